//! Ready condition bookkeeping

use chrono::{DateTime, Utc};

use crate::crd::{Condition, ObjectStoreStatus};
use crate::error::Error;

/// Condition type reported on every ObjectStore
pub const READY: &str = "Ready";

/// Reason used when all derivatives are in place
pub const CONVERGED: &str = "Converged";

/// Readiness to report on the Ready condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub reason: String,
    pub message: String,
}

impl Readiness {
    pub fn converged() -> Self {
        Self {
            ready: true,
            reason: CONVERGED.to_string(),
            message: "Role, RoleBinding and credentials Secret are up to date".to_string(),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self {
            ready: false,
            reason: err.reason().to_string(),
            message: err.to_string(),
        }
    }

    fn status(&self) -> &'static str {
        if self.ready {
            "True"
        } else {
            "False"
        }
    }
}

/// Status to write, or `None` when the current one already says the same.
///
/// `lastTransitionTime` only moves when the condition status flips.
pub fn next_status(
    current: Option<&ObjectStoreStatus>,
    generation: Option<i64>,
    readiness: &Readiness,
    now: DateTime<Utc>,
) -> Option<ObjectStoreStatus> {
    let condition = current.and_then(|s| s.condition(READY));
    let unchanged = condition.is_some_and(|c| {
        c.status == readiness.status()
            && c.reason.as_deref() == Some(readiness.reason.as_str())
            && c.message.as_deref() == Some(readiness.message.as_str())
    });
    if unchanged && current.and_then(|s| s.observed_generation) == generation {
        return None;
    }

    let last_transition_time = match condition {
        Some(c) if c.status == readiness.status() => c.last_transition_time,
        _ => now,
    };
    let mut conditions: Vec<Condition> = current
        .map(|s| s.conditions.iter().filter(|c| c.type_ != READY).cloned().collect())
        .unwrap_or_default();
    conditions.push(Condition {
        type_: READY.to_string(),
        status: readiness.status().to_string(),
        last_transition_time,
        reason: Some(readiness.reason.clone()),
        message: Some(readiness.message.clone()),
    });

    Some(ObjectStoreStatus {
        observed_generation: generation,
        conditions,
        last_reconciled_time: Some(now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn first_report_sets_ready() {
        let now = Utc::now();
        let status = next_status(None, Some(1), &Readiness::converged(), now).unwrap();

        let ready = status.condition(READY).unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason.as_deref(), Some(CONVERGED));
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.last_reconciled_time, Some(now));
    }

    #[test]
    fn identical_report_is_skipped() {
        let now = Utc::now();
        let status = next_status(None, Some(1), &Readiness::converged(), now).unwrap();

        let later = now + Duration::minutes(5);
        assert!(next_status(Some(&status), Some(1), &Readiness::converged(), later).is_none());
    }

    #[test]
    fn generation_change_is_recorded_without_transition() {
        let now = Utc::now();
        let status = next_status(None, Some(1), &Readiness::converged(), now).unwrap();

        let later = now + Duration::minutes(5);
        let next = next_status(Some(&status), Some(2), &Readiness::converged(), later).unwrap();
        assert_eq!(next.observed_generation, Some(2));
        assert_eq!(next.condition(READY).unwrap().last_transition_time, now);
    }

    #[test]
    fn failure_flips_the_condition() {
        let now = Utc::now();
        let status = next_status(None, Some(1), &Readiness::converged(), now).unwrap();

        let later = now + Duration::minutes(5);
        let err = Error::ReferencedResourceExists("Cluster/db1".to_string());
        let next = next_status(Some(&status), Some(1), &Readiness::from_error(&err), later).unwrap();

        let ready = next.condition(READY).unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason.as_deref(), Some("ReferencedResourceExists"));
        assert_eq!(ready.last_transition_time, later);
        assert_eq!(next.conditions.len(), 1);
    }
}
