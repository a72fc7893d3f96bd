//! Reconciler for ObjectStore resources
//!
//! This module contains the business logic of the control loop:
//! - Converging Role, RoleBinding and Secret derivatives
//! - Guarding deletion with the finalizer protocol
//! - Reporting readiness on the ObjectStore status

mod finalizer;
mod object_store;
pub mod references;
pub mod status;

pub use finalizer::{has_finalizer, FINALIZER_NAME};
pub use object_store::ObjectStoreReconciler;

use crate::error::{Error, ErrorClass};

/// How soon a reconciliation should run again
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Run again right away without growing the backoff (stale read)
    Immediate,
    /// Run again after the identity's next backoff interval
    Backoff,
}

/// Result of one reconciliation
#[derive(Debug)]
pub enum Outcome {
    /// Observed state matches the declared state
    Converged,
    Requeue(Requeue),
    /// An invariant was violated; reported and retried with backoff by the caller
    Fatal(Error),
}

impl Outcome {
    pub fn from_error(err: Error) -> Self {
        match err.class() {
            ErrorClass::Gone => Outcome::Converged,
            ErrorClass::Conflict => Outcome::Requeue(Requeue::Immediate),
            ErrorClass::Transient | ErrorClass::Blocked | ErrorClass::Configuration => {
                Outcome::Requeue(Requeue::Backoff)
            }
            ErrorClass::Fatal => Outcome::Fatal(err),
        }
    }

    /// Label used for the reconciliation counter
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Converged => "converged",
            Outcome::Requeue(Requeue::Immediate) => "requeue_immediate",
            Outcome::Requeue(Requeue::Backoff) => "requeue_backoff",
            Outcome::Fatal(_) => "fatal",
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, Outcome::Converged)
    }
}
