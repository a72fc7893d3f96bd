//! Managed fields of each derivative kind
//!
//! The reconciler only compares and overwrites what the policy sets. Extra
//! labels, annotations or owner references added by others are left alone.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;

use crate::store::StoreObject;

/// An object kind the policy derives from an ObjectStore
pub trait Derivative: StoreObject {
    /// Whether the live object already carries the desired managed content
    fn matches(&self, desired: &Self) -> bool;

    /// Copy the desired managed content onto the live object
    fn adopt(&mut self, desired: &Self);

    /// Whether the difference touches an immutable field
    fn needs_recreate(&self, _desired: &Self) -> bool {
        false
    }
}

/// Whether `obj` has an owner reference to the given uid
pub fn is_owned_by<K: Resource>(obj: &K, uid: &str) -> bool {
    obj.meta()
        .owner_references
        .iter()
        .flatten()
        .any(|r| r.uid == uid)
}

fn is_subset(
    desired: &Option<BTreeMap<String, String>>,
    live: &Option<BTreeMap<String, String>>,
) -> bool {
    desired
        .iter()
        .flatten()
        .all(|(k, v)| live.as_ref().and_then(|l| l.get(k)) == Some(v))
}

fn has_owners(desired: &[OwnerReference], live: &ObjectMeta) -> bool {
    desired.iter().all(|d| {
        live.owner_references
            .iter()
            .flatten()
            .any(|l| l.uid == d.uid && l.controller == d.controller)
    })
}

fn metadata_matches(live: &ObjectMeta, desired: &ObjectMeta) -> bool {
    is_subset(&desired.labels, &live.labels)
        && is_subset(&desired.annotations, &live.annotations)
        && has_owners(desired.owner_references.as_deref().unwrap_or_default(), live)
}

fn merge_map(
    live: &mut Option<BTreeMap<String, String>>,
    desired: &Option<BTreeMap<String, String>>,
) {
    if let Some(desired) = desired {
        let live = live.get_or_insert_with(BTreeMap::new);
        for (k, v) in desired {
            live.insert(k.clone(), v.clone());
        }
    }
}

fn adopt_metadata(live: &mut ObjectMeta, desired: &ObjectMeta) {
    merge_map(&mut live.labels, &desired.labels);
    merge_map(&mut live.annotations, &desired.annotations);
    for owner in desired.owner_references.iter().flatten() {
        let owners = live.owner_references.get_or_insert_with(Vec::new);
        owners.retain(|o| o.uid != owner.uid);
        owners.push(owner.clone());
    }
}

impl Derivative for Role {
    fn matches(&self, desired: &Self) -> bool {
        metadata_matches(&self.metadata, &desired.metadata) && self.rules == desired.rules
    }

    fn adopt(&mut self, desired: &Self) {
        adopt_metadata(&mut self.metadata, &desired.metadata);
        self.rules = desired.rules.clone();
    }
}

impl Derivative for RoleBinding {
    fn matches(&self, desired: &Self) -> bool {
        metadata_matches(&self.metadata, &desired.metadata)
            && self.role_ref == desired.role_ref
            && subjects_match(
                self.subjects.as_deref().unwrap_or_default(),
                desired.subjects.as_deref().unwrap_or_default(),
            )
    }

    fn adopt(&mut self, desired: &Self) {
        adopt_metadata(&mut self.metadata, &desired.metadata);
        self.subjects = desired.subjects.clone();
    }

    /// roleRef cannot be changed in place
    fn needs_recreate(&self, desired: &Self) -> bool {
        self.role_ref != desired.role_ref
    }
}

/// The API server omits an empty subject `apiGroup`
fn subjects_match(live: &[Subject], desired: &[Subject]) -> bool {
    let group = |s: &Subject| s.api_group.clone().filter(|g| !g.is_empty());
    live.len() == desired.len()
        && live.iter().zip(desired).all(|(l, d)| {
            l.kind == d.kind && l.name == d.name && l.namespace == d.namespace && group(l) == group(d)
        })
}

impl Derivative for Secret {
    fn matches(&self, desired: &Self) -> bool {
        let empty = BTreeMap::new();
        metadata_matches(&self.metadata, &desired.metadata)
            && self.type_ == desired.type_
            && self.data.as_ref().unwrap_or(&empty) == desired.data.as_ref().unwrap_or(&empty)
    }

    fn adopt(&mut self, desired: &Self) {
        adopt_metadata(&mut self.metadata, &desired.metadata);
        self.data = desired.data.clone();
        self.string_data = None;
    }

    /// Secret type is immutable
    fn needs_recreate(&self, desired: &Self) -> bool {
        self.type_ != desired.type_
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::rbac::v1::{PolicyRule, RoleRef};

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "barmancloud.cnpg.io/v1".to_string(),
            kind: "ObjectStore".to_string(),
            name: "store-a".to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn role(verbs: &[&str]) -> Role {
        Role {
            metadata: ObjectMeta {
                name: Some("store-a-role".to_string()),
                labels: Some(BTreeMap::from([("a".to_string(), "1".to_string())])),
                owner_references: Some(vec![owner("uid-1")]),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                verbs: verbs.iter().map(|v| v.to_string()).collect(),
                ..Default::default()
            }]),
        }
    }

    #[test]
    fn extra_labels_on_the_live_object_are_tolerated() {
        let desired = role(&["get"]);
        let mut live = desired.clone();
        live.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("team".to_string(), "db".to_string());

        assert!(live.matches(&desired));
    }

    #[test]
    fn drifted_rules_are_detected_and_repaired() {
        let desired = role(&["get"]);
        let mut live = role(&["get", "delete"]);
        live.metadata.resource_version = Some("42".to_string());
        assert!(!live.matches(&desired));

        live.adopt(&desired);
        assert!(live.matches(&desired));
        assert_eq!(live.metadata.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn role_ref_change_requires_recreate() {
        let desired = RoleBinding {
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: "store-a-role".to_string(),
            },
            ..Default::default()
        };
        let mut live = desired.clone();
        live.role_ref.name = "other".to_string();

        assert!(live.needs_recreate(&desired));
        assert!(!desired.needs_recreate(&desired));
    }

    #[test]
    fn role_binding_read_back_from_the_api_server_matches() {
        let desired = crate::policy::build_role_binding(
            "ns1",
            &crate::policy::derivative_names("store-a"),
            &["db1".to_string()],
        );

        // Served objects drop empty fields such as subjects[].apiGroup
        let mut served = serde_json::to_value(&desired).unwrap();
        for subject in served["subjects"].as_array_mut().unwrap() {
            subject.as_object_mut().unwrap().remove("apiGroup");
        }
        let live: RoleBinding = serde_json::from_value(served).unwrap();
        assert!(live.matches(&desired));

        let mut explicit = live.clone();
        explicit.subjects.as_mut().unwrap()[0].api_group = Some(String::new());
        assert!(explicit.matches(&desired));
        assert!(live.matches(&explicit));

        let mut renamed = live;
        renamed.subjects.as_mut().unwrap()[0].name = "db2".to_string();
        assert!(!renamed.matches(&desired));
    }

    #[test]
    fn ownership_is_checked_by_uid() {
        let live = role(&["get"]);
        assert!(is_owned_by(&live, "uid-1"));
        assert!(!is_owned_by(&live, "uid-2"));
    }
}
