use std::collections::BTreeSet;

use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use super::DerivativeNames;
use crate::crd::ObjectStore;

fn rule(api_group: &str, resource: &str, verbs: &[&str], resource_name: &str) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(vec![resource.to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        resource_names: Some(vec![resource_name.to_string()]),
        ..Default::default()
    }
}

/// Role granting read access to the credentials Secret and the ObjectStore
pub fn build_role(object_store: &str, namespace: &str, names: &DerivativeNames) -> Role {
    let group = ObjectStore::group(&()).to_string();
    let plural = ObjectStore::plural(&()).to_string();
    Role {
        metadata: ObjectMeta {
            name: Some(names.role.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            rule("", "secrets", &["get", "list", "watch"], &names.secret),
            rule(&group, &plural, &["get", "list", "watch"], object_store),
            rule(
                &group,
                &format!("{}/status", plural),
                &["get", "patch", "update"],
                object_store,
            ),
        ]),
    }
}

/// RoleBinding from the Role to each consumer service account, sorted and deduplicated
pub fn build_role_binding(
    namespace: &str,
    names: &DerivativeNames,
    service_accounts: &[String],
) -> RoleBinding {
    let subjects: BTreeSet<&String> = service_accounts.iter().collect();
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(names.role_binding.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: names.role.clone(),
        },
        subjects: Some(
            subjects
                .into_iter()
                .map(|sa| Subject {
                    kind: "ServiceAccount".to_string(),
                    name: sa.clone(),
                    namespace: Some(namespace.to_string()),
                    api_group: None,
                })
                .collect(),
        ),
    }
}
