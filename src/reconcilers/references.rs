//! Lookup of Backups and Clusters still using an ObjectStore

use std::collections::BTreeSet;
use std::fmt;

use kube::ResourceExt;

use crate::crd::{Backup, Cluster};
use crate::error::{Error, Result};
use crate::store::{CallContext, ObjectKey, ResourceStore, StoreObject};

/// An external resource pointing at an ObjectStore
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    pub kind: &'static str,
    pub name: String,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Whether the cluster uses the named ObjectStore
pub fn cluster_references(cluster: &Cluster, object_store: &str) -> bool {
    cluster.barman_object_names().any(|n| n == object_store)
}

/// Whether an unfinished backup uses the named ObjectStore, directly or via
/// one of the `referencing_clusters`
pub fn backup_references(
    backup: &Backup,
    object_store: &str,
    referencing_clusters: &BTreeSet<String>,
) -> bool {
    if backup.is_finished() {
        return false;
    }
    match backup.barman_object_name() {
        Some(name) => name == object_store,
        None => referencing_clusters.contains(&backup.spec.cluster.name),
    }
}

/// A kind that is not installed cannot reference anything
async fn list_or_empty<S: ResourceStore, K: StoreObject>(
    store: &S,
    call: &CallContext,
    namespace: &str,
) -> Result<Vec<K>> {
    match call.run(store.list::<K>(namespace, "")).await {
        Err(Error::NotFound(_)) => Ok(Vec::new()),
        other => other,
    }
}

/// Every Cluster and Backup in the ObjectStore's namespace that still uses it, sorted
pub async fn find_references<S: ResourceStore>(
    store: &S,
    call: &CallContext,
    key: &ObjectKey,
) -> Result<Vec<Reference>> {
    let clusters: Vec<Cluster> = list_or_empty(store, call, &key.namespace).await?;
    let backups: Vec<Backup> = list_or_empty(store, call, &key.namespace).await?;

    let referencing_clusters: BTreeSet<String> = clusters
        .iter()
        .filter(|c| cluster_references(c, &key.name))
        .map(|c| c.name_any())
        .collect();

    let mut references: Vec<Reference> = referencing_clusters
        .iter()
        .map(|name| Reference {
            kind: "Cluster",
            name: name.clone(),
        })
        .collect();
    references.extend(
        backups
            .iter()
            .filter(|b| backup_references(b, &key.name, &referencing_clusters))
            .map(|b| Reference {
                kind: "Backup",
                name: b.name_any(),
            }),
    );
    references.sort();
    Ok(references)
}

/// Render references as "Backup/b1, Cluster/db1"
pub fn describe(references: &[Reference]) -> String {
    references
        .iter()
        .map(Reference::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::crd::{
        BackupPluginConfiguration, BackupSpec, BackupStatus, ClusterSpec, LocalObjectReference,
        PluginConfiguration, BARMAN_CLOUD_PLUGIN, BARMAN_OBJECT_NAME_PARAMETER,
    };

    fn cluster(name: &str, store: &str) -> Cluster {
        Cluster::new(
            name,
            ClusterSpec {
                plugins: vec![PluginConfiguration {
                    name: BARMAN_CLOUD_PLUGIN.to_string(),
                    enabled: Some(true),
                    parameters: BTreeMap::from([(
                        BARMAN_OBJECT_NAME_PARAMETER.to_string(),
                        store.to_string(),
                    )]),
                }],
                external_clusters: vec![],
            },
        )
    }

    fn backup(cluster: &str, store: Option<&str>, phase: Option<&str>) -> Backup {
        let mut backup = Backup::new(
            "b1",
            BackupSpec {
                cluster: LocalObjectReference {
                    name: cluster.to_string(),
                },
                method: Some("plugin".to_string()),
                plugin_configuration: store.map(|s| BackupPluginConfiguration {
                    name: BARMAN_CLOUD_PLUGIN.to_string(),
                    parameters: BTreeMap::from([(
                        BARMAN_OBJECT_NAME_PARAMETER.to_string(),
                        s.to_string(),
                    )]),
                }),
            },
        );
        backup.status = phase.map(|p| BackupStatus {
            phase: Some(p.to_string()),
        });
        backup
    }

    #[test]
    fn cluster_reference_matches_by_store_name() {
        assert!(cluster_references(&cluster("db1", "store-a"), "store-a"));
        assert!(!cluster_references(&cluster("db1", "store-b"), "store-a"));
    }

    #[test]
    fn running_backup_of_referencing_cluster_counts() {
        let clusters = BTreeSet::from(["db1".to_string()]);
        assert!(backup_references(&backup("db1", None, Some("running")), "store-a", &clusters));
        assert!(!backup_references(&backup("db2", None, Some("running")), "store-a", &clusters));
    }

    #[test]
    fn explicit_store_parameter_wins_over_cluster() {
        let clusters = BTreeSet::from(["db1".to_string()]);
        assert!(!backup_references(&backup("db1", Some("store-b"), None), "store-a", &clusters));
        assert!(backup_references(&backup("db9", Some("store-a"), None), "store-a", &BTreeSet::new()));
    }

    #[test]
    fn finished_backups_do_not_block() {
        let clusters = BTreeSet::from(["db1".to_string()]);
        assert!(!backup_references(&backup("db1", Some("store-a"), Some("completed")), "store-a", &clusters));
        assert!(!backup_references(&backup("db1", Some("store-a"), Some("failed")), "store-a", &clusters));
    }

    #[test]
    fn describe_joins_references() {
        let refs = vec![
            Reference { kind: "Backup", name: "b1".to_string() },
            Reference { kind: "Cluster", name: "db1".to_string() },
        ];
        assert_eq!(describe(&refs), "Backup/b1, Cluster/db1");
    }
}
