//! CloudNativePG resources consulted during deletion
//!
//! Only the fields needed to find ObjectStore references are modelled; the
//! rest of the upstream schema is ignored on deserialization.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name under which the Barman Cloud plugin registers with CloudNativePG
pub const BARMAN_CLOUD_PLUGIN: &str = "barman-cloud.cloudnative-pg.io";

/// Plugin parameter naming the ObjectStore a cluster or backup uses
pub const BARMAN_OBJECT_NAME_PARAMETER: &str = "barmanObjectName";

/// Cluster specification (partial)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "postgresql.cnpg.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// CNPG-I plugins enabled on the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginConfiguration>,

    /// External clusters, used as replica or recovery sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_clusters: Vec<ExternalCluster>,
}

/// Plugin entry of a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfiguration {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl PluginConfiguration {
    /// ObjectStore this entry points at, if it is an enabled Barman Cloud plugin
    pub fn barman_object_name(&self) -> Option<&str> {
        if self.name != BARMAN_CLOUD_PLUGIN || self.enabled == Some(false) {
            return None;
        }
        self.parameters
            .get(BARMAN_OBJECT_NAME_PARAMETER)
            .map(String::as_str)
    }
}

/// External cluster entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCluster {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginConfiguration>,
}

impl Cluster {
    /// Names of every ObjectStore this cluster uses
    pub fn barman_object_names(&self) -> impl Iterator<Item = &str> + '_ {
        let plugins = self.spec.plugins.iter();
        let external = self
            .spec
            .external_clusters
            .iter()
            .filter_map(|e| e.plugin.as_ref());
        plugins
            .chain(external)
            .filter_map(PluginConfiguration::barman_object_name)
    }
}

/// Backup specification (partial)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "postgresql.cnpg.io",
    version = "v1",
    kind = "Backup",
    plural = "backups",
    namespaced,
    status = "BackupStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Cluster being backed up
    pub cluster: LocalObjectReference,

    /// Backup method (plugin, barmanObjectStore, volumeSnapshot)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Plugin driving a method=plugin backup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_configuration: Option<BackupPluginConfiguration>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupPluginConfiguration {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Backup status (partial)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl Backup {
    /// Completed and failed backups no longer touch the object store
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status.as_ref().and_then(|s| s.phase.as_deref()),
            Some("completed") | Some("failed")
        )
    }

    /// ObjectStore named directly by the backup's plugin configuration
    pub fn barman_object_name(&self) -> Option<&str> {
        self.spec
            .plugin_configuration
            .as_ref()
            .filter(|p| p.name == BARMAN_CLOUD_PLUGIN)
            .and_then(|p| p.parameters.get(BARMAN_OBJECT_NAME_PARAMETER))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(store: &str) -> PluginConfiguration {
        PluginConfiguration {
            name: BARMAN_CLOUD_PLUGIN.to_string(),
            enabled: None,
            parameters: BTreeMap::from([(
                BARMAN_OBJECT_NAME_PARAMETER.to_string(),
                store.to_string(),
            )]),
        }
    }

    #[test]
    fn cluster_lists_plugin_and_replica_stores() {
        let cluster = Cluster::new(
            "db1",
            ClusterSpec {
                plugins: vec![plugin("store-a")],
                external_clusters: vec![ExternalCluster {
                    name: "origin".to_string(),
                    plugin: Some(plugin("store-b")),
                }],
            },
        );

        let names: Vec<&str> = cluster.barman_object_names().collect();
        assert_eq!(names, vec!["store-a", "store-b"]);
    }

    #[test]
    fn disabled_or_foreign_plugins_are_ignored() {
        let mut disabled = plugin("store-a");
        disabled.enabled = Some(false);
        let mut foreign = plugin("store-a");
        foreign.name = "other.plugin.io".to_string();

        assert_eq!(disabled.barman_object_name(), None);
        assert_eq!(foreign.barman_object_name(), None);
    }

    #[test]
    fn backup_phase_decides_whether_it_is_finished() {
        let mut backup = Backup::new(
            "b1",
            BackupSpec {
                cluster: LocalObjectReference {
                    name: "db1".to_string(),
                },
                ..Default::default()
            },
        );
        assert!(!backup.is_finished());

        backup.status = Some(BackupStatus {
            phase: Some("running".to_string()),
        });
        assert!(!backup.is_finished());

        backup.status = Some(BackupStatus {
            phase: Some("completed".to_string()),
        });
        assert!(backup.is_finished());
    }
}
