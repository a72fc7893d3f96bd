//! ObjectStore Custom Resource Definition

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ObjectStore resource specification
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "barmancloud.cnpg.io",
    version = "v1",
    kind = "ObjectStore",
    plural = "objectstores",
    singular = "objectstore",
    namespaced,
    status = "ObjectStoreStatus",
    printcolumn = r#"{"name": "Ready", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name": "Reason", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreSpec {
    /// Barman object store configuration
    pub configuration: BarmanObjectStoreConfiguration,

    /// Retention policy, e.g. "30d", "4w", "6m"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<String>,

    /// Settings for the instance sidecar that consumes this store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_sidecar_configuration: Option<InstanceSidecarConfiguration>,

    /// Service accounts allowed to read the resolved credentials.
    /// CloudNativePG names each cluster's service account after the cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<String>,
}

/// Where backups go and how to authenticate against the provider
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BarmanObjectStoreConfiguration {
    /// Bucket path, e.g. "s3://backups/pg"
    pub destination_path: String,

    /// Custom endpoint (for MinIO, Ceph, etc.)
    #[serde(rename = "endpointURL", skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,

    /// Server name used as the folder inside the bucket
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    /// S3 credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_credentials: Option<S3Credentials>,

    /// Azure Blob credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azure_credentials: Option<AzureCredentials>,

    /// Google Cloud Storage credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_credentials: Option<GoogleCredentials>,

    /// WAL archive settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wal: Option<WalBackupConfiguration>,

    /// Base backup settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DataBackupConfiguration>,

    /// Tags attached to uploaded objects
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Reference to a key inside a Secret in the ObjectStore namespace
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    /// Secret name
    pub name: String,
    /// Key in the secret
    pub key: String,
}

/// S3 credentials
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Credentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<SecretKeySelector>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<SecretKeySelector>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<SecretKeySelector>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<SecretKeySelector>,

    /// Use the pod's IAM role instead of static keys
    #[serde(rename = "inheritFromIAMRole", default)]
    pub inherit_from_iam_role: bool,
}

/// Azure Blob credentials
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<SecretKeySelector>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_account: Option<SecretKeySelector>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<SecretKeySelector>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_sas_token: Option<SecretKeySelector>,

    /// Use Azure AD workload identity
    #[serde(rename = "inheritFromAzureAD", default)]
    pub inherit_from_azure_ad: bool,
}

/// Google Cloud Storage credentials
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GoogleCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_credentials: Option<SecretKeySelector>,

    /// Use the GKE metadata server
    #[serde(default)]
    pub gke_environment: bool,
}

/// WAL archive settings
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WalBackupConfiguration {
    /// bzip2, gzip, lz4, snappy, xz or zstd
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,

    /// Server-side encryption (AES256 or aws:kms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
}

/// Base backup settings
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataBackupConfiguration {
    /// bzip2, gzip or snappy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,

    /// Server-side encryption (AES256 or aws:kms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,

    /// Parallel upload jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<i32>,
}

/// Instance sidecar settings
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSidecarConfiguration {
    /// How often the sidecar enforces the retention policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_policy_interval_seconds: Option<i64>,

    /// Extra environment variables for the sidecar
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// ObjectStore status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreStatus {
    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Time of the last reconciliation that changed this status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconciled_time: Option<DateTime<Utc>>,
}

impl ObjectStoreStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Status condition
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Parsed retention policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub count: u32,
    pub unit: RetentionUnit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetentionUnit {
    Days,
    Weeks,
    Months,
}

impl FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            format!(
                "invalid retention policy '{}': expected a positive number followed by d, w or m",
                s
            )
        };
        let unit = match s.chars().last() {
            Some('d') => RetentionUnit::Days,
            Some('w') => RetentionUnit::Weeks,
            Some('m') => RetentionUnit::Months,
            _ => return Err(invalid()),
        };
        let digits = &s[..s.len() - 1];
        if digits.starts_with('0') || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let count = digits.parse::<u32>().map_err(|_| invalid())?;
        Ok(RetentionPolicy { count, unit })
    }
}

impl fmt::Display for RetentionPolicy {
    /// Renders the policy the way barman-cloud-backup-delete expects it
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            RetentionUnit::Days => "DAYS",
            RetentionUnit::Weeks => "WEEKS",
            RetentionUnit::Months => "MONTHS",
        };
        write!(f, "RECOVERY WINDOW OF {} {}", self.count, unit)
    }
}
