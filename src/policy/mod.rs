//! Derived-resource policy
//!
//! Maps one ObjectStore to the Role, RoleBinding and credentials Secret it
//! owns. Everything here is a pure function of the ObjectStore identity and
//! spec: no store access, no clock, no randomness. Owner references are
//! stamped by the reconciler, which knows the live uid.

mod managed;
mod rbac;
mod secret;

pub use managed::{is_owned_by, Derivative};
pub use rbac::{build_role, build_role_binding};
pub use secret::{credential_sources, SecretDescriptor};

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::crd::{ObjectStore, ObjectStoreSpec, RetentionPolicy};
use crate::error::{Error, Result};

/// Label carried by every derivative, valued with the owning ObjectStore name
pub const OBJECT_STORE_LABEL: &str = "barmancloud.cnpg.io/object-store";

/// Label marking objects this operator manages
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "barman-cloud-operator";

/// Annotation holding the hash of the policy output
pub const DERIVATIVES_HASH_ANNOTATION: &str = "barmancloud.cnpg.io/derivatives-hash";

/// Kubernetes limit for object names
const MAX_NAME_LENGTH: usize = 253;

/// Server-side encryption modes barman-cloud understands
const ENCRYPTIONS: &[&str] = &["AES256", "aws:kms"];

/// Names of the derivatives of one ObjectStore
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivativeNames {
    pub role: String,
    pub role_binding: String,
    pub secret: String,
}

/// Derivative names are a function of the owner's name only
pub fn derivative_names(object_store: &str) -> DerivativeNames {
    DerivativeNames {
        role: format!("{}-role", object_store),
        role_binding: format!("{}-rolebinding", object_store),
        secret: format!("{}-credentials", object_store),
    }
}

/// Label selector matching every derivative of an ObjectStore
pub fn owner_selector(object_store: &str) -> String {
    format!("{}={}", OBJECT_STORE_LABEL, object_store)
}

/// Everything one ObjectStore should own
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredDerivatives {
    pub role: Role,
    pub role_binding: RoleBinding,
    pub secret: SecretDescriptor,
    /// SHA-256 of the policy output, hex encoded
    pub hash: String,
}

/// Compute the derivatives of an ObjectStore.
///
/// Fails with [`Error::InvalidSpec`] when the spec cannot be realized.
pub fn desired_derivatives(store: &ObjectStore) -> Result<DesiredDerivatives> {
    let name = store.name_any();
    let namespace = store
        .namespace()
        .ok_or_else(|| Error::invalid_spec(format!("ObjectStore {} has no namespace", name)))?;
    validate(&store.spec)?;

    let names = derivative_names(&name);
    if let Some(long) = [&names.role, &names.role_binding, &names.secret]
        .into_iter()
        .find(|n| n.len() > MAX_NAME_LENGTH)
    {
        return Err(Error::invalid_spec(format!(
            "derived name '{}' exceeds {} characters; shorten the ObjectStore name",
            long, MAX_NAME_LENGTH
        )));
    }

    let mut role = build_role(&name, &namespace, &names);
    let mut role_binding = build_role_binding(&namespace, &names, &store.spec.service_accounts);
    let mut secret = SecretDescriptor {
        name: names.secret.clone(),
        namespace: namespace.clone(),
        labels: labels(&name),
        annotations: BTreeMap::new(),
        sources: credential_sources(&store.spec.configuration),
    };
    role.metadata.labels = Some(labels(&name));
    role_binding.metadata.labels = Some(labels(&name));

    let hash = content_hash(&role, &role_binding, &secret)?;
    let annotations = BTreeMap::from([(DERIVATIVES_HASH_ANNOTATION.to_string(), hash.clone())]);
    role.metadata.annotations = Some(annotations.clone());
    role_binding.metadata.annotations = Some(annotations.clone());
    secret.annotations = annotations;

    Ok(DesiredDerivatives {
        role,
        role_binding,
        secret,
        hash,
    })
}

fn labels(object_store: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OBJECT_STORE_LABEL.to_string(), object_store.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
}

fn content_hash(
    role: &Role,
    role_binding: &RoleBinding,
    secret: &SecretDescriptor,
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(role)?);
    hasher.update(serde_json::to_vec(role_binding)?);
    hasher.update(serde_json::to_vec(&secret.sources)?);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Validate the ObjectStore spec
pub fn validate(spec: &ObjectStoreSpec) -> Result<()> {
    let config = &spec.configuration;

    // Validate destination path
    match config.destination_path.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() && !rest.trim_matches('/').is_empty() => {}
        _ => {
            return Err(Error::invalid_spec(format!(
                "destinationPath '{}' must look like <scheme>://<bucket>[/<path>]",
                config.destination_path
            )));
        }
    }

    // Validate endpoint
    if let Some(endpoint) = &config.endpoint_url {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(Error::invalid_spec(format!(
                "endpointURL '{}' must start with http:// or https://",
                endpoint
            )));
        }
    }

    // Exactly one provider
    let providers = [
        config.s3_credentials.is_some(),
        config.azure_credentials.is_some(),
        config.google_credentials.is_some(),
    ];
    match providers.iter().filter(|p| **p).count() {
        1 => {}
        0 => {
            return Err(Error::invalid_spec(
                "one of s3Credentials, azureCredentials or googleCredentials is required",
            ))
        }
        _ => {
            return Err(Error::invalid_spec(
                "only one of s3Credentials, azureCredentials or googleCredentials may be set",
            ))
        }
    }
    secret::validate_credentials(config)?;

    // Validate compression and server-side encryption
    if let Some(wal) = &config.wal {
        validate_choice(
            "wal.compression",
            wal.compression.as_deref(),
            &["bzip2", "gzip", "lz4", "snappy", "xz", "zstd"],
        )?;
        validate_choice("wal.encryption", wal.encryption.as_deref(), ENCRYPTIONS)?;
    }
    if let Some(data) = &config.data {
        validate_choice(
            "data.compression",
            data.compression.as_deref(),
            &["bzip2", "gzip", "snappy"],
        )?;
        validate_choice("data.encryption", data.encryption.as_deref(), ENCRYPTIONS)?;
        if let Some(jobs) = data.jobs {
            if jobs < 1 {
                return Err(Error::invalid_spec(format!(
                    "data.jobs must be at least 1, got {}",
                    jobs
                )));
            }
        }
    }

    if let Some(policy) = &spec.retention_policy {
        policy.parse::<RetentionPolicy>().map_err(Error::InvalidSpec)?;
    }

    if let Some(sidecar) = &spec.instance_sidecar_configuration {
        if let Some(interval) = sidecar.retention_policy_interval_seconds {
            if interval <= 0 {
                return Err(Error::invalid_spec(format!(
                    "retentionPolicyIntervalSeconds must be positive, got {}",
                    interval
                )));
            }
        }
    }

    for sa in &spec.service_accounts {
        if !is_valid_name(sa) {
            return Err(Error::invalid_spec(format!(
                "serviceAccounts entry '{}' is not a valid Kubernetes name",
                sa
            )));
        }
    }

    Ok(())
}

fn validate_choice(field: &str, value: Option<&str>, allowed: &[&str]) -> Result<()> {
    match value {
        Some(v) if !allowed.contains(&v) => Err(Error::invalid_spec(format!(
            "invalid {} '{}': must be one of: {}",
            field,
            v,
            allowed.join(", ")
        ))),
        _ => Ok(()),
    }
}

/// DNS-1123 subdomain
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        BarmanObjectStoreConfiguration, S3Credentials, SecretKeySelector, WalBackupConfiguration,
    };

    fn selector(name: &str, key: &str) -> SecretKeySelector {
        SecretKeySelector {
            name: name.to_string(),
            key: key.to_string(),
        }
    }

    fn valid_spec() -> ObjectStoreSpec {
        ObjectStoreSpec {
            configuration: BarmanObjectStoreConfiguration {
                destination_path: "s3://backups/pg".to_string(),
                s3_credentials: Some(S3Credentials {
                    access_key_id: Some(selector("aws", "ACCESS_KEY_ID")),
                    secret_access_key: Some(selector("aws", "ACCESS_SECRET_KEY")),
                    ..Default::default()
                }),
                ..Default::default()
            },
            retention_policy: Some("30d".to_string()),
            service_accounts: vec!["db1".to_string()],
            ..Default::default()
        }
    }

    fn object_store(name: &str, spec: ObjectStoreSpec) -> ObjectStore {
        let mut store = ObjectStore::new(name, spec);
        store.metadata.namespace = Some("ns1".to_string());
        store
    }

    #[test]
    fn names_follow_the_owner() {
        let names = derivative_names("store-a");
        assert_eq!(names.role, "store-a-role");
        assert_eq!(names.role_binding, "store-a-rolebinding");
        assert_eq!(names.secret, "store-a-credentials");
    }

    #[test]
    fn policy_is_deterministic() {
        let store = object_store("store-a", valid_spec());
        let first = desired_derivatives(&store).unwrap();
        let second = desired_derivatives(&store.clone()).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first.role).unwrap(),
            serde_json::to_vec(&second.role).unwrap()
        );
        assert_eq!(first.hash.len(), 64);
    }

    #[test]
    fn hash_tracks_spec_changes() {
        let before = desired_derivatives(&object_store("store-a", valid_spec())).unwrap();

        let mut spec = valid_spec();
        spec.service_accounts.push("db2".to_string());
        let after = desired_derivatives(&object_store("store-a", spec)).unwrap();

        assert_ne!(before.hash, after.hash);
    }

    #[test]
    fn derivatives_are_labelled_for_their_owner() {
        let desired = desired_derivatives(&object_store("store-a", valid_spec())).unwrap();
        let labels = desired.role.metadata.labels.unwrap();
        assert_eq!(labels.get(OBJECT_STORE_LABEL).map(String::as_str), Some("store-a"));
        assert_eq!(desired.secret.labels, labels);
        assert_eq!(
            desired.secret.annotations.get(DERIVATIVES_HASH_ANNOTATION),
            Some(&desired.hash)
        );
    }

    #[test]
    fn valid_spec_passes_validation() {
        assert!(validate(&valid_spec()).is_ok());
    }

    #[test]
    fn destination_path_needs_scheme_and_bucket() {
        for bad in ["", "backups", "s3://", "://bucket", "s3:///"] {
            let mut spec = valid_spec();
            spec.configuration.destination_path = bad.to_string();
            let err = validate(&spec).unwrap_err();
            assert!(err.to_string().contains("destinationPath"), "{}", bad);
        }
    }

    #[test]
    fn exactly_one_provider_is_required() {
        let mut spec = valid_spec();
        spec.configuration.s3_credentials = None;
        assert!(validate(&spec).unwrap_err().to_string().contains("required"));

        let mut spec = valid_spec();
        spec.configuration.google_credentials = Some(Default::default());
        assert!(validate(&spec).unwrap_err().to_string().contains("only one"));
    }

    #[test]
    fn unknown_encryption_is_rejected() {
        let mut spec = valid_spec();
        spec.configuration.wal = Some(WalBackupConfiguration {
            compression: Some("gzip".to_string()),
            encryption: Some("rot13".to_string()),
        });
        let err = validate(&spec).unwrap_err().to_string();
        assert!(err.contains("wal.encryption"));
    }

    #[test]
    fn malformed_retention_policy_is_rejected() {
        let mut spec = valid_spec();
        spec.retention_policy = Some("30 days".to_string());
        assert!(matches!(validate(&spec), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn invalid_service_account_is_rejected() {
        let mut spec = valid_spec();
        spec.service_accounts = vec!["Not_Valid".to_string()];
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn overlong_owner_names_are_rejected() {
        let name = "a".repeat(250);
        let err = desired_derivatives(&object_store(&name, valid_spec())).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }
}
