//! Secret fetching utilities
//!
//! Resolves the key selectors of a [`SecretDescriptor`] into the data of the
//! credentials Secret, reading each referenced user Secret once.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;

use crate::error::{Error, Result};
use crate::policy::SecretDescriptor;
use crate::store::{CallContext, ResourceStore};

/// Fetch a secret through the store
pub async fn get_secret<S: ResourceStore>(
    store: &S,
    call: &CallContext,
    name: &str,
    namespace: &str,
) -> Result<Secret> {
    call.run(store.get::<Secret>(namespace, name))
        .await?
        .ok_or_else(|| Error::SecretNotFound(format!("{}/{}", namespace, name)))
}

/// Get a raw value from a secret
pub fn get_secret_bytes(secret: &Secret, key: &str) -> Result<ByteString> {
    let missing = || Error::SecretKeyNotFound {
        secret: secret.metadata.name.clone().unwrap_or_default(),
        key: key.to_string(),
    };

    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return Ok(value.clone());
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| ByteString(v.as_bytes().to_vec()))
        .ok_or_else(missing)
}

/// Resolve every source of the descriptor into Secret data
pub async fn resolve_credentials<S: ResourceStore>(
    store: &S,
    call: &CallContext,
    descriptor: &SecretDescriptor,
) -> Result<BTreeMap<String, ByteString>> {
    let secret_names: BTreeSet<&str> = descriptor
        .sources
        .values()
        .map(|s| s.name.as_str())
        .collect();

    let mut secrets = BTreeMap::new();
    for name in secret_names {
        if name == descriptor.name {
            return Err(Error::invalid_spec(format!(
                "credentials cannot be read from the generated secret '{}'",
                name
            )));
        }
        let secret = get_secret(store, call, name, &descriptor.namespace).await?;
        secrets.insert(name, secret);
    }

    descriptor
        .sources
        .iter()
        .map(|(target, source)| {
            let secret = secrets
                .get(source.name.as_str())
                .ok_or_else(|| Error::SecretNotFound(source.name.clone()))?;
            Ok::<_, Error>((target.clone(), get_secret_bytes(secret, &source.key)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use tokio_util::sync::CancellationToken;

    use crate::crd::SecretKeySelector;
    use crate::store::MemoryStore;

    fn user_secret(name: &str, data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn descriptor(sources: &[(&str, &str, &str)]) -> SecretDescriptor {
        SecretDescriptor {
            name: "store-a-credentials".to_string(),
            namespace: "ns1".to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            sources: sources
                .iter()
                .map(|(target, name, key)| {
                    (
                        target.to_string(),
                        SecretKeySelector {
                            name: name.to_string(),
                            key: key.to_string(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn call() -> CallContext {
        CallContext::new(Duration::from_secs(1), CancellationToken::new())
    }

    #[tokio::test]
    async fn copies_values_under_target_keys() {
        let store = MemoryStore::new();
        store
            .seed(user_secret("aws", &[("ID", "AKIA"), ("SECRET", "s3cr3t")]))
            .unwrap();

        let data = resolve_credentials(
            &store,
            &call(),
            &descriptor(&[
                ("AWS_ACCESS_KEY_ID", "aws", "ID"),
                ("AWS_SECRET_ACCESS_KEY", "aws", "SECRET"),
            ]),
        )
        .await
        .unwrap();

        assert_eq!(data["AWS_ACCESS_KEY_ID"], ByteString(b"AKIA".to_vec()));
        assert_eq!(data["AWS_SECRET_ACCESS_KEY"], ByteString(b"s3cr3t".to_vec()));
    }

    #[tokio::test]
    async fn missing_secret_is_reported() {
        let store = MemoryStore::new();
        let err = resolve_credentials(&store, &call(), &descriptor(&[("X", "absent", "k")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SecretNotFound(ref s) if s == "ns1/absent"));
    }

    #[tokio::test]
    async fn missing_key_is_reported() {
        let store = MemoryStore::new();
        store.seed(user_secret("aws", &[("ID", "AKIA")])).unwrap();

        let err = resolve_credentials(&store, &call(), &descriptor(&[("X", "aws", "SECRET")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SecretKeyNotFound { ref key, .. } if key == "SECRET"));
    }
}
