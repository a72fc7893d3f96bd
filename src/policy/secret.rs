use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use crate::crd::{BarmanObjectStoreConfiguration, SecretKeySelector};
use crate::error::{Error, Result};

/// The credentials Secret, before its source values are resolved
#[derive(Clone, Debug, PartialEq)]
pub struct SecretDescriptor {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Target key → user Secret key it is copied from
    pub sources: BTreeMap<String, SecretKeySelector>,
}

impl SecretDescriptor {
    /// Build the Secret from resolved source values
    pub fn render(&self, data: BTreeMap<String, ByteString>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels.clone()),
                annotations: Some(self.annotations.clone()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }
}

/// Map the provider credentials to the environment keys barman-cloud reads
pub fn credential_sources(
    config: &BarmanObjectStoreConfiguration,
) -> BTreeMap<String, SecretKeySelector> {
    let mut sources = BTreeMap::new();
    let mut put = |key: &str, selector: &Option<SecretKeySelector>| {
        if let Some(selector) = selector {
            sources.insert(key.to_string(), selector.clone());
        }
    };

    if let Some(s3) = &config.s3_credentials {
        put("AWS_ACCESS_KEY_ID", &s3.access_key_id);
        put("AWS_SECRET_ACCESS_KEY", &s3.secret_access_key);
        put("AWS_DEFAULT_REGION", &s3.region);
        put("AWS_SESSION_TOKEN", &s3.session_token);
    }
    if let Some(azure) = &config.azure_credentials {
        put("AZURE_STORAGE_CONNECTION_STRING", &azure.connection_string);
        put("AZURE_STORAGE_ACCOUNT", &azure.storage_account);
        put("AZURE_STORAGE_KEY", &azure.storage_key);
        put("AZURE_STORAGE_SAS_TOKEN", &azure.storage_sas_token);
    }
    if let Some(google) = &config.google_credentials {
        put("GOOGLE_APPLICATION_CREDENTIALS", &google.application_credentials);
    }
    sources
}

/// Check that the chosen provider has enough material to authenticate
pub(super) fn validate_credentials(config: &BarmanObjectStoreConfiguration) -> Result<()> {
    if let Some(s3) = &config.s3_credentials {
        if !s3.inherit_from_iam_role
            && (s3.access_key_id.is_none() || s3.secret_access_key.is_none())
        {
            return Err(Error::invalid_spec(
                "s3Credentials needs accessKeyId and secretAccessKey unless inheritFromIAMRole is set",
            ));
        }
    }
    if let Some(azure) = &config.azure_credentials {
        let has_key = azure.storage_key.is_some() || azure.storage_sas_token.is_some();
        let usable = azure.inherit_from_azure_ad
            || azure.connection_string.is_some()
            || (azure.storage_account.is_some() && has_key);
        if !usable {
            return Err(Error::invalid_spec(
                "azureCredentials needs connectionString, or storageAccount with storageKey or storageSasToken, unless inheritFromAzureAD is set",
            ));
        }
    }
    if let Some(google) = &config.google_credentials {
        if !google.gke_environment && google.application_credentials.is_none() {
            return Err(Error::invalid_spec(
                "googleCredentials needs applicationCredentials unless gkeEnvironment is set",
            ));
        }
    }
    for selector in credential_sources(config).values() {
        if selector.name.is_empty() || selector.key.is_empty() {
            return Err(Error::invalid_spec(
                "credential references need both a secret name and a key",
            ));
        }
    }
    Ok(())
}
