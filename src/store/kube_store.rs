use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, PostParams, Preconditions};
use kube::{Api, Client, ResourceExt};

use super::{ResourceStore, StoreObject};
use crate::error::{Error, Result};

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "barman-cloud-operator";

/// [`ResourceStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoreObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }
}

fn namespace_of<K: StoreObject>(obj: &K) -> Result<String> {
    obj.namespace().ok_or_else(|| {
        Error::fatal(format!(
            "{} {} has no namespace",
            K::kind(&()),
            obj.name_any()
        ))
    })
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: StoreObject>(&self, namespace: &str, selector: &str) -> Result<Vec<K>> {
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(selector);
        }
        Ok(self.api::<K>(namespace).list(&lp).await?.items)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let namespace = namespace_of(obj)?;
        Ok(self
            .api::<K>(&namespace)
            .create(&Self::post_params(), obj)
            .await?)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let namespace = namespace_of(obj)?;
        Ok(self
            .api::<K>(&namespace)
            .replace(&obj.name_any(), &Self::post_params(), obj)
            .await?)
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let namespace = namespace_of(obj)?;
        let body = serde_json::to_vec(obj)?;
        Ok(self
            .api::<K>(&namespace)
            .replace_status(&obj.name_any(), &Self::post_params(), body)
            .await?)
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        expected_version: Option<&str>,
    ) -> Result<()> {
        let dp = DeleteParams {
            preconditions: expected_version.map(|v| Preconditions {
                resource_version: Some(v.to_string()),
                uid: None,
            }),
            ..DeleteParams::default()
        };
        self.api::<K>(namespace).delete(name, &dp).await?;
        Ok(())
    }
}
