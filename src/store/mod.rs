//! Resource store abstraction
//!
//! The reconciler talks to the cluster only through [`ResourceStore`], which is
//! handed to it at construction. [`KubeStore`] is backed by the Kubernetes API;
//! [`MemoryStore`] keeps everything in process.
//!
//! All writes are compare-and-swap: `update` and `update_status` require the
//! object's `resourceVersion` to match the stored one, and `delete` takes the
//! expected version explicitly.

mod call;
mod kube_store;
mod memory;

pub use call::CallContext;
pub use kube_store::KubeStore;
pub use memory::{FailureKind, MemoryStore, Operation};

use std::fmt;

use async_trait::async_trait;
use kube::core::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// A namespaced, typed object the store can hold
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Identity of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced resource, `None` if it has no namespace
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        Some(Self::new(obj.namespace()?, obj.name_any()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Versioned object store with optimistic concurrency
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch an object, `None` if it does not exist
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects matching an equality label selector ("a=b,c=d"); empty selects all
    async fn list<K: StoreObject>(&self, namespace: &str, selector: &str) -> Result<Vec<K>>;

    /// Create an object; fails with Conflict if the name is taken
    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Replace an object's metadata and body, expecting its current resourceVersion
    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Replace an object's status subresource, expecting its current resourceVersion
    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Delete an object if its version still matches `expected_version`
    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        expected_version: Option<&str>,
    ) -> Result<()>;
}
