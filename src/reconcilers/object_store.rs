//! ObjectStore reconciliation logic

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, trace, warn};

use super::finalizer::ensure_finalizer;
use super::status::{next_status, Readiness};
use super::Outcome;
use crate::adapters::resolve_credentials;
use crate::crd::ObjectStore;
use crate::error::{Error, ErrorClass, Result};
use crate::metrics::{DERIVATIVE_WRITES, RECONCILIATION_ERRORS};
use crate::policy::{
    desired_derivatives, is_owned_by, owner_selector, Derivative, DesiredDerivatives,
};
use crate::store::{CallContext, ObjectKey, ResourceStore, StoreObject};

/// Drives one ObjectStore identity toward its desired derivatives
pub struct ObjectStoreReconciler<S> {
    store: Arc<S>,
}

impl<S: ResourceStore> ObjectStoreReconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reconcile the ObjectStore named by `key` against its current state.
    ///
    /// Every read happens inside this call, so replaying a key any number of
    /// times converges to the same result.
    pub async fn reconcile(&self, key: &ObjectKey, call: &CallContext) -> Outcome {
        let mut obj = match call
            .run(self.store.get::<ObjectStore>(&key.namespace, &key.name))
            .await
        {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                debug!(object_store = %key, "ObjectStore is gone, nothing to do");
                return Outcome::Converged;
            }
            Err(e) => return self.fail(None, key, e, call).await,
        };

        if obj.metadata.deletion_timestamp.is_some() {
            return self.release(obj, key, call).await;
        }

        if let Err(e) = self.apply(&mut obj, call).await {
            return self.fail(Some(&obj), key, e, call).await;
        }
        match self.report(&obj, &Readiness::converged(), call).await {
            Ok(()) => {
                debug!(object_store = %key, "ObjectStore converged");
                Outcome::Converged
            }
            Err(e) => self.fail(None, key, e, call).await,
        }
    }

    /// Bring the derivatives in line with the policy output
    async fn apply(&self, obj: &mut ObjectStore, call: &CallContext) -> Result<()> {
        let desired = desired_derivatives(obj)?;
        let data = resolve_credentials(self.store(), call, &desired.secret).await?;

        // The finalizer must be persisted before anything is created
        ensure_finalizer(self.store(), obj, call).await?;
        self.converge_all(obj, desired, data, call).await
    }

    /// Recreate or repair the derivatives of an ObjectStore whose deletion
    /// is held back. The ObjectStore itself is left untouched.
    pub(super) async fn restore(&self, obj: &ObjectStore, call: &CallContext) -> Result<()> {
        let desired = desired_derivatives(obj)?;
        let data = resolve_credentials(self.store(), call, &desired.secret).await?;
        self.converge_all(obj, desired, data, call).await
    }

    async fn converge_all(
        &self,
        obj: &ObjectStore,
        desired: DesiredDerivatives,
        data: BTreeMap<String, ByteString>,
        call: &CallContext,
    ) -> Result<()> {
        let owner = obj
            .controller_owner_ref(&())
            .ok_or_else(|| Error::fatal(format!("ObjectStore {} has no uid", obj.name_any())))?;
        let name = obj.name_any();
        let owners = Some(vec![owner.clone()]);

        let mut role = desired.role;
        role.metadata.owner_references = owners.clone();
        self.converge(role, &owner.uid, &name, call).await?;

        let mut role_binding = desired.role_binding;
        role_binding.metadata.owner_references = owners.clone();
        self.converge(role_binding, &owner.uid, &name, call).await?;

        let mut secret = desired.secret.render(data);
        secret.metadata.owner_references = owners;
        self.converge(secret, &owner.uid, &name, call).await?;

        Ok(())
    }

    /// Make the single derivative of kind `K` match `desired`, removing any
    /// other object of that kind the owner still holds
    async fn converge<K: Derivative>(
        &self,
        desired: K,
        uid: &str,
        owner_name: &str,
        call: &CallContext,
    ) -> Result<()> {
        let kind = K::kind(&());
        let key = ObjectKey::of(&desired)
            .ok_or_else(|| Error::fatal(format!("{} derivative has no namespace", kind)))?;

        let owned: Vec<K> = call
            .run(self.store.list::<K>(&key.namespace, &owner_selector(owner_name)))
            .await?;
        for stale in owned
            .iter()
            .filter(|o| is_owned_by(*o, uid) && o.name_any() != key.name)
        {
            info!(kind = %kind, name = %stale.name_any(), "Removing stale derivative");
            self.delete_derivative(stale, call).await?;
        }

        let live = call
            .run(self.store.get::<K>(&key.namespace, &key.name))
            .await?;
        match live {
            None => {
                info!(kind = %kind, derivative = %key, "Creating derivative");
                call.run(self.store.create(&desired)).await?;
                DERIVATIVE_WRITES.with_label_values(&[kind.as_ref(), "create"]).inc();
            }
            Some(live) if !is_owned_by(&live, uid) => {
                return Err(Error::fatal(format!(
                    "{} {} exists but is not owned by ObjectStore {}",
                    kind, key, owner_name
                )));
            }
            Some(live) if live.needs_recreate(&desired) => {
                info!(kind = %kind, derivative = %key, "Recreating derivative with immutable changes");
                self.delete_derivative(&live, call).await?;
                call.run(self.store.create(&desired)).await?;
                DERIVATIVE_WRITES.with_label_values(&[kind.as_ref(), "create"]).inc();
            }
            Some(live) if live.matches(&desired) => {
                trace!(kind = %kind, derivative = %key, "Derivative up to date");
            }
            Some(mut live) => {
                info!(kind = %kind, derivative = %key, "Repairing drifted derivative");
                live.adopt(&desired);
                call.run(self.store.update(&live)).await?;
                DERIVATIVE_WRITES.with_label_values(&[kind.as_ref(), "update"]).inc();
            }
        }
        Ok(())
    }

    /// Delete a derivative at the version we observed; already gone is fine
    pub(super) async fn delete_derivative<K: StoreObject>(
        &self,
        obj: &K,
        call: &CallContext,
    ) -> Result<()> {
        let kind = K::kind(&());
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        match call
            .run(self.store.delete::<K>(
                &namespace,
                &name,
                obj.meta().resource_version.as_deref(),
            ))
            .await
        {
            Ok(()) => {
                DERIVATIVE_WRITES.with_label_values(&[kind.as_ref(), "delete"]).inc();
                Ok(())
            }
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Write the Ready condition when it differs from what is recorded
    pub(super) async fn report(
        &self,
        obj: &ObjectStore,
        readiness: &Readiness,
        call: &CallContext,
    ) -> Result<()> {
        let Some(status) = next_status(
            obj.status.as_ref(),
            obj.metadata.generation,
            readiness,
            Utc::now(),
        ) else {
            return Ok(());
        };

        let mut updated = obj.clone();
        updated.status = Some(status);
        call.run(self.store.update_status(&updated)).await?;
        Ok(())
    }

    /// Log, record and classify a failed reconciliation.
    ///
    /// Persistent failures are also written to the Ready condition of `obj`.
    pub(super) async fn fail(
        &self,
        obj: Option<&ObjectStore>,
        key: &ObjectKey,
        err: Error,
        call: &CallContext,
    ) -> Outcome {
        let class = err.class();
        match class {
            ErrorClass::Gone | ErrorClass::Conflict => {
                debug!(object_store = %key, error = %err, "Reconciliation raced with another writer")
            }
            ErrorClass::Transient => {
                warn!(object_store = %key, error = %err, "Reconciliation interrupted")
            }
            ErrorClass::Blocked => info!(object_store = %key, error = %err, "Deletion blocked"),
            ErrorClass::Configuration => {
                warn!(object_store = %key, error = %err, "ObjectStore cannot be realized")
            }
            ErrorClass::Fatal => error!(object_store = %key, error = %err, "Reconciliation failed"),
        }
        RECONCILIATION_ERRORS
            .with_label_values(&[err.metric_label()])
            .inc();

        let persistent = matches!(
            class,
            ErrorClass::Blocked | ErrorClass::Configuration | ErrorClass::Fatal
        );
        if let (Some(obj), true) = (obj, persistent) {
            if let Err(status_err) = self.report(obj, &Readiness::from_error(&err), call).await {
                warn!(object_store = %key, error = %status_err, "Failed to record status");
            }
        }

        Outcome::from_error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use k8s_openapi::api::rbac::v1::Role;
    use tokio_util::sync::CancellationToken;

    use crate::crd::{BarmanObjectStoreConfiguration, GoogleCredentials, ObjectStoreSpec};
    use crate::store::MemoryStore;

    fn object_store() -> ObjectStore {
        let mut obj = ObjectStore::new(
            "store-a",
            ObjectStoreSpec {
                configuration: BarmanObjectStoreConfiguration {
                    destination_path: "gs://backups".to_string(),
                    google_credentials: Some(GoogleCredentials {
                        gke_environment: true,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        obj.metadata.namespace = Some("ns1".to_string());
        obj
    }

    fn call() -> CallContext {
        CallContext::new(Duration::from_secs(1), CancellationToken::new())
    }

    #[tokio::test]
    async fn derivatives_carry_a_controller_owner_reference() {
        let store = Arc::new(MemoryStore::new());
        let seeded = store.seed(object_store()).unwrap();
        let reconciler = ObjectStoreReconciler::new(store.clone());

        let outcome = reconciler
            .reconcile(&ObjectKey::new("ns1", "store-a"), &call())
            .await;
        assert!(outcome.is_converged());

        let role: Role = store.snapshot("ns1", "store-a-role").unwrap();
        let owners = role.metadata.owner_references.unwrap();
        let owner = &owners[0];
        assert_eq!(Some(&owner.uid), seeded.metadata.uid.as_ref());
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.kind, "ObjectStore");
    }

    #[tokio::test]
    async fn missing_uid_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = ObjectStoreReconciler::new(store);
        let obj = object_store();

        let err = reconciler.restore(&obj, &call()).await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }
}
