//! Finalizer protocol guarding ObjectStore deletion
//!
//! While the finalizer is present the ObjectStore cannot disappear. It is only
//! removed once no Cluster or Backup uses the store and every derivative has
//! been deleted.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::ResourceExt;
use tracing::{debug, info};

use super::object_store::ObjectStoreReconciler;
use super::references::{describe, find_references};
use super::Outcome;
use crate::crd::ObjectStore;
use crate::error::{Error, ErrorClass, Result};
use crate::metrics::{DELETIONS_BLOCKED, MANAGED_OBJECT_STORES};
use crate::policy::{derivative_names, is_owned_by, owner_selector};
use crate::store::{CallContext, ObjectKey, ResourceStore, StoreObject};

/// Finalizer added to every ObjectStore this operator manages
pub const FINALIZER_NAME: &str = "barmancloud.cnpg.io/objectstore-finalizer";

pub fn has_finalizer(obj: &ObjectStore) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER_NAME)
}

/// Persist the finalizer, replacing `obj` with the stored copy
pub(super) async fn ensure_finalizer<S: ResourceStore>(
    store: &S,
    obj: &mut ObjectStore,
    call: &CallContext,
) -> Result<()> {
    if has_finalizer(obj) {
        return Ok(());
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().push(FINALIZER_NAME.to_string());
    *obj = call.run(store.update(&updated)).await?;
    MANAGED_OBJECT_STORES.inc();
    info!(name = %obj.name_any(), "Added finalizer");
    Ok(())
}

impl<S: ResourceStore> ObjectStoreReconciler<S> {
    /// Handle an ObjectStore that has been asked to go away
    pub(super) async fn release(
        &self,
        obj: ObjectStore,
        key: &ObjectKey,
        call: &CallContext,
    ) -> Outcome {
        if !has_finalizer(&obj) {
            return Outcome::Converged;
        }

        let references = match find_references(self.store(), call, key).await {
            Ok(references) => references,
            Err(e) => return self.fail(Some(&obj), key, e, call).await,
        };
        if !references.is_empty() {
            DELETIONS_BLOCKED
                .with_label_values(&[key.namespace.as_str()])
                .inc();
            // Consumers still read the Secret until the last reference goes
            match self.restore(&obj, call).await {
                Ok(()) => {}
                Err(e) if e.class() == ErrorClass::Configuration => {
                    debug!(object_store = %key, error = %e, "Not restoring derivatives");
                }
                Err(e) => return self.fail(Some(&obj), key, e, call).await,
            }
            let err = Error::ReferencedResourceExists(describe(&references));
            return self.fail(Some(&obj), key, err, call).await;
        }

        if let Err(e) = self.purge(&obj, call).await {
            return self.fail(Some(&obj), key, e, call).await;
        }
        match self.remove_finalizer(obj, call).await {
            Ok(()) => {
                info!(object_store = %key, "Released ObjectStore");
                Outcome::Converged
            }
            Err(e) => self.fail(None, key, e, call).await,
        }
    }

    /// Delete every derivative the ObjectStore owns
    async fn purge(&self, obj: &ObjectStore, call: &CallContext) -> Result<()> {
        let Some(uid) = obj.uid() else {
            return Err(Error::fatal(format!(
                "ObjectStore {} has no uid",
                obj.name_any()
            )));
        };
        let name = obj.name_any();
        let names = derivative_names(&name);
        self.purge_kind::<Role>(obj, &uid, &names.role, call).await?;
        self.purge_kind::<RoleBinding>(obj, &uid, &names.role_binding, call)
            .await?;
        self.purge_kind::<Secret>(obj, &uid, &names.secret, call).await?;
        Ok(())
    }

    /// Owned objects of kind `K`: everything carrying the owner label plus
    /// the deterministic name, in case the label was stripped
    async fn purge_kind<K: StoreObject>(
        &self,
        obj: &ObjectStore,
        uid: &str,
        expected_name: &str,
        call: &CallContext,
    ) -> Result<()> {
        let namespace = obj.namespace().unwrap_or_default();
        let mut candidates: Vec<K> = call
            .run(self.store().list::<K>(&namespace, &owner_selector(&obj.name_any())))
            .await?;
        if !candidates.iter().any(|c| c.name_any() == expected_name) {
            if let Some(named) = call
                .run(self.store().get::<K>(&namespace, expected_name))
                .await?
            {
                candidates.push(named);
            }
        }

        let kind = K::kind(&());
        for candidate in candidates.iter().filter(|c| is_owned_by(*c, uid)) {
            info!(kind = %kind, name = %candidate.name_any(), "Deleting derivative");
            self.delete_derivative(candidate, call).await?;
        }
        Ok(())
    }

    async fn remove_finalizer(&self, obj: ObjectStore, call: &CallContext) -> Result<()> {
        let mut updated = obj;
        updated.finalizers_mut().retain(|f| f != FINALIZER_NAME);
        call.run(self.store().update(&updated)).await?;
        MANAGED_OBJECT_STORES.dec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizer_is_detected() {
        let mut obj = ObjectStore::new("store-a", Default::default());
        assert!(!has_finalizer(&obj));

        obj.finalizers_mut().push("other.io/finalizer".to_string());
        assert!(!has_finalizer(&obj));

        obj.finalizers_mut().push(FINALIZER_NAME.to_string());
        assert!(has_finalizer(&obj));
    }
}
