//! ObjectStore controller
//!
//! Watches ObjectStore resources and triggers reconciliation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::{
    api::ListParams,
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::RetryTracker;
use crate::controllers::Context;
use crate::crd::{Backup, Cluster, ObjectStore};
use crate::error::{Error, Result};
use crate::metrics;
use crate::policy::{credential_sources, OBJECT_STORE_LABEL};
use crate::reconcilers::{Outcome, Requeue};
use crate::store::{CallContext, ObjectKey};

/// Run the ObjectStore controller until the shutdown token fires.
///
/// Fails when the ObjectStore CRD is not served.
pub async fn run(client: Client, context: Arc<Context>) -> Result<()> {
    let api: Api<ObjectStore> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("ObjectStore CRD not installed: {}", e);
        return Err(Error::config(format!("ObjectStore CRD not installed: {}", e)));
    }

    // Only derivatives carry the owner label
    let owned = WatcherConfig::default().labels(OBJECT_STORE_LABEL);
    let concurrency = context.config.concurrency;
    let shutdown = context.shutdown.clone();

    info!(concurrency, "Starting ObjectStore controller");

    let controller = Controller::new(api, WatcherConfig::default())
        .with_config(controller::Config::default().concurrency(concurrency));
    let object_stores = controller.store();
    let known = object_stores.clone();
    let tracked = context.clone();

    metrics::OPERATOR_HEALTH.set(1.0);
    controller
        .owns(Api::<Role>::all(client.clone()), owned.clone())
        .owns(Api::<RoleBinding>::all(client.clone()), owned.clone())
        .owns(Api::<Secret>::all(client.clone()), owned)
        .watches(
            Api::<Secret>::all(client.clone()),
            WatcherConfig::default(),
            move |secret| stores_using_secret(&object_stores.state(), &secret),
        )
        .watches(
            Api::<Cluster>::all(client.clone()),
            WatcherConfig::default(),
            stores_of_cluster,
        )
        .watches(
            Api::<Backup>::all(client),
            WatcherConfig::default(),
            stores_of_backup,
        )
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, context)
        .for_each(|result| {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or_default(),
                        ?action,
                        "Reconciled ObjectStore"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Controller error");
                }
            }
            // Deleted ObjectStores are never reconciled again
            tracked.retries.retain(|key| {
                known
                    .get(&ObjectRef::new(&key.name).within(&key.namespace))
                    .is_some()
            });
            future::ready(())
        })
        .await;

    metrics::OPERATOR_HEALTH.set(0.0);
    info!("ObjectStore controller stopped");
    Ok(())
}

/// ObjectStores in the Secret's namespace that read credentials from it
fn stores_using_secret(
    stores: &[Arc<ObjectStore>],
    secret: &Secret,
) -> Vec<ObjectRef<ObjectStore>> {
    let Some(namespace) = secret.namespace() else {
        return Vec::new();
    };
    let name = secret.name_any();
    stores
        .iter()
        .filter(|store| store.namespace().as_deref() == Some(namespace.as_str()))
        .filter(|store| {
            credential_sources(&store.spec.configuration)
                .values()
                .any(|source| source.name == name)
        })
        .map(|store| ObjectRef::from_obj(store.as_ref()))
        .collect()
}

fn stores_of_cluster(cluster: Cluster) -> Vec<ObjectRef<ObjectStore>> {
    let Some(namespace) = cluster.namespace() else {
        return Vec::new();
    };
    cluster
        .barman_object_names()
        .map(|name| ObjectRef::new(name).within(&namespace))
        .collect()
}

/// Backups naming their store through the cluster are covered by the Cluster
/// watch and the blocked-deletion retry
fn stores_of_backup(backup: Backup) -> Option<ObjectRef<ObjectStore>> {
    let namespace = backup.namespace()?;
    backup
        .barman_object_name()
        .map(|name| ObjectRef::new(name).within(&namespace))
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<ObjectStore>, ctx: Arc<Context>) -> Result<Action> {
    let Some(key) = ObjectKey::of(obj.as_ref()) else {
        warn!("ObjectStore without namespace, ignoring");
        return Ok(Action::await_change());
    };

    let started = Instant::now();
    let call = CallContext::new(ctx.config.store_timeout(), ctx.shutdown.child_token());
    let outcome = ctx.reconciler.reconcile(&key, &call).await;

    let label = outcome.label();
    metrics::RECONCILIATIONS.with_label_values(&[label]).inc();
    metrics::RECONCILE_DURATION
        .with_label_values(&[label])
        .observe(started.elapsed().as_secs_f64());

    to_action(outcome, &key, &ctx.retries, ctx.config.resync_interval())
}

/// Translate a reconciliation outcome into the runtime's next action
pub fn to_action(
    outcome: Outcome,
    key: &ObjectKey,
    retries: &RetryTracker,
    resync: Duration,
) -> Result<Action> {
    match outcome {
        Outcome::Converged => {
            retries.reset(key);
            Ok(Action::requeue(resync))
        }
        Outcome::Requeue(Requeue::Immediate) => Ok(Action::requeue(Duration::ZERO)),
        Outcome::Requeue(Requeue::Backoff) => Ok(Action::requeue(retries.next_delay(key))),
        Outcome::Fatal(e) => Err(e),
    }
}

/// Error policy for the controller
fn error_policy(obj: Arc<ObjectStore>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        name = %obj.name_any(),
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    match ObjectKey::of(obj.as_ref()) {
        Some(key) => Action::requeue(ctx.retries.next_delay(&key)),
        None => Action::await_change(),
    }
}
