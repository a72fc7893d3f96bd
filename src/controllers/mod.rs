//! Kubernetes controller for ObjectStore resources
//!
//! Watches ObjectStores, their derivatives and the CloudNativePG resources
//! referencing them, and feeds the reconciler one identity at a time.

mod object_store_controller;

pub use object_store_controller::{run, to_action};

use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryTracker;
use crate::config::OperatorConfig;
use crate::reconcilers::ObjectStoreReconciler;
use crate::store::KubeStore;

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub reconciler: ObjectStoreReconciler<KubeStore>,
    pub retries: RetryTracker,
    pub config: OperatorConfig,
    /// Fires when the operator is shutting down; aborts in-flight store calls
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, config: OperatorConfig, shutdown: CancellationToken) -> Self {
        Self {
            reconciler: ObjectStoreReconciler::new(Arc::new(KubeStore::new(client.clone()))),
            retries: RetryTracker::new(config.backoff()),
            client,
            config,
            shutdown,
        }
    }
}
