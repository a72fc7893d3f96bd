//! Barman Cloud ObjectStore Operator
//!
//! Reconciles `ObjectStore` resources (barmancloud.cnpg.io) into the Role,
//! RoleBinding and credentials Secret that CloudNativePG instances need to
//! reach a backup object store, and guards their deletion while Clusters or
//! Backups still use them.

pub mod adapters;
pub mod backoff;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod reconcilers;
pub mod store;

pub use error::{Error, Result};
