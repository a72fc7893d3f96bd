//! Adapters between ObjectStore specs and the Secrets they reference

mod secrets;

pub use secrets::*;
