//! Prometheus metrics for the Barman Cloud operator
//!
//! Counters and gauges for reconciliation outcomes and derivative writes,
//! served over HTTP next to the health probes.

mod prometheus;

pub use prometheus::*;
