//! Reconciliation engine for GPU workloads: backoff, placement policies,
//! the per-workload state machine, and the dispatcher that drives it.

pub mod backoff;
pub mod dispatcher;
pub mod engine;
pub mod metrics;
pub mod notify;
pub mod policy;
pub mod ports;
pub mod store;
pub mod util;

#[cfg(test)]
mod testing;

pub use dispatcher::Dispatcher;
pub use engine::{Outcome, ReconcileError, ReconciliationEngine};
pub use policy::{resolve_policy, PolicyKind, SchedulingPolicy};
