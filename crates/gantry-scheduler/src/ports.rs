//! Interfaces the reconciliation engine consumes. Production implementations
//! live in [`crate::store`], [`crate::notify`] and [`crate::metrics`].

use anyhow::Result;
use async_trait::async_trait;

use gantry_common::{NodeDescriptor, PlacementHandle, PlacementSpec, WorkloadRecord, WorkloadStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadEvent {
    pub id: String,
    pub kind: EventKind,
}

/// At-least-once notifications, ordered per identity only.
#[async_trait]
pub trait EventSource: Send {
    /// `None` once the source is exhausted.
    async fn next(&mut self) -> Option<WorkloadEvent>;
}

/// Result of a version-guarded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Applied; carries the new version.
    Applied(u64),
    Conflict,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// The record and its version, or `None` if it no longer exists.
    async fn get(&self, id: &str) -> Result<Option<(WorkloadRecord, u64)>>;

    async fn update_status(
        &self,
        id: &str,
        status: &WorkloadStatus,
        expected_version: u64,
    ) -> Result<WriteOutcome>;

    /// Drop the tracking record once nothing it owns is still live.
    async fn remove(&self, id: &str, expected_version: u64) -> Result<WriteOutcome>;
}

#[async_trait]
pub trait NodeInventory: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<NodeDescriptor>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issued {
    Created,
    Existing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotFound,
}

/// Creates and releases placements. Creation is idempotent per key.
#[async_trait]
pub trait PlacementExecutor: Send + Sync {
    async fn ensure_created(
        &self,
        key: &str,
        spec: &PlacementSpec,
    ) -> Result<(PlacementHandle, Issued)>;

    async fn release(&self, key: &str) -> Result<ReleaseOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Fire-and-forget user-facing notifications. Must not block or fail the caller.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, request_id: &str, severity: Severity, reason: &str, message: &str);
}

/// Best-effort counters and timings. Must never affect control flow.
pub trait MetricsSink: Send + Sync {
    fn scheduled(&self, strategy: &str);
    fn failed(&self, reason: &str);
    fn retried(&self);
    fn reconcile_duration(&self, result: &str, seconds: f64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn scheduled(&self, _strategy: &str) {}
    fn failed(&self, _reason: &str) {}
    fn retried(&self) {}
    fn reconcile_duration(&self, _result: &str, _seconds: f64) {}
}
