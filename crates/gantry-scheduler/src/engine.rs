use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, warn, Instrument};

use gantry_common::{PlacementSpec, RetryPolicy, WorkloadPhase, WorkloadRecord, WorkloadStatus};

use crate::backoff::{next_backoff, should_retry};
use crate::notify::TracingNotificationSink;
use crate::policy::resolve_policy;
use crate::ports::{
    Issued, MetricsSink, NodeInventory, NoopMetrics, NotificationSink, PlacementExecutor,
    ReleaseOutcome, RequestStore, Severity, WriteOutcome,
};
use crate::util::now_ms;

/// What the caller should do with the identity after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing further until the next event.
    Done,
    /// Deliver the identity again after the delay.
    RequeueAfter(Duration),
}

/// A pass that did not complete. The dispatcher retries these.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("workload {0} changed during the pass")]
    Conflict(String),

    #[error("failed to release placement {key}: {reason:#}")]
    Release { key: String, reason: anyhow::Error },
}

/// How a pass ended, used as the `result` label of the duration histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassResult {
    Scheduled,
    Requeued,
    Failed,
    Skipped,
    Deleted,
}

impl PassResult {
    fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Requeued => "requeued",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Deleted => "deleted",
        }
    }
}

type PassOutput = Result<(Outcome, PassResult), ReconcileError>;

/// Drives one workload at a time through Pending → Scheduled | Failed, and
/// through cleanup once deletion is requested.
///
/// The engine holds no per-workload state; everything it needs is read from
/// the [`RequestStore`] at the start of a pass, and every write is guarded by
/// the version read then.
pub struct ReconciliationEngine {
    store: Arc<dyn RequestStore>,
    inventory: Arc<dyn NodeInventory>,
    executor: Arc<dyn PlacementExecutor>,
    notifier: Arc<dyn NotificationSink>,
    metrics: Arc<dyn MetricsSink>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn RequestStore>,
        inventory: Arc<dyn NodeInventory>,
        executor: Arc<dyn PlacementExecutor>,
    ) -> Self {
        Self {
            store,
            inventory,
            executor,
            notifier: Arc::new(TracingNotificationSink),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run one reconciliation pass for `id`.
    pub async fn reconcile(&self, id: &str) -> Result<Outcome, ReconcileError> {
        let started = Instant::now();
        let result = self
            .reconcile_inner(id)
            .instrument(info_span!("reconcile", workload = %id))
            .await;

        let label = match &result {
            Ok((_, pass)) => pass.as_str(),
            Err(_) => "error",
        };
        self.metrics
            .reconcile_duration(label, started.elapsed().as_secs_f64());
        result.map(|(outcome, _)| outcome)
    }

    async fn reconcile_inner(&self, id: &str) -> PassOutput {
        let Some((record, version)) = self.store.get(id).await? else {
            debug!("workload no longer exists");
            return Ok((Outcome::Done, PassResult::Skipped));
        };

        // Deletion pre-empts everything, including the already-placed skip.
        if record.is_deleting() {
            self.cleanup(id, &record, version).await?;
            return Ok((Outcome::Done, PassResult::Deleted));
        }

        let mut status = record.status.clone();
        match status.phase {
            Some(phase) if phase.is_placed() => {
                debug!(%phase, "already placed, nothing to do");
                return Ok((Outcome::Done, PassResult::Skipped));
            }
            Some(WorkloadPhase::Failed) => {
                debug!("workload already failed");
                return Ok((Outcome::Done, PassResult::Skipped));
            }
            _ => {}
        }

        if status.phase.is_none() {
            debug!("initializing workload as Pending");
            status.phase = Some(WorkloadPhase::Pending);
        }
        status.last_attempt_ms = Some(now_ms());

        let retry = record.request.spec.retry_policy;
        let max_retries = retry.effective_max_retries();
        if !should_retry(status.retry_count, max_retries) {
            return self.mark_failed(id, status, version, max_retries, None).await;
        }

        let nodes = match self.inventory.snapshot().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "node inventory unavailable");
                self.metrics.failed("inventory_unavailable");
                let message = format!("error listing nodes: {e:#}");
                return self.requeue_transient(id, status, version, &retry, message).await;
            }
        };

        let ready: Vec<_> = nodes.into_iter().filter(|n| n.ready).collect();
        if ready.is_empty() {
            info!("no ready nodes");
            self.metrics.failed("no_ready_nodes");
            let message = "no ready capacity".to_string();
            return self.requeue_transient(id, status, version, &retry, message).await;
        }
        debug!(count = ready.len(), "found ready nodes");

        let spec = &record.request.spec;
        let policy = resolve_policy(&spec.strategy_name);
        let node = match policy.choose(&ready, spec) {
            Ok(node) => node,
            Err(e) => {
                info!(strategy = policy.name(), error = %e, "no suitable node");
                return self
                    .placement_failure(id, status, version, &retry, "no_suitable_node", e.to_string())
                    .await;
            }
        };
        info!(node = %node.name, strategy = policy.name(), "selected node");

        let key = record.request.placement_key();
        let placement = PlacementSpec {
            request_id: id.to_string(),
            node: node.name.clone(),
            model_name: spec.model_name.clone(),
            gpu_count: spec.gpu_count,
        };
        let handle = match self.executor.ensure_created(&key, &placement).await {
            Ok((handle, Issued::Created)) => handle,
            Ok((handle, Issued::Existing)) => {
                info!(placement = %handle.key, node = %handle.node, "adopting existing placement");
                handle
            }
            Err(e) => {
                warn!(placement = %key, error = %format!("{e:#}"), "failed to create placement");
                let message = format!("failed to create placement: {e:#}");
                return self
                    .placement_failure(id, status, version, &retry, "placement_failed", message)
                    .await;
            }
        };

        status.phase = Some(WorkloadPhase::Scheduled);
        status.message = format!(
            "scheduled on node {} using {} strategy",
            handle.node,
            policy.name()
        );
        status.assigned_node = handle.node;
        status.placement_ref = Some(handle.key);
        self.write_status(id, &status, version).await?;

        info!(node = %status.assigned_node, "workload scheduled");
        self.notifier
            .emit(id, Severity::Normal, "Scheduled", &status.message);
        self.metrics.scheduled(policy.name());
        Ok((Outcome::Done, PassResult::Scheduled))
    }

    /// Release everything the workload owns, then drop its record. Any
    /// release error leaves the record in place for the next pass.
    async fn cleanup(&self, id: &str, record: &WorkloadRecord, version: u64) -> Result<(), ReconcileError> {
        let mut keys = vec![record.request.placement_key()];
        if let Some(recorded) = &record.status.placement_ref {
            if !keys.contains(recorded) {
                keys.push(recorded.clone());
            }
        }

        for key in keys {
            match self.executor.release(&key).await {
                Ok(ReleaseOutcome::Released) => info!(placement = %key, "released placement"),
                Ok(ReleaseOutcome::NotFound) => debug!(placement = %key, "no placement to release"),
                Err(reason) => {
                    warn!(placement = %key, error = %format!("{reason:#}"), "failed to release placement");
                    self.notifier.emit(
                        id,
                        Severity::Warning,
                        "CleanupFailed",
                        &format!("failed to release placement {key}: {reason:#}"),
                    );
                    return Err(ReconcileError::Release { key, reason });
                }
            }
        }

        match self.store.remove(id, version).await? {
            WriteOutcome::Applied(_) => {
                info!("workload removed");
                Ok(())
            }
            WriteOutcome::Conflict => Err(ReconcileError::Conflict(id.to_string())),
        }
    }

    /// Inventory-class failure: stays Pending without consuming a retry.
    async fn requeue_transient(
        &self,
        id: &str,
        mut status: WorkloadStatus,
        version: u64,
        retry: &RetryPolicy,
        message: String,
    ) -> PassOutput {
        status.phase = Some(WorkloadPhase::Pending);
        status.message = message;
        self.write_status(id, &status, version).await?;

        let delay = next_backoff(retry.backoff_base(), i64::from(status.retry_count));
        debug!(?delay, "requeueing");
        Ok((Outcome::RequeueAfter(delay), PassResult::Requeued))
    }

    /// Placement-class failure: consumes a retry, and fails the workload once
    /// the ceiling is reached.
    async fn placement_failure(
        &self,
        id: &str,
        mut status: WorkloadStatus,
        version: u64,
        retry: &RetryPolicy,
        reason: &'static str,
        message: String,
    ) -> PassOutput {
        status.retry_count = status.retry_count.saturating_add(1);
        self.metrics.retried();
        self.metrics.failed(reason);

        let max_retries = retry.effective_max_retries();
        if !should_retry(status.retry_count, max_retries) {
            return self
                .mark_failed(id, status, version, max_retries, Some(&message))
                .await;
        }

        status.phase = Some(WorkloadPhase::Pending);
        status.message = message;
        self.write_status(id, &status, version).await?;

        let delay = next_backoff(retry.backoff_base(), i64::from(status.retry_count));
        info!(retry_count = status.retry_count, ?delay, "placement attempt failed, requeueing");
        Ok((Outcome::RequeueAfter(delay), PassResult::Requeued))
    }

    async fn mark_failed(
        &self,
        id: &str,
        mut status: WorkloadStatus,
        version: u64,
        max_retries: u32,
        last_error: Option<&str>,
    ) -> PassOutput {
        status.phase = Some(WorkloadPhase::Failed);
        status.assigned_node.clear();
        status.placement_ref = None;
        status.message = match last_error {
            Some(e) => format!("exceeded {max_retries} retries: {e}"),
            None => format!("exceeded {max_retries} retries"),
        };
        self.write_status(id, &status, version).await?;

        warn!(retry_count = status.retry_count, max_retries, "giving up on workload");
        self.metrics.failed("max_retries_exceeded");
        self.notifier
            .emit(id, Severity::Warning, "MaxRetriesExceeded", &status.message);
        Ok((Outcome::Done, PassResult::Failed))
    }

    async fn write_status(&self, id: &str, status: &WorkloadStatus, version: u64) -> Result<(), ReconcileError> {
        match self.store.update_status(id, status, version).await? {
            WriteOutcome::Applied(_) => Ok(()),
            WriteOutcome::Conflict => {
                debug!("status write lost to a concurrent writer");
                Err(ReconcileError::Conflict(id.to_string()))
            }
        }
    }
}
