use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::next_backoff;
use crate::engine::{Outcome, ReconciliationEngine};
use crate::ports::EventSource;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Slot {
    /// Sitting in the work queue.
    queued: bool,
    /// A worker is mid-pass.
    running: bool,
    /// An event arrived while running; run again afterwards.
    dirty: bool,
    /// Deadline of the armed requeue timer, if any.
    requeue_at: Option<Instant>,
}

/// Work queue with per-identity coalescing.
struct Queue {
    slots: DashMap<String, Slot>,
    /// Consecutive failed passes per identity, for the error backoff.
    failures: DashMap<String, u32>,
    tx: mpsc::UnboundedSender<String>,
}

impl Queue {
    fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            slots: DashMap::new(),
            failures: DashMap::new(),
            tx,
        }
    }

    fn enqueue(&self, id: &str) {
        {
            let mut slot = self.slots.entry(id.to_string()).or_default();
            if slot.running {
                slot.dirty = true;
                return;
            }
            if slot.queued {
                return;
            }
            slot.queued = true;
        }
        // Receiver is gone only after shutdown.
        let _ = self.tx.send(id.to_string());
    }

    fn begin(&self, id: &str) {
        let mut slot = self.slots.entry(id.to_string()).or_default();
        slot.queued = false;
        slot.running = true;
    }

    /// End a pass. Returns whether the identity was touched meanwhile.
    fn finish(&self, id: &str) -> bool {
        let dirty = match self.slots.get_mut(id) {
            Some(mut slot) => {
                slot.running = false;
                std::mem::take(&mut slot.dirty)
            }
            None => false,
        };
        self.slots
            .remove_if(id, |_, s| {
                !s.queued && !s.running && !s.dirty && s.requeue_at.is_none()
            });
        dirty
    }

    /// Next error backoff attempt for `id`.
    fn record_failure(&self, id: &str) -> u32 {
        let mut count = self.failures.entry(id.to_string()).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        attempt
    }

    fn clear_failures(&self, id: &str) {
        self.failures.remove(id);
    }

    /// Enqueue `id` after `delay`. At most one timer per identity is kept
    /// armed: a request that would fire no earlier than it is dropped.
    fn requeue_after(self: &Arc<Self>, id: String, delay: Duration) {
        let deadline = Instant::now() + delay;
        {
            let mut slot = self.slots.entry(id.clone()).or_default();
            if slot.requeue_at.is_some_and(|armed| armed <= deadline) {
                debug!(workload = %id, "earlier requeue already armed");
                return;
            }
            slot.requeue_at = Some(deadline);
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            queue.fire(&id, deadline);
        });
    }

    fn fire(&self, id: &str, deadline: Instant) {
        if let Some(mut slot) = self.slots.get_mut(id) {
            if slot.requeue_at == Some(deadline) {
                slot.requeue_at = None;
            }
        }
        self.enqueue(id);
    }
}

/// Feeds workload identities from an [`EventSource`] to a bounded pool of
/// reconcile workers.
///
/// An identity is never reconciled by two workers at once. Requeues are
/// handled by timers, so a worker is released as soon as its pass ends.
pub struct Dispatcher {
    engine: Arc<ReconciliationEngine>,
    workers: usize,
    error_backoff: Duration,
}

impl Dispatcher {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self {
            engine,
            workers: DEFAULT_WORKERS,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_error_backoff(mut self, base: Duration) -> Self {
        self.error_backoff = base;
        self
    }

    /// Run until `shutdown` resolves, then wait for in-flight passes.
    pub async fn run<E, F>(&self, mut source: E, shutdown: F) -> anyhow::Result<()>
    where
        E: EventSource + 'static,
        F: Future<Output = ()>,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Queue::new(tx));
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        let intake = {
            let queue = queue.clone();
            tokio::spawn(async move {
                while let Some(event) = source.next().await {
                    debug!(workload = %event.id, kind = ?event.kind, "event received");
                    queue.enqueue(&event.id);
                }
                info!("event source closed");
            })
        };

        info!(workers = self.workers, "dispatcher started");
        tokio::pin!(shutdown);
        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "reconcile worker panicked");
                }
            }

            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = permits.clone().acquire_owned() => permit?,
            };
            let id = tokio::select! {
                _ = &mut shutdown => break,
                id = rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };

            queue.begin(&id);
            let engine = self.engine.clone();
            let queue = queue.clone();
            let error_backoff = self.error_backoff;
            tasks.spawn(async move {
                let _permit = permit;
                let next = match engine.reconcile(&id).await {
                    Ok(Outcome::Done) => {
                        queue.clear_failures(&id);
                        None
                    }
                    Ok(Outcome::RequeueAfter(delay)) => {
                        queue.clear_failures(&id);
                        Some(delay)
                    }
                    Err(e) => {
                        let attempt = queue.record_failure(&id);
                        let delay = next_backoff(error_backoff, i64::from(attempt));
                        warn!(workload = %id, error = %e, ?delay, "reconcile failed, retrying");
                        Some(delay)
                    }
                };

                if queue.finish(&id) {
                    queue.enqueue(&id);
                } else if let Some(delay) = next {
                    queue.requeue_after(id, delay);
                }
            });
        }

        info!(in_flight = tasks.len(), "dispatcher stopping");
        intake.abort();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "reconcile worker panicked");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use gantry_common::{NodeDescriptor, NodeRecord, WorkloadPhase, WorkloadRequest, WorkloadSpec};
    use gantry_meta::{MemoryMetaStore, MetaStore};
    use tokio::sync::oneshot;

    use super::*;
    use crate::metrics::SharedMetrics;
    use crate::ports::{EventKind, RequestStore, WorkloadEvent};
    use crate::store::{
        MetaNodeInventory, MetaPlacementExecutor, MetaRequestStore, WatchEventSource,
        DEFAULT_NODE_STALE_MS, NODES_PREFIX,
    };
    use crate::testing::{ChannelEventSource, Harness};
    use crate::util::now_ms;

    fn created(id: &str) -> WorkloadEvent {
        WorkloadEvent {
            id: id.to_string(),
            kind: EventKind::Created,
        }
    }

    async fn wait_for_phase(h: &Harness, id: &str, phase: WorkloadPhase) {
        for _ in 0..300 {
            if h.status(id).await.and_then(|s| s.phase) == Some(phase) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{id} never reached {phase}");
    }

    struct Running {
        events: mpsc::UnboundedSender<WorkloadEvent>,
        stop: oneshot::Sender<()>,
        handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    fn spawn_run<E: EventSource + 'static>(
        dispatcher: Dispatcher,
        source: E,
    ) -> (oneshot::Sender<()>, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            dispatcher
                .run(source, async {
                    let _ = stopped.await;
                })
                .await
        });
        (stop, handle)
    }

    fn start(dispatcher: Dispatcher) -> Running {
        let (events, rx) = mpsc::unbounded_channel();
        let (stop, handle) = spawn_run(dispatcher, ChannelEventSource(rx));
        Running { events, stop, handle }
    }

    async fn stop(running: Running) {
        let _ = running.stop.send(());
        running.handle.await.unwrap().unwrap();
    }

    /// Engine over store-backed adapters, driven by the store's own watch.
    struct StoreBacked {
        store: MemoryMetaStore,
        requests: MetaRequestStore<MemoryMetaStore>,
        metrics: Arc<SharedMetrics>,
        stop: oneshot::Sender<()>,
        handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    async fn put_node(store: &MemoryMetaStore, name: &str, gpus: i64, heartbeat_ms: u64) {
        let record = NodeRecord {
            descriptor: NodeDescriptor::new(name, gpus),
            last_heartbeat_ms: heartbeat_ms,
        };
        store
            .put(
                &format!("{NODES_PREFIX}{name}"),
                serde_json::to_vec(&record).unwrap(),
                None,
            )
            .await
            .unwrap();
    }

    fn start_store_backed(store: MemoryMetaStore) -> StoreBacked {
        let metrics = Arc::new(SharedMetrics::default());
        let engine = Arc::new(
            ReconciliationEngine::new(
                Arc::new(MetaRequestStore::new(store.clone())),
                Arc::new(MetaNodeInventory::new(store.clone(), DEFAULT_NODE_STALE_MS)),
                Arc::new(MetaPlacementExecutor::new(store.clone())),
            )
            .with_metrics(metrics.clone()),
        );
        let (stop, handle) = spawn_run(
            Dispatcher::new(engine),
            WatchEventSource::new(store.clone()),
        );
        StoreBacked {
            requests: MetaRequestStore::new(store.clone()),
            store,
            metrics,
            stop,
            handle,
        }
    }

    async fn stop_store_backed(running: StoreBacked) {
        let _ = running.stop.send(());
        running.handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_queue_coalesces_per_identity() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = Queue::new(tx);

        queue.enqueue("w1");
        queue.enqueue("w1");
        queue.enqueue("w2");
        assert_eq!(rx.try_recv().unwrap(), "w1");
        assert_eq!(rx.try_recv().unwrap(), "w2");
        assert!(rx.try_recv().is_err());

        queue.begin("w1");
        queue.enqueue("w1");
        assert!(rx.try_recv().is_err());
        assert!(queue.finish("w1"));

        queue.begin("w2");
        assert!(!queue.finish("w2"));
        assert!(!queue.slots.contains_key("w2"));
    }

    #[test]
    fn test_failure_count_resets() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let queue = Queue::new(tx);
        assert_eq!(queue.record_failure("w1"), 0);
        assert_eq!(queue.record_failure("w1"), 1);
        queue.clear_failures("w1");
        assert_eq!(queue.record_failure("w1"), 0);
    }

    #[tokio::test]
    async fn test_schedules_submitted_workloads() {
        let h = Harness::new();
        h.inventory.set(vec![NodeDescriptor::new("node1", 8)]);
        for id in ["w1", "w2", "w3"] {
            h.submit(id, WorkloadSpec::new("llama2", 1)).await;
        }
        let running = start(Dispatcher::new(h.engine.clone()).with_workers(2));

        for id in ["w1", "w2", "w3", "w1", "w1"] {
            running.events.send(created(id)).unwrap();
        }
        for id in ["w1", "w2", "w3"] {
            wait_for_phase(&h, id, WorkloadPhase::Scheduled).await;
        }
        stop(running).await;

        assert_eq!(h.executor.creates.load(Ordering::SeqCst), 3);
        assert_eq!(h.metrics.scheduled_total("leastLoaded"), 3);
    }

    #[tokio::test]
    async fn test_requeue_after_transient_failure() {
        let h = Harness::new();
        h.inventory.fail();
        let mut spec = WorkloadSpec::new("llama2", 1);
        spec.retry_policy.backoff_base_seconds = 1;
        h.submit("w1", spec).await;

        let running = start(Dispatcher::new(h.engine.clone()));
        running.events.send(created("w1")).unwrap();

        wait_for_phase(&h, "w1", WorkloadPhase::Pending).await;
        h.inventory.set(vec![NodeDescriptor::new("node1", 2)]);

        // No further event: the timer must bring the workload back.
        wait_for_phase(&h, "w1", WorkloadPhase::Scheduled).await;
        stop(running).await;

        assert_eq!(h.metrics.failed_total("inventory_unavailable"), 1);
        assert_eq!(h.status("w1").await.unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_error_pass_is_retried() {
        let h = Harness::new();
        h.inventory.set(vec![NodeDescriptor::new("node1", 2)]);
        h.submit("w1", WorkloadSpec::new("llama2", 1)).await;
        h.requests.conflict_next.store(true, Ordering::SeqCst);

        let running = start(
            Dispatcher::new(h.engine.clone()).with_error_backoff(Duration::from_millis(10)),
        );
        running.events.send(created("w1")).unwrap();

        wait_for_phase(&h, "w1", WorkloadPhase::Scheduled).await;
        stop(running).await;

        assert_eq!(h.metrics.reconcile_count("error"), 1);
        assert_eq!(h.metrics.reconcile_count("scheduled"), 1);
        // The lost write left the placement behind; the retry adopted it.
        assert_eq!(h.executor.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_with_idle_queue() {
        let h = Harness::new();
        let running = start(Dispatcher::new(h.engine.clone()));
        stop(running).await;
    }

    #[tokio::test]
    async fn test_requeue_keeps_earliest_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Queue::new(tx));

        queue.requeue_after("w1".into(), Duration::from_millis(20));
        let armed = queue.slots.get("w1").unwrap().requeue_at;
        assert!(armed.is_some());
        queue.requeue_after("w1".into(), Duration::from_secs(60));
        assert_eq!(queue.slots.get("w1").unwrap().requeue_at, armed);

        let id = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "w1");
        assert_eq!(queue.slots.get("w1").unwrap().requeue_at, None);
        assert!(rx.try_recv().is_err());

        // A sooner deadline replaces a later one.
        queue.begin("w1");
        queue.finish("w1");
        queue.requeue_after("w1".into(), Duration::from_secs(60));
        let later = queue.slots.get("w1").unwrap().requeue_at.unwrap();
        queue.requeue_after("w1".into(), Duration::from_millis(10));
        let sooner = queue.slots.get("w1").unwrap().requeue_at.unwrap();
        assert!(sooner < later);
    }

    #[tokio::test]
    async fn test_status_write_does_not_cut_backoff_short() {
        let store = MemoryMetaStore::new();
        put_node(&store, "node1", 1, now_ms()).await;
        let running = start_store_backed(store);
        running
            .requests
            .submit(WorkloadRequest::new("w1", WorkloadSpec::new("llama2", 4)))
            .await
            .unwrap();

        for _ in 0..300 {
            if running.metrics.retries_total() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let (record, _) = running.requests.get("w1").await.unwrap().unwrap();
        assert_eq!(record.status.phase, Some(WorkloadPhase::Pending));
        assert_eq!(record.status.retry_count, 1);
        assert_eq!(running.metrics.reconcile_count("requeued"), 1);
        stop_store_backed(running).await;
    }

    #[tokio::test]
    async fn test_no_ready_capacity_waits_for_backoff() {
        let store = MemoryMetaStore::new();
        put_node(&store, "stale", 8, 1).await;
        let running = start_store_backed(store);
        running
            .requests
            .submit(WorkloadRequest::new("w1", WorkloadSpec::new("llama2", 1)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(running.metrics.failed_total("no_ready_nodes"), 1);
        let (record, _) = running.requests.get("w1").await.unwrap().unwrap();
        assert_eq!(record.status.message, "no ready capacity");
        assert_eq!(record.status.retry_count, 0);

        // A node coming back is not a workload change; the workload waits
        // for its timer rather than being picked up at once.
        put_node(&running.store, "fresh", 8, now_ms()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(running.metrics.scheduled_total("leastLoaded"), 0);
        stop_store_backed(running).await;
    }
}
