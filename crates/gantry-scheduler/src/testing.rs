//! In-memory doubles shared by the engine and dispatcher tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use gantry_common::{
    NodeDescriptor, PlacementHandle, PlacementSpec, WorkloadPhase, WorkloadRecord,
    WorkloadRequest, WorkloadSpec, WorkloadStatus,
};
use gantry_meta::MemoryMetaStore;

use crate::engine::ReconciliationEngine;
use crate::metrics::SharedMetrics;
use crate::ports::{
    EventSource, Issued, NodeInventory, NotificationSink, PlacementExecutor, ReleaseOutcome,
    RequestStore, Severity, WorkloadEvent, WriteOutcome,
};
use crate::store::MetaRequestStore;

pub type Journal = Arc<Mutex<Vec<String>>>;

fn record(journal: &Journal, entry: String) {
    journal.lock().unwrap().push(entry);
}

/// Request store over [`MemoryMetaStore`] that journals removals and can be
/// told to lose the next status write.
pub struct JournaledStore {
    inner: MetaRequestStore<MemoryMetaStore>,
    journal: Journal,
    pub conflict_next: AtomicBool,
}

impl JournaledStore {
    pub fn inner(&self) -> &MetaRequestStore<MemoryMetaStore> {
        &self.inner
    }
}

#[async_trait]
impl RequestStore for JournaledStore {
    async fn get(&self, id: &str) -> Result<Option<(WorkloadRecord, u64)>> {
        self.inner.get(id).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: &WorkloadStatus,
        expected_version: u64,
    ) -> Result<WriteOutcome> {
        if self.conflict_next.swap(false, Ordering::SeqCst) {
            return Ok(WriteOutcome::Conflict);
        }
        self.inner.update_status(id, status, expected_version).await
    }

    async fn remove(&self, id: &str, expected_version: u64) -> Result<WriteOutcome> {
        let outcome = self.inner.remove(id, expected_version).await?;
        if matches!(outcome, WriteOutcome::Applied(_)) {
            record(&self.journal, format!("remove:{id}"));
        }
        Ok(outcome)
    }
}

/// Fixed node list, or an error while none is set.
#[derive(Default)]
pub struct FakeInventory {
    nodes: Mutex<Option<Vec<NodeDescriptor>>>,
}

impl FakeInventory {
    pub fn set(&self, nodes: Vec<NodeDescriptor>) {
        *self.nodes.lock().unwrap() = Some(nodes);
    }

    pub fn fail(&self) {
        *self.nodes.lock().unwrap() = None;
    }
}

#[async_trait]
impl NodeInventory for FakeInventory {
    async fn snapshot(&self) -> Result<Vec<NodeDescriptor>> {
        self.nodes
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("inventory offline"))
    }
}

/// Keeps placements in a map and counts real creates.
pub struct FakeExecutor {
    placements: Mutex<HashMap<String, PlacementHandle>>,
    journal: Journal,
    pub creates: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_release: AtomicBool,
}

#[async_trait]
impl PlacementExecutor for FakeExecutor {
    async fn ensure_created(
        &self,
        key: &str,
        spec: &PlacementSpec,
    ) -> Result<(PlacementHandle, Issued)> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(anyhow!("executor unavailable"));
        }
        let mut placements = self.placements.lock().unwrap();
        if let Some(existing) = placements.get(key) {
            return Ok((existing.clone(), Issued::Existing));
        }
        let handle = PlacementHandle {
            key: key.to_string(),
            node: spec.node.clone(),
        };
        placements.insert(key.to_string(), handle.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        record(&self.journal, format!("create:{key}"));
        Ok((handle, Issued::Created))
    }

    async fn release(&self, key: &str) -> Result<ReleaseOutcome> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(anyhow!("executor unavailable"));
        }
        if self.placements.lock().unwrap().remove(key).is_none() {
            return Ok(ReleaseOutcome::NotFound);
        }
        record(&self.journal, format!("release:{key}"));
        Ok(ReleaseOutcome::Released)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, Severity, String)>>,
}

impl RecordingSink {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, reason)| reason.clone())
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn emit(&self, request_id: &str, severity: Severity, reason: &str, _message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((request_id.to_string(), severity, reason.to_string()));
    }
}

/// Event source fed from the test body.
pub struct ChannelEventSource(pub mpsc::UnboundedReceiver<WorkloadEvent>);

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn next(&mut self) -> Option<WorkloadEvent> {
        self.0.recv().await
    }
}

/// An engine wired to in-memory collaborators, with handles to inspect them.
pub struct Harness {
    pub requests: Arc<JournaledStore>,
    pub inventory: Arc<FakeInventory>,
    pub executor: Arc<FakeExecutor>,
    pub sink: Arc<RecordingSink>,
    pub metrics: Arc<SharedMetrics>,
    pub engine: Arc<ReconciliationEngine>,
    journal: Journal,
}

impl Harness {
    pub fn new() -> Self {
        let journal: Journal = Arc::default();
        let requests = Arc::new(JournaledStore {
            inner: MetaRequestStore::new(MemoryMetaStore::new()),
            journal: journal.clone(),
            conflict_next: AtomicBool::new(false),
        });
        let inventory = Arc::new(FakeInventory::default());
        let executor = Arc::new(FakeExecutor {
            placements: Mutex::default(),
            journal: journal.clone(),
            creates: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_release: AtomicBool::new(false),
        });
        let sink = Arc::new(RecordingSink::default());
        let metrics = Arc::new(SharedMetrics::default());

        let engine = Arc::new(
            ReconciliationEngine::new(requests.clone(), inventory.clone(), executor.clone())
                .with_notifier(sink.clone())
                .with_metrics(metrics.clone()),
        );

        Self {
            requests,
            inventory,
            executor,
            sink,
            metrics,
            engine,
            journal,
        }
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub async fn submit(&self, id: &str, spec: WorkloadSpec) {
        let outcome = self
            .requests
            .inner()
            .submit(WorkloadRequest::new(id, spec))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(_)));
    }

    pub async fn status(&self, id: &str) -> Option<WorkloadStatus> {
        self.requests
            .get(id)
            .await
            .unwrap()
            .map(|(record, _)| record.status)
    }

    /// Overwrite the status outside the engine.
    pub async fn write_status(&self, id: &str, status: WorkloadStatus) {
        let (_, version) = self.requests.get(id).await.unwrap().unwrap();
        let outcome = self
            .requests
            .inner()
            .update_status(id, &status, version)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(_)));
    }

    pub async fn set_phase(&self, id: &str, phase: WorkloadPhase) {
        let mut status = self.status(id).await.unwrap();
        status.phase = Some(phase);
        self.write_status(id, status).await;
    }
}
