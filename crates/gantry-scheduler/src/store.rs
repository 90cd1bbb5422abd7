use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use gantry_common::{
    NodeDescriptor, NodeRecord, PlacementHandle, PlacementRecord, PlacementSpec, WorkloadRecord,
    WorkloadRequest, WorkloadStatus,
};
use gantry_meta::{MetaStore, WatchEvent, WatchStream};

use crate::ports::{
    EventKind, EventSource, Issued, NodeInventory, PlacementExecutor, ReleaseOutcome,
    RequestStore, WorkloadEvent, WriteOutcome,
};
use crate::util::now_ms;

pub const WORKLOADS_PREFIX: &str = "/workloads/";
pub const NODES_PREFIX: &str = "/nodes/";
pub const PLACEMENTS_PREFIX: &str = "/placements/";

/// Nodes whose last heartbeat is older than this are reported as not ready.
pub const DEFAULT_NODE_STALE_MS: u64 = 10_000;

pub fn workload_key(id: &str) -> String {
    format!("{WORKLOADS_PREFIX}{id}")
}

pub fn placement_key(key: &str) -> String {
    format!("{PLACEMENTS_PREFIX}{key}")
}

// ---------------------------------------------------------------------------
// Workload records
// ---------------------------------------------------------------------------

/// Workload records in a [`MetaStore`]; the key's mod-revision is the version.
#[derive(Clone)]
pub struct MetaRequestStore<S> {
    store: S,
}

impl<S: MetaStore> MetaRequestStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Submission path: validate and create the record if the id is free.
    pub async fn submit(&self, request: WorkloadRequest) -> anyhow::Result<WriteOutcome> {
        request
            .spec
            .validate()
            .with_context(|| format!("invalid workload {}", request.id))?;
        let key = workload_key(&request.id);
        let val = serde_json::to_vec(&WorkloadRecord::new(request))?;
        let (ok, rev) = self.store.compare_and_swap(&key, 0, val).await?;
        Ok(if ok {
            WriteOutcome::Applied(rev)
        } else {
            WriteOutcome::Conflict
        })
    }

    /// Set the deletion marker. The reconciler removes the record once its
    /// placement has been released. Returns false if the record does not exist.
    pub async fn request_deletion(&self, id: &str) -> anyhow::Result<bool> {
        let key = workload_key(id);
        loop {
            let Some((mut record, version)) = self.get(id).await? else {
                return Ok(false);
            };
            if record.is_deleting() {
                return Ok(true);
            }
            record.deletion_requested_at_ms = Some(now_ms());
            let val = serde_json::to_vec(&record)?;
            let (ok, _) = self.store.compare_and_swap(&key, version, val).await?;
            if ok {
                return Ok(true);
            }
            debug!(workload=%id, "deletion marker raced a status write, retrying");
        }
    }
}

#[async_trait]
impl<S: MetaStore> RequestStore for MetaRequestStore<S> {
    async fn get(&self, id: &str) -> anyhow::Result<Option<(WorkloadRecord, u64)>> {
        let Some((bytes, rev)) = self.store.get(&workload_key(id)).await? else {
            return Ok(None);
        };
        let record: WorkloadRecord = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt workload record {id}"))?;
        Ok(Some((record, rev)))
    }

    async fn update_status(
        &self,
        id: &str,
        status: &WorkloadStatus,
        expected_version: u64,
    ) -> anyhow::Result<WriteOutcome> {
        let Some((mut record, version)) = self.get(id).await? else {
            return Ok(WriteOutcome::Conflict);
        };
        if version != expected_version {
            return Ok(WriteOutcome::Conflict);
        }
        record.status = status.clone();
        let val = serde_json::to_vec(&record)?;
        let (ok, rev) = self
            .store
            .compare_and_swap(&workload_key(id), expected_version, val)
            .await?;
        Ok(if ok {
            WriteOutcome::Applied(rev)
        } else {
            WriteOutcome::Conflict
        })
    }

    async fn remove(&self, id: &str, expected_version: u64) -> anyhow::Result<WriteOutcome> {
        let removed = self
            .store
            .compare_and_delete(&workload_key(id), expected_version)
            .await?;
        Ok(if removed {
            WriteOutcome::Applied(expected_version)
        } else {
            WriteOutcome::Conflict
        })
    }
}

// ---------------------------------------------------------------------------
// Node inventory
// ---------------------------------------------------------------------------

/// Reads node registrations from `/nodes/`. A node with a stale heartbeat is
/// reported as not ready rather than dropped.
#[derive(Clone)]
pub struct MetaNodeInventory<S> {
    store: S,
    stale_after_ms: u64,
}

impl<S: MetaStore> MetaNodeInventory<S> {
    pub fn new(store: S, stale_after_ms: u64) -> Self {
        Self {
            store,
            stale_after_ms,
        }
    }
}

#[async_trait]
impl<S: MetaStore> NodeInventory for MetaNodeInventory<S> {
    async fn snapshot(&self) -> anyhow::Result<Vec<NodeDescriptor>> {
        let (kvs, _) = self
            .store
            .list_prefix(NODES_PREFIX)
            .await
            .context("failed to list nodes")?;

        let now = now_ms();
        let mut nodes = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let record: NodeRecord = match serde_json::from_slice(&kv.value) {
                Ok(r) => r,
                Err(e) => {
                    warn!(key=%kv.key, error=%e, "skipping malformed node record");
                    continue;
                }
            };
            let mut node = record.descriptor;
            if now.saturating_sub(record.last_heartbeat_ms) > self.stale_after_ms {
                node.ready = false;
            }
            nodes.push(node);
        }
        Ok(nodes)
    }
}

// ---------------------------------------------------------------------------
// Placements
// ---------------------------------------------------------------------------

/// Placements as records under `/placements/{key}`; node agents pick them up
/// from there.
#[derive(Clone)]
pub struct MetaPlacementExecutor<S> {
    store: S,
}

impl<S: MetaStore> MetaPlacementExecutor<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    async fn load(&self, key: &str) -> anyhow::Result<Option<PlacementRecord>> {
        match self.store.get(&placement_key(key)).await? {
            Some((bytes, _)) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt placement record {key}"))?,
            )),
            None => Ok(None),
        }
    }
}

fn handle_of(record: &PlacementRecord) -> PlacementHandle {
    PlacementHandle {
        key: record.key.clone(),
        node: record.spec.node.clone(),
    }
}

#[async_trait]
impl<S: MetaStore> PlacementExecutor for MetaPlacementExecutor<S> {
    async fn ensure_created(
        &self,
        key: &str,
        spec: &PlacementSpec,
    ) -> anyhow::Result<(PlacementHandle, Issued)> {
        if let Some(existing) = self.load(key).await? {
            return Ok((handle_of(&existing), Issued::Existing));
        }

        let record = PlacementRecord {
            key: key.to_string(),
            spec: spec.clone(),
            created_at_ms: now_ms(),
        };
        let val = serde_json::to_vec(&record)?;
        let (created, _) = self
            .store
            .compare_and_swap(&placement_key(key), 0, val)
            .await?;
        if created {
            info!(placement=%key, node=%spec.node, "created placement");
            return Ok((handle_of(&record), Issued::Created));
        }

        // Lost a create race: adopt whatever won.
        let winner = self
            .load(key)
            .await?
            .with_context(|| format!("placement {key} vanished during create"))?;
        Ok((handle_of(&winner), Issued::Existing))
    }

    async fn release(&self, key: &str) -> anyhow::Result<ReleaseOutcome> {
        let full_key = placement_key(key);
        if self.store.get(&full_key).await?.is_none() {
            return Ok(ReleaseOutcome::NotFound);
        }
        self.store.delete(&full_key).await?;
        info!(placement=%key, "released placement");
        Ok(ReleaseOutcome::Released)
    }
}

// ---------------------------------------------------------------------------
// Event source
// ---------------------------------------------------------------------------

/// The parts of a workload record that call for a pass. Status is left out:
/// the reconciler writes it on every pass and must not wake itself up.
#[derive(Debug, PartialEq, Eq)]
struct Fingerprint {
    request: WorkloadRequest,
    deleting: bool,
}

/// Turns a prefix watch on `/workloads/` into workload events. Starts with a
/// full listing, then watches from the listing's revision. Whenever the watch
/// ends (disconnect, compaction, a lagging receiver) it re-lists and emits
/// events only for what changed in between.
///
/// Puts that change nothing but the status are dropped, so a requeue asked
/// for by the engine is not cut short by its own status write.
pub struct WatchEventSource<S> {
    store: S,
    reconnect_delay: Duration,
    seen: HashMap<String, Fingerprint>,
    pending: VecDeque<WorkloadEvent>,
    stream: Option<WatchStream>,
    revision: Option<u64>,
}

impl<S: MetaStore> WatchEventSource<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            reconnect_delay: Duration::from_secs(1),
            seen: HashMap::new(),
            pending: VecDeque::new(),
            stream: None,
            revision: None,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    fn classify(&mut self, id: String, value: Option<&[u8]>) -> Option<WorkloadEvent> {
        let Some(bytes) = value else {
            self.seen.remove(&id);
            return Some(WorkloadEvent {
                id,
                kind: EventKind::Deleted,
            });
        };

        let record = match serde_json::from_slice::<WorkloadRecord>(bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!(workload=%id, error=%e, "undecodable workload record");
                return Some(WorkloadEvent {
                    id,
                    kind: EventKind::Updated,
                });
            }
        };

        let deleting = record.is_deleting();
        let fingerprint = Fingerprint {
            request: record.request,
            deleting,
        };
        let previous = self.seen.insert(id.clone(), fingerprint);
        if previous.is_some() && previous.as_ref() == self.seen.get(&id) {
            debug!(workload=%id, "status-only update, skipping");
            return None;
        }

        let kind = if deleting {
            EventKind::Deleted
        } else if previous.is_none() {
            EventKind::Created
        } else {
            EventKind::Updated
        };
        Some(WorkloadEvent { id, kind })
    }

    fn push_watch_event(&mut self, ev: WatchEvent) {
        self.revision = Some(ev.revision);
        let Some(id) = ev.key.strip_prefix(WORKLOADS_PREFIX) else {
            return;
        };
        if id.is_empty() {
            return;
        }
        if let Some(event) = self.classify(id.to_string(), ev.value.as_deref()) {
            self.pending.push_back(event);
        }
    }

    /// List everything and emit the difference against what was seen before.
    async fn relist(&mut self) -> anyhow::Result<()> {
        let (kvs, revision) = self.store.list_prefix(WORKLOADS_PREFIX).await?;
        info!(count = kvs.len(), revision, "listed workloads");

        let mut listed = HashSet::with_capacity(kvs.len());
        for kv in kvs {
            let Some(id) = kv.key.strip_prefix(WORKLOADS_PREFIX) else {
                continue;
            };
            listed.insert(id.to_string());
            if let Some(event) = self.classify(id.to_string(), Some(&kv.value)) {
                self.pending.push_back(event);
            }
        }

        let gone: Vec<String> = self
            .seen
            .keys()
            .filter(|id| !listed.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(event) = self.classify(id, None) {
                self.pending.push_back(event);
            }
        }

        self.revision = Some(revision);
        Ok(())
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        if self.revision.is_none() {
            self.relist().await?;
        }
        match self.store.watch_prefix(WORKLOADS_PREFIX, self.revision).await {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                self.revision = None;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<S: MetaStore> EventSource for WatchEventSource<S> {
    async fn next(&mut self) -> Option<WorkloadEvent> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Some(ev);
            }

            let Some(stream) = self.stream.as_mut() else {
                if let Err(e) = self.connect().await {
                    warn!(error=%e, "failed to watch workloads, retrying");
                    tokio::time::sleep(self.reconnect_delay).await;
                }
                continue;
            };

            match stream.next().await {
                Some(ev) => self.push_watch_event(ev),
                None => {
                    // Events may have been dropped; resync from a fresh listing.
                    warn!("workload watch ended, re-listing");
                    self.stream = None;
                    self.revision = None;
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }
}
