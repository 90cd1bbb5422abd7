use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::types::{KeyValue, MetaStore, WatchEvent, WatchStream};

/// Events retained for watchers that start from an older revision.
const HISTORY_LIMIT: usize = 1024;

/// In-process store for tests and single-node runs. TTLs are accepted and ignored.
#[derive(Debug, Clone)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
    history: VecDeque<WatchEvent>,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn record(&mut self, event: WatchEvent, tx: &broadcast::Sender<WatchEvent>) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(event.clone());
        // No subscribers is fine.
        let _ = tx.send(event);
    }

    fn write(&mut self, key: &str, value: Vec<u8>, tx: &broadcast::Sender<WatchEvent>) -> u64 {
        let rev = self.next_revision();
        self.kv.insert(key.to_string(), (value.clone(), rev));
        self.record(
            WatchEvent {
                key: key.to_string(),
                value: Some(value),
                revision: rev,
            },
            tx,
        );
        rev
    }

    fn remove(&mut self, key: &str, tx: &broadcast::Sender<WatchEvent>) -> bool {
        if self.kv.remove(key).is_none() {
            return false;
        }
        let rev = self.next_revision();
        self.record(
            WatchEvent {
                key: key.to_string(),
                value: None,
                revision: rev,
            },
            tx,
        );
        true
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(HISTORY_LIMIT);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, _ttl_ms: Option<u64>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        Ok(inner.write(key, value, &self.tx))
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| (v.clone(), *rev)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        inner.remove(key, &self.tx);
        Ok(inner.revision)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, u64)> {
        let inner = self.inner.read().await;
        let out = inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| KeyValue {
                key: k.clone(),
                value: v.clone(),
                revision: *rev,
            })
            .collect();
        Ok((out, inner.revision))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let mut inner = self.inner.write().await;
        let current_rev = inner.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if current_rev != expected_revision {
            return Ok((false, current_rev));
        }
        Ok((true, inner.write(key, value, &self.tx)))
    }

    async fn compare_and_delete(&self, key: &str, expected_revision: u64) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let current_rev = inner.kv.get(key).map(|(_, rev)| *rev);
        if current_rev != Some(expected_revision) {
            return Ok(false);
        }
        Ok(inner.remove(key, &self.tx))
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream> {
        let min_rev = start_revision_exclusive.unwrap_or(0);

        // Subscribe while holding the lock so nothing falls between replay and live events.
        let (replay, rx) = {
            let inner = self.inner.read().await;
            let replay: Vec<WatchEvent> = match start_revision_exclusive {
                Some(_) => inner
                    .history
                    .iter()
                    .filter(|ev| ev.revision > min_rev && ev.key.starts_with(prefix))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            (replay, self.tx.subscribe())
        };

        let prefix = prefix.to_string();
        // A lagged receiver has lost events; end the stream so the watcher resyncs.
        let live = BroadcastStream::new(rx)
            .take_while(|msg| msg.is_ok())
            .filter_map(move |msg| match msg {
                Ok(ev) if ev.revision > min_rev && ev.key.starts_with(&prefix) => Some(ev),
                _ => None,
            });

        Ok(Box::pin(tokio_stream::iter(replay).chain(live)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cas_create_only_if_absent() {
        let store = MemoryMetaStore::new();
        let (ok, rev) = store.compare_and_swap("/a", 0, b"1".to_vec()).await.unwrap();
        assert!(ok);
        assert_eq!(rev, 1);

        let (ok, current) = store.compare_and_swap("/a", 0, b"2".to_vec()).await.unwrap();
        assert!(!ok);
        assert_eq!(current, 1);
        assert_eq!(store.get("/a").await.unwrap().unwrap().0, b"1".to_vec());
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_revision() {
        let store = MemoryMetaStore::new();
        let rev = store.put("/a", b"1".to_vec(), None).await.unwrap();
        store.put("/a", b"2".to_vec(), None).await.unwrap();

        let (ok, _) = store.compare_and_swap("/a", rev, b"3".to_vec()).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryMetaStore::new();
        let rev = store.put("/a", b"1".to_vec(), None).await.unwrap();

        assert!(!store.compare_and_delete("/a", rev + 10).await.unwrap());
        assert!(store.get("/a").await.unwrap().is_some());

        assert!(store.compare_and_delete("/a", rev).await.unwrap());
        assert!(store.get("/a").await.unwrap().is_none());
        assert!(!store.compare_and_delete("/a", rev).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_prefix_is_bounded() {
        let store = MemoryMetaStore::new();
        store.put("/workloads/a", b"a".to_vec(), None).await.unwrap();
        store.put("/workloads/b", b"b".to_vec(), None).await.unwrap();
        store.put("/workloadsx", b"x".to_vec(), None).await.unwrap();
        store.put("/nodes/n1", b"n".to_vec(), None).await.unwrap();

        let (kvs, rev) = store.list_prefix("/workloads/").await.unwrap();
        let keys: Vec<_> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/workloads/a", "/workloads/b"]);
        assert_eq!(rev, 4);
    }

    #[tokio::test]
    async fn test_watch_replays_after_revision() {
        let store = MemoryMetaStore::new();
        store.put("/workloads/a", b"1".to_vec(), None).await.unwrap();
        let (_, rev) = store.list_prefix("/workloads/").await.unwrap();
        store.put("/workloads/b", b"2".to_vec(), None).await.unwrap();
        store.put("/other", b"x".to_vec(), None).await.unwrap();

        let mut stream = store.watch_prefix("/workloads/", Some(rev)).await.unwrap();
        store.delete("/workloads/a").await.unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.key, "/workloads/b");
        let second = stream.next().await.unwrap();
        assert_eq!(second.key, "/workloads/a");
        assert_eq!(second.value, None);
    }

    #[tokio::test]
    async fn test_watch_ends_when_lagging() {
        let store = MemoryMetaStore::new();
        let mut stream = store.watch_prefix("/workloads/", None).await.unwrap();
        for i in 0..(HISTORY_LIMIT + 10) {
            store
                .put(&format!("/workloads/{i}"), b"x".to_vec(), None)
                .await
                .unwrap();
        }
        assert!(stream.next().await.is_none());
    }
}
