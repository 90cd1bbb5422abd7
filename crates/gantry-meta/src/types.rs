use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

/// A change observed on a watched prefix. `value` is `None` for deletions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub revision: u64,
}

/// One entry returned by a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the last write to this key.
    pub revision: u64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// Versioned key/value store. Every write bumps a store-wide revision; the
/// per-key revision is the optimistic-concurrency token for CAS operations.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Entries under `prefix` plus the store revision the listing was taken at.
    async fn list_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, u64)>;

    /// Write `value` only if the key's revision equals `expected_revision`
    /// (0 means the key must not exist). Returns whether the write applied and
    /// the key's revision afterwards.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)>;

    /// Remove the key only if its revision equals `expected_revision`.
    async fn compare_and_delete(&self, key: &str, expected_revision: u64) -> Result<bool>;

    /// Stream changes under `prefix` made after `start_revision_exclusive`.
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream>;
}
