use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use gantry_meta::MetaStore;

use crate::ports::{NotificationSink, Severity};
use crate::util::now_ms;

pub const EVENTS_PREFIX: &str = "/events/";

/// Notifications expire from the store after an hour.
const EVENT_TTL_MS: u64 = 3_600_000;

/// Notification as persisted under `/events/{request_id}/{timestamp_ms}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub request_id: String,
    pub severity: String,
    pub reason: String,
    pub message: String,
    pub timestamp_ms: u64,
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn emit(&self, request_id: &str, severity: Severity, reason: &str, message: &str) {
        match severity {
            Severity::Normal => info!(workload=%request_id, %reason, "{message}"),
            Severity::Warning => warn!(workload=%request_id, %reason, "{message}"),
        }
    }
}

/// Logs each notification and persists it on a detached task, so a slow or
/// failing store never holds up reconciliation.
#[derive(Clone)]
pub struct StoreNotificationSink<S> {
    store: S,
}

impl<S> StoreNotificationSink<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: MetaStore + Clone + 'static> NotificationSink for StoreNotificationSink<S> {
    fn emit(&self, request_id: &str, severity: Severity, reason: &str, message: &str) {
        TracingNotificationSink.emit(request_id, severity, reason, message);

        let record = NotificationRecord {
            request_id: request_id.to_string(),
            severity: severity.as_str().to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp_ms: now_ms(),
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(workload=%request_id, "no runtime, notification not persisted");
            return;
        };
        let store = self.store.clone();
        handle.spawn(async move {
            let key = format!("{EVENTS_PREFIX}{}/{}", record.request_id, record.timestamp_ms);
            let val = match serde_json::to_vec(&record) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error=%e, "failed to serialize notification");
                    return;
                }
            };
            if let Err(e) = store.put(&key, val, Some(EVENT_TTL_MS)).await {
                warn!(%key, error=%e, "failed to persist notification");
            }
        });
    }
}
