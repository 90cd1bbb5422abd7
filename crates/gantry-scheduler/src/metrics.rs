use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use dashmap::DashMap;

use crate::ports::MetricsSink;

/// Upper bounds (seconds) of the reconcile duration histogram.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Default)]
struct Histogram {
    buckets: [AtomicU64; DURATION_BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    fn observe(&self, seconds: f64) {
        for (bound, bucket) in DURATION_BUCKETS.iter().zip(&self.buckets) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        let micros = (seconds.max(0.0) * 1_000_000.0) as u64;
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

/// Scheduler metrics, safe for concurrent access.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    /// Successful placements by strategy.
    scheduled_total: DashMap<String, AtomicU64>,
    /// Failed attempts by reason.
    failed_total: DashMap<String, AtomicU64>,
    retries_total: AtomicU64,
    reconcile_duration: DashMap<String, Histogram>,
}

impl SharedMetrics {
    pub fn scheduled_total(&self, strategy: &str) -> u64 {
        self.scheduled_total
            .get(strategy)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn failed_total(&self, reason: &str) -> u64 {
        self.failed_total
            .get(reason)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn retries_total(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }

    pub fn reconcile_count(&self, result: &str) -> u64 {
        self.reconcile_duration
            .get(result)
            .map(|h| h.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut body = String::new();

        body.push_str(
            "# HELP gantry_scheduled_total Workloads placed successfully.\n\
             # TYPE gantry_scheduled_total counter\n",
        );
        for (strategy, value) in sorted_counters(&self.scheduled_total) {
            let _ = writeln!(body, "gantry_scheduled_total{{strategy=\"{strategy}\"}} {value}");
        }

        body.push_str(
            "# HELP gantry_failed_total Failed scheduling attempts.\n\
             # TYPE gantry_failed_total counter\n",
        );
        for (reason, value) in sorted_counters(&self.failed_total) {
            let _ = writeln!(body, "gantry_failed_total{{reason=\"{reason}\"}} {value}");
        }

        let _ = write!(
            body,
            "# HELP gantry_retries_total Placement retries.\n\
             # TYPE gantry_retries_total counter\n\
             gantry_retries_total {}\n",
            self.retries_total.load(Ordering::Relaxed),
        );

        body.push_str(
            "# HELP gantry_reconcile_duration_seconds Duration of one reconcile pass.\n\
             # TYPE gantry_reconcile_duration_seconds histogram\n",
        );
        let mut results: Vec<String> = self
            .reconcile_duration
            .iter()
            .map(|e| e.key().clone())
            .collect();
        results.sort();
        for result in results {
            let Some(h) = self.reconcile_duration.get(&result) else {
                continue;
            };
            for (bound, bucket) in DURATION_BUCKETS.iter().zip(&h.buckets) {
                let _ = writeln!(
                    body,
                    "gantry_reconcile_duration_seconds_bucket{{result=\"{result}\",le=\"{bound}\"}} {}",
                    bucket.load(Ordering::Relaxed)
                );
            }
            let count = h.count.load(Ordering::Relaxed);
            let sum = h.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            let _ = writeln!(
                body,
                "gantry_reconcile_duration_seconds_bucket{{result=\"{result}\",le=\"+Inf\"}} {count}\n\
                 gantry_reconcile_duration_seconds_sum{{result=\"{result}\"}} {sum}\n\
                 gantry_reconcile_duration_seconds_count{{result=\"{result}\"}} {count}"
            );
        }

        body
    }
}

fn sorted_counters(map: &DashMap<String, AtomicU64>) -> Vec<(String, u64)> {
    let mut out: Vec<(String, u64)> = map
        .iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect();
    out.sort();
    out
}

impl MetricsSink for SharedMetrics {
    fn scheduled(&self, strategy: &str) {
        self.scheduled_total
            .entry(strategy.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn failed(&self, reason: &str) {
        self.failed_total
            .entry(reason.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn retried(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    fn reconcile_duration(&self, result: &str, seconds: f64) {
        self.reconcile_duration
            .entry(result.to_string())
            .or_default()
            .observe(seconds);
    }
}

/// GET /metrics: Prometheus text exposition format.
pub async fn metrics_handler(State(metrics): State<Arc<SharedMetrics>>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics.render(),
    )
}

/// GET /healthz: liveness check.
pub async fn healthz_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}

pub fn router(metrics: Arc<SharedMetrics>) -> axum::Router {
    axum::Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(metrics)
}
