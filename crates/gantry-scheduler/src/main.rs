mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use gantry_common::telemetry::init_tracing;
use gantry_meta::EtcdMetaStore;
use gantry_scheduler::metrics::{self, SharedMetrics};
use gantry_scheduler::notify::StoreNotificationSink;
use gantry_scheduler::store::{
    MetaNodeInventory, MetaPlacementExecutor, MetaRequestStore, WatchEventSource,
};
use gantry_scheduler::{Dispatcher, ReconciliationEngine};

use crate::args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let tracer_provider = init_tracing(
        "gantry-scheduler",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );
    info!("gantry-scheduler starting...");

    let store = EtcdMetaStore::connect(std::slice::from_ref(&args.etcd_endpoint))
        .await
        .with_context(|| format!("failed to connect to etcd at {}", args.etcd_endpoint))?;
    info!(endpoint = %args.etcd_endpoint, "connected to etcd");

    let metrics = Arc::new(SharedMetrics::default());
    let engine = Arc::new(
        ReconciliationEngine::new(
            Arc::new(MetaRequestStore::new(store.clone())),
            Arc::new(MetaNodeInventory::new(store.clone(), args.node_stale_ms)),
            Arc::new(MetaPlacementExecutor::new(store.clone())),
        )
        .with_notifier(Arc::new(StoreNotificationSink::new(store.clone())))
        .with_metrics(metrics.clone()),
    );

    let listener = tokio::net::TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    info!(addr = %args.listen_addr, "metrics server listening");
    let app = metrics::router(metrics);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "metrics server failed");
        }
    });

    let dispatcher = Dispatcher::new(engine)
        .with_workers(args.workers)
        .with_error_backoff(Duration::from_millis(args.error_backoff_ms));
    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C"),
            Err(e) => error!(error = %e, "failed to listen for Ctrl-C"),
        }
    };
    let result = dispatcher.run(WatchEventSource::new(store), shutdown).await;

    if let Some(provider) = tracer_provider {
        if let Err(e) = provider.shutdown() {
            error!(error = %e, "failed to flush spans");
        }
    }
    info!("gantry-scheduler stopped");
    result
}
