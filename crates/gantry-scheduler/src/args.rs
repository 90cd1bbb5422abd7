use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "gantry-scheduler", about = "Places GPU workloads onto worker nodes")]
pub struct Args {
    #[arg(long, env = "GANTRY_ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    /// Address for the /metrics and /healthz endpoints.
    #[arg(long, default_value = "0.0.0.0:19090")]
    pub listen_addr: String,

    /// Concurrent reconcile passes.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Base delay (ms) before retrying a pass that errored.
    #[arg(long, default_value_t = 1000)]
    pub error_backoff_ms: u64,

    /// Nodes without a heartbeat for this long are treated as not ready.
    #[arg(long, default_value_t = 10_000)]
    pub node_stale_ms: u64,

    /// OTLP/HTTP collector base URL (e.g. "http://127.0.0.1:4318").
    #[arg(long, env = "GANTRY_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP collector.
    #[arg(long, env = "GANTRY_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}
