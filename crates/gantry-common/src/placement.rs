use serde::{Deserialize, Serialize};

/// What the executor needs to start a workload on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    pub request_id: String,
    pub node: String,
    pub model_name: String,
    pub gpu_count: u32,
}

/// A placement as stored under `/placements/{key}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRecord {
    pub key: String,

    #[serde(flatten)]
    pub spec: PlacementSpec,

    pub created_at_ms: u64,
}

/// Reference to a live placement, returned by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementHandle {
    pub key: String,
    pub node: String,
}
