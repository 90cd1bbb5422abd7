use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Label marking a node as cheap capacity for the cost-optimized policy.
pub const LOW_COST_LABEL: &str = "low-cost";

/// Point-in-time view of one node, as handed to scheduling policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub name: String,
    pub ready: bool,
    pub available_gpus: i64,

    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl NodeDescriptor {
    pub fn new(name: impl Into<String>, available_gpus: i64) -> Self {
        Self {
            name: name.into(),
            ready: true,
            available_gpus,
            labels: HashMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn has_capacity_for(&self, gpu_count: u32) -> bool {
        self.available_gpus >= i64::from(gpu_count)
    }

    pub fn is_low_cost(&self) -> bool {
        self.labels.get(LOW_COST_LABEL).map(String::as_str) == Some("true")
    }
}

/// Node registration as published under `/nodes/{name}` by node agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    #[serde(flatten)]
    pub descriptor: NodeDescriptor,

    #[serde(default)]
    pub last_heartbeat_ms: u64,
}
