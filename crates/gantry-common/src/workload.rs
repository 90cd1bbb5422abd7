use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_STRATEGY: &str = "leastLoaded";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_SECONDS: u32 = 30;

const MAX_MODEL_NAME_LEN: usize = 255;
const MAX_GPU_COUNT: u32 = 8;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// How often and how patiently a request is retried before it is failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff; the n-th retry waits roughly base * 2^n.
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff_base_seconds() -> u32 {
    DEFAULT_BACKOFF_BASE_SECONDS
}

fn default_strategy() -> String {
    DEFAULT_STRATEGY.to_string()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_seconds: DEFAULT_BACKOFF_BASE_SECONDS,
        }
    }
}

impl RetryPolicy {
    /// Retry ceiling, with an unset (zero) value meaning the default.
    pub fn effective_max_retries(&self) -> u32 {
        if self.max_retries == 0 {
            DEFAULT_MAX_RETRIES
        } else {
            self.max_retries
        }
    }

    /// Backoff base, with an unset (zero) value meaning the default.
    pub fn backoff_base(&self) -> std::time::Duration {
        let secs = if self.backoff_base_seconds == 0 {
            DEFAULT_BACKOFF_BASE_SECONDS
        } else {
            self.backoff_base_seconds
        };
        std::time::Duration::from_secs(u64::from(secs))
    }
}

/// Immutable description of a GPU workload, fixed at submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Opaque model or workload label (e.g. "llama2").
    pub model_name: String,

    pub gpu_count: u32,

    #[serde(default)]
    pub priority: Priority,

    /// Placement policy name. Kept as a string so that unknown names reach the
    /// policy factory, which substitutes the default instead of failing.
    #[serde(default = "default_strategy")]
    pub strategy_name: String,

    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl WorkloadSpec {
    pub fn new(model_name: impl Into<String>, gpu_count: u32) -> Self {
        Self {
            model_name: model_name.into(),
            gpu_count,
            priority: Priority::default(),
            strategy_name: default_strategy(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Range checks applied at the submission boundary.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let name_len = self.model_name.chars().count();
        if name_len == 0 || name_len > MAX_MODEL_NAME_LEN {
            return Err(ValidationError::ModelName(name_len));
        }
        if self.gpu_count == 0 || self.gpu_count > MAX_GPU_COUNT {
            return Err(ValidationError::GpuCount(self.gpu_count));
        }
        if !(1..=10).contains(&self.retry_policy.max_retries) {
            return Err(ValidationError::MaxRetries(self.retry_policy.max_retries));
        }
        if !(1..=300).contains(&self.retry_policy.backoff_base_seconds) {
            return Err(ValidationError::BackoffBase(
                self.retry_policy.backoff_base_seconds,
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("model name must be 1..=255 characters, got {0}")]
    ModelName(usize),
    #[error("gpu count must be 1..=8, got {0}")]
    GpuCount(u32),
    #[error("max retries must be 1..=10, got {0}")]
    MaxRetries(u32),
    #[error("backoff base must be 1..=300 seconds, got {0}")]
    BackoffBase(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRequest {
    /// Stable, user-chosen identity (also the store key).
    pub id: String,

    /// Minted once per submission; a request re-created under the same id gets
    /// a new uid and therefore a new placement key.
    pub uid: Uuid,

    pub spec: WorkloadSpec,
}

impl WorkloadRequest {
    pub fn new(id: impl Into<String>, spec: WorkloadSpec) -> Self {
        Self {
            id: id.into(),
            uid: Uuid::new_v4(),
            spec,
        }
    }

    /// Deterministic placement key: `{id}-job-{first 8 hex chars of uid}`.
    pub fn placement_key(&self) -> String {
        let uid = self.uid.simple().to_string();
        format!("{}-job-{}", self.id, &uid[..8])
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkloadPhase {
    Pending,
    Scheduled,
    Running,
    Failed,
    Succeeded,
}

impl WorkloadPhase {
    /// Phases that own a placement on a node.
    pub fn is_placed(self) -> bool {
        matches!(self, Self::Scheduled | Self::Running | Self::Succeeded)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Succeeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Failed => "Failed",
            Self::Succeeded => "Succeeded",
        }
    }
}

impl std::fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of a workload. Written only by the reconciler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkloadPhase>,

    /// Non-empty iff the phase is Scheduled, Running or Succeeded.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assigned_node: String,

    /// Placement key returned by the executor, set together with `assigned_node`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_ref: Option<String>,

    /// Failed placement attempts. Never decreases.
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_ms: Option<u64>,

    #[serde(default)]
    pub message: String,
}

/// Persisted form of a workload under `/workloads/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRecord {
    pub request: WorkloadRequest,

    #[serde(default)]
    pub status: WorkloadStatus,

    /// Deletion marker. While set, the record is kept until every placement it
    /// owns has been released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_requested_at_ms: Option<u64>,
}

impl WorkloadRecord {
    pub fn new(request: WorkloadRequest) -> Self {
        Self {
            request,
            status: WorkloadStatus::default(),
            deletion_requested_at_ms: None,
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_requested_at_ms.is_some()
    }
}
