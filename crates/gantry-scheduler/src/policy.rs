use rand::seq::SliceRandom;
use tracing::{debug, warn};

use gantry_common::{NodeDescriptor, WorkloadSpec};

/// No node in the candidate set can hold the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no node has {gpu_count} available GPUs (considered {candidates} ready nodes)")]
pub struct NoSuitableNode {
    pub gpu_count: u32,
    pub candidates: usize,
}

/// Trait for pluggable placement policies.
/// The engine hands over ready nodes only; every policy still checks GPU
/// capacity itself because that test depends on the request.
pub trait SchedulingPolicy: Send + Sync {
    fn choose<'a>(
        &self,
        nodes: &'a [NodeDescriptor],
        request: &WorkloadSpec,
    ) -> Result<&'a NodeDescriptor, NoSuitableNode>;

    /// Name used in logs, status messages and the `strategy` metric label.
    fn name(&self) -> &'static str;
}

fn not_found(nodes: &[NodeDescriptor], request: &WorkloadSpec) -> NoSuitableNode {
    NoSuitableNode {
        gpu_count: request.gpu_count,
        candidates: nodes.len(),
    }
}

/// Node with the most available GPUs; the first one wins a tie.
fn most_available<'a, I>(nodes: I) -> Option<&'a NodeDescriptor>
where
    I: IntoIterator<Item = &'a NodeDescriptor>,
{
    let mut best: Option<&NodeDescriptor> = None;
    for node in nodes {
        match best {
            Some(b) if node.available_gpus <= b.available_gpus => {}
            _ => best = Some(node),
        }
    }
    best
}

// ---------------------------------------------------------------------------
// LeastLoaded: the node with the most free GPUs (default)
// ---------------------------------------------------------------------------

pub struct LeastLoaded;

impl SchedulingPolicy for LeastLoaded {
    fn choose<'a>(
        &self,
        nodes: &'a [NodeDescriptor],
        request: &WorkloadSpec,
    ) -> Result<&'a NodeDescriptor, NoSuitableNode> {
        most_available(nodes.iter().filter(|n| n.has_capacity_for(request.gpu_count)))
            .ok_or_else(|| not_found(nodes, request))
    }

    fn name(&self) -> &'static str {
        "leastLoaded"
    }
}

// ---------------------------------------------------------------------------
// Random: uniform choice among nodes with enough capacity
// ---------------------------------------------------------------------------

/// Uses the thread-local RNG, so concurrent workers never share generator state.
pub struct Random;

impl SchedulingPolicy for Random {
    fn choose<'a>(
        &self,
        nodes: &'a [NodeDescriptor],
        request: &WorkloadSpec,
    ) -> Result<&'a NodeDescriptor, NoSuitableNode> {
        let suitable: Vec<&NodeDescriptor> = nodes
            .iter()
            .filter(|n| n.has_capacity_for(request.gpu_count))
            .collect();

        suitable
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or_else(|| not_found(nodes, request))
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

// ---------------------------------------------------------------------------
// CostOptimized: LeastLoaded among "low-cost" nodes, else over everything
// ---------------------------------------------------------------------------

pub struct CostOptimized;

impl SchedulingPolicy for CostOptimized {
    fn choose<'a>(
        &self,
        nodes: &'a [NodeDescriptor],
        request: &WorkloadSpec,
    ) -> Result<&'a NodeDescriptor, NoSuitableNode> {
        let cheap = most_available(
            nodes
                .iter()
                .filter(|n| n.is_low_cost() && n.has_capacity_for(request.gpu_count)),
        );
        if let Some(node) = cheap {
            return Ok(node);
        }

        debug!(
            gpu_count = request.gpu_count,
            "no low-cost node fits, falling back to leastLoaded"
        );
        LeastLoaded.choose(nodes, request)
    }

    fn name(&self) -> &'static str {
        "costOptimized"
    }
}

/// The closed set of placement policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PolicyKind {
    #[default]
    LeastLoaded,
    Random,
    CostOptimized,
}

impl PolicyKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "leastLoaded" => Some(Self::LeastLoaded),
            "random" => Some(Self::Random),
            "costOptimized" => Some(Self::CostOptimized),
            _ => None,
        }
    }

    pub fn policy(self) -> &'static dyn SchedulingPolicy {
        match self {
            Self::LeastLoaded => &LeastLoaded,
            Self::Random => &Random,
            Self::CostOptimized => &CostOptimized,
        }
    }
}

/// Resolve a strategy name. Unknown names fall back to `leastLoaded` with a
/// warning; this never fails a request.
pub fn resolve_policy(name: &str) -> &'static dyn SchedulingPolicy {
    match PolicyKind::parse(name) {
        Some(kind) => kind.policy(),
        None => {
            warn!(requested = name, "unknown scheduling strategy, defaulting to leastLoaded");
            PolicyKind::default().policy()
        }
    }
}
