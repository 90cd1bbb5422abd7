pub mod node;
pub mod placement;
pub mod workload;

pub use node::{NodeDescriptor, NodeRecord, LOW_COST_LABEL};
pub use placement::{PlacementHandle, PlacementRecord, PlacementSpec};
pub use workload::*;

pub mod telemetry;
