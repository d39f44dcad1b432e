//! Rolling updates: probing, draining and patching nodes one at a time.

pub mod evacuation;
pub mod executor;
pub mod probe;
pub mod recorder;
pub mod rolling;
pub mod types;

pub use evacuation::{evacuate_node, EvacuationResult};
pub use executor::{NodeOutcome, NodeUpdateExecutor, Timings};
pub use probe::{check_nodes, probe_node};
pub use recorder::{JobRecorder, JobSlot};
pub use rolling::{ClusterRuntime, RuntimeSettings};
pub use types::{
    ClusterUpdateSummary, EvacuationFailurePolicy, FailedNode, FailedVm, FailureKind, Job,
    JobSnapshot, JobStatus, NodeUpdateCheck, PausedDetails, PausedReason, Step, Trigger,
    UpdateOptions,
};
