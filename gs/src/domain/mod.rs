//! Domain types: jobs, identifiers, request sequencing and priority policies

mod id;
mod job;
mod kind;
mod priority;
mod sequence;

pub use id::{IdAllocator, JobId, RequestId};
pub use job::{Job, JobError, JobSnapshot, JobState};
pub use kind::JobKind;
pub use priority::{FairSharePolicy, FifoPolicy, PolicyContext, PolicyKind, PriorityPolicy};
pub use sequence::{CompoundRequest, RequestSequencer, SequenceError};
