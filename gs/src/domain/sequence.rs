//! Ordinal positions of jobs within a compound request
//!
//! Job ids come from a wrapping allocator, so the numerically smallest id of
//! a request is not necessarily the first one allocated. Sorting the ids and
//! looking for a jump of more than half the id space finds the wrap point;
//! everything past that jump was allocated before the wrap and ranks first.

use thiserror::Error;
use tracing::debug;

use crate::error::ErrorKind;

use super::id::{JobId, RequestId};

/// Half of the 64-bit id space
const HALF_SPACE: i128 = 1 << 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("request {request_id} has no members")]
    UnknownRequest { request_id: RequestId },

    #[error("job {target} is not a member of request {request_id}")]
    UnknownMember { request_id: RequestId, target: JobId },
}

impl SequenceError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Contract
    }
}

/// Recovers allocation order from a set of wrapping ids
pub struct RequestSequencer;

impl RequestSequencer {
    /// Member ids in allocation order, duplicates removed
    pub fn allocation_order(members: &[JobId]) -> Vec<JobId> {
        let mut ids = members.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let wrap = ids
            .windows(2)
            .position(|pair| i128::from(pair[1].as_i64()) - i128::from(pair[0].as_i64()) > HALF_SPACE);
        if let Some(split) = wrap {
            ids.rotate_left(split + 1);
        }
        ids
    }

    /// 1-based rank of `target` among `members` in allocation order
    pub fn ordinal(request_id: RequestId, members: &[JobId], target: JobId) -> Result<usize, SequenceError> {
        debug!(%request_id, members = members.len(), %target, "RequestSequencer::ordinal: called");
        if members.is_empty() {
            return Err(SequenceError::UnknownRequest { request_id });
        }

        Self::allocation_order(members)
            .iter()
            .position(|id| *id == target)
            .map(|index| index + 1)
            .ok_or(SequenceError::UnknownMember { request_id, target })
    }
}

/// A client request that fans out into several jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundRequest {
    id: RequestId,
    members: Vec<JobId>,
}

impl CompoundRequest {
    pub fn new(id: RequestId) -> Self {
        Self {
            id,
            members: Vec::new(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Register a job; adding the same id twice is a no-op
    pub fn add_member(&mut self, job_id: JobId) {
        if !self.members.contains(&job_id) {
            self.members.push(job_id);
        }
    }

    /// Member ids in allocation order
    pub fn members(&self) -> Vec<JobId> {
        RequestSequencer::allocation_order(&self.members)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ordinal(&self, target: JobId) -> Result<usize, SequenceError> {
        RequestSequencer::ordinal(self.id, &self.members, target)
    }
}
