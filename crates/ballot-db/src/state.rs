//! Contract over the cryptographic state tree, consumed by the
//! failure-recovery path to detect vote-ids that a successful transition
//! has already absorbed.

use crate::error::Result;
use crate::types::{ProcessId, StateRoot, VoteId};

/// Read access to a process's committed state at a given root.
///
/// Implemented outside this crate by the sequencer's state-tree layer; the
/// engine only ever asks membership questions.
pub trait ProcessStateReader: Send + Sync {
    /// Whether the state of `process_id` at `root` already contains
    /// `vote_id`.
    fn contains_vote_id(
        &self,
        process_id: &ProcessId,
        root: &StateRoot,
        vote_id: &VoteId,
    ) -> Result<bool>;
}
