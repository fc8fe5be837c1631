//! The in-memory vote-ID lock table.
//!
//! A nullifier is locked from ingestion until its vote-id reaches
//! `settled` or `error`, which is what makes duplicate submissions cheap
//! to reject. The table is not persisted: on startup it is reconstructed
//! by scanning the live records of the pending, verified, aggregator and
//! state-transition stages.

use std::ops::ControlFlow;
use std::sync::Arc;

use dashmap::DashSet;
use tracing::warn;

use crate::artifact::Artifact;
use crate::error::Result;
use crate::kv::{KeyValueDb, NamespacedDb};
use crate::types::{AggregatorBallotBatch, Ballot, StateTransitionBatch, VerifiedBallot, VoteId};
use crate::tables;

/// Concurrent set of in-flight nullifiers. Lock and release are
/// idempotent.
#[derive(Debug, Default)]
pub struct VoteIdLocks {
    inner: DashSet<VoteId>,
}

impl VoteIdLocks {
    pub fn lock(&self, vote_id: &VoteId) {
        self.inner.insert(vote_id.clone());
    }

    pub fn release(&self, vote_id: &VoteId) {
        self.inner.remove(vote_id);
    }

    /// Whether the nullifier is currently inside the pipeline.
    pub fn is_processing(&self, vote_id: &VoteId) -> bool {
        self.inner.contains(vote_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Rebuilds the table from the live pipeline records. Corrupt records
    /// are logged and skipped; they cannot hold a lock we know nothing
    /// about.
    pub(crate) fn rebuild(&self, db: &Arc<dyn KeyValueDb>) -> Result<()> {
        self.scan_into::<Ballot>(db, tables::PENDING_BALLOTS, |b| vec![b.vote_id])?;
        self.scan_into::<VerifiedBallot>(db, tables::VERIFIED_BALLOTS, |b| vec![b.vote_id])?;
        self.scan_into::<AggregatorBallotBatch>(db, tables::AGGREGATOR_BATCHES, |b| {
            b.ballots.into_iter().map(|a| a.vote_id).collect()
        })?;
        self.scan_into::<StateTransitionBatch>(db, tables::STATE_TRANSITIONS, |b| {
            b.ballots.into_iter().map(|a| a.vote_id).collect()
        })?;
        Ok(())
    }

    fn scan_into<T: Artifact>(
        &self,
        db: &Arc<dyn KeyValueDb>,
        ns: crate::kv::Namespace,
        vote_ids: impl Fn(T) -> Vec<VoteId>,
    ) -> Result<()> {
        let view = NamespacedDb::new(db.clone(), ns);
        let mut values = Vec::new();
        view.iterate(&[], &mut |_, value| {
            values.push(value.to_vec());
            ControlFlow::Continue(())
        })?;
        for value in values {
            match T::decode(&value) {
                Ok(record) => {
                    for vote_id in vote_ids(record) {
                        self.lock(&vote_id);
                    }
                }
                Err(e) => {
                    warn!(namespace = ns.name(), error = %e,
                        "skipping corrupt record during lock-table rebuild");
                }
            }
        }
        Ok(())
    }
}
