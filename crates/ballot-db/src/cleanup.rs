//! Bulk cleanup: abandoning all in-flight pipeline work, and per-process
//! removal of one stage.

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use tracing::{info, warn};

use crate::artifact::Artifact;
use crate::error::{Result, StorageError};
use crate::kv::{NamespacedDb, WriteBatch};
use crate::stats::{StatKind, StatsUpdate};
use crate::types::{
    process_of_key, AggregatorBallotBatch, ProcessId, Stage, StateTransitionBatch, VerifiedBallot,
    VoteId, VoteIdStatus,
};
use crate::{tables, BallotDb};

/// Everything queued for removal for one process during
/// [`BallotDb::clean_all_pending`]. Corrupt records keep a `None` payload:
/// they are deleted but excluded from accounting.
#[derive(Default)]
struct ProcessSweep {
    verified: Vec<(Vec<u8>, Option<VerifiedBallot>)>,
    aggregator: Vec<(Vec<u8>, Option<AggregatorBallotBatch>)>,
    transitions: Vec<(Vec<u8>, Option<StateTransitionBatch>)>,
}

fn collect_stage<T: Artifact>(
    view: &NamespacedDb,
    mut push: impl FnMut(Vec<u8>, Option<T>),
) -> Result<()> {
    let mut raw = Vec::new();
    view.iterate(&[], &mut |key, value| {
        raw.push((key.to_vec(), value.to_vec()));
        ControlFlow::Continue(())
    })?;
    for (key, value) in raw {
        match T::decode(&value) {
            Ok(record) => push(key, Some(record)),
            Err(e) => {
                warn!(namespace = view.namespace().name(), key = %hex::encode(&key), error = %e,
                    "deleting corrupt record without accounting");
                push(key, None);
            }
        }
    }
    Ok(())
}

impl BallotDb {
    /// Abandons every verified ballot, aggregator batch, and
    /// state-transition batch in the store, releasing all nullifier locks
    /// and reversing the counters they contributed. Vote-ids of transition
    /// batches keep their `processed` status (their proofs can be
    /// re-derived); every other swept vote-id becomes `error`. Pending
    /// ballots are left untouched.
    pub fn clean_all_pending(&self) -> Result<()> {
        let _admin = self.admin_exclusive();

        let mut sweeps: BTreeMap<ProcessId, ProcessSweep> = BTreeMap::new();

        collect_stage::<VerifiedBallot>(&self.view(tables::VERIFIED_BALLOTS), |key, record| {
            if let Ok(pid) = process_of_key(&key) {
                sweeps.entry(pid).or_default().verified.push((key, record));
            }
        })?;
        collect_stage::<AggregatorBallotBatch>(
            &self.view(tables::AGGREGATOR_BATCHES),
            |key, record| {
                if let Ok(pid) = process_of_key(&key) {
                    sweeps.entry(pid).or_default().aggregator.push((key, record));
                }
            },
        )?;
        collect_stage::<StateTransitionBatch>(
            &self.view(tables::STATE_TRANSITIONS),
            |key, record| {
                if let Ok(pid) = process_of_key(&key) {
                    sweeps
                        .entry(pid)
                        .or_default()
                        .transitions
                        .push((key, record));
                }
            },
        )?;

        for (process_id, sweep) in sweeps {
            self.sweep_process(&process_id, sweep)?;
        }

        // Retry slots and settlement markers belong to the work being
        // abandoned.
        let retry_slots = self
            .view(tables::PENDING_AGGREGATOR_BATCHES)
            .collect_keys(&[])?;
        let mut batch = WriteBatch::new();
        for key in retry_slots {
            batch.delete(tables::PENDING_AGGREGATOR_BATCHES, &key);
        }
        self.commit(batch)?;
        self.pending_settlements.clear();

        info!("cleaned all pending pipeline work");
        Ok(())
    }

    fn sweep_process(&self, process_id: &ProcessId, sweep: ProcessSweep) -> Result<()> {
        let mut batch = WriteBatch::new();
        let mut release: Vec<VoteId> = Vec::new();

        let mut verified_records: i64 = 0;
        for (key, record) in &sweep.verified {
            batch.delete(tables::VERIFIED_BALLOTS, key);
            self.reservations.release(&mut batch, Stage::Verified, key);
            if let Some(ballot) = record {
                verified_records += 1;
                self.stage_status_change(&mut batch, process_id, &ballot.vote_id, VoteIdStatus::Error);
                release.push(ballot.vote_id.clone());
            }
        }

        let mut aggregated_ballots: i64 = 0;
        for (key, record) in &sweep.aggregator {
            batch.delete(tables::AGGREGATOR_BATCHES, key);
            self.reservations.release(&mut batch, Stage::Aggregator, key);
            if let Some(agg) = record {
                for ballot in &agg.ballots {
                    aggregated_ballots += 1;
                    self.stage_status_change(
                        &mut batch,
                        process_id,
                        &ballot.vote_id,
                        VoteIdStatus::Error,
                    );
                    release.push(ballot.vote_id.clone());
                }
            }
        }

        let mut transition_batches: i64 = 0;
        let mut transition_ballots: i64 = 0;
        for (key, record) in &sweep.transitions {
            batch.delete(tables::STATE_TRANSITIONS, key);
            self.reservations
                .release(&mut batch, Stage::StateTransition, key);
            if let Some(stb) = record {
                transition_batches += 1;
                for ballot in &stb.ballots {
                    // Status stays `processed`: the transition is valid and
                    // its proof can be re-derived.
                    transition_ballots += 1;
                    release.push(ballot.vote_id.clone());
                }
            }
        }

        // Reverse the full history of every swept ballot: each verified
        // ballot once contributed `verified +1`; aggregated ones also
        // `aggregated +1, current_batch -1`; each transition batch
        // `state_transitions +1`.
        let updates = [
            StatsUpdate::new(
                StatKind::VerifiedVotes,
                -(verified_records + aggregated_ballots + transition_ballots),
            ),
            StatsUpdate::new(
                StatKind::AggregatedVotes,
                -(aggregated_ballots + transition_ballots),
            ),
            StatsUpdate::new(StatKind::CurrentBatchSize, -verified_records),
            StatsUpdate::new(StatKind::StateTransitions, -transition_batches),
        ];
        {
            let _ledger = self.ledger_guard();
            match self.apply_stats_updates_locked(&mut batch, process_id, &updates) {
                Ok(()) => {}
                Err(StorageError::NotFound) => {
                    warn!(process = %process_id,
                        "process is not registered; sweeping its records without accounting");
                }
                Err(e) => return Err(e),
            }
            self.commit(batch)?;
        }
        for vote_id in &release {
            self.vote_id_locks().release(vote_id);
        }
        Ok(())
    }

    /// Deletes every record and reservation of one process in one stage.
    /// Counters, statuses, and nullifier locks are left as they are; this
    /// is an operator-level escape hatch.
    pub fn remove_by_process(&self, stage: Stage, process_id: &ProcessId) -> Result<()> {
        let _admin = self.admin_shared();
        let guard = self.process_guard(process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        let view = self.view(stage.namespace());
        let keys = view.collect_keys(process_id.as_bytes())?;
        let count = keys.len();

        let mut batch = WriteBatch::new();
        for key in keys {
            batch.delete(stage.namespace(), &key);
            self.reservations.release(&mut batch, stage, &key);
        }
        self.commit(batch)?;
        info!(process = %process_id, stage = stage.namespace().name(), count,
            "removed process records from stage");
        Ok(())
    }
}
