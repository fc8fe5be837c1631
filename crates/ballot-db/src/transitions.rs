//! State-transition batches and the failure-recovery controller.
//!
//! A transition batch is the proof-bearing artifact the settlement watcher
//! drives to `done`, `outdated`, or `failed`. Failure recovery may re-push
//! a previously saved retry batch into the aggregator queue, after
//! filtering out vote-ids the on-chain state has already absorbed.

use tracing::{debug, info, warn};

use crate::artifact::{content_hash, Artifact};
use crate::error::{Result, StorageError};
use crate::kv::WriteBatch;
use crate::stats::{StatKind, StatsUpdate};
use crate::types::{
    process_of_key, record_key, AggregatorBallot, ProcessId, RecordKey, Stage,
    StateTransitionBatch, VoteIdStatus,
};
use crate::{tables, BallotDb, MAX_STATE_TRANSITION_ATTEMPTS};

impl BallotDb {
    /// Stores a transition batch, moves its vote-ids to `processed`, and
    /// bumps the state-transition counter.
    pub fn push_state_transition_batch(&self, batch: &StateTransitionBatch) -> Result<()> {
        let _admin = self.admin_shared();
        let guard = self.process_guard(&batch.process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        let encoded = batch.encode();
        let key = record_key(&batch.process_id, &content_hash(&encoded));

        let mut write = WriteBatch::new();
        write.put(tables::STATE_TRANSITIONS, &key, encoded);
        for ballot in &batch.ballots {
            self.stage_status_change(
                &mut write,
                &batch.process_id,
                &ballot.vote_id,
                VoteIdStatus::Processed,
            );
        }
        {
            let _ledger = self.ledger_guard();
            self.apply_stats_updates_locked(
                &mut write,
                &batch.process_id,
                &[StatsUpdate::new(StatKind::StateTransitions, 1)],
            )?;
            self.commit(write)?;
        }
        debug!(process = %batch.process_id, origin = %hex::encode(batch.batch_id),
            size = batch.ballots.len(), "state-transition batch pushed");
        Ok(())
    }

    /// Returns the first unreserved transition batch of the process and
    /// reserves it.
    pub fn next_state_transition_batch(
        &self,
        process_id: &ProcessId,
    ) -> Result<(RecordKey, StateTransitionBatch)> {
        let _admin = self.admin_shared();
        let guard = self.process_guard(process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        let view = self.view(tables::STATE_TRANSITIONS);
        let keys = view.collect_keys(process_id.as_bytes())?;

        for key in keys {
            if self.reservations.is_reserved(Stage::StateTransition, &key)? {
                continue;
            }
            let bytes = match view.get(&key) {
                Ok(bytes) => bytes,
                Err(StorageError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let batch = match StateTransitionBatch::decode(&bytes) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(key = %hex::encode(&key), error = %e,
                        "skipping corrupt state-transition batch");
                    continue;
                }
            };
            if let Err(e) = self.reservations.reserve(Stage::StateTransition, &key) {
                warn!(key = %hex::encode(&key), error = %e,
                    "failed to reserve state-transition batch; treating it as unavailable");
                continue;
            }
            return Ok((key, batch));
        }
        Err(StorageError::NoMoreElements)
    }

    /// Settles a transition batch: vote-ids become `settled`, nullifiers
    /// are released, and the settled counter and transition timestamp are
    /// updated.
    pub fn mark_state_transition_batch_done(
        &self,
        key: &[u8],
        process_id: &ProcessId,
    ) -> Result<()> {
        let _admin = self.admin_shared();
        let guard = self.process_guard(process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        let batch = StateTransitionBatch::decode(&self.view(tables::STATE_TRANSITIONS).get(key)?)?;

        let mut write = WriteBatch::new();
        for ballot in &batch.ballots {
            self.stage_status_change(
                &mut write,
                process_id,
                &ballot.vote_id,
                VoteIdStatus::Settled,
            );
        }
        write.delete(tables::STATE_TRANSITIONS, key);
        self.reservations
            .release(&mut write, Stage::StateTransition, key);
        {
            let _ledger = self.ledger_guard();
            self.apply_stats_updates_locked(
                &mut write,
                process_id,
                &[
                    StatsUpdate::new(StatKind::SettledStateTransitions, 1),
                    StatsUpdate::new(StatKind::LastTransitionDate, 0),
                ],
            )?;
            self.commit(write)?;
        }
        for ballot in &batch.ballots {
            self.vote_id_locks().release(&ballot.vote_id);
        }
        debug!(process = %process_id, origin = %hex::encode(batch.batch_id),
            "state-transition batch settled");
        Ok(())
    }

    /// Drops a transition batch whose proof became stale because the
    /// on-chain root moved. Vote-ids keep their `processed` status and
    /// their nullifier locks; the origin aggregator batch's reservation is
    /// released so it can be picked up and re-proven.
    pub fn mark_state_transition_batch_outdated(&self, key: &[u8]) -> Result<()> {
        let _admin = self.admin_shared();
        let process_id = process_of_key(key)?;
        let guard = self.process_guard(&process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        let batch = StateTransitionBatch::decode(&self.view(tables::STATE_TRANSITIONS).get(key)?)?;

        let mut write = WriteBatch::new();
        write.delete(tables::STATE_TRANSITIONS, key);
        self.reservations
            .release(&mut write, Stage::StateTransition, key);
        self.reservations.release(
            &mut write,
            Stage::Aggregator,
            &record_key(&process_id, &batch.batch_id),
        );
        self.commit(write)?;
        info!(process = %process_id, origin = %hex::encode(batch.batch_id),
            "state-transition batch outdated; origin aggregator batch released");
        Ok(())
    }

    /// Handles a failed settlement attempt.
    ///
    /// The transition batch is always dropped and the process's pending
    /// settlement marker released. If a retry slot exists, its attempt
    /// count is bumped and — unless the process stopped accepting votes or
    /// the attempt bound is hit — the batch is re-pushed into the
    /// aggregator queue, minus any vote-id the on-chain state already
    /// contains. Without a retry slot the batch's vote-ids are terminally
    /// errored. Fired from the settlement watcher's background loop, so
    /// recoverable conditions never surface as errors.
    pub fn mark_state_transition_batch_failed(
        &self,
        key: &[u8],
        process_id: &ProcessId,
    ) -> Result<()> {
        let _admin = self.admin_shared();
        let guard = self.process_guard(process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        let batch = match self.view(tables::STATE_TRANSITIONS).get(key) {
            Ok(bytes) => StateTransitionBatch::decode(&bytes)?,
            Err(StorageError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };

        // The failed batch never survives, whatever happens below.
        let mut write = WriteBatch::new();
        write.delete(tables::STATE_TRANSITIONS, key);
        self.reservations
            .release(&mut write, Stage::StateTransition, key);
        self.commit(write)?;
        self.release_pending_settlement(process_id);

        let retry = match self.pending_aggregator_batch(process_id) {
            Ok(retry) => Some(retry),
            Err(StorageError::NotFound) => None,
            Err(e) => return Err(e),
        };
        let Some(mut retry) = retry else {
            info!(process = %process_id, origin = %hex::encode(batch.batch_id),
                "transition failed without a retry slot; abandoning its ballots");
            return self.fail_ballots_locked(process_id, &batch.ballots);
        };

        self.view(tables::PENDING_AGGREGATOR_BATCHES)
            .delete(process_id.as_bytes())?;
        retry.attempts += 1;

        if retry.attempts >= MAX_STATE_TRANSITION_ATTEMPTS {
            info!(process = %process_id, attempts = retry.attempts,
                "retry attempt bound reached; abandoning the batch");
            return self.fail_ballots_locked(process_id, &batch.ballots);
        }

        let process = self.process(process_id)?;
        if !process.accepting_votes {
            info!(process = %process_id, "process no longer accepts votes; abandoning the batch");
            return self.fail_ballots_locked(process_id, &batch.ballots);
        }
        let root = process
            .state_root
            .ok_or(StorageError::MissingStateRoot(*process_id))?;

        // Split the retry batch into ballots the chain already absorbed
        // (a previous transition landed them) and ballots still worth
        // re-proving.
        let mut absorbed: Vec<AggregatorBallot> = Vec::new();
        let mut kept: Vec<AggregatorBallot> = Vec::new();
        for ballot in retry.ballots.drain(..) {
            let contained = match &self.state_reader {
                Some(reader) => {
                    match reader.contains_vote_id(process_id, &root, &ballot.vote_id) {
                        Ok(contained) => contained,
                        Err(e) => {
                            warn!(vote_id = %ballot.vote_id, error = %e,
                                "state lookup failed; keeping ballot for retry");
                            false
                        }
                    }
                }
                None => false,
            };
            if contained {
                absorbed.push(ballot);
            } else {
                kept.push(ballot);
            }
        }

        if !absorbed.is_empty() {
            self.fail_ballots_locked(process_id, &absorbed)?;
        }
        if kept.is_empty() {
            info!(process = %process_id, "all retry ballots already absorbed; nothing to re-push");
            return Ok(());
        }

        retry.ballots = kept;
        retry.last_attempt_unix = Some(self.now_unix());
        info!(process = %process_id, origin = %hex::encode(retry.batch_id),
            attempts = retry.attempts, size = retry.ballots.len(),
            "re-pushing recovered aggregator batch");
        self.push_aggregator_batch_locked(&retry)
    }

    /// Terminally errors a set of ballots: statuses to `error`, nullifier
    /// locks released. Assumes the caller holds the process guard.
    fn fail_ballots_locked(
        &self,
        process_id: &ProcessId,
        ballots: &[AggregatorBallot],
    ) -> Result<()> {
        let mut write = WriteBatch::new();
        for ballot in ballots {
            self.stage_status_change(&mut write, process_id, &ballot.vote_id, VoteIdStatus::Error);
        }
        self.commit(write)?;
        for ballot in ballots {
            self.vote_id_locks().release(&ballot.vote_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::kv::MemDb;
    use crate::state::ProcessStateReader;
    use crate::testing::ManualClock;
    use crate::types::AggregatorBallotBatch;
    use crate::{Process, StateRoot, VoteId};

    fn pid(byte: u8) -> ProcessId {
        ProcessId::new([byte; 32])
    }

    fn agg_ballot(seed: u8) -> AggregatorBallot {
        AggregatorBallot {
            vote_id: VoteId::new(vec![seed, 0xcc]),
            address: vec![seed; 20],
            encrypted_ballot: vec![seed],
        }
    }

    /// State reader backed by a plain set of absorbed vote-ids.
    #[derive(Default)]
    struct SetReader {
        absorbed: Mutex<HashSet<VoteId>>,
    }

    impl SetReader {
        fn absorb(&self, vote_id: &VoteId) {
            self.absorbed.lock().unwrap().insert(vote_id.clone());
        }
    }

    impl ProcessStateReader for SetReader {
        fn contains_vote_id(
            &self,
            _process_id: &ProcessId,
            _root: &StateRoot,
            vote_id: &VoteId,
        ) -> Result<bool> {
            Ok(self.absorbed.lock().unwrap().contains(vote_id))
        }
    }

    struct Setup {
        db: BallotDb,
        clock: Arc<ManualClock>,
        reader: Arc<SetReader>,
    }

    fn setup() -> Setup {
        let clock = Arc::new(ManualClock::default());
        clock.set(10_000);
        let reader = Arc::new(SetReader::default());
        let mut db = BallotDb::with_clock(Arc::new(MemDb::new()), clock.clone()).unwrap();
        db.set_state_reader(reader.clone());
        let mut process = Process::new(pid(1));
        process.state_root = Some([9; 32]);
        db.set_process(&process).unwrap();
        Setup { db, clock, reader }
    }

    /// Pushes an aggregator batch and derives its transition batch, the
    /// way the prover pipeline would.
    fn transition_for(db: &BallotDb, agg: &AggregatorBallotBatch) -> (RecordKey, StateTransitionBatch) {
        db.push_aggregator_batch(agg).unwrap();
        let (agg_key, _) = db.next_aggregator_batch(&agg.process_id).unwrap();
        let batch = StateTransitionBatch {
            process_id: agg.process_id,
            batch_id: agg.batch_id,
            ballots: agg.ballots.clone(),
            pre_state_root: [1; 32],
            post_state_root: [2; 32],
            proof: vec![],
        };
        db.push_state_transition_batch(&batch).unwrap();
        db.mark_aggregator_batch_done(&agg_key).unwrap();
        let (key, stored) = db.next_state_transition_batch(&agg.process_id).unwrap();
        assert_eq!(stored, batch);
        (key, batch)
    }

    #[test]
    fn done_settles_and_releases() {
        let Setup { db, .. } = setup();
        let agg = AggregatorBallotBatch::new(pid(1), vec![agg_ballot(1), agg_ballot(2)]);
        for ballot in &agg.ballots {
            db.vote_id_locks().lock(&ballot.vote_id);
        }
        let (key, batch) = transition_for(&db, &agg);

        db.mark_state_transition_batch_done(&key, &pid(1)).unwrap();

        let stats = db.process_stats(&pid(1)).unwrap();
        assert_eq!(stats.state_transition_count, 1);
        assert_eq!(stats.settled_state_transition_count, 1);
        assert_eq!(stats.last_state_transition_unix, 10_000);
        for ballot in &batch.ballots {
            assert_eq!(
                db.vote_id_status(&pid(1), &ballot.vote_id).unwrap(),
                VoteIdStatus::Settled
            );
            assert!(!db.vote_id_locks().is_processing(&ballot.vote_id));
        }
    }

    #[test]
    fn outdated_releases_the_origin_batch_but_keeps_statuses() {
        let Setup { db, .. } = setup();
        let agg = AggregatorBallotBatch::new(pid(1), vec![agg_ballot(1)]);
        db.vote_id_locks().lock(&agg.ballots[0].vote_id);

        db.push_aggregator_batch(&agg).unwrap();
        let (agg_key, _) = db.next_aggregator_batch(&pid(1)).unwrap();
        let batch = StateTransitionBatch {
            process_id: pid(1),
            batch_id: agg.batch_id,
            ballots: agg.ballots.clone(),
            pre_state_root: [1; 32],
            post_state_root: [2; 32],
            proof: vec![],
        };
        db.push_state_transition_batch(&batch).unwrap();
        let (key, _) = db.next_state_transition_batch(&pid(1)).unwrap();

        db.mark_state_transition_batch_outdated(&key).unwrap();

        // Status stays processed, the lock stays held, and the origin
        // aggregator batch is claimable again.
        assert_eq!(
            db.vote_id_status(&pid(1), &agg.ballots[0].vote_id).unwrap(),
            VoteIdStatus::Processed
        );
        assert!(db.vote_id_locks().is_processing(&agg.ballots[0].vote_id));
        let (reclaimed_key, _) = db.next_aggregator_batch(&pid(1)).unwrap();
        assert_eq!(reclaimed_key, agg_key);
    }

    #[test]
    fn failed_without_retry_slot_abandons_the_ballots() {
        let Setup { db, .. } = setup();
        let agg = AggregatorBallotBatch::new(pid(1), vec![agg_ballot(1), agg_ballot(2)]);
        for ballot in &agg.ballots {
            db.vote_id_locks().lock(&ballot.vote_id);
        }
        let (key, batch) = transition_for(&db, &agg);
        db.set_pending_settlement(&pid(1));

        db.mark_state_transition_batch_failed(&key, &pid(1)).unwrap();

        assert!(!db.has_pending_settlement(&pid(1)));
        for ballot in &batch.ballots {
            assert_eq!(
                db.vote_id_status(&pid(1), &ballot.vote_id).unwrap(),
                VoteIdStatus::Error
            );
            assert!(!db.vote_id_locks().is_processing(&ballot.vote_id));
        }
        // A second call is a no-op.
        db.mark_state_transition_batch_failed(&key, &pid(1)).unwrap();
    }

    #[test]
    fn failed_with_retry_slot_filters_absorbed_ballots_and_re_pushes() {
        let Setup { db, clock, reader } = setup();
        let ballots: Vec<AggregatorBallot> = (1..=5).map(agg_ballot).collect();
        let agg = AggregatorBallotBatch::new(pid(1), ballots.clone());
        for ballot in &agg.ballots {
            db.vote_id_locks().lock(&ballot.vote_id);
        }
        db.mark_aggregator_batch_pending(&agg).unwrap();
        let (key, _) = transition_for(&db, &agg);

        // Two of five already landed on-chain through an earlier
        // transition.
        reader.absorb(&ballots[0].vote_id);
        reader.absorb(&ballots[1].vote_id);

        db.mark_state_transition_batch_failed(&key, &pid(1)).unwrap();

        // The retry slot is consumed.
        assert!(matches!(
            db.pending_aggregator_batch(&pid(1)),
            Err(StorageError::NotFound)
        ));
        for absorbed in &ballots[..2] {
            assert_eq!(
                db.vote_id_status(&pid(1), &absorbed.vote_id).unwrap(),
                VoteIdStatus::Error
            );
            assert!(!db.vote_id_locks().is_processing(&absorbed.vote_id));
        }
        for kept in &ballots[2..] {
            assert_eq!(
                db.vote_id_status(&pid(1), &kept.vote_id).unwrap(),
                VoteIdStatus::Aggregated
            );
            assert!(db.vote_id_locks().is_processing(&kept.vote_id));
        }

        // The re-pushed batch is cooling down: a pull inside the 30s
        // window finds nothing, one after it succeeds.
        clock.advance(29);
        assert!(matches!(
            db.next_aggregator_batch(&pid(1)),
            Err(StorageError::NoMoreElements)
        ));
        clock.advance(1);
        let (_, recovered) = db.next_aggregator_batch(&pid(1)).unwrap();
        assert_eq!(recovered.attempts, 1);
        assert_eq!(recovered.last_attempt_unix, Some(10_000));
        assert_eq!(recovered.ballots, ballots[2..].to_vec());
    }

    #[test]
    fn attempt_bound_abandons_instead_of_re_pushing() {
        let Setup { db, .. } = setup();
        let agg = AggregatorBallotBatch::new(pid(1), vec![agg_ballot(1)]);
        db.vote_id_locks().lock(&agg.ballots[0].vote_id);

        let mut slot = agg.clone();
        slot.attempts = MAX_STATE_TRANSITION_ATTEMPTS - 1;
        db.mark_aggregator_batch_pending(&slot).unwrap();
        let (key, _) = transition_for(&db, &agg);

        db.mark_state_transition_batch_failed(&key, &pid(1)).unwrap();

        assert_eq!(
            db.vote_id_status(&pid(1), &agg.ballots[0].vote_id).unwrap(),
            VoteIdStatus::Error
        );
        assert!(matches!(
            db.next_aggregator_batch(&pid(1)),
            Err(StorageError::NoMoreElements)
        ));
    }

    #[test]
    fn closed_process_abandons_the_batch() {
        let Setup { db, .. } = setup();
        let agg = AggregatorBallotBatch::new(pid(1), vec![agg_ballot(1)]);
        db.vote_id_locks().lock(&agg.ballots[0].vote_id);
        db.mark_aggregator_batch_pending(&agg).unwrap();
        let (key, _) = transition_for(&db, &agg);

        db.set_process_accepting(&pid(1), false).unwrap();
        db.mark_state_transition_batch_failed(&key, &pid(1)).unwrap();

        assert_eq!(
            db.vote_id_status(&pid(1), &agg.ballots[0].vote_id).unwrap(),
            VoteIdStatus::Error
        );
        assert!(matches!(
            db.next_aggregator_batch(&pid(1)),
            Err(StorageError::NoMoreElements)
        ));
    }

    #[test]
    fn missing_state_root_is_a_hard_error() {
        let Setup { db, .. } = setup();
        let mut process = Process::new(pid(2));
        process.state_root = None;
        db.set_process(&process).unwrap();

        let agg = AggregatorBallotBatch::new(pid(2), vec![agg_ballot(7)]);
        db.vote_id_locks().lock(&agg.ballots[0].vote_id);
        db.mark_aggregator_batch_pending(&agg).unwrap();
        let (key, _) = transition_for(&db, &agg);

        let err = db
            .mark_state_transition_batch_failed(&key, &pid(2))
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingStateRoot(_)));
    }
}
