//! The stat ledger: per-process counters plus their global mirrors.
//!
//! All updates of one call are committed in a single write batch, so no
//! reader can observe a state where the per-process counters and the
//! global mirrors disagree. The ledger sits behind its own mutex
//! (`ledger_lock`) so stat reads never contend with queue operations.

use tracing::warn;

use crate::artifact::Artifact;
use crate::error::{Result, StorageError};
use crate::kv::{NamespacedDb, WriteBatch};
use crate::types::{Process, ProcessId, SequencerStats, Stats, StatsPendingBallots};
use crate::{tables, BallotDb};

pub(crate) const GLOBAL_STATS_KEY: &[u8] = b"global";
pub(crate) const PENDING_BALLOTS_KEY: &[u8] = b"pendingBallots";

/// The counters a stats update may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    StateTransitions,
    SettledStateTransitions,
    AggregatedVotes,
    VerifiedVotes,
    PendingVotes,
    LastBatchSize,
    CurrentBatchSize,
    LastTransitionDate,
}

impl TryFrom<u8> for StatKind {
    type Error = StorageError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(StatKind::StateTransitions),
            1 => Ok(StatKind::SettledStateTransitions),
            2 => Ok(StatKind::AggregatedVotes),
            3 => Ok(StatKind::VerifiedVotes),
            4 => Ok(StatKind::PendingVotes),
            5 => Ok(StatKind::LastBatchSize),
            6 => Ok(StatKind::CurrentBatchSize),
            7 => Ok(StatKind::LastTransitionDate),
            other => Err(StorageError::UnknownStatKind(other)),
        }
    }
}

/// One counter mutation.
///
/// `delta` is added for the free-signed kinds, added-then-clamped for
/// `PendingVotes` and `CurrentBatchSize`, taken as the new value for
/// `LastBatchSize`, and ignored for `LastTransitionDate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsUpdate {
    pub kind: StatKind,
    pub delta: i64,
}

impl StatsUpdate {
    pub fn new(kind: StatKind, delta: i64) -> Self {
        Self { kind, delta }
    }
}

fn read_or_default<T: Artifact + Default>(view: &NamespacedDb, key: &[u8]) -> Result<T> {
    match view.get(key) {
        Ok(bytes) => T::decode(&bytes),
        Err(StorageError::NotFound) => Ok(T::default()),
        Err(e) => Err(e),
    }
}

impl BallotDb {
    /// Applies `updates` to the process's counters and their global
    /// mirrors, atomically.
    pub fn update_process_stats(
        &self,
        process_id: &ProcessId,
        updates: &[StatsUpdate],
    ) -> Result<()> {
        let _admin = self.admin_shared();
        let _ledger = self.ledger_guard();
        let mut batch = WriteBatch::new();
        self.apply_stats_updates_locked(&mut batch, process_id, updates)?;
        self.commit(batch)
    }

    /// Global counters across all processes. O(1): reads the mirrored
    /// record, never scans.
    pub fn total_stats(&self) -> Result<Stats> {
        read_or_default(&self.view(tables::STATS), GLOBAL_STATS_KEY)
    }

    /// Global pending-ballot count. O(1).
    pub fn total_pending_ballots(&self) -> Result<i64> {
        let pending: StatsPendingBallots =
            read_or_default(&self.view(tables::STATS), PENDING_BALLOTS_KEY)?;
        Ok(pending.pending_ballots_count)
    }

    /// Convenience read of one process's counters.
    pub fn process_stats(&self, process_id: &ProcessId) -> Result<SequencerStats> {
        Ok(self.process(process_id)?.sequencer_stats)
    }

    /// Buffers the record rewrites for `updates` into `batch`. The caller
    /// must hold the ledger lock.
    pub(crate) fn apply_stats_updates_locked(
        &self,
        batch: &mut WriteBatch,
        process_id: &ProcessId,
        updates: &[StatsUpdate],
    ) -> Result<()> {
        let processes = self.view(tables::PROCESSES);
        let stats_view = self.view(tables::STATS);

        let mut process = Process::decode(&processes.get(process_id.as_bytes())?)?;
        let mut global: Stats = read_or_default(&stats_view, GLOBAL_STATS_KEY)?;
        let mut pending: StatsPendingBallots = read_or_default(&stats_view, PENDING_BALLOTS_KEY)?;

        for update in updates {
            let delta = update.delta;
            let stats = &mut process.sequencer_stats;
            match update.kind {
                StatKind::StateTransitions => {
                    stats.state_transition_count = stats.state_transition_count.saturating_add(delta);
                    global.state_transition_count = global.state_transition_count.saturating_add(delta);
                }
                StatKind::SettledStateTransitions => {
                    stats.settled_state_transition_count =
                        stats.settled_state_transition_count.saturating_add(delta);
                    global.settled_state_transition_count =
                        global.settled_state_transition_count.saturating_add(delta);
                }
                StatKind::AggregatedVotes => {
                    stats.aggregated_votes_count = stats.aggregated_votes_count.saturating_add(delta);
                    global.aggregated_votes_count = global.aggregated_votes_count.saturating_add(delta);
                }
                StatKind::VerifiedVotes => {
                    stats.verified_votes_count = stats.verified_votes_count.saturating_add(delta);
                    global.verified_votes_count = global.verified_votes_count.saturating_add(delta);
                }
                StatKind::PendingVotes => {
                    let prior = stats.pending_votes_count;
                    let next = prior.saturating_add(delta);
                    if next < 0 {
                        warn!(process = %process_id, prior, delta,
                            "pending-votes delta would go negative; clamping to zero");
                        stats.pending_votes_count = 0;
                        // The prior value, not the delta, is what the global
                        // counter actually held for this process.
                        pending.pending_ballots_count =
                            pending.pending_ballots_count.saturating_sub(prior);
                    } else {
                        stats.pending_votes_count = next;
                        pending.pending_ballots_count =
                            pending.pending_ballots_count.saturating_add(delta);
                    }
                }
                StatKind::LastBatchSize => {
                    if delta < 0 {
                        warn!(process = %process_id, delta,
                            "negative last-batch-size; clamping to zero");
                    }
                    stats.last_batch_size = delta.max(0);
                }
                StatKind::CurrentBatchSize => {
                    let next = stats.current_batch_size.saturating_add(delta);
                    if next < 0 {
                        warn!(process = %process_id, prior = stats.current_batch_size, delta,
                            "current-batch-size delta would go negative; clamping to zero");
                        stats.current_batch_size = 0;
                    } else {
                        stats.current_batch_size = next;
                    }
                }
                StatKind::LastTransitionDate => {
                    let now = self.now_unix();
                    stats.last_state_transition_unix = now;
                    global.last_state_transition_unix = now;
                }
            }
        }

        batch.put(tables::PROCESSES, process_id.as_bytes(), process.encode());
        batch.put(tables::STATS, GLOBAL_STATS_KEY, global.encode());
        batch.put(tables::STATS, PENDING_BALLOTS_KEY, pending.encode());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::kv::MemDb;
    use crate::testing::ManualClock;
    use crate::Process;

    fn engine_with_process(id: ProcessId) -> BallotDb {
        let db = BallotDb::new(Arc::new(MemDb::new())).unwrap();
        db.set_process(&Process::new(id)).unwrap();
        db
    }

    fn pid(byte: u8) -> ProcessId {
        ProcessId::new([byte; 32])
    }

    #[test]
    fn unknown_stat_kind_is_rejected_at_the_boundary() {
        assert!(StatKind::try_from(7).is_ok());
        assert!(matches!(
            StatKind::try_from(42),
            Err(StorageError::UnknownStatKind(42))
        ));
    }

    #[test]
    fn updating_stats_of_unknown_process_reports_not_found() {
        let db = BallotDb::new(Arc::new(MemDb::new())).unwrap();
        let err = db
            .update_process_stats(&pid(1), &[StatsUpdate::new(StatKind::VerifiedVotes, 1)])
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[test]
    fn pending_votes_clamp_preserves_the_global_sum() {
        let db = engine_with_process(pid(1));
        db.set_process(&Process::new(pid(2))).unwrap();

        db.update_process_stats(&pid(1), &[StatsUpdate::new(StatKind::PendingVotes, 7)])
            .unwrap();
        db.update_process_stats(&pid(2), &[StatsUpdate::new(StatKind::PendingVotes, 5)])
            .unwrap();
        assert_eq!(db.total_pending_ballots().unwrap(), 12);

        // Clamped: the process held 7, so the global loses exactly 7.
        db.update_process_stats(
            &pid(1),
            &[StatsUpdate::new(StatKind::PendingVotes, i64::MIN)],
        )
        .unwrap();
        assert_eq!(db.process_stats(&pid(1)).unwrap().pending_votes_count, 0);
        assert_eq!(db.total_pending_ballots().unwrap(), 5);
    }

    #[test]
    fn current_batch_size_clamps_to_zero() {
        let db = engine_with_process(pid(1));
        db.update_process_stats(&pid(1), &[StatsUpdate::new(StatKind::CurrentBatchSize, 3)])
            .unwrap();
        db.update_process_stats(
            &pid(1),
            &[StatsUpdate::new(StatKind::CurrentBatchSize, i64::MIN)],
        )
        .unwrap();
        assert_eq!(db.process_stats(&pid(1)).unwrap().current_batch_size, 0);
    }

    #[test]
    fn last_batch_size_is_an_absolute_set() {
        let db = engine_with_process(pid(1));
        db.update_process_stats(&pid(1), &[StatsUpdate::new(StatKind::LastBatchSize, 40)])
            .unwrap();
        db.update_process_stats(&pid(1), &[StatsUpdate::new(StatKind::LastBatchSize, 12)])
            .unwrap();
        assert_eq!(db.process_stats(&pid(1)).unwrap().last_batch_size, 12);

        db.update_process_stats(&pid(1), &[StatsUpdate::new(StatKind::LastBatchSize, -3)])
            .unwrap();
        assert_eq!(db.process_stats(&pid(1)).unwrap().last_batch_size, 0);
    }

    #[test]
    fn free_signed_counters_may_go_negative() {
        let db = engine_with_process(pid(1));
        db.update_process_stats(
            &pid(1),
            &[
                StatsUpdate::new(StatKind::VerifiedVotes, -4),
                StatsUpdate::new(StatKind::AggregatedVotes, -2),
                StatsUpdate::new(StatKind::StateTransitions, -1),
            ],
        )
        .unwrap();

        let stats = db.process_stats(&pid(1)).unwrap();
        assert_eq!(stats.verified_votes_count, -4);
        assert_eq!(stats.aggregated_votes_count, -2);
        assert_eq!(stats.state_transition_count, -1);

        let total = db.total_stats().unwrap();
        assert_eq!(total.verified_votes_count, -4);
        assert_eq!(total.aggregated_votes_count, -2);
        assert_eq!(total.state_transition_count, -1);
    }

    #[test]
    fn last_transition_date_uses_the_clock_and_ignores_delta() {
        let clock = Arc::new(ManualClock::default());
        clock.set(1_234);
        let db = BallotDb::with_clock(Arc::new(MemDb::new()), clock).unwrap();
        db.set_process(&Process::new(pid(1))).unwrap();

        db.update_process_stats(
            &pid(1),
            &[StatsUpdate::new(StatKind::LastTransitionDate, -999)],
        )
        .unwrap();
        assert_eq!(
            db.process_stats(&pid(1)).unwrap().last_state_transition_unix,
            1_234
        );
        assert_eq!(db.total_stats().unwrap().last_state_transition_unix, 1_234);
    }

    proptest! {
        // I3: the global pending counter equals the per-process sum no
        // matter how deltas interleave with clamping.
        #[test]
        fn global_pending_always_equals_the_per_process_sum(
            deltas in proptest::collection::vec((0u8..2, -30i64..30), 1..40)
        ) {
            let db = engine_with_process(pid(1));
            db.set_process(&Process::new(pid(2))).unwrap();

            for (which, delta) in deltas {
                let target = if which == 0 { pid(1) } else { pid(2) };
                db.update_process_stats(
                    &target,
                    &[StatsUpdate::new(StatKind::PendingVotes, delta)],
                ).unwrap();
            }

            let p1 = db.process_stats(&pid(1)).unwrap().pending_votes_count;
            let p2 = db.process_stats(&pid(2)).unwrap().pending_votes_count;
            prop_assert!(p1 >= 0 && p2 >= 0);
            prop_assert_eq!(db.total_pending_ballots().unwrap(), p1 + p2);
        }
    }
}
