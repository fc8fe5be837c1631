//! Ballot lifecycle storage for the Scrutin zk voting sequencer.
//!
//! [`BallotDb`] moves individually submitted ballots through the fixed
//! pipeline `pending -> verified -> aggregated -> processed -> settled`
//! while maintaining per-process statistics, nullifier uniqueness locks,
//! and crash-safe worker reservations. Several OS-thread workers may pull
//! work concurrently: multi-step operations are serialized per process,
//! with a global lock reserved for bulk admin work.
//!
//! The engine runs on any ordered key-value store implementing
//! [`kv::KeyValueDb`]; [`kv::MemDb`] and [`kv::RocksDb`] ship with the
//! crate.

mod aggregator;
pub mod artifact;
mod cleanup;
mod error;
pub mod kv;
mod nullifiers;
mod pending;
mod reservations;
mod state;
mod stats;
mod transitions;
mod types;
mod verified;

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use dashmap::DashSet;
use tracing::warn;

pub use crate::artifact::{content_hash, Artifact, ContentHash};
pub use crate::error::{Result, StorageError};
use crate::kv::{KeyValueDb, NamespacedDb, WriteBatch};
pub use crate::nullifiers::VoteIdLocks;
use crate::reservations::ReservationSet;
pub use crate::state::ProcessStateReader;
pub use crate::stats::{StatKind, StatsUpdate};
pub use crate::types::{
    AggregatorBallot, AggregatorBallotBatch, Ballot, Process, ProcessId, RecordKey,
    SequencerStats, Stage, StateRoot, StateTransitionBatch, Stats, StatsPendingBallots,
    VerifiedBallot, VoteId, VoteIdStatus, PROCESS_ID_LEN,
};

/// A state-transition batch that fails this many times is abandoned and its
/// remaining ballots marked `error`.
pub const MAX_STATE_TRANSITION_ATTEMPTS: u32 = 5;
/// Base retry cooldown, doubled per failed attempt.
pub const COOLDOWN_BASE_SECS: i64 = 30;
/// Upper bound on the retry cooldown.
pub const COOLDOWN_MAX_SECS: i64 = 300;

/// The namespaces partitioning the backing store. Tags are prefix-free and
/// fixed for the lifetime of a database.
pub mod tables {
    use crate::kv::Namespace;

    pub const PROCESSES: Namespace = Namespace::new(b"pr/", "process");
    pub const PENDING_BALLOTS: Namespace = Namespace::new(b"pb/", "pendingBallot");
    pub const PENDING_BALLOT_RESERVATIONS: Namespace = Namespace::new(b"pbr/", "pendingBallotRes");
    pub const VERIFIED_BALLOTS: Namespace = Namespace::new(b"vb/", "verifiedBallot");
    pub const VERIFIED_BALLOT_RESERVATIONS: Namespace =
        Namespace::new(b"vbr/", "verifiedBallotRes");
    pub const AGGREGATOR_BATCHES: Namespace = Namespace::new(b"ab/", "aggBatch");
    pub const AGGREGATOR_BATCH_RESERVATIONS: Namespace = Namespace::new(b"abr/", "aggBatchRes");
    pub const PENDING_AGGREGATOR_BATCHES: Namespace = Namespace::new(b"pab/", "pendingAggBatch");
    pub const STATE_TRANSITIONS: Namespace = Namespace::new(b"stb/", "stateTransition");
    pub const STATE_TRANSITION_RESERVATIONS: Namespace =
        Namespace::new(b"str/", "stateTransitionRes");
    pub const STATS: Namespace = Namespace::new(b"st/", "stats");
    pub const VOTE_ID_STATUSES: Namespace = Namespace::new(b"vs/", "voteIdStatus");

    /// Every namespace of the engine; used to assert prefix-freedom.
    pub const ALL: &[Namespace] = &[
        PROCESSES,
        PENDING_BALLOTS,
        PENDING_BALLOT_RESERVATIONS,
        VERIFIED_BALLOTS,
        VERIFIED_BALLOT_RESERVATIONS,
        AGGREGATOR_BATCHES,
        AGGREGATOR_BATCH_RESERVATIONS,
        PENDING_AGGREGATOR_BATCHES,
        STATE_TRANSITIONS,
        STATE_TRANSITION_RESERVATIONS,
        STATS,
        VOTE_ID_STATUSES,
    ];
}

/// Source of "now" used for retry cooldowns and transition timestamps.
/// Production uses [`SystemClock`]; tests inject a manual clock so cooldown
/// behavior can be exercised without sleeping.
pub trait Clock: Send + Sync + 'static {
    fn now_unix(&self) -> i64;
}

/// Wall-clock time via [`chrono::Utc`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// The ballot-lifecycle storage engine.
///
/// All multi-step operations on one process are serialized by a
/// per-process mutex; bulk admin operations take the global lock
/// exclusively. The stats ledger sits behind its own mutex so stat reads
/// never contend with queue mutation. None of the locks are reentrant:
/// internal `*_locked` helpers assume the caller already holds the
/// relevant guard and must not re-acquire it.
pub struct BallotDb {
    db: Arc<dyn KeyValueDb>,
    locks: VoteIdLocks,
    reservations: ReservationSet,
    pending_settlements: DashSet<ProcessId>,
    state_reader: Option<Arc<dyn ProcessStateReader>>,
    clock: Arc<dyn Clock>,

    admin_lock: RwLock<()>,
    process_locks: Mutex<HashMap<ProcessId, Arc<Mutex<()>>>>,
    ledger_lock: Mutex<()>,
}

impl BallotDb {
    /// Opens the engine over `db`, rebuilding the in-memory vote-id lock
    /// table from the live pipeline records.
    pub fn new(db: Arc<dyn KeyValueDb>) -> Result<Self> {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    /// Like [`BallotDb::new`] with an explicit [`Clock`].
    pub fn with_clock(db: Arc<dyn KeyValueDb>, clock: Arc<dyn Clock>) -> Result<Self> {
        let engine = Self {
            locks: VoteIdLocks::default(),
            reservations: ReservationSet::new(db.clone()),
            pending_settlements: DashSet::new(),
            state_reader: None,
            clock,
            admin_lock: RwLock::new(()),
            process_locks: Mutex::new(HashMap::new()),
            ledger_lock: Mutex::new(()),
            db,
        };
        engine.locks.rebuild(&engine.db)?;
        Ok(engine)
    }

    /// Installs the state-tree reader consumed by the failure-recovery
    /// path. Without one, recovery treats no vote-id as already absorbed.
    pub fn set_state_reader(&mut self, reader: Arc<dyn ProcessStateReader>) {
        self.state_reader = Some(reader);
    }

    /// The in-memory nullifier lock table.
    pub fn vote_id_locks(&self) -> &VoteIdLocks {
        &self.locks
    }

    pub(crate) fn view(&self, ns: kv::Namespace) -> NamespacedDb {
        NamespacedDb::new(self.db.clone(), ns)
    }

    /// Commits a buffered batch atomically. Empty batches never reach the
    /// backend.
    pub(crate) fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.db.write(batch)
    }

    pub(crate) fn now_unix(&self) -> i64 {
        self.clock.now_unix()
    }

    /// Per-process mutex, lazily created. Callers hold the returned `Arc`
    /// for the duration of the operation.
    pub(crate) fn process_guard(&self, process_id: &ProcessId) -> Arc<Mutex<()>> {
        let mut map = self.process_locks.lock().expect("Lock was poisoned");
        map.entry(*process_id).or_default().clone()
    }

    pub(crate) fn admin_shared(&self) -> std::sync::RwLockReadGuard<'_, ()> {
        self.admin_lock.read().expect("Lock was poisoned")
    }

    pub(crate) fn admin_exclusive(&self) -> std::sync::RwLockWriteGuard<'_, ()> {
        self.admin_lock.write().expect("Lock was poisoned")
    }

    pub(crate) fn ledger_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.ledger_lock.lock().expect("Lock was poisoned")
    }

    // ------------------------------------------------------------------
    // Process registry
    // ------------------------------------------------------------------

    /// Inserts or replaces a process descriptor.
    pub fn set_process(&self, process: &Process) -> Result<()> {
        let _admin = self.admin_shared();
        let _ledger = self.ledger_guard();
        self.view(tables::PROCESSES)
            .set(process.id.as_bytes(), process.encode())
    }

    /// Reads a process descriptor.
    pub fn process(&self, process_id: &ProcessId) -> Result<Process> {
        let bytes = self.view(tables::PROCESSES).get(process_id.as_bytes())?;
        Process::decode(&bytes)
    }

    /// Every registered process id, in key order.
    pub fn list_processes(&self) -> Result<Vec<ProcessId>> {
        let mut ids = Vec::new();
        self.view(tables::PROCESSES).iterate(&[], &mut |key, _| {
            match ProcessId::try_from_bytes(key) {
                Ok(id) => ids.push(id),
                Err(_) => warn!(key = %hex::encode(key), "skipping malformed process key"),
            }
            ControlFlow::Continue(())
        })?;
        Ok(ids)
    }

    /// Records the latest known on-chain state root for `process_id`.
    pub fn set_process_state_root(&self, process_id: &ProcessId, root: StateRoot) -> Result<()> {
        self.update_process_record(process_id, |p| p.state_root = Some(root))
    }

    /// Flags whether `process_id` still accepts votes.
    pub fn set_process_accepting(&self, process_id: &ProcessId, accepting: bool) -> Result<()> {
        self.update_process_record(process_id, |p| p.accepting_votes = accepting)
    }

    fn update_process_record(
        &self,
        process_id: &ProcessId,
        mutate: impl FnOnce(&mut Process),
    ) -> Result<()> {
        let _admin = self.admin_shared();
        let _ledger = self.ledger_guard();
        let view = self.view(tables::PROCESSES);
        let mut process = Process::decode(&view.get(process_id.as_bytes())?)?;
        mutate(&mut process);
        view.set(process_id.as_bytes(), process.encode())
    }

    // ------------------------------------------------------------------
    // Vote-id statuses
    // ------------------------------------------------------------------

    /// Current pipeline status of a vote-id within a process.
    pub fn vote_id_status(&self, process_id: &ProcessId, vote_id: &VoteId) -> Result<VoteIdStatus> {
        let bytes = self
            .view(tables::VOTE_ID_STATUSES)
            .get(&types::status_key(process_id, vote_id))?;
        VoteIdStatus::decode(&bytes)
    }

    /// Buffers a status change into `batch`, enforcing the status machine.
    /// An illegal transition is logged and skipped; a stat mismatch is
    /// preferred to a stuck pipeline.
    pub(crate) fn stage_status_change(
        &self,
        batch: &mut WriteBatch,
        process_id: &ProcessId,
        vote_id: &VoteId,
        next: VoteIdStatus,
    ) {
        let current = match self.vote_id_status(process_id, vote_id) {
            Ok(status) => Some(status),
            Err(StorageError::NotFound) => None,
            Err(e) => {
                warn!(process = %process_id, vote_id = %vote_id, error = %e,
                    "failed to read vote-id status; skipping update");
                return;
            }
        };
        if let Some(current) = current {
            if !current.can_transition_to(next) {
                warn!(process = %process_id, vote_id = %vote_id, %current, %next,
                    "illegal vote-id status transition; keeping current status");
                return;
            }
        }
        batch.put(
            tables::VOTE_ID_STATUSES,
            &types::status_key(process_id, vote_id),
            next.encode(),
        );
    }

    // ------------------------------------------------------------------
    // Pending settlement markers
    // ------------------------------------------------------------------

    /// Marks that a settlement transaction is in flight for `process_id`.
    pub fn set_pending_settlement(&self, process_id: &ProcessId) {
        self.pending_settlements.insert(*process_id);
    }

    /// Clears the in-flight settlement marker. Idempotent.
    pub fn release_pending_settlement(&self, process_id: &ProcessId) {
        self.pending_settlements.remove(process_id);
    }

    pub fn has_pending_settlement(&self, process_id: &ProcessId) -> bool {
        self.pending_settlements.contains(process_id)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemDb;

    fn engine() -> BallotDb {
        BallotDb::new(Arc::new(MemDb::new())).unwrap()
    }

    fn pid(byte: u8) -> ProcessId {
        ProcessId::new([byte; 32])
    }

    #[test]
    fn namespace_tags_are_prefix_free() {
        for (i, a) in tables::ALL.iter().enumerate() {
            for (j, b) in tables::ALL.iter().enumerate() {
                if i == j {
                    continue;
                }
                let a_tag = a.prefixed(b"");
                let b_tag = b.prefixed(b"");
                assert!(
                    !a_tag.starts_with(&b_tag),
                    "{} is prefixed by {}",
                    a.name(),
                    b.name()
                );
            }
        }
    }

    #[test]
    fn process_registry_roundtrip() {
        let db = engine();
        let process = Process::new(pid(1));
        db.set_process(&process).unwrap();
        assert_eq!(db.process(&pid(1)).unwrap(), process);
        assert!(matches!(db.process(&pid(2)), Err(StorageError::NotFound)));

        db.set_process_state_root(&pid(1), [7; 32]).unwrap();
        db.set_process_accepting(&pid(1), false).unwrap();
        let stored = db.process(&pid(1)).unwrap();
        assert_eq!(stored.state_root, Some([7; 32]));
        assert!(!stored.accepting_votes);

        assert_eq!(db.list_processes().unwrap(), vec![pid(1)]);
    }

    #[test]
    fn settlement_markers_are_idempotent() {
        let db = engine();
        assert!(!db.has_pending_settlement(&pid(1)));
        db.set_pending_settlement(&pid(1));
        db.set_pending_settlement(&pid(1));
        assert!(db.has_pending_settlement(&pid(1)));
        db.release_pending_settlement(&pid(1));
        db.release_pending_settlement(&pid(1));
        assert!(!db.has_pending_settlement(&pid(1)));
    }
}
