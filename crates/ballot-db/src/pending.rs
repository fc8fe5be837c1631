//! The pending-ballot queue: ingestion hands ballots in, verifier workers
//! drain them.

use tracing::{debug, warn};

use crate::artifact::{content_hash, Artifact};
use crate::error::{Result, StorageError};
use crate::kv::WriteBatch;
use crate::stats::{StatKind, StatsUpdate};
use crate::types::{process_of_key, record_key, Ballot, RecordKey, Stage, VerifiedBallot, VoteIdStatus};
use crate::{tables, BallotDb};

impl BallotDb {
    /// Accepts a new ballot into the pipeline: locks its nullifier, stores
    /// the record, and bumps the pending counter.
    ///
    /// The owning process must already be registered. Reports
    /// [`StorageError::KeyAlreadyExists`] when the ballot's content hash
    /// collides with a stored record or when its nullifier is already in
    /// flight.
    pub fn push_ballot(&self, ballot: &Ballot) -> Result<()> {
        let _admin = self.admin_shared();
        let guard = self.process_guard(&ballot.process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        if self.vote_id_locks().is_processing(&ballot.vote_id) {
            return Err(StorageError::KeyAlreadyExists);
        }

        let encoded = ballot.encode();
        let key = record_key(&ballot.process_id, &content_hash(&encoded));
        if self.view(tables::PENDING_BALLOTS).has(&key)? {
            return Err(StorageError::KeyAlreadyExists);
        }

        let mut batch = WriteBatch::new();
        batch.put(tables::PENDING_BALLOTS, &key, encoded);
        self.stage_status_change(
            &mut batch,
            &ballot.process_id,
            &ballot.vote_id,
            VoteIdStatus::Pending,
        );
        {
            let _ledger = self.ledger_guard();
            self.apply_stats_updates_locked(
                &mut batch,
                &ballot.process_id,
                &[StatsUpdate::new(StatKind::PendingVotes, 1)],
            )?;
            self.commit(batch)?;
        }
        self.vote_id_locks().lock(&ballot.vote_id);
        debug!(process = %ballot.process_id, vote_id = %ballot.vote_id, "ballot queued");
        Ok(())
    }

    /// Hands out one unreserved pending ballot (from any process) and
    /// reserves it for the calling worker.
    pub fn next_ballot(&self) -> Result<(RecordKey, Ballot)> {
        let _admin = self.admin_shared();
        let view = self.view(tables::PENDING_BALLOTS);
        let keys = view.collect_keys(&[])?;

        for key in keys {
            let Ok(process_id) = process_of_key(&key) else {
                warn!(key = %hex::encode(&key), "skipping malformed pending-ballot key");
                continue;
            };
            let guard = self.process_guard(&process_id);
            let _process = guard.lock().expect("Lock was poisoned");

            if self.reservations.is_reserved(Stage::Pending, &key)? {
                continue;
            }
            let bytes = match view.get(&key) {
                Ok(bytes) => bytes,
                // Deleted between the scan and the claim.
                Err(StorageError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let ballot = match Ballot::decode(&bytes) {
                Ok(ballot) => ballot,
                Err(e) => {
                    warn!(key = %hex::encode(&key), error = %e, "skipping corrupt pending ballot");
                    continue;
                }
            };
            if let Err(e) = self.reservations.reserve(Stage::Pending, &key) {
                warn!(key = %hex::encode(&key), error = %e,
                    "failed to reserve pending ballot; treating it as unavailable");
                continue;
            }
            return Ok((key, ballot));
        }
        Err(StorageError::NoMoreElements)
    }

    /// Replaces a pending ballot with its verified form, atomically. The
    /// nullifier stays locked; the vote-id moves to `verified`.
    pub fn mark_ballot_verified(&self, key: &[u8], verified: &VerifiedBallot) -> Result<()> {
        let _admin = self.admin_shared();
        let guard = self.process_guard(&verified.process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        if !self.view(tables::PENDING_BALLOTS).has(key)? {
            return Err(StorageError::NotFound);
        }

        let encoded = verified.encode();
        let verified_key = record_key(&verified.process_id, &content_hash(&encoded));

        let mut batch = WriteBatch::new();
        batch.delete(tables::PENDING_BALLOTS, key);
        self.reservations.release(&mut batch, Stage::Pending, key);
        batch.put(tables::VERIFIED_BALLOTS, &verified_key, encoded);
        self.stage_status_change(
            &mut batch,
            &verified.process_id,
            &verified.vote_id,
            VoteIdStatus::Verified,
        );
        {
            let _ledger = self.ledger_guard();
            self.apply_stats_updates_locked(
                &mut batch,
                &verified.process_id,
                &[
                    StatsUpdate::new(StatKind::PendingVotes, -1),
                    StatsUpdate::new(StatKind::VerifiedVotes, 1),
                    StatsUpdate::new(StatKind::CurrentBatchSize, 1),
                ],
            )?;
            self.commit(batch)?;
        }
        debug!(process = %verified.process_id, vote_id = %verified.vote_id, "ballot verified");
        Ok(())
    }

    /// Drops a pending ballot whose verification failed: the record goes
    /// away, the nullifier is released, and the vote-id becomes `error`.
    pub fn mark_ballot_failed(&self, key: &[u8]) -> Result<()> {
        let _admin = self.admin_shared();
        let process_id = process_of_key(key)?;
        let guard = self.process_guard(&process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        let ballot = Ballot::decode(&self.view(tables::PENDING_BALLOTS).get(key)?)?;

        let mut batch = WriteBatch::new();
        batch.delete(tables::PENDING_BALLOTS, key);
        self.reservations.release(&mut batch, Stage::Pending, key);
        self.stage_status_change(&mut batch, &process_id, &ballot.vote_id, VoteIdStatus::Error);
        {
            let _ledger = self.ledger_guard();
            self.apply_stats_updates_locked(
                &mut batch,
                &process_id,
                &[StatsUpdate::new(StatKind::PendingVotes, -1)],
            )?;
            self.commit(batch)?;
        }
        self.vote_id_locks().release(&ballot.vote_id);
        debug!(process = %process_id, vote_id = %ballot.vote_id, "pending ballot failed");
        Ok(())
    }
}
