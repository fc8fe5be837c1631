//! Aggregator batches: verified ballots grouped for a single proof, plus
//! the at-most-one-per-process retry slot used by failure recovery.

use tracing::{debug, warn};

use crate::artifact::Artifact;
use crate::error::{Result, StorageError};
use crate::kv::WriteBatch;
use crate::stats::{StatKind, StatsUpdate};
use crate::types::{process_of_key, record_key, AggregatorBallotBatch, ProcessId, RecordKey, Stage, VoteIdStatus};
use crate::{tables, BallotDb};

impl BallotDb {
    /// Stores an aggregator batch under `process_id || batch_id`, moves
    /// its vote-ids to `aggregated`, and applies the batch accounting
    /// (`aggregated += n`, `last_batch_size := n`, `current_batch -= n`).
    ///
    /// Also the re-entry point of failure recovery: a retried batch is
    /// pushed through here with its attempt bookkeeping updated, which
    /// re-applies the same accounting.
    pub fn push_aggregator_batch(&self, batch: &AggregatorBallotBatch) -> Result<()> {
        let _admin = self.admin_shared();
        let guard = self.process_guard(&batch.process_id);
        let _process = guard.lock().expect("Lock was poisoned");
        self.push_aggregator_batch_locked(batch)
    }

    /// Assumes the caller holds the process guard.
    pub(crate) fn push_aggregator_batch_locked(&self, batch: &AggregatorBallotBatch) -> Result<()> {
        let key = record_key(&batch.process_id, &batch.batch_id);
        let size = batch.len() as i64;

        let mut write = WriteBatch::new();
        write.put(tables::AGGREGATOR_BATCHES, &key, batch.encode());
        for ballot in &batch.ballots {
            self.stage_status_change(
                &mut write,
                &batch.process_id,
                &ballot.vote_id,
                VoteIdStatus::Aggregated,
            );
        }
        {
            let _ledger = self.ledger_guard();
            self.apply_stats_updates_locked(
                &mut write,
                &batch.process_id,
                &[
                    StatsUpdate::new(StatKind::AggregatedVotes, size),
                    StatsUpdate::new(StatKind::LastBatchSize, size),
                    StatsUpdate::new(StatKind::CurrentBatchSize, -size),
                ],
            )?;
            self.commit(write)?;
        }
        debug!(process = %batch.process_id, batch = %hex::encode(batch.batch_id), size,
            attempts = batch.attempts, "aggregator batch pushed");
        Ok(())
    }

    /// Returns the first unreserved, out-of-cooldown batch of the process
    /// and reserves it. Batches inside their backoff window are skipped,
    /// never waited on.
    pub fn next_aggregator_batch(
        &self,
        process_id: &ProcessId,
    ) -> Result<(RecordKey, AggregatorBallotBatch)> {
        let _admin = self.admin_shared();
        let guard = self.process_guard(process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        let view = self.view(tables::AGGREGATOR_BATCHES);
        let keys = view.collect_keys(process_id.as_bytes())?;
        let now = self.now_unix();

        for key in keys {
            if self.reservations.is_reserved(Stage::Aggregator, &key)? {
                continue;
            }
            let bytes = match view.get(&key) {
                Ok(bytes) => bytes,
                Err(StorageError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let batch = match AggregatorBallotBatch::decode(&bytes) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(key = %hex::encode(&key), error = %e, "skipping corrupt aggregator batch");
                    continue;
                }
            };
            if batch.in_cooldown(now) {
                debug!(process = %process_id, batch = %hex::encode(batch.batch_id),
                    attempts = batch.attempts, cooldown_secs = batch.cooldown_secs(),
                    "skipping aggregator batch in cooldown");
                continue;
            }
            if let Err(e) = self.reservations.reserve(Stage::Aggregator, &key) {
                warn!(key = %hex::encode(&key), error = %e,
                    "failed to reserve aggregator batch; treating it as unavailable");
                continue;
            }
            return Ok((key, batch));
        }
        Err(StorageError::NoMoreElements)
    }

    /// Deletes a batch and its reservation after its proof was produced.
    pub fn mark_aggregator_batch_done(&self, key: &[u8]) -> Result<()> {
        let _admin = self.admin_shared();
        let process_id = process_of_key(key)?;
        let guard = self.process_guard(&process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        let mut batch = WriteBatch::new();
        batch.delete(tables::AGGREGATOR_BATCHES, key);
        self.reservations.release(&mut batch, Stage::Aggregator, key);
        self.commit(batch)
    }

    /// Abandons a batch whose proof failed: every contained vote-id is
    /// errored and its nullifier released. Only ballots still in
    /// `aggregated` count toward the compensating deltas, so the
    /// `verified == aggregated + current_batch` balance survives even if
    /// another path already demoted some of them.
    pub fn mark_aggregator_batch_failed(&self, key: &[u8]) -> Result<()> {
        let _admin = self.admin_shared();
        let process_id = process_of_key(key)?;
        let guard = self.process_guard(&process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        let batch =
            AggregatorBallotBatch::decode(&self.view(tables::AGGREGATOR_BATCHES).get(key)?)?;

        let mut truly_aggregated: i64 = 0;
        let mut write = WriteBatch::new();
        for ballot in &batch.ballots {
            match self.vote_id_status(&process_id, &ballot.vote_id) {
                Ok(VoteIdStatus::Aggregated) => truly_aggregated += 1,
                Ok(_) | Err(StorageError::NotFound) => {}
                Err(e) => {
                    warn!(vote_id = %ballot.vote_id, error = %e,
                        "failed to read vote-id status while failing a batch");
                }
            }
            self.stage_status_change(
                &mut write,
                &process_id,
                &ballot.vote_id,
                VoteIdStatus::Error,
            );
        }
        write.delete(tables::AGGREGATOR_BATCHES, key);
        self.reservations.release(&mut write, Stage::Aggregator, key);
        {
            let _ledger = self.ledger_guard();
            self.apply_stats_updates_locked(
                &mut write,
                &process_id,
                &[
                    StatsUpdate::new(StatKind::AggregatedVotes, -truly_aggregated),
                    StatsUpdate::new(StatKind::CurrentBatchSize, truly_aggregated),
                ],
            )?;
            self.commit(write)?;
        }
        for ballot in &batch.ballots {
            self.vote_id_locks().release(&ballot.vote_id);
        }
        debug!(process = %process_id, batch = %hex::encode(batch.batch_id),
            truly_aggregated, "aggregator batch failed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retry slot
    // ------------------------------------------------------------------

    /// Saves the batch in the per-process retry slot. At most one slot
    /// exists per process; a second save reports
    /// [`StorageError::KeyAlreadyExists`].
    pub fn mark_aggregator_batch_pending(&self, batch: &AggregatorBallotBatch) -> Result<()> {
        let _admin = self.admin_shared();
        let guard = self.process_guard(&batch.process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        let view = self.view(tables::PENDING_AGGREGATOR_BATCHES);
        if view.has(batch.process_id.as_bytes())? {
            return Err(StorageError::KeyAlreadyExists);
        }
        view.set(batch.process_id.as_bytes(), batch.encode())
    }

    /// Reads the process's retry slot.
    pub fn pending_aggregator_batch(&self, process_id: &ProcessId) -> Result<AggregatorBallotBatch> {
        AggregatorBallotBatch::decode(
            &self
                .view(tables::PENDING_AGGREGATOR_BATCHES)
                .get(process_id.as_bytes())?,
        )
    }

    /// Clears the process's retry slot. Idempotent.
    pub fn release_pending_aggregator_batch(&self, process_id: &ProcessId) -> Result<()> {
        let _admin = self.admin_shared();
        let guard = self.process_guard(process_id);
        let _process = guard.lock().expect("Lock was poisoned");
        self.view(tables::PENDING_AGGREGATOR_BATCHES)
            .delete(process_id.as_bytes())
    }
}
