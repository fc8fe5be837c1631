//! The verified-ballot queue, drained by the aggregator worker.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::artifact::Artifact;
use crate::error::{Result, StorageError};
use crate::kv::WriteBatch;
use crate::stats::{StatKind, StatsUpdate};
use crate::types::{process_of_key, ProcessId, RecordKey, Stage, VerifiedBallot, VoteId, VoteIdStatus};
use crate::{tables, BallotDb};

/// Groups stage keys by the process that owns them, preserving key order
/// within a group.
fn group_by_process(keys: &[RecordKey]) -> Result<BTreeMap<ProcessId, Vec<&RecordKey>>> {
    let mut groups: BTreeMap<ProcessId, Vec<&RecordKey>> = BTreeMap::new();
    for key in keys {
        groups.entry(process_of_key(key)?).or_default().push(key);
    }
    Ok(groups)
}

impl BallotDb {
    /// Reserves and returns up to `max` unreserved verified ballots of one
    /// process, in key order. Reports [`StorageError::NoMoreElements`]
    /// when nothing is available.
    pub fn pull_verified_ballots(
        &self,
        process_id: &ProcessId,
        max: usize,
    ) -> Result<Vec<(RecordKey, VerifiedBallot)>> {
        let _admin = self.admin_shared();
        let guard = self.process_guard(process_id);
        let _process = guard.lock().expect("Lock was poisoned");

        let view = self.view(tables::VERIFIED_BALLOTS);
        let keys = view.collect_keys(process_id.as_bytes())?;

        let mut pulled = Vec::new();
        for key in keys {
            if pulled.len() == max {
                break;
            }
            if self.reservations.is_reserved(Stage::Verified, &key)? {
                continue;
            }
            let bytes = match view.get(&key) {
                Ok(bytes) => bytes,
                Err(StorageError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let ballot = match VerifiedBallot::decode(&bytes) {
                Ok(ballot) => ballot,
                Err(e) => {
                    warn!(key = %hex::encode(&key), error = %e, "skipping corrupt verified ballot");
                    continue;
                }
            };
            if let Err(e) = self.reservations.reserve(Stage::Verified, &key) {
                warn!(key = %hex::encode(&key), error = %e,
                    "failed to reserve verified ballot; treating it as unavailable");
                continue;
            }
            pulled.push((key, ballot));
        }

        if pulled.is_empty() {
            return Err(StorageError::NoMoreElements);
        }
        debug!(process = %process_id, count = pulled.len(), "pulled verified ballots");
        Ok(pulled)
    }

    /// Deletes verified ballots (and their reservations) after they were
    /// successfully folded into an aggregator batch. Counters are not
    /// touched: aggregation accounting happens on the batch push.
    pub fn mark_verified_done(&self, keys: &[RecordKey]) -> Result<()> {
        let _admin = self.admin_shared();
        for (process_id, group) in group_by_process(keys)? {
            let guard = self.process_guard(&process_id);
            let _process = guard.lock().expect("Lock was poisoned");

            let mut batch = WriteBatch::new();
            for key in group {
                batch.delete(tables::VERIFIED_BALLOTS, key);
                self.reservations.release(&mut batch, Stage::Verified, key);
            }
            self.commit(batch)?;
        }
        Ok(())
    }

    /// Drops verified ballots that could not be aggregated: records and
    /// reservations go away, nullifiers are released, vote-ids become
    /// `error`, and the verified/current-batch counters are reversed.
    pub fn mark_verified_failed(&self, keys: &[RecordKey]) -> Result<()> {
        let _admin = self.admin_shared();
        for (process_id, group) in group_by_process(keys)? {
            let guard = self.process_guard(&process_id);
            let _process = guard.lock().expect("Lock was poisoned");

            let view = self.view(tables::VERIFIED_BALLOTS);
            let mut batch = WriteBatch::new();
            let mut failed: Vec<VoteId> = Vec::new();
            for key in group {
                let ballot = match view.get(key) {
                    Ok(bytes) => match VerifiedBallot::decode(&bytes) {
                        Ok(ballot) => Some(ballot),
                        Err(e) => {
                            warn!(key = %hex::encode(key), error = %e,
                                "dropping corrupt verified ballot without accounting");
                            None
                        }
                    },
                    Err(StorageError::NotFound) => continue,
                    Err(e) => return Err(e),
                };
                batch.delete(tables::VERIFIED_BALLOTS, key);
                self.reservations.release(&mut batch, Stage::Verified, key);
                if let Some(ballot) = ballot {
                    self.stage_status_change(
                        &mut batch,
                        &process_id,
                        &ballot.vote_id,
                        VoteIdStatus::Error,
                    );
                    failed.push(ballot.vote_id);
                }
            }

            let reversed = failed.len() as i64;
            {
                let _ledger = self.ledger_guard();
                self.apply_stats_updates_locked(
                    &mut batch,
                    &process_id,
                    &[
                        StatsUpdate::new(StatKind::VerifiedVotes, -reversed),
                        StatsUpdate::new(StatKind::CurrentBatchSize, -reversed),
                    ],
                )?;
                self.commit(batch)?;
            }
            for vote_id in &failed {
                self.vote_id_locks().release(vote_id);
            }
            debug!(process = %process_id, count = reversed, "verified ballots failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kv::MemDb;
    use crate::{Ballot, Process};

    fn pid(byte: u8) -> ProcessId {
        ProcessId::new([byte; 32])
    }

    fn engine() -> BallotDb {
        let db = BallotDb::new(Arc::new(MemDb::new())).unwrap();
        db.set_process(&Process::new(pid(1))).unwrap();
        db
    }

    /// Pushes `count` ballots and verifies them all, returning the vote-ids.
    fn verify_ballots(db: &BallotDb, process: ProcessId, count: u8) -> Vec<VoteId> {
        let mut vote_ids = Vec::new();
        for seed in 0..count {
            let ballot = Ballot {
                process_id: process,
                address: vec![seed; 20],
                vote_id: VoteId::new(vec![seed, 0xee]),
                encrypted_ballot: vec![seed],
                ballot_input_hash: [seed; 32],
            };
            db.push_ballot(&ballot).unwrap();
            let (key, picked) = db.next_ballot().unwrap();
            let verified = VerifiedBallot {
                process_id: picked.process_id,
                address: picked.address.clone(),
                vote_id: picked.vote_id.clone(),
                verified_ballot: picked.encrypted_ballot.clone(),
                voter_weight: 1,
            };
            db.mark_ballot_verified(&key, &verified).unwrap();
            vote_ids.push(picked.vote_id);
        }
        vote_ids
    }

    #[test]
    fn pull_respects_max_and_reservations() {
        let db = engine();
        verify_ballots(&db, pid(1), 5);

        let first = db.pull_verified_ballots(&pid(1), 3).unwrap();
        assert_eq!(first.len(), 3);
        let second = db.pull_verified_ballots(&pid(1), 10).unwrap();
        assert_eq!(second.len(), 2);
        assert!(matches!(
            db.pull_verified_ballots(&pid(1), 10),
            Err(StorageError::NoMoreElements)
        ));
    }

    #[test]
    fn done_deletes_without_touching_counters() {
        let db = engine();
        verify_ballots(&db, pid(1), 4);

        let pulled = db.pull_verified_ballots(&pid(1), 4).unwrap();
        let keys: Vec<RecordKey> = pulled.iter().map(|(k, _)| k.clone()).collect();
        db.mark_verified_done(&keys).unwrap();

        let stats = db.process_stats(&pid(1)).unwrap();
        assert_eq!(stats.verified_votes_count, 4);
        assert_eq!(stats.current_batch_size, 4);
        assert!(matches!(
            db.pull_verified_ballots(&pid(1), 1),
            Err(StorageError::NoMoreElements)
        ));
    }

    #[test]
    fn failing_a_subset_reverses_its_counters() {
        let db = engine();
        let vote_ids = verify_ballots(&db, pid(1), 5);

        let pulled = db.pull_verified_ballots(&pid(1), 3).unwrap();
        let keys: Vec<RecordKey> = pulled.iter().map(|(k, _)| k.clone()).collect();
        db.mark_verified_failed(&keys).unwrap();

        let stats = db.process_stats(&pid(1)).unwrap();
        assert_eq!(stats.verified_votes_count, 2);
        assert_eq!(stats.current_batch_size, 2);

        let mut errored = 0;
        for vote_id in &vote_ids {
            if db.vote_id_status(&pid(1), vote_id).unwrap() == VoteIdStatus::Error {
                assert!(!db.vote_id_locks().is_processing(vote_id));
                errored += 1;
            }
        }
        assert_eq!(errored, 3);
        assert_eq!(db.vote_id_locks().len(), 2);
    }
}
