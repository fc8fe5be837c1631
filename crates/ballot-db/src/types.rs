//! The records moving through the ballot pipeline, their identifiers, and
//! the per-vote-id status machine.

use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::artifact::{content_hash, ContentHash};
use crate::error::{Result, StorageError};
use crate::kv::Namespace;
use crate::{tables, COOLDOWN_BASE_SECS, COOLDOWN_MAX_SECS};

/// Length of the canonical process identifier encoding.
pub const PROCESS_ID_LEN: usize = 32;

/// A root of the per-process cryptographic state tree.
pub type StateRoot = [u8; 32];

/// A key inside a stage namespace: the owning process id followed by the
/// record's content hash. A process's records therefore form a contiguous
/// key range.
pub type RecordKey = Vec<u8>;

/// Identifier of one voting process. Two ids are equal iff their canonical
/// 32-byte encodings are equal.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct ProcessId([u8; PROCESS_ID_LEN]);

impl ProcessId {
    pub const fn new(bytes: [u8; PROCESS_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses a canonical encoding, rejecting any other length.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PROCESS_ID_LEN] = bytes
            .try_into()
            .map_err(|_| StorageError::InvalidProcessId)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Per-voter uniqueness token; maps injectively to the nullifier integer.
#[derive(
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct VoteId(Vec<u8>);

impl VoteId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for VoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Display for VoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

/// Where a vote-id currently sits in the pipeline.
///
/// Statuses move forward along `Pending -> Verified -> Aggregated ->
/// Processed -> Settled`; `Error` is terminal and reachable from any
/// non-settled state. The single sanctioned backward move is `Processed ->
/// Aggregated`, taken when a failed state transition is re-pushed into the
/// aggregator queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum VoteIdStatus {
    Pending,
    Verified,
    Aggregated,
    Processed,
    Settled,
    Error,
}

impl VoteIdStatus {
    fn rank(self) -> u8 {
        match self {
            VoteIdStatus::Pending => 0,
            VoteIdStatus::Verified => 1,
            VoteIdStatus::Aggregated => 2,
            VoteIdStatus::Processed => 3,
            VoteIdStatus::Settled => 4,
            VoteIdStatus::Error => 5,
        }
    }

    /// Whether moving from `self` to `next` is a legal status transition.
    pub fn can_transition_to(self, next: VoteIdStatus) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            (VoteIdStatus::Settled, _) | (VoteIdStatus::Error, _) => false,
            (_, VoteIdStatus::Error) | (VoteIdStatus::Processed, VoteIdStatus::Aggregated) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for VoteIdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VoteIdStatus::Pending => "pending",
            VoteIdStatus::Verified => "verified",
            VoteIdStatus::Aggregated => "aggregated",
            VoteIdStatus::Processed => "processed",
            VoteIdStatus::Settled => "settled",
            VoteIdStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// One voter submission, as handed over by the ingestion layer.
#[derive(
    Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct Ballot {
    pub process_id: ProcessId,
    pub address: Vec<u8>,
    pub vote_id: VoteId,
    pub encrypted_ballot: Vec<u8>,
    pub ballot_input_hash: [u8; 32],
}

/// A ballot whose zero-knowledge verification has passed.
#[derive(
    Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct VerifiedBallot {
    pub process_id: ProcessId,
    pub address: Vec<u8>,
    pub vote_id: VoteId,
    pub verified_ballot: Vec<u8>,
    pub voter_weight: u64,
}

/// The slim ballot form carried inside batches.
#[derive(
    Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct AggregatorBallot {
    pub vote_id: VoteId,
    pub address: Vec<u8>,
    pub encrypted_ballot: Vec<u8>,
}

impl From<&VerifiedBallot> for AggregatorBallot {
    fn from(vb: &VerifiedBallot) -> Self {
        Self {
            vote_id: vb.vote_id.clone(),
            address: vb.address.clone(),
            encrypted_ballot: vb.verified_ballot.clone(),
        }
    }
}

/// A set of verified ballots grouped for a single aggregation proof.
///
/// The `batch_id` is derived from the process id and ballot payload only,
/// so it stays stable while `attempts`/`last_attempt_unix` change across
/// retries. Batches are stored under `process_id || batch_id`.
#[derive(
    Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct AggregatorBallotBatch {
    pub process_id: ProcessId,
    pub batch_id: ContentHash,
    pub ballots: Vec<AggregatorBallot>,
    pub attempts: u32,
    pub last_attempt_unix: Option<i64>,
}

impl AggregatorBallotBatch {
    pub fn new(process_id: ProcessId, ballots: Vec<AggregatorBallot>) -> Self {
        let batch_id = content_hash(
            &borsh::to_vec(&(&process_id, &ballots)).expect("Serialization to vec is infallible"),
        );
        Self {
            process_id,
            batch_id,
            ballots,
            attempts: 0,
            last_attempt_unix: None,
        }
    }

    pub fn len(&self) -> usize {
        self.ballots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ballots.is_empty()
    }

    /// Exponential-backoff window for this batch's attempt count.
    pub fn cooldown_secs(&self) -> i64 {
        let exp = self.attempts.saturating_sub(1).min(4);
        (COOLDOWN_BASE_SECS << exp).min(COOLDOWN_MAX_SECS)
    }

    /// True while the last failed attempt is more recent than the backoff
    /// window allows. Never-attempted batches are always eligible.
    pub fn in_cooldown(&self, now_unix: i64) -> bool {
        match self.last_attempt_unix {
            Some(last) => now_unix.saturating_sub(last) < self.cooldown_secs(),
            None => false,
        }
    }
}

/// The proof-bearing batch derived from an aggregator batch. `batch_id`
/// references the origin aggregator batch by value; resolution is by
/// lookup, never by pointer.
#[derive(
    Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct StateTransitionBatch {
    pub process_id: ProcessId,
    pub batch_id: ContentHash,
    pub ballots: Vec<AggregatorBallot>,
    pub pre_state_root: StateRoot,
    pub post_state_root: StateRoot,
    pub proof: Vec<u8>,
}

/// Per-process pipeline counters.
///
/// The verified/aggregated/state-transition counters are free-signed and
/// may go negative under compensating deltas; `pending_votes_count`,
/// `current_batch_size` and `last_batch_size` are clamped at zero.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct SequencerStats {
    pub state_transition_count: i64,
    pub settled_state_transition_count: i64,
    pub aggregated_votes_count: i64,
    pub verified_votes_count: i64,
    pub pending_votes_count: i64,
    pub last_batch_size: i64,
    pub current_batch_size: i64,
    pub last_state_transition_unix: i64,
}

/// Global counters mirroring the free-signed and timestamp per-process
/// kinds.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct Stats {
    pub state_transition_count: i64,
    pub settled_state_transition_count: i64,
    pub aggregated_votes_count: i64,
    pub verified_votes_count: i64,
    pub last_state_transition_unix: i64,
}

/// Global pending-ballot counter, maintained with the clamping-aware delta
/// so it always equals the sum of the per-process values.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct StatsPendingBallots {
    pub pending_ballots_count: i64,
}

/// Voting process descriptor.
#[derive(
    Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct Process {
    pub id: ProcessId,
    pub accepting_votes: bool,
    pub state_root: Option<StateRoot>,
    pub sequencer_stats: SequencerStats,
}

impl Process {
    pub fn new(id: ProcessId) -> Self {
        Self {
            id,
            accepting_votes: true,
            state_root: None,
            sequencer_stats: SequencerStats::default(),
        }
    }
}

/// The pipeline stages that own a queue namespace and a reservation
/// namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Verified,
    Aggregator,
    StateTransition,
}

impl Stage {
    /// Namespace holding the stage's records.
    pub fn namespace(self) -> Namespace {
        match self {
            Stage::Pending => tables::PENDING_BALLOTS,
            Stage::Verified => tables::VERIFIED_BALLOTS,
            Stage::Aggregator => tables::AGGREGATOR_BATCHES,
            Stage::StateTransition => tables::STATE_TRANSITIONS,
        }
    }

    /// Namespace holding the stage's worker reservations.
    pub fn reservation_namespace(self) -> Namespace {
        match self {
            Stage::Pending => tables::PENDING_BALLOT_RESERVATIONS,
            Stage::Verified => tables::VERIFIED_BALLOT_RESERVATIONS,
            Stage::Aggregator => tables::AGGREGATOR_BATCH_RESERVATIONS,
            Stage::StateTransition => tables::STATE_TRANSITION_RESERVATIONS,
        }
    }
}

/// Builds the stage key `process_id || content_hash`.
pub(crate) fn record_key(process_id: &ProcessId, hash: &ContentHash) -> RecordKey {
    let mut key = Vec::with_capacity(PROCESS_ID_LEN + hash.len());
    key.extend_from_slice(process_id.as_bytes());
    key.extend_from_slice(hash);
    key
}

/// Recovers the owning process id from a stage key.
pub(crate) fn process_of_key(key: &[u8]) -> Result<ProcessId> {
    if key.len() < PROCESS_ID_LEN {
        return Err(StorageError::InvalidProcessId);
    }
    ProcessId::try_from_bytes(&key[..PROCESS_ID_LEN])
}

/// Key of a vote-id's persisted status: `process_id || sha256(vote_id)`.
/// Hashing keeps the key fixed-width regardless of the vote-id encoding.
pub(crate) fn status_key(process_id: &ProcessId, vote_id: &VoteId) -> Vec<u8> {
    record_key(process_id, &content_hash(vote_id.as_bytes()))
}
