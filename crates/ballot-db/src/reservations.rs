//! Persistent "claimed by a worker" markers.
//!
//! A reservation lives in the stage's reservation namespace under the same
//! key as the record it claims. Reservations survive restarts and carry no
//! TTL: a crashed worker strands its claims until an operator-level reset.

use std::sync::Arc;

use crate::error::Result;
use crate::kv::{KeyValueDb, NamespacedDb, WriteBatch};
use crate::types::Stage;

const RESERVED_MARKER: &[u8] = &[1];

#[derive(Clone)]
pub(crate) struct ReservationSet {
    db: Arc<dyn KeyValueDb>,
}

impl ReservationSet {
    pub fn new(db: Arc<dyn KeyValueDb>) -> Self {
        Self { db }
    }

    fn view(&self, stage: Stage) -> NamespacedDb {
        NamespacedDb::new(self.db.clone(), stage.reservation_namespace())
    }

    pub fn is_reserved(&self, stage: Stage, key: &[u8]) -> Result<bool> {
        self.view(stage).has(key)
    }

    pub fn reserve(&self, stage: Stage, key: &[u8]) -> Result<()> {
        self.view(stage).set(key, RESERVED_MARKER.to_vec())
    }

    /// Buffers the release of a reservation into `batch`, so it commits
    /// atomically with the record mutation it belongs to. Idempotent:
    /// releasing an absent reservation is a no-op.
    pub fn release(&self, batch: &mut WriteBatch, stage: Stage, key: &[u8]) {
        batch.delete(stage.reservation_namespace(), key);
    }
}
