//! The ordered key-value contract consumed by the engine, plus the
//! namespace wrapper that partitions one keyspace between pipeline stages.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::error::{Result, StorageError};

mod memory;
mod rocks;

pub use memory::MemDb;
pub use rocks::RocksDb;

/// A logical namespace inside the backing store. The tag is prepended to
/// every key; tags are prefix-free so two namespaces can never produce the
/// same stored key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Namespace {
    tag: &'static [u8],
    name: &'static str,
}

impl Namespace {
    pub const fn new(tag: &'static [u8], name: &'static str) -> Self {
        Self { tag, name }
    }

    /// Human-readable namespace name, used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn prefixed(&self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.tag.len() + key.len());
        out.extend_from_slice(self.tag);
        out.extend_from_slice(key);
        out
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[derive(Debug)]
pub(crate) enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An atomic group of mutations. Writes are buffered in memory and take
/// effect only when the batch is handed to [`KeyValueDb::write`]; dropping
/// the batch discards it.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer an insert of `key -> value` inside `ns`.
    pub fn put(&mut self, ns: Namespace, key: &[u8], value: Vec<u8>) {
        self.ops.push(WriteOp::Put {
            key: ns.prefixed(key),
            value,
        });
    }

    /// Buffer a delete of `key` inside `ns`. Deleting a missing key is a
    /// no-op on commit.
    pub fn delete(&mut self, ns: Namespace, key: &[u8]) {
        self.ops.push(WriteOp::Delete {
            key: ns.prefixed(key),
        });
    }

    /// True when no mutation has been buffered; committing such a batch
    /// is a no-op, so callers skip the write entirely.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The ordered byte-key store the engine runs on.
///
/// Keys are iterated in ascending lexicographic order. Point reads of
/// missing keys report [`StorageError::NotFound`]; mutations only happen
/// through [`WriteBatch`]es, which commit atomically.
pub trait KeyValueDb: Send + Sync {
    /// Reads the value stored at `key`.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Commits all mutations in `batch` atomically.
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Visits every `(key, value)` whose key starts with `prefix`, in key
    /// order, until exhaustion or until `visit` breaks.
    fn iterate(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()>;
}

/// A read/write view of a single [`Namespace`] over the shared store.
#[derive(Clone)]
pub struct NamespacedDb {
    db: Arc<dyn KeyValueDb>,
    ns: Namespace,
}

impl NamespacedDb {
    pub fn new(db: Arc<dyn KeyValueDb>, ns: Namespace) -> Self {
        Self { db, ns }
    }

    pub fn namespace(&self) -> Namespace {
        self.ns
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.db.get(&self.ns.prefixed(key))
    }

    /// Existence check that folds `NotFound` into `false`.
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Single-key insert committed immediately.
    pub fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(self.ns, key, value);
        self.db.write(batch)
    }

    /// Single-key delete committed immediately. Idempotent.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(self.ns, key);
        self.db.write(batch)
    }

    /// Visits `(key, value)` pairs under `prefix`, with the namespace tag
    /// stripped from the keys handed to `visit`.
    ///
    /// `visit` must not call back into the engine; collect keys first and
    /// mutate afterwards.
    pub fn iterate(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        let tag_len = self.ns.tag.len();
        self.db
            .iterate(&self.ns.prefixed(prefix), &mut |key, value| {
                visit(&key[tag_len..], value)
            })
    }

    /// Collects every key under `prefix`, honoring the collect-then-mutate
    /// iteration rule.
    pub fn collect_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        self.iterate(prefix, &mut |key, _| {
            keys.push(key.to_vec());
            ControlFlow::Continue(())
        })?;
        Ok(keys)
    }
}

impl fmt::Debug for NamespacedDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespacedDb").field("ns", &self.ns).finish()
    }
}
