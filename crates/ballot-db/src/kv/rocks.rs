use std::fmt;
use std::ops::ControlFlow;
use std::path::Path;

use rocksdb::{Direction, IteratorMode, Options, DB};

use super::{KeyValueDb, WriteBatch, WriteOp};
use crate::error::{Result, StorageError};

/// The on-disk LSM store used in production deployments.
pub struct RocksDb {
    db: DB,
}

impl RocksDb {
    const DB_PATH_SUFFIX: &'static str = "ballots";

    /// Opens (or creates) the database under `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref().join(Self::DB_PATH_SUFFIX))
            .map_err(StorageError::kv)?;
        Ok(Self { db })
    }
}

impl KeyValueDb for RocksDb {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.db
            .get(key)
            .map_err(StorageError::kv)?
            .ok_or(StorageError::NotFound)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut rocks_batch = rocksdb::WriteBatch::default();
        for op in batch.ops {
            match op {
                WriteOp::Put { key, value } => rocks_batch.put(key, value),
                WriteOp::Delete { key } => rocks_batch.delete(key),
            }
        }
        self.db.write(rocks_batch).map_err(StorageError::kv)
    }

    fn iterate(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(StorageError::kv)?;
            if !key.starts_with(prefix) {
                break;
            }
            if let ControlFlow::Break(()) = visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for RocksDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksDb").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Namespace;

    const NS: Namespace = Namespace::new(b"t/", "test");

    #[test]
    fn roundtrip_on_disk() {
        let tempdir = tempfile::tempdir().unwrap();
        let db = RocksDb::open(tempdir.path()).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(NS, b"k1", vec![1]);
        batch.put(NS, b"k2", vec![2]);
        db.write(batch).unwrap();

        assert_eq!(db.get(&NS.prefixed(b"k1")).unwrap(), vec![1]);
        assert!(matches!(
            db.get(&NS.prefixed(b"k3")),
            Err(StorageError::NotFound)
        ));

        let mut keys = Vec::new();
        db.iterate(&NS.prefixed(b""), &mut |k, _| {
            keys.push(k.to_vec());
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(keys, vec![NS.prefixed(b"k1"), NS.prefixed(b"k2")]);
    }

    #[test]
    fn delete_is_idempotent() {
        let tempdir = tempfile::tempdir().unwrap();
        let db = RocksDb::open(tempdir.path()).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(NS, b"k", vec![9]);
        db.write(batch).unwrap();

        for _ in 0..2 {
            let mut batch = WriteBatch::new();
            batch.delete(NS, b"k");
            db.write(batch).unwrap();
        }
        assert!(matches!(
            db.get(&NS.prefixed(b"k")),
            Err(StorageError::NotFound)
        ));
    }
}
