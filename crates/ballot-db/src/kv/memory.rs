use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::RwLock;

use super::{KeyValueDb, WriteBatch, WriteOp};
use crate::error::{Result, StorageError};

/// An in-memory ordered store backed by a [`BTreeMap`].
///
/// Used by the test suite and by light deployments that do not need
/// persistence; semantics (ordering, atomic batches, `NotFound`) match the
/// on-disk [`RocksDb`](super::RocksDb) implementation.
#[derive(Debug, Default)]
pub struct MemDb {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueDb for MemDb {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.map
            .read()
            .expect("Lock was poisoned")
            .get(key)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut map = self.map.write().expect("Lock was poisoned");
        for op in batch.ops {
            match op {
                WriteOp::Put { key, value } => {
                    map.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iterate(
        &self,
        prefix: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        let map = self.map.read().expect("Lock was poisoned");
        for (key, value) in map.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if let ControlFlow::Break(()) = visit(key, value) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_missing_reports_not_found() {
        let db = MemDb::new();
        assert!(matches!(db.get(b"nope"), Err(StorageError::NotFound)));
    }

    #[test]
    fn batch_applies_all_ops() {
        let db = MemDb::new();
        let mut batch = WriteBatch::new();
        batch.ops.push(WriteOp::Put {
            key: b"a".to_vec(),
            value: vec![1],
        });
        batch.ops.push(WriteOp::Put {
            key: b"b".to_vec(),
            value: vec![2],
        });
        batch.ops.push(WriteOp::Delete { key: b"a".to_vec() });
        db.write(batch).unwrap();

        assert!(matches!(db.get(b"a"), Err(StorageError::NotFound)));
        assert_eq!(db.get(b"b").unwrap(), vec![2]);
    }

    #[test]
    fn iteration_is_ordered() {
        let db = MemDb::new();
        let mut batch = WriteBatch::new();
        for key in [b"p3".to_vec(), b"p1".to_vec(), b"p2".to_vec()] {
            batch.ops.push(WriteOp::Put {
                key,
                value: vec![0],
            });
        }
        db.write(batch).unwrap();

        let mut seen = Vec::new();
        db.iterate(b"p", &mut |k, _| {
            seen.push(k.to_vec());
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(seen, vec![b"p1".to_vec(), b"p2".to_vec(), b"p3".to_vec()]);
    }
}
