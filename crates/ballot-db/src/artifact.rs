//! Deterministic record encoding and content addressing.
//!
//! Every stored record is borsh-encoded; the canonical encoding means the
//! same logical value always produces identical bytes, so the SHA-256 of
//! those bytes can serve as the record's intra-namespace key suffix.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, StorageError};

/// Fixed-width digest used as the content-addressed key suffix.
pub type ContentHash = [u8; 32];

/// SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> ContentHash {
    Sha256::digest(bytes).into()
}

/// A typed record that can round-trip through the store.
pub trait Artifact: BorshSerialize + BorshDeserialize {
    /// Canonical byte encoding of the record.
    fn encode(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("Serialization to vec is infallible")
    }

    /// Decodes a record, reporting [`StorageError::Decode`] on mismatched
    /// or corrupted bytes.
    fn decode(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized,
    {
        Self::try_from_slice(bytes).map_err(StorageError::decode)
    }

    /// Content address of the record's canonical encoding.
    fn content_hash(&self) -> ContentHash {
        content_hash(&self.encode())
    }
}

impl<T: BorshSerialize + BorshDeserialize> Artifact for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, BorshSerialize, BorshDeserialize)]
    struct Record {
        id: Vec<u8>,
        weight: u64,
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = Record {
            id: vec![1, 2, 3],
            weight: 42,
        };
        let b = Record {
            id: vec![1, 2, 3],
            weight: 42,
        };
        assert_eq!(a.encode(), b.encode());
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn different_values_have_different_hashes() {
        let a = Record {
            id: vec![1],
            weight: 1,
        };
        let b = Record {
            id: vec![1],
            weight: 2,
        };
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn decode_of_garbage_fails() {
        let err = Record::decode(&[0xff, 0xff]).unwrap_err();
        assert!(matches!(err, StorageError::Decode(_)));
    }

    #[test]
    fn roundtrip() {
        let rec = Record {
            id: vec![9, 9],
            weight: 7,
        };
        assert_eq!(Record::decode(&rec.encode()).unwrap(), rec);
    }
}
