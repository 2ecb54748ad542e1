//! CRDT merge of opaque update blobs.
//!
//! The relay never keeps a document in memory between requests. When a full
//! state is needed the blobs are applied to a scratch Yrs `Doc` that lives for
//! the duration of one call, then re-encoded against an empty state vector.
//! Merge is commutative and idempotent, so duplicate or reordered blobs
//! converge to the same document.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Merge errors.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("undecodable update at position {index}: {reason}")]
    Decode { index: usize, reason: String },
    #[error("update at position {index} failed to apply: {reason}")]
    Apply { index: usize, reason: String },
}

/// Merge update blobs into one full-state update.
///
/// Returns `None` when there is nothing to merge, so "empty" and "never
/// written" stay indistinguishable.
pub fn merge_updates<I, B>(updates: I) -> Result<Option<Vec<u8>>, MergeError>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let doc = Doc::new();
    let mut applied = 0usize;
    {
        let mut txn = doc.transact_mut();
        for (index, blob) in updates.into_iter().enumerate() {
            let update = Update::decode_v1(blob.as_ref()).map_err(|e| MergeError::Decode {
                index,
                reason: e.to_string(),
            })?;
            txn.apply_update(update).map_err(|e| MergeError::Apply {
                index,
                reason: e.to_string(),
            })?;
            applied += 1;
        }
    }

    if applied == 0 {
        return Ok(None);
    }

    let txn = doc.transact();
    Ok(Some(txn.encode_state_as_update_v1(&StateVector::default())))
}

/// Check that a blob decodes as a v1 update without applying it.
pub fn validate_update(blob: &[u8]) -> Result<(), MergeError> {
    Update::decode_v1(blob)
        .map(|_| ())
        .map_err(|e| MergeError::Decode {
            index: 0,
            reason: e.to_string(),
        })
}
