use std::convert::TryInto;

use crate::queue::record::{OperationId, OperationRecord};
use crate::storage::error::StorageError;

/// Durable copy of the queue's live records, replayed on startup.
pub trait OperationJournal: Send + Sync {
    /// Insert or overwrite the record under its id.
    fn save(&self, record: &OperationRecord) -> Result<(), StorageError>;

    fn remove(&self, id: OperationId) -> Result<(), StorageError>;

    /// All journaled records in id order.
    fn load(&self) -> Result<Vec<OperationRecord>, StorageError>;

    /// Highest id ever saved, even if that record is gone since.
    fn last_id(&self) -> Result<OperationId, StorageError>;

    /// Force buffered writes to stable storage.
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Keeps nothing: pending work lives only in memory and is lost on restart.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

impl OperationJournal for NullJournal {
    fn save(&self, _record: &OperationRecord) -> Result<(), StorageError> {
        Ok(())
    }

    fn remove(&self, _id: OperationId) -> Result<(), StorageError> {
        Ok(())
    }

    fn load(&self) -> Result<Vec<OperationRecord>, StorageError> {
        Ok(Vec::new())
    }

    fn last_id(&self) -> Result<OperationId, StorageError> {
        Ok(0)
    }
}

/// Pending-operation journal backed by a dedicated Sled tree.
///
/// Keys are the operation id encoded big-endian, so iteration order is id
/// order. A separate metadata key remembers the highest id handed out so
/// ids are never reused after the journal drains.
///
/// Writes land in Sled's page cache and reach disk on its background flush
/// (every 500ms by default) or on [`OperationJournal::flush`], which the
/// queue calls after every batch. A crash inside that window can lose
/// records enqueued since the last flush.
pub struct SledJournal {
    tree: sled::Tree,
}

impl SledJournal {
    const TREE_NAME: &'static str = "__pending_operations__";
    const META_LAST_ID_KEY: &'static [u8] = b"__last_id__";

    pub fn new(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }

    fn decode_u64(bytes: &[u8]) -> Option<u64> {
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(u64::from_be_bytes(arr))
    }
}

impl OperationJournal for SledJournal {
    fn save(&self, record: &OperationRecord) -> Result<(), StorageError> {
        let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| StorageError::EncodeError(e.to_string()))?;

        self.tree.insert(record.id.to_be_bytes(), bytes)?;

        let id = record.id;
        self.tree.fetch_and_update(Self::META_LAST_ID_KEY, |old| {
            let current = old.and_then(Self::decode_u64).unwrap_or(0);
            Some(current.max(id).to_be_bytes().to_vec())
        })?;

        Ok(())
    }

    fn remove(&self, id: OperationId) -> Result<(), StorageError> {
        self.tree.remove(id.to_be_bytes())?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<OperationRecord>, StorageError> {
        let mut records = Vec::new();

        for item in self.tree.iter() {
            let (key, value) = item?;

            // Only 8-byte keys are records; everything else is metadata.
            if key.len() != 8 {
                continue;
            }

            let (record, _): (OperationRecord, usize) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StorageError::DecodeError(e.to_string()))?;
            records.push(record);
        }

        Ok(records)
    }

    fn last_id(&self) -> Result<OperationId, StorageError> {
        let stored = self
            .tree
            .get(Self::META_LAST_ID_KEY)?
            .and_then(|bytes| Self::decode_u64(&bytes));

        if let Some(id) = stored {
            return Ok(id);
        }

        // No metadata yet: fall back to the highest record key.
        let mut last_id = 0;
        for item in self.tree.iter() {
            let (key, _value) = item?;
            if let Some(id) = Self::decode_u64(&key) {
                last_id = last_id.max(id);
            }
        }
        Ok(last_id)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.tree.flush()?;
        Ok(())
    }
}
