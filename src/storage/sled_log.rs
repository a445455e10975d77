use std::convert::TryInto;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::storage::error::StorageError;
use crate::sync_log::{SyncLogEntry, SyncLogFilter, SyncLogStore};

/// Durable, append-only sync log in a dedicated Sled tree.
///
/// Entries are keyed by a big-endian sequence number, so a reverse scan
/// yields newest-first without an index. Entries are never rewritten.
pub struct SledSyncLog {
    tree: sled::Tree,
    next_seq: AtomicU64,
}

impl SledSyncLog {
    const TREE_NAME: &'static str = "__sync_log__";

    pub fn new(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree(Self::TREE_NAME)?;

        let last_seq = match tree.last()? {
            Some((key, _)) => {
                let arr: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::DecodeError("malformed sync log key".into()))?;
                u64::from_be_bytes(arr)
            }
            None => 0,
        };

        Ok(Self {
            tree,
            next_seq: AtomicU64::new(last_seq),
        })
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[async_trait::async_trait]
impl SyncLogStore for SledSyncLog {
    async fn append(&self, entry: &SyncLogEntry) -> Result<(), StorageError> {
        let bytes = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| StorageError::EncodeError(e.to_string()))?;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.tree.insert(seq.to_be_bytes(), bytes)?;
        self.tree.flush_async().await?;

        Ok(())
    }

    async fn query(&self, filter: &SyncLogFilter) -> Result<Vec<SyncLogEntry>, StorageError> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut results = Vec::new();

        for item in self.tree.iter().rev() {
            if results.len() >= limit {
                break;
            }

            let (_key, value) = item?;
            let (entry, _): (SyncLogEntry, usize) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| StorageError::DecodeError(e.to_string()))?;

            if filter.matches(&entry) {
                results.push(entry);
            }
        }

        log::debug!("Sync log query returned {} entries", results.len());

        Ok(results)
    }
}
