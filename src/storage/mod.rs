mod error;
mod journal;
mod sled_log;

use std::path::Path;
use std::sync::Arc;

pub use self::error::StorageError;
pub use self::journal::{NullJournal, OperationJournal, SledJournal};
pub use self::sled_log::SledSyncLog;

/// Open (creating if needed) the Sled database under `data_dir`.
pub fn open_db(data_dir: impl AsRef<Path>) -> Result<sled::Db, StorageError> {
    let path = data_dir.as_ref();
    std::fs::create_dir_all(path)?;

    let db = sled::open(path)?;
    log::info!("Sled sync store opened at {:?}", path);

    Ok(db)
}

/// Both durable stores of one process, sharing a database.
pub struct DurableStores {
    pub db: sled::Db,
    pub journal: Arc<SledJournal>,
    pub sync_log: Arc<SledSyncLog>,
}

impl DurableStores {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = open_db(data_dir)?;
        let journal = Arc::new(SledJournal::new(&db)?);
        let sync_log = Arc::new(SledSyncLog::new(&db)?);
        Ok(Self {
            db,
            journal,
            sync_log,
        })
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }
}
