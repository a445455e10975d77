use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid enqueue request: {0}")]
    InvalidRequest(String),

    #[error("Sync queue is shutting down")]
    ShuttingDown,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}
