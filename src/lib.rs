// Queue engine and its parts
pub mod queue;
pub mod reconcile;
pub mod sync_log;

// Persistence and shared plumbing
pub mod storage;
pub mod config;
pub mod common;

// Public exports
pub use config::{Config, ConfigError};
pub use queue::{DrainReport, EnqueueRequest, OperationRecord, QueueError, QueueStatus, SyncQueue, SyncQueueBuilder};
pub use reconcile::{DispatchOutcome, ReconcileError, Reconciler, ReconcilerRouter};
pub use sync_log::{SyncLogEntry, SyncLogFilter, SyncLogSink, SyncStatus};
