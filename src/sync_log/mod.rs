//! Write-once audit trail of terminal sync outcomes.
//!
//! The sink is not part of the retry path: a failed write is reported on the
//! process log and dropped, never turned back into queue work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::common::timestamp::now_ms;
use crate::queue::record::{Direction, EntityType, OperationId, OperationKind, OperationRecord};
use crate::reconcile::{ErrorClass, ReconcileError};
use crate::storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(SyncStatus::Success),
            "error" => Ok(SyncStatus::Error),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// Why an operation stopped being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    NonRetryable,
    RetriesExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub operation_id: OperationId,
    pub operation_kind: OperationKind,
    pub retry_count: u32,
    pub error_class: ErrorClass,
    pub reason: TerminalReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub owner_id: String,
    /// `auto_sync` or `manual_sync`.
    pub operation_type: String,
    pub direction: Direction,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub status: SyncStatus,
    pub error_message: Option<String>,
    pub error_details: Option<ErrorDetails>,
    pub timestamp_ms: u64,
}

impl SyncLogEntry {
    pub fn success(record: &OperationRecord) -> Self {
        Self::base(record, SyncStatus::Success)
    }

    pub fn failure(record: &OperationRecord, error: &ReconcileError, reason: TerminalReason) -> Self {
        let mut entry = Self::base(record, SyncStatus::Error);
        entry.error_message = Some(error.to_string());
        entry.error_details = Some(ErrorDetails {
            operation_id: record.id,
            operation_kind: record.operation_kind,
            retry_count: record.retry_count,
            error_class: error.class(),
            reason,
        });
        entry
    }

    fn base(record: &OperationRecord, status: SyncStatus) -> Self {
        Self {
            owner_id: record.owner_id.clone(),
            operation_type: record.trigger.operation_type().to_string(),
            direction: record.direction,
            entity_type: record.entity_type,
            entity_id: record.entity_id.clone(),
            status,
            error_message: None,
            error_details: None,
            timestamp_ms: now_ms(),
        }
    }
}

/// Operator query over the sync log. Unset fields match everything; the
/// time range is inclusive on both ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncLogFilter {
    pub owner_id: Option<String>,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub status: Option<SyncStatus>,
    pub since_ms: Option<u64>,
    pub until_ms: Option<u64>,
    pub limit: Option<usize>,
}

impl SyncLogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn status(mut self, status: SyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn between(mut self, since_ms: Option<u64>, until_ms: Option<u64>) -> Self {
        self.since_ms = since_ms;
        self.until_ms = until_ms;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &SyncLogEntry) -> bool {
        self.owner_id.as_ref().map_or(true, |o| *o == entry.owner_id)
            && self.entity_type.map_or(true, |t| t == entry.entity_type)
            && self.entity_id.as_ref().map_or(true, |id| *id == entry.entity_id)
            && self.status.map_or(true, |s| s == entry.status)
            && self.since_ms.map_or(true, |since| entry.timestamp_ms >= since)
            && self.until_ms.map_or(true, |until| entry.timestamp_ms <= until)
    }
}

/// Append-only persistence for sync log entries.
#[async_trait::async_trait]
pub trait SyncLogStore: Send + Sync {
    async fn append(&self, entry: &SyncLogEntry) -> Result<(), StorageError>;

    /// Matching entries, newest first, at most `filter.limit` of them.
    async fn query(&self, filter: &SyncLogFilter) -> Result<Vec<SyncLogEntry>, StorageError>;
}

#[derive(Debug, Default)]
pub struct MemorySyncLog {
    entries: Mutex<Vec<SyncLogEntry>>,
}

impl MemorySyncLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> Vec<SyncLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl SyncLogStore for MemorySyncLog {
    async fn append(&self, entry: &SyncLogEntry) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(())
    }

    async fn query(&self, filter: &SyncLogFilter) -> Result<Vec<SyncLogEntry>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

/// Front door to the sync log used by the queue.
pub struct SyncLogSink {
    store: Arc<dyn SyncLogStore>,
    write_failures: AtomicU64,
}

impl SyncLogSink {
    pub fn new(store: Arc<dyn SyncLogStore>) -> Self {
        Self {
            store,
            write_failures: AtomicU64::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySyncLog::new()))
    }

    /// Append `entry`. A failed write is logged and counted; it is never
    /// returned to the caller. Returns whether the entry was stored.
    pub async fn record(&self, entry: SyncLogEntry) -> bool {
        match self.store.append(&entry).await {
            Ok(()) => true,
            Err(e) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "Sync log write failed for {} {} (owner={}, status={}): {e}",
                    entry.entity_type,
                    entry.entity_id,
                    entry.owner_id,
                    entry.status.as_str()
                );
                false
            }
        }
    }

    pub async fn query(&self, filter: &SyncLogFilter) -> Result<Vec<SyncLogEntry>, StorageError> {
        self.store.query(filter).await
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::record::{EnqueueRequest, Trigger};

    fn record(owner: &str, entity_type: EntityType, entity_id: &str) -> OperationRecord {
        EnqueueRequest::new(owner, entity_type, entity_id, OperationKind::Update).into_record(1, 0)
    }

    fn entry_at(owner: &str, entity_type: EntityType, status: SyncStatus, ts: u64) -> SyncLogEntry {
        let mut entry = SyncLogEntry::success(&record(owner, entity_type, "x"));
        entry.status = status;
        entry.timestamp_ms = ts;
        entry
    }

    #[test]
    fn failure_entry_carries_retry_count_and_class() {
        let mut rec = record("o", EntityType::CatalogItem, "dish-1");
        rec.retry_count = 3;
        rec.trigger = Trigger::Manual;

        let entry = SyncLogEntry::failure(
            &rec,
            &ReconcileError::Network("reset".into()),
            TerminalReason::RetriesExhausted,
        );

        assert_eq!(entry.status, SyncStatus::Error);
        assert_eq!(entry.operation_type, "manual_sync");
        assert_eq!(entry.error_message.as_deref(), Some("Network error: reset"));
        let details = entry.error_details.unwrap();
        assert_eq!(details.retry_count, 3);
        assert_eq!(details.error_class, ErrorClass::Retryable);
        assert_eq!(details.reason, TerminalReason::RetriesExhausted);
    }

    #[test]
    fn filter_matches_each_dimension() {
        let e = entry_at("o1", EntityType::Employee, SyncStatus::Error, 100);

        assert!(SyncLogFilter::new().matches(&e));
        assert!(SyncLogFilter::new().owner("o1").matches(&e));
        assert!(!SyncLogFilter::new().owner("o2").matches(&e));
        assert!(!SyncLogFilter::new().entity_type(EntityType::RecipeCost).matches(&e));
        assert!(!SyncLogFilter::new().status(SyncStatus::Success).matches(&e));
        assert!(SyncLogFilter::new().between(Some(100), Some(100)).matches(&e));
        assert!(!SyncLogFilter::new().between(Some(101), None).matches(&e));
        assert!(!SyncLogFilter::new().between(None, Some(99)).matches(&e));
    }

    #[tokio::test]
    async fn memory_store_queries_newest_first_with_limit() {
        let store = MemorySyncLog::new();
        for ts in 1..=5 {
            store
                .append(&entry_at("o", EntityType::CatalogItem, SyncStatus::Error, ts))
                .await
                .unwrap();
        }
        store
            .append(&entry_at("other", EntityType::CatalogItem, SyncStatus::Error, 6))
            .await
            .unwrap();

        let found = store
            .query(&SyncLogFilter::new().owner("o").limit(2))
            .await
            .unwrap();
        let stamps: Vec<u64> = found.iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, vec![5, 4]);
        assert_eq!(store.entries().len(), 6);
    }

    #[test]
    fn sync_status_parses() {
        assert_eq!("ERROR".parse::<SyncStatus>().unwrap(), SyncStatus::Error);
        assert!("pending".parse::<SyncStatus>().is_err());
    }
}
