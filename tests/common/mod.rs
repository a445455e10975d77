#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kitchen_sync::config::{QueueConfig, RetryConfig};
use kitchen_sync::queue::OperationRecord;
use kitchen_sync::reconcile::{EntityVersions, ReconcileError, Reconciler, ReconcilerRouter};
use kitchen_sync::storage::StorageError;
use kitchen_sync::sync_log::{SyncLogEntry, SyncLogFilter, SyncLogStore};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Push,
    Pull,
    Versions,
    DeleteRemote,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub op_id: u64,
    pub entity_id: String,
    pub action: Action,
    pub retry_count: u32,
    pub at: Instant,
}

/// Reconciler double. Push is an idempotent upsert into a fake remote map;
/// failures are scripted per entity id and consumed one per attempt.
#[derive(Default)]
pub struct ScriptedReconciler {
    calls: Mutex<Vec<Call>>,
    script: Mutex<HashMap<String, VecDeque<ReconcileError>>>,
    panics: Mutex<HashSet<String>>,
    versions: Mutex<HashMap<String, EntityVersions>>,
    remote: Mutex<HashSet<String>>,
    remote_creates: AtomicUsize,
    remote_delete: AtomicBool,
    delay: Mutex<Duration>,
}

impl ScriptedReconciler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_remote_delete() -> Arc<Self> {
        let r = Self::default();
        r.remote_delete.store(true, Ordering::SeqCst);
        Arc::new(r)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// The next `times` attempts on `entity_id` fail with `error`.
    pub fn fail_times(&self, entity_id: &str, error: ReconcileError, times: usize) {
        let mut script = self.script.lock().unwrap();
        let queue = script.entry(entity_id.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// The next attempt on `entity_id` panics.
    pub fn panic_once(&self, entity_id: &str) {
        self.panics.lock().unwrap().insert(entity_id.to_string());
    }

    pub fn set_versions(&self, entity_id: &str, local: Option<u64>, remote: Option<u64>) {
        self.versions
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), EntityVersions::new(local, remote));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, entity_id: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.entity_id == entity_id)
            .collect()
    }

    pub fn actions(&self) -> Vec<(String, Action)> {
        self.calls()
            .into_iter()
            .map(|c| (c.entity_id, c.action))
            .collect()
    }

    pub fn remote_creates(&self) -> usize {
        self.remote_creates.load(Ordering::SeqCst)
    }

    pub fn exists_remotely(&self, entity_id: &str) -> bool {
        self.remote.lock().unwrap().contains(entity_id)
    }

    async fn attempt(&self, op: &OperationRecord, action: Action) -> Result<(), ReconcileError> {
        self.calls.lock().unwrap().push(Call {
            op_id: op.id,
            entity_id: op.entity_id.clone(),
            action,
            retry_count: op.retry_count,
            at: Instant::now(),
        });

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.panics.lock().unwrap().remove(&op.entity_id) {
            panic!("scripted reconciler panic for {}", op.entity_id);
        }

        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&op.entity_id)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for ScriptedReconciler {
    async fn push(&self, op: &OperationRecord) -> Result<(), ReconcileError> {
        self.attempt(op, Action::Push).await?;
        if self.remote.lock().unwrap().insert(op.entity_id.clone()) {
            self.remote_creates.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn pull(&self, op: &OperationRecord) -> Result<(), ReconcileError> {
        self.attempt(op, Action::Pull).await
    }

    async fn versions(&self, op: &OperationRecord) -> Result<EntityVersions, ReconcileError> {
        self.attempt(op, Action::Versions).await?;
        Ok(self
            .versions
            .lock()
            .unwrap()
            .get(&op.entity_id)
            .copied()
            .unwrap_or_default())
    }

    fn supports_remote_delete(&self) -> bool {
        self.remote_delete.load(Ordering::SeqCst)
    }

    async fn delete_remote(&self, op: &OperationRecord) -> Result<(), ReconcileError> {
        self.attempt(op, Action::DeleteRemote).await?;
        self.remote.lock().unwrap().remove(&op.entity_id);
        Ok(())
    }
}

/// Sync log store whose writes always fail.
#[derive(Default)]
pub struct FailingStore {
    pub attempts: AtomicUsize,
}

#[async_trait::async_trait]
impl SyncLogStore for FailingStore {
    async fn append(&self, _entry: &SyncLogEntry) -> Result<(), StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Unavailable("sync log database offline".into()))
    }

    async fn query(&self, _filter: &SyncLogFilter) -> Result<Vec<SyncLogEntry>, StorageError> {
        Err(StorageError::Unavailable("sync log database offline".into()))
    }
}

/// One reconciler behind every entity type.
pub fn router_with(reconciler: Arc<ScriptedReconciler>) -> ReconcilerRouter {
    ReconcilerRouter::new(reconciler.clone(), reconciler.clone(), reconciler)
}

pub fn queue_config(batch_size: usize, batch_interval_ms: u64) -> QueueConfig {
    QueueConfig {
        batch_size,
        batch_interval_ms,
        ..QueueConfig::default()
    }
}

pub fn retry_config(max_retries: u32, base_delay_ms: u64) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_delay_ms,
        ..RetryConfig::default()
    }
}
