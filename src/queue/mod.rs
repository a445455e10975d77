//! The sync operation queue.
//!
//! Mutation handlers call [`SyncQueue::enqueue`], which only records intent
//! and returns. A drain pulls prioritized batches, paces them through the
//! [`BatchLimiter`], runs every record of a batch concurrently against the
//! [`ReconcilerRouter`] and settles each outcome: success drops the record,
//! retryable failure reschedules it, terminal failure goes to the sync log.

mod error;
pub mod limiter;
pub mod pending;
pub mod record;
pub mod retry;
pub mod status;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};

use crate::common::timestamp::{age_of, now_ms};
use crate::config::{Config, QueueConfig, RetryConfig, StorageConfig};
use crate::reconcile::{DispatchOutcome, ReconcileError, ReconcilerRouter};
use crate::storage::{DurableStores, NullJournal, OperationJournal};
use crate::sync_log::{SyncLogEntry, SyncLogSink};

pub use self::error::QueueError;
pub use self::limiter::BatchLimiter;
pub use self::pending::PendingSet;
pub use self::record::{
    Direction, EnqueueRequest, EntityKey, EntityType, OperationId, OperationKind, OperationRecord,
    Priority, Trigger,
};
pub use self::retry::{BackoffKind, FailureOutcome, RetryController, RetryDecision, RetryPolicy};
pub use self::status::{QueueCounters, QueueStatus};

/// Summary of one [`SyncQueue::drain`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub batches: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Another drain was already running; this call handed its work over.
    pub coalesced: bool,
}

struct QueueInner {
    config: QueueConfig,
    pending: Mutex<PendingSet>,
    next_id: AtomicU64,
    router: Arc<ReconcilerRouter>,
    retry: RetryController,
    sink: Arc<SyncLogSink>,
    journal: Arc<dyn OperationJournal>,
    limiter: TokioMutex<BatchLimiter>,
    draining: AtomicBool,
    rerun: AtomicBool,
    closed: AtomicBool,
    /// Wakes the background dispatcher.
    wake: Notify,
    /// Wakes a drain that is waiting out a retry delay.
    work_added: Notify,
    counters: QueueCounters,
}

impl QueueInner {
    fn lock_pending(&self) -> MutexGuard<'_, PendingSet> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn journal_save(&self, record: &OperationRecord) {
        if let Err(e) = self.journal.save(record) {
            log::error!("Failed to journal sync op #{}: {e}", record.id);
        }
    }

    fn journal_flush(&self) {
        if let Err(e) = self.journal.flush() {
            log::error!("Failed to flush sync journal: {e}");
        }
    }

    fn journal_remove(&self, id: OperationId) {
        if let Err(e) = self.journal.remove(id) {
            log::error!("Failed to drop sync op #{id} from journal: {e}");
        }
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle to one queue. Clones share the same queue.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

pub struct SyncQueueBuilder {
    router: ReconcilerRouter,
    queue: QueueConfig,
    retry_config: RetryConfig,
    retry: Option<RetryController>,
    sink: Option<Arc<SyncLogSink>>,
    journal: Option<Arc<dyn OperationJournal>>,
}

impl SyncQueueBuilder {
    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue = config;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Queue and retry sections of `config`. Storage is wired separately.
    pub fn config(self, config: &Config) -> Self {
        self.queue_config(config.queue.clone())
            .retry_config(config.retry.clone())
    }

    /// Use a prepared controller instead of one built from the retry
    /// config. It should write to the same sink as the queue.
    pub fn retry_controller(mut self, controller: RetryController) -> Self {
        self.retry = Some(controller);
        self
    }

    pub fn sync_log(mut self, sink: Arc<SyncLogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn journal(mut self, journal: Arc<dyn OperationJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Build the queue and re-admit every journaled record.
    pub fn build(self) -> Result<SyncQueue, QueueError> {
        Config {
            queue: self.queue.clone(),
            retry: self.retry_config.clone(),
            storage: StorageConfig::Memory,
        }
        .validate()?;

        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(SyncLogSink::in_memory()));
        let retry = match self.retry {
            Some(controller) => controller,
            None => RetryController::from_config(&self.retry_config, Arc::clone(&sink)),
        };
        let journal = self.journal.unwrap_or_else(|| Arc::new(NullJournal));

        let mut recovered = journal.load()?;
        recovered.sort_by_key(|r| r.id);
        let last_id = recovered
            .iter()
            .map(|r| r.id)
            .max()
            .unwrap_or(0)
            .max(journal.last_id()?);

        let mut pending = PendingSet::new();
        let recovered_count = recovered.len();
        for record in recovered {
            pending.push(record);
        }
        if recovered_count > 0 {
            log::info!("Recovered {recovered_count} pending sync operations from journal");
        }

        let limiter = BatchLimiter::new(self.queue.batch_size, self.queue.batch_interval());

        Ok(SyncQueue {
            inner: Arc::new(QueueInner {
                config: self.queue,
                pending: Mutex::new(pending),
                next_id: AtomicU64::new(last_id),
                router: Arc::new(self.router),
                retry,
                sink,
                journal,
                limiter: TokioMutex::new(limiter),
                draining: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                wake: Notify::new(),
                work_added: Notify::new(),
                counters: QueueCounters::default(),
            }),
        })
    }
}

impl SyncQueue {
    pub fn builder(router: ReconcilerRouter) -> SyncQueueBuilder {
        SyncQueueBuilder {
            router,
            queue: QueueConfig::default(),
            retry_config: RetryConfig::default(),
            retry: None,
            sink: None,
            journal: None,
        }
    }

    /// Queue wired the way `config` says, with Sled-backed journal and
    /// sync log when storage is `sled`.
    pub fn from_config(config: &Config, router: ReconcilerRouter) -> Result<Self, QueueError> {
        config.validate()?;
        let builder = Self::builder(router).config(config);

        match &config.storage {
            StorageConfig::Memory => builder.build(),
            StorageConfig::Sled { data_dir } => {
                let stores = DurableStores::open(data_dir)?;
                builder
                    .journal(stores.journal.clone())
                    .sync_log(Arc::new(SyncLogSink::new(stores.sync_log.clone())))
                    .build()
            }
        }
    }

    /// Record the intent to sync one entity and return at once.
    ///
    /// No network I/O happens here. A request identical in intent to a
    /// record for the same entity that has not started yet is folded into
    /// that record and its id is returned.
    pub fn enqueue(&self, req: EnqueueRequest) -> Result<OperationId, QueueError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(QueueError::ShuttingDown);
        }
        if req.owner_id.trim().is_empty() {
            return Err(QueueError::InvalidRequest("owner_id is empty".into()));
        }
        if req.entity_id.trim().is_empty() {
            return Err(QueueError::InvalidRequest("entity_id is empty".into()));
        }

        let mut pending = inner.lock_pending();

        if inner.config.coalesce_duplicates {
            if let Some(existing) = pending.coalesce(&req) {
                let id = existing.id;
                inner.journal_save(existing);
                QueueCounters::incr(&inner.counters.coalesced);
                log::debug!(
                    "Coalesced {} {} {} into sync op #{id}",
                    req.operation_kind,
                    req.entity_type,
                    req.entity_id
                );
                return Ok(id);
            }
        }

        let id = inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = req.into_record(id, now_ms());
        inner.journal_save(&record);
        log::debug!(
            "Enqueued sync op #{id}: {} {} {} ({}, {})",
            record.operation_kind,
            record.entity_type,
            record.entity_id,
            record.direction,
            record.priority
        );
        pending.push(record);
        drop(pending);

        QueueCounters::incr(&inner.counters.enqueued);
        inner.wake.notify_one();
        inner.work_added.notify_waiters();
        Ok(id)
    }

    /// Run batches until nothing is pending and no retry is scheduled.
    ///
    /// At most one drain runs per queue. A call made while another drain is
    /// active returns immediately with `coalesced` set, and the active drain
    /// makes one more pass before it finishes.
    pub async fn drain(&self) -> DrainReport {
        let inner = &self.inner;
        let mut report = DrainReport::default();

        loop {
            if inner
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                inner.rerun.store(true, Ordering::Release);
                report.coalesced = true;
                return report;
            }

            {
                let _guard = DrainGuard(&inner.draining);
                self.drain_pass(&mut report).await;
            }

            if !inner.rerun.swap(false, Ordering::AcqRel) {
                break;
            }
        }

        inner
            .counters
            .last_drain_ms
            .store(now_ms(), Ordering::Relaxed);
        report
    }

    async fn drain_pass(&self, report: &mut DrainReport) {
        let inner = &self.inner;
        let mut limiter = inner.limiter.lock().await;

        loop {
            let notified = inner.work_added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (has_ready, next_ready_at) = {
                let mut pending = inner.lock_pending();
                pending.promote_ready(Instant::now());
                (!pending.is_empty(), pending.next_ready_at())
            };

            if !has_ready {
                match next_ready_at {
                    Some(_) if inner.closed.load(Ordering::Acquire) => {
                        log::info!("Sync queue closing with retries still scheduled");
                        return;
                    }
                    Some(at) => {
                        tokio::select! {
                            _ = sleep_until(at) => {}
                            _ = notified => {}
                        }
                        continue;
                    }
                    None => {
                        if inner.rerun.swap(false, Ordering::AcqRel) {
                            continue;
                        }
                        return;
                    }
                }
            }

            limiter.acquire().await;
            let batch = {
                let mut pending = inner.lock_pending();
                pending.promote_ready(Instant::now());
                pending.take_batch(limiter.batch_size())
            };
            if batch.is_empty() {
                continue;
            }

            report.batches += 1;
            report.dispatched += batch.len();
            self.run_batch(batch, report).await;
            limiter.finish();
            inner.journal_flush();
        }
    }

    async fn run_batch(&self, batch: Vec<OperationRecord>, report: &mut DrainReport) {
        let inner = &self.inner;
        let timeout = inner.config.operation_timeout();
        log::debug!("Dispatching sync batch of {} operations", batch.len());

        let mut handles = Vec::with_capacity(batch.len());
        for record in batch {
            let router = Arc::clone(&inner.router);
            let op = record.clone();
            inner.counters.in_flight.fetch_add(1, Ordering::Relaxed);

            let handle = tokio::spawn(async move {
                match tokio::time::timeout(timeout, router.dispatch(&op)).await {
                    Ok(result) => result,
                    Err(_) => Err(ReconcileError::Timeout(timeout)),
                }
            });
            handles.push((record, handle));
        }

        for (record, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(ReconcileError::Internal(format!("reconciler task failed: {e}"))),
            };
            inner.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
            self.settle(record, result, report).await;
        }
    }

    async fn settle(
        &self,
        record: OperationRecord,
        result: Result<DispatchOutcome, ReconcileError>,
        report: &mut DrainReport,
    ) {
        let inner = &self.inner;

        let error = match result {
            Ok(outcome) => {
                inner.journal_remove(record.id);
                inner.counters.set_last_error(None);
                QueueCounters::incr(&inner.counters.succeeded);
                report.succeeded += 1;
                log::debug!(
                    "Sync op #{} {} {} done ({outcome:?}) after {} retries",
                    record.id,
                    record.entity_type,
                    record.entity_id,
                    record.retry_count
                );
                if inner.config.log_successes {
                    inner.sink.record(SyncLogEntry::success(&record)).await;
                }
                return;
            }
            Err(error) => error,
        };

        inner.counters.set_last_error(Some(error.to_string()));
        let id = record.id;
        let entity_type = record.entity_type;
        let entity_id = record.entity_id.clone();
        let created_at_ms = record.created_at_ms;

        match inner.retry.on_failure(record, &error).await {
            FailureOutcome::WillRetry { record, delay } => {
                log::warn!(
                    "Sync op #{id} ({entity_type} {entity_id}) failed: {error}; retry {} in {:?}",
                    record.retry_count,
                    delay
                );
                inner.journal_save(&record);
                inner
                    .lock_pending()
                    .schedule(record, Instant::now() + delay);
                QueueCounters::incr(&inner.counters.retried);
                report.retried += 1;
            }
            FailureOutcome::Terminal { reason, logged } => {
                log::error!(
                    "Sync op #{id} ({entity_type} {entity_id}) failed permanently ({reason:?}) after {:?}: {error}{}",
                    age_of(created_at_ms),
                    if logged { "" } else { " [sync log write failed]" }
                );
                inner.journal_remove(id);
                QueueCounters::incr(&inner.counters.failed);
                report.failed += 1;
            }
        }
    }

    /// Start a background task that drains on every enqueue and on each
    /// poll tick, until [`SyncQueue::shutdown`].
    pub fn spawn_dispatcher(&self) -> JoinHandle<()> {
        let queue = self.clone();
        let period = queue
            .inner
            .config
            .poll_interval()
            .max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("Sync dispatcher started (poll every {:?})", period);

            loop {
                if queue.is_shutting_down() {
                    break;
                }
                tokio::select! {
                    _ = queue.inner.wake.notified() => {}
                    _ = ticker.tick() => {}
                }
                if queue.is_shutting_down() {
                    break;
                }

                let report = queue.drain().await;
                if report.dispatched > 0 {
                    log::info!(
                        "Sync drain finished: {} batches, {} ok, {} retried, {} failed",
                        report.batches,
                        report.succeeded,
                        report.retried,
                        report.failed
                    );
                }
            }

            log::info!("Sync dispatcher stopped");
        })
    }

    /// Refuse new work and stop the dispatcher. Records not yet finished
    /// stay in the journal for the next start.
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            log::info!("Sync queue shutting down");
        }
        self.inner.wake.notify_one();
        self.inner.work_added.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn status(&self) -> QueueStatus {
        let inner = &self.inner;
        let (pending, retry_scheduled) = {
            let set = inner.lock_pending();
            (set.len() as u64, set.scheduled_len() as u64)
        };
        let c = &inner.counters;

        QueueStatus {
            pending,
            retry_scheduled,
            in_flight: c.in_flight.load(Ordering::Relaxed),
            enqueued_total: c.enqueued.load(Ordering::Relaxed),
            coalesced_total: c.coalesced.load(Ordering::Relaxed),
            succeeded_total: c.succeeded.load(Ordering::Relaxed),
            retried_total: c.retried.load(Ordering::Relaxed),
            failed_total: c.failed.load(Ordering::Relaxed),
            sink_write_failures: inner.sink.write_failures(),
            last_error: c.last_error(),
            last_drain_ms: c.last_drain_ms.load(Ordering::Relaxed),
            draining: inner.draining.load(Ordering::Acquire),
        }
    }

    /// Unfinished records: ready ones in drain order, then scheduled retries.
    pub fn pending_operations(&self) -> Vec<OperationRecord> {
        self.inner.lock_pending().snapshot()
    }

    pub fn sync_log(&self) -> &Arc<SyncLogSink> {
        &self.inner.sink
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }
}
