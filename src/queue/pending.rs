use std::collections::{HashSet, VecDeque};

use tokio::time::Instant;

use super::record::{EnqueueRequest, EntityKey, OperationRecord};

#[derive(Debug)]
struct Queued {
    seq: u64,
    record: OperationRecord,
}

#[derive(Debug)]
struct ScheduledRetry {
    ready_at: Instant,
    seq: u64,
    record: OperationRecord,
}

/// Live, not-yet-finished operations of one queue.
///
/// Records waiting to run sit in one FIFO tier per priority. Records whose
/// retry delay has not elapsed sit in `scheduled` and are invisible to batch
/// selection until promoted back into their tier.
#[derive(Debug, Default)]
pub struct PendingSet {
    tiers: [VecDeque<Queued>; 3],
    scheduled: Vec<ScheduledRetry>,
    next_seq: u64,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records ready to run (excludes retry-scheduled ones).
    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    pub fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }

    /// No ready records and no retries waiting.
    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.scheduled.is_empty()
    }

    /// Append to the back of the record's priority tier.
    pub fn push(&mut self, record: OperationRecord) {
        let seq = self.bump_seq();
        self.tiers[record.priority.rank()].push_back(Queued { seq, record });
    }

    /// Park a failed record until `ready_at`.
    pub fn schedule(&mut self, record: OperationRecord, ready_at: Instant) {
        let seq = self.bump_seq();
        self.scheduled.push(ScheduledRetry {
            ready_at,
            seq,
            record,
        });
    }

    /// Move every retry whose delay has elapsed back into its tier, in the
    /// order the delays elapsed. Returns how many were promoted.
    pub fn promote_ready(&mut self, now: Instant) -> usize {
        if self.scheduled.is_empty() {
            return 0;
        }

        let (mut ready, waiting): (Vec<_>, Vec<_>) = self
            .scheduled
            .drain(..)
            .partition(|s| s.ready_at <= now);
        self.scheduled = waiting;

        ready.sort_by_key(|s| (s.ready_at, s.seq));
        let promoted = ready.len();
        for s in ready {
            self.push(s.record);
        }
        promoted
    }

    /// Earliest instant at which a scheduled retry becomes ready.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.scheduled.iter().map(|s| s.ready_at).min()
    }

    /// Remove up to `limit` ready records: high tier before normal before
    /// low, FIFO within a tier. At most one record per entity is taken; a
    /// skipped record keeps its position for a later batch.
    pub fn take_batch(&mut self, limit: usize) -> Vec<OperationRecord> {
        let mut batch = Vec::new();
        let mut keys: HashSet<EntityKey> = HashSet::new();

        for tier in self.tiers.iter_mut() {
            if batch.len() >= limit {
                break;
            }

            let mut kept = VecDeque::with_capacity(tier.len());
            while let Some(queued) = tier.pop_front() {
                if batch.len() < limit && keys.insert(queued.record.entity_key()) {
                    batch.push(queued.record);
                } else {
                    kept.push_back(queued);
                }
            }
            *tier = kept;
        }

        batch
    }

    /// Fold `req` into the most recent ready record for the same entity when
    /// both describe the same intent. Newer metadata keys win. Returns the
    /// record that absorbed the request.
    pub fn coalesce(&mut self, req: &EnqueueRequest) -> Option<&OperationRecord> {
        let key = req.entity_key();

        let latest = self
            .tiers
            .iter_mut()
            .flat_map(|tier| tier.iter_mut())
            .filter(|q| q.record.entity_key() == key)
            .max_by_key(|q| q.seq)?;

        if !latest.record.same_intent(req) {
            return None;
        }

        for (k, v) in &req.metadata {
            latest.record.metadata.insert(k.clone(), v.clone());
        }
        Some(&latest.record)
    }

    /// Ready records in drain order followed by scheduled retries.
    pub fn snapshot(&self) -> Vec<OperationRecord> {
        let mut records: Vec<OperationRecord> = self
            .tiers
            .iter()
            .flat_map(|tier| tier.iter().map(|q| q.record.clone()))
            .collect();

        let mut scheduled: Vec<&ScheduledRetry> = self.scheduled.iter().collect();
        scheduled.sort_by_key(|s| (s.ready_at, s.seq));
        records.extend(scheduled.into_iter().map(|s| s.record.clone()));
        records
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.next_seq
    }
}
