use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::queue::record::{EntityType, OperationRecord};
use crate::reconcile::ReconcileError;
use crate::sync_log::{SyncLogEntry, SyncLogSink, TerminalReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `base × n` for the n-th retry.
    Linear,
    /// `base × 2^(n-1)` for the n-th retry.
    Exponential,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: BackoffKind,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff: config.backoff,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Delay before the `retry_count`-th retry, capped at `max_delay`,
    /// without jitter.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let n = retry_count.max(1);
        let raw = match self.backoff {
            BackoffKind::Linear => self.base_delay.saturating_mul(n),
            BackoffKind::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(n - 1)),
        };
        raw.min(self.max_delay)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }
        let max_ms = self.jitter.as_millis() as u64;
        delay + Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

/// Verdict on one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Terminal(TerminalReason),
}

/// What became of a failed record.
#[derive(Debug)]
pub enum FailureOutcome {
    /// `record.retry_count` has been incremented; run it again after `delay`.
    WillRetry {
        record: OperationRecord,
        delay: Duration,
    },
    /// Written to the sync log (unless the write itself failed).
    Terminal { reason: TerminalReason, logged: bool },
}

pub struct RetryController {
    default_policy: RetryPolicy,
    overrides: HashMap<EntityType, RetryPolicy>,
    sink: Arc<SyncLogSink>,
}

impl RetryController {
    pub fn new(default_policy: RetryPolicy, sink: Arc<SyncLogSink>) -> Self {
        Self {
            default_policy,
            overrides: HashMap::new(),
            sink,
        }
    }

    /// Default policy plus one policy per configured entity-type override.
    pub fn from_config(config: &RetryConfig, sink: Arc<SyncLogSink>) -> Self {
        let default_policy = RetryPolicy::from_config(config);
        let mut controller = Self::new(default_policy.clone(), sink);

        for (entity_type, o) in &config.overrides {
            let mut policy = default_policy.clone();
            if let Some(max_retries) = o.max_retries {
                policy.max_retries = max_retries;
            }
            if let Some(base_delay_ms) = o.base_delay_ms {
                policy.base_delay = Duration::from_millis(base_delay_ms);
            }
            if let Some(backoff) = o.backoff {
                policy.backoff = backoff;
            }
            controller.overrides.insert(*entity_type, policy);
        }

        controller
    }

    pub fn with_override(mut self, entity_type: EntityType, policy: RetryPolicy) -> Self {
        self.overrides.insert(entity_type, policy);
        self
    }

    pub fn policy_for(&self, entity_type: EntityType) -> &RetryPolicy {
        self.overrides
            .get(&entity_type)
            .unwrap_or(&self.default_policy)
    }

    pub fn decide(&self, record: &OperationRecord, error: &ReconcileError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::Terminal(TerminalReason::NonRetryable);
        }

        let policy = self.policy_for(record.entity_type);
        if record.retry_count >= policy.max_retries {
            return RetryDecision::Terminal(TerminalReason::RetriesExhausted);
        }

        let mut delay = policy.with_jitter(policy.delay_for(record.retry_count + 1));
        if let Some(retry_after) = error.retry_after() {
            delay = delay.max(retry_after);
        }
        RetryDecision::Retry { delay }
    }

    /// Decide the fate of `record` after `error`. Terminal outcomes are
    /// written to the sync log here.
    pub async fn on_failure(&self, mut record: OperationRecord, error: &ReconcileError) -> FailureOutcome {
        match self.decide(&record, error) {
            RetryDecision::Retry { delay } => {
                record.retry_count += 1;
                FailureOutcome::WillRetry { record, delay }
            }
            RetryDecision::Terminal(reason) => {
                let logged = self
                    .sink
                    .record(SyncLogEntry::failure(&record, error, reason))
                    .await;
                FailureOutcome::Terminal { reason, logged }
            }
        }
    }
}
