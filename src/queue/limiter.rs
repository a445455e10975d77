use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Paces batch dispatch against the external system's rate limits.
///
/// The gap is measured from the end of the previous batch, so a slow batch
/// still leaves the external system `min_interval` of quiet. It only ever
/// delays: it never drops or reorders work.
#[derive(Debug)]
pub struct BatchLimiter {
    batch_size: usize,
    min_interval: Duration,
    last_batch: Option<Instant>,
    dispatched: u64,
}

impl BatchLimiter {
    pub fn new(batch_size: usize, min_interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            min_interval,
            last_batch: None,
            dispatched: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Wait until the next batch may start, then claim the slot.
    pub async fn acquire(&mut self) {
        if let Some(last) = self.last_batch {
            sleep_until(last + self.min_interval).await;
        }
        self.last_batch = Some(Instant::now());
        self.dispatched += 1;
    }

    /// Mark the claimed batch as settled; the next gap starts now.
    pub fn finish(&mut self) {
        self.last_batch = Some(Instant::now());
    }

    /// Batches released since creation.
    pub fn batches_dispatched(&self) -> u64 {
        self.dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_batch_is_immediate_then_paced() {
        let mut limiter = BatchLimiter::new(10, Duration::from_secs(1));
        let start = Instant::now();

        limiter.acquire().await;
        assert_eq!(Instant::now(), start);

        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(Instant::now() - start, Duration::from_secs(2));
        assert_eq!(limiter.batches_dispatched(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_gap_counts_toward_interval() {
        let mut limiter = BatchLimiter::new(10, Duration::from_secs(1));
        limiter.acquire().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        let before = Instant::now();
        limiter.acquire().await;
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn gap_runs_from_end_of_slow_batch() {
        let mut limiter = BatchLimiter::new(10, Duration::from_secs(1));
        limiter.acquire().await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        limiter.finish();
        let finished = Instant::now();

        limiter.acquire().await;
        assert_eq!(Instant::now() - finished, Duration::from_secs(1));
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        assert_eq!(BatchLimiter::new(0, Duration::ZERO).batch_size(), 1);
    }
}
