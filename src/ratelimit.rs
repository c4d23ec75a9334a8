//! Per-connection admission control.
//!
//! Each socket owns two token buckets, one for data operations and one
//! for bundle chunk uploads. Buckets refill in whole seconds so a
//! rejected client can be told exactly how long to back off.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Returned when a bucket has no token to hand out.
#[derive(Debug, thiserror::Error)]
#[error("rate limited, retry in {retry_after:?}")]
pub struct RateLimited {
    /// Time until the next whole-second refill.
    pub retry_after: Duration,
}

/// A token bucket over the tokio clock.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_per_sec: u32,
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Take one token, refilling first.
    pub fn try_admit(&mut self) -> Result<(), RateLimited> {
        let now = Instant::now();
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            Ok(())
        } else {
            let retry_after =
                (self.last_refill + Duration::from_secs(1)).saturating_duration_since(now);
            Err(RateLimited { retry_after })
        }
    }

    // Credits whole elapsed seconds only. The sub-second remainder stays
    // in `last_refill` and counts towards the next refill.
    fn refill(&mut self, now: Instant) {
        let whole_secs = now.saturating_duration_since(self.last_refill).as_secs();
        if whole_secs == 0 {
            return;
        }
        let added = whole_secs.saturating_mul(u64::from(self.refill_per_sec));
        self.tokens = u64::from(self.tokens)
            .saturating_add(added)
            .min(u64::from(self.capacity)) as u32;
        self.last_refill += Duration::from_secs(whole_secs);
    }
}

/// The buckets a single connection draws from.
#[derive(Debug)]
pub struct ConnectionLimits {
    /// Inserts, updates, deletes and batches.
    pub data_ops: TokenBucket,
    /// Bundle chunk uploads.
    pub file_ops: TokenBucket,
}

impl ConnectionLimits {
    /// Fresh buckets sized from the config.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            data_ops: TokenBucket::new(config.data_ops_capacity, config.data_ops_per_sec),
            file_ops: TokenBucket::new(config.file_ops_capacity, config.file_ops_per_sec),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_drains_the_bucket() {
        let mut bucket = TokenBucket::new(5, 1);
        for _ in 0..5 {
            bucket.try_admit().unwrap();
        }
        let err = bucket.try_admit().unwrap_err();
        assert!(err.retry_after <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_points_at_the_next_refill() {
        let mut bucket = TokenBucket::new(1, 1);
        bucket.try_admit().unwrap();
        advance(Duration::from_millis(300)).await;
        let err = bucket.try_admit().unwrap_err();
        assert_eq!(err.retry_after, Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_whole_seconds_only() {
        let mut bucket = TokenBucket::new(3, 2);
        for _ in 0..3 {
            bucket.try_admit().unwrap();
        }
        advance(Duration::from_millis(999)).await;
        assert!(bucket.try_admit().is_err());

        advance(Duration::from_millis(1)).await;
        bucket.try_admit().unwrap();
        bucket.try_admit().unwrap();
        assert!(bucket.try_admit().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sub_second_remainder_carries_over() {
        let mut bucket = TokenBucket::new(2, 1);
        bucket.try_admit().unwrap();
        bucket.try_admit().unwrap();

        advance(Duration::from_millis(1500)).await;
        bucket.try_admit().unwrap();
        assert!(bucket.try_admit().is_err());

        // the leftover 500ms plus another 500ms is a full second
        advance(Duration::from_millis(500)).await;
        bucket.try_admit().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(3, 2);
        for _ in 0..3 {
            bucket.try_admit().unwrap();
        }
        advance(Duration::from_secs(3600)).await;
        for _ in 0..3 {
            bucket.try_admit().unwrap();
        }
        assert!(bucket.try_admit().is_err());
    }
}
