//! Concurrency and throughput limiting primitives
//!
//! Two limiters are shared across shards:
//!
//! - [`Fixed`]: a bounded-concurrency gate used while opening shards and
//!   running compactions.
//! - [`Rate`]: a token-bucket byte-rate limit with burst capacity applied
//!   to compaction throughput.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// A fixed-width concurrency limiter.
///
/// Cloning shares the underlying capacity.
#[derive(Clone)]
pub struct Fixed {
    sem: Arc<Semaphore>,
    capacity: usize,
}

impl Fixed {
    /// Create a limiter admitting at most `n` holders at once.
    pub fn new(n: usize) -> Self {
        let n = n.max(1);
        Self {
            sem: Arc::new(Semaphore::new(n)),
            capacity: n,
        }
    }

    /// Total width of the limiter.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Wait for a slot. The slot is released when the returned permit is
    /// dropped.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.sem
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore closed")
    }

    /// Take a slot without waiting, if one is free.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.sem.clone().try_acquire_owned().ok()
    }
}

impl std::fmt::Debug for Fixed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fixed")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

/// A token-bucket rate limiter in bytes per second with burst capacity.
///
/// Callers ask for `n` tokens and are delayed until the bucket can cover
/// them. Cloning shares the bucket.
#[derive(Clone)]
pub struct Rate {
    state: Arc<Mutex<RateState>>,
    rate: f64,
    burst: f64,
}

impl Rate {
    /// Create a limiter sustaining `rate` bytes/sec with up to `burst`
    /// bytes available at once. The bucket starts full.
    pub fn new(rate: u64, burst: u64) -> Self {
        let burst = burst.max(rate).max(1);
        Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            })),
            rate: rate.max(1) as f64,
            burst: burst as f64,
        }
    }

    /// Consume `n` tokens, sleeping until the bucket covers them. Requests
    /// larger than the burst are served in burst-sized installments.
    pub async fn take(&self, n: u64) {
        let mut remaining = n as f64;
        while remaining > 0.0 {
            let want = remaining.min(self.burst);
            let wait = {
                let mut st = self.state.lock();
                self.refill(&mut st);
                if st.tokens >= want {
                    st.tokens -= want;
                    remaining -= want;
                    continue;
                }
                let deficit = want - st.tokens;
                Duration::from_secs_f64(deficit / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, st: &mut RateState) {
        let now = Instant::now();
        let elapsed = now.duration_since(st.last_refill).as_secs_f64();
        st.tokens = (st.tokens + elapsed * self.rate).min(self.burst);
        st.last_refill = now;
    }
}

impl std::fmt::Debug for Rate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rate")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_limits_concurrency() {
        let lim = Fixed::new(2);
        let a = lim.acquire().await;
        let _b = lim.acquire().await;
        assert_eq!(lim.available(), 0);
        assert!(lim.try_acquire().is_none());
        drop(a);
        assert!(lim.try_acquire().is_some());
    }

    #[tokio::test]
    async fn fixed_width_is_at_least_one() {
        let lim = Fixed::new(0);
        assert_eq!(lim.capacity(), 1);
        let _p = lim.acquire().await;
    }

    #[tokio::test]
    async fn rate_serves_burst_immediately() {
        let lim = Rate::new(1_000, 4_096);
        let start = Instant::now();
        lim.take(4_096).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_delays_when_drained() {
        let lim = Rate::new(1_000, 1_000);
        lim.take(1_000).await;
        let start = Instant::now();
        lim.take(500).await;
        // Auto-advanced virtual time covers the half-second refill.
        assert!(start.elapsed() >= Duration::from_millis(490));
    }
}
