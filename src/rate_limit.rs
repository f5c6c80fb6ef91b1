//! Per-service token bucket rate limiter (§4.B).
//!
//! Refill is computed lazily on each `try_acquire` call from elapsed time; there is no
//! background timer. Each bucket is guarded by its own mutex and the critical section
//! is O(1).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::telemetry::status::RateLimitAvailability;

/// Default bucket for the outbound killmail feed connection (§6 config table).
pub const FEED_SOURCE: &str = "feed-source";
/// Default bucket for the enrichment HTTP client (§6 config table).
pub const ENRICHMENT_SOURCE: &str = "enrichment-source";

/// Returned by [`RateLimiter::try_acquire`] when the bucket has no tokens left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimited {
    /// How long until a token will be available, assuming no further acquisitions.
    pub retry_after: Duration,
}

struct BucketState {
    tokens: f64,
    last_refill_millis: u64,
}

/// A single service's token bucket, shared cheaply via `Arc`.
#[derive(Clone)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_minute: f64,
    state: Arc<Mutex<BucketState>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill_per_minute", &self.refill_per_minute)
            .finish()
    }
}

impl RateLimiter {
    /// Build a limiter starting with a full bucket.
    pub fn new(capacity: u32, refill_per_minute: u32, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity as f64;
        Self {
            capacity,
            refill_per_minute: refill_per_minute as f64,
            state: Arc::new(Mutex::new(BucketState {
                tokens: capacity,
                last_refill_millis: clock.now_millis(),
            })),
            clock,
        }
    }

    /// Refill by elapsed-time × refill-rate (capped at capacity), then try to take one
    /// token. Non-blocking: returns immediately either way.
    pub fn try_acquire(&self) -> Result<(), RateLimited> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap();

        let elapsed_millis = now.saturating_sub(state.last_refill_millis);
        if elapsed_millis > 0 {
            let refilled = (elapsed_millis as f64 / 60_000.0) * self.refill_per_minute;
            state.tokens = (state.tokens + refilled).min(self.capacity);
            state.last_refill_millis = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let tokens_needed = 1.0 - state.tokens;
            let minutes_needed = tokens_needed / self.refill_per_minute;
            Err(RateLimited { retry_after: Duration::from_secs_f64(minutes_needed * 60.0) })
        }
    }

    /// Current token count without consuming one, after applying lazy refill.
    pub fn available(&self) -> f64 {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap();
        let elapsed_millis = now.saturating_sub(state.last_refill_millis);
        if elapsed_millis > 0 {
            let refilled = (elapsed_millis as f64 / 60_000.0) * self.refill_per_minute;
            state.tokens = (state.tokens + refilled).min(self.capacity);
            state.last_refill_millis = now;
        }
        state.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Registry of named rate limiters, mirroring [`crate::CircuitBreakerRegistry`]'s keying
/// so §4.B's singleton-per-service model has one shared home (§5).
#[derive(Clone)]
pub struct RateLimiterRegistry {
    inner: Arc<Mutex<HashMap<String, RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Registry pre-populated with the two default buckets named in §4.B / §6.
    pub fn with_defaults(clock: Arc<dyn Clock>) -> Self {
        let registry = Self::new();
        registry.register(FEED_SOURCE, RateLimiter::new(10, 10, clock.clone()));
        registry.register(ENRICHMENT_SOURCE, RateLimiter::new(100, 100, clock));
        registry
    }

    pub fn register(&self, id: &str, limiter: RateLimiter) {
        self.inner.lock().unwrap().insert(id.to_string(), limiter);
    }

    pub fn get(&self, id: &str) -> Option<RateLimiter> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    /// Convenience: look up `id` and acquire, erroring if the id isn't registered.
    pub fn try_acquire(&self, id: &str) -> Result<Result<(), RateLimited>, String> {
        self.get(id).map(|l| l.try_acquire()).ok_or_else(|| format!("rate limiter id not found: {id}"))
    }

    /// Snapshot of all bucket availability, for the status endpoint (§4.M).
    pub fn snapshot(&self) -> Vec<RateLimitAvailability> {
        let map = self.inner.lock().unwrap();
        let mut entries: Vec<RateLimitAvailability> = map
            .iter()
            .map(|(id, limiter)| RateLimitAvailability {
                service: id.clone(),
                tokens_remaining: limiter.available(),
                capacity: limiter.capacity(),
            })
            .collect();
        entries.sort_by(|a, b| a.service.cmp(&b.service));
        entries
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use chrono::{DateTime, Utc};

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }

        fn now_utc(&self) -> DateTime<Utc> {
            DateTime::<Utc>::from_timestamp(0, 0).unwrap()
        }
    }

    #[test]
    fn starts_full_and_drains() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(2, 60, clock);

        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
    }

    #[test]
    fn refills_over_elapsed_time() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(10, 10, clock.clone());

        for _ in 0..10 {
            assert!(limiter.try_acquire().is_ok());
        }
        assert!(limiter.try_acquire().is_err());

        // 10/min refill rate: 6 seconds should yield exactly 1 token.
        clock.advance(6_000);
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
    }

    #[test]
    fn refill_caps_at_capacity() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(10, 10, clock.clone());

        clock.advance(600_000); // 10 minutes, would overshoot without the cap
        assert_eq!(limiter.available(), 10.0);
    }

    #[test]
    fn rate_limited_reports_retry_after() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(1, 60, clock);

        assert!(limiter.try_acquire().is_ok());
        let err = limiter.try_acquire().unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(1));
    }

    #[test]
    fn registry_has_default_buckets_with_spec_capacities() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let registry = RateLimiterRegistry::with_defaults(clock);

        let feed = registry.get(FEED_SOURCE).expect("feed-source registered");
        assert_eq!(feed.capacity(), 10.0);

        let enrich = registry.get(ENRICHMENT_SOURCE).expect("enrichment-source registered");
        assert_eq!(enrich.capacity(), 100.0);
    }

    #[test]
    fn registry_snapshot_is_sorted_by_service() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let registry = RateLimiterRegistry::new();
        registry.register("zeta", RateLimiter::new(5, 5, clock.clone()));
        registry.register("alpha", RateLimiter::new(5, 5, clock));

        let snap = registry.snapshot();
        assert_eq!(snap[0].service, "alpha");
        assert_eq!(snap[1].service, "zeta");
    }

    #[test]
    fn unknown_registry_id_errors() {
        let registry = RateLimiterRegistry::new();
        assert!(registry.try_acquire("nope").is_err());
    }
}
