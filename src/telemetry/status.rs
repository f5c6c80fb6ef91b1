//! Status aggregator (§4.M): periodically polls the other long-lived
//! components and caches the result so the `/status` HTTP handler is an O(1)
//! read rather than a fan-out across the whole pipeline.
//!
//! Modeled as an actor with its own mailbox, per the `ChannelTransport`
//! pattern used elsewhere in this crate for long-lived processes: a
//! `tokio::spawn`-ed run loop, a `watch`-based cooperative shutdown signal,
//! and a cheap shared handle for readers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::circuit_breaker::CircuitState;
use crate::clock::Clock;

/// Running counters for the ingest worker (component I). Shared via `Arc`
/// between the worker and whatever provider feeds the aggregator.
#[derive(Debug, Default)]
pub struct FeedCounters {
    received: AtomicU64,
    skipped: AtomicU64,
    older: AtomicU64,
    errors: AtomicU64,
}

impl FeedCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_older(&self) {
        self.older.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            received: self.received.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            older: self.older.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FeedSnapshot {
    pub received: u64,
    pub skipped: u64,
    pub older: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheSnapshot {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EventStoreSnapshot {
    pub total_events: usize,
    pub min_seq: Option<u64>,
    pub max_seq: Option<u64>,
    pub active_systems: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SubscriptionSnapshot {
    pub channel_subscribers: usize,
    pub webhook_subscribers: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RateLimitAvailability {
    pub service: String,
    pub tokens_remaining: f64,
    pub capacity: f64,
}

/// Full observability snapshot served by `GET /status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub feed: FeedSnapshot,
    pub cache: CacheSnapshot,
    pub event_store: EventStoreSnapshot,
    pub subscriptions: SubscriptionSnapshot,
    pub rate_limits: Vec<RateLimitAvailability>,
    pub breakers: Vec<(String, CircuitState)>,
    pub uptime_secs: u64,
    pub memory_bytes: u64,
    pub generated_at: DateTime<Utc>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            feed: FeedSnapshot::default(),
            cache: CacheSnapshot::default(),
            event_store: EventStoreSnapshot::default(),
            subscriptions: SubscriptionSnapshot::default(),
            rate_limits: Vec::new(),
            breakers: Vec::new(),
            uptime_secs: 0,
            memory_bytes: 0,
            generated_at: DateTime::<Utc>::from_timestamp(0, 0).expect("valid epoch timestamp"),
        }
    }
}

type Provider<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Closures the aggregator polls each tick. Each component that wants to be
/// visible in `/status` registers a provider here; components that don't
/// care are left at the zero-value default.
pub struct StatusProviders {
    pub feed: Provider<FeedSnapshot>,
    pub cache: Provider<CacheSnapshot>,
    pub event_store: Provider<EventStoreSnapshot>,
    pub subscriptions: Provider<SubscriptionSnapshot>,
    pub rate_limits: Provider<Vec<RateLimitAvailability>>,
    pub breakers: Provider<Vec<(String, CircuitState)>>,
}

impl Default for StatusProviders {
    fn default() -> Self {
        Self {
            feed: Box::new(FeedSnapshot::default),
            cache: Box::new(CacheSnapshot::default),
            event_store: Box::new(EventStoreSnapshot::default),
            subscriptions: Box::new(SubscriptionSnapshot::default),
            rate_limits: Box::new(Vec::new),
            breakers: Box::new(Vec::new),
        }
    }
}

/// Cheap, cloneable handle for readers (the `/status` HTTP route). Reading a
/// snapshot never blocks on the aggregator's run loop.
#[derive(Clone)]
pub struct StatusHandle {
    current: Arc<RwLock<StatusSnapshot>>,
}

impl StatusHandle {
    pub fn snapshot(&self) -> StatusSnapshot {
        self.current.read().expect("status lock poisoned").clone()
    }
}

/// Default poll interval (§4.M: "default every 5 min").
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Actor that polls `StatusProviders` on a timer and publishes the result.
pub struct StatusAggregator {
    shutdown_tx: watch::Sender<bool>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StatusAggregator {
    /// Spawn the aggregator's run loop. Returns the actor (for shutdown) and
    /// a [`StatusHandle`] readers can clone freely.
    pub fn spawn(
        interval: Duration,
        clock: Arc<dyn Clock>,
        providers: StatusProviders,
    ) -> (Self, StatusHandle) {
        let start = clock.now_millis();
        let current = Arc::new(RwLock::new(StatusSnapshot::default()));
        let handle = StatusHandle { current: current.clone() };

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let poll_clock = clock.clone();
        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            tracing::info!("status aggregator started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let snapshot = StatusSnapshot {
                            feed: (providers.feed)(),
                            cache: (providers.cache)(),
                            event_store: (providers.event_store)(),
                            subscriptions: (providers.subscriptions)(),
                            rate_limits: (providers.rate_limits)(),
                            breakers: (providers.breakers)(),
                            uptime_secs: (poll_clock.now_millis().saturating_sub(start)) / 1000,
                            memory_bytes: read_rss_bytes(),
                            generated_at: poll_clock.now_utc(),
                        };
                        *current.write().expect("status lock poisoned") = snapshot;
                    }
                }
            }
            tracing::info!("status aggregator stopped");
        });

        (Self { shutdown_tx, worker: std::sync::Mutex::new(Some(worker)) }, handle)
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }
}

/// Resident set size of the current process, best-effort. Returns 0 on
/// platforms without `/proc` (this crate targets Linux deployment).
fn read_rss_bytes() -> u64 {
    let Ok(contents) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let page_size = 4096u64;
    contents
        .split_whitespace()
        .nth(1)
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * page_size)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;

    #[test]
    fn feed_counters_accumulate() {
        let counters = FeedCounters::new();
        counters.record_received();
        counters.record_received();
        counters.record_skipped();
        counters.record_older();
        counters.record_error();
        let snap = counters.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.older, 1);
        assert_eq!(snap.errors, 1);
    }

    #[tokio::test]
    async fn aggregator_publishes_snapshot_after_tick() {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let counters = Arc::new(FeedCounters::new());
        counters.record_received();
        let providers_counters = counters.clone();
        let providers = StatusProviders {
            feed: Box::new(move || providers_counters.snapshot()),
            ..StatusProviders::default()
        };

        let (aggregator, handle) = StatusAggregator::spawn(Duration::from_millis(10), clock, providers);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.feed.received, 1);

        aggregator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_worker() {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let (aggregator, _handle) =
            StatusAggregator::spawn(Duration::from_secs(60), clock, StatusProviders::default());
        aggregator.shutdown().await;
    }
}
