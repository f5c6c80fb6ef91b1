#![forbid(unsafe_code)]

//! # killfeed-core
//!
//! Ingests a real-time killmail feed, enriches it with named entities, stores a
//! bounded in-memory event log per solar system, and broadcasts updates to
//! websocket and webhook subscribers.
//!
//! The resilience primitives (retry, circuit breaker, bulkhead, timeout, rate limit)
//! are the load-bearing plumbing the pipeline is built from, not the product itself.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use killfeed_core::{
//!     Backoff, BulkheadPolicy, CircuitBreakerPolicy, Jitter, ResilienceError, ResilienceStack,
//!     ResilienceStackBuilder, RetryPolicy, TimeoutPolicy,
//! };
//!
//! async fn flaky_operation(
//!     attempts: Arc<AtomicUsize>,
//! ) -> Result<(), ResilienceError<std::io::Error>> {
//!     let n = attempts.fetch_add(1, Ordering::Relaxed);
//!     if n < 2 {
//!         Err(ResilienceError::Inner(std::io::Error::new(
//!             std::io::ErrorKind::Other,
//!             "transient failure",
//!         )))
//!     } else {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError<std::io::Error>> {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!
//!     // Configure individual policies.
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .expect("max_attempts > 0")
//!         .backoff(Backoff::exponential(Duration::from_millis(200)))
//!         .with_jitter(Jitter::full())
//!         .build();
//!     let timeout = TimeoutPolicy::new(Duration::from_secs(2)).expect("valid timeout");
//!     let bulkhead = BulkheadPolicy::new(32);
//!     let circuit_breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(30));
//!
//!     // Compose via the stack builder (Retry → CircuitBreaker → Bulkhead → Timeout).
//!     let stack: ResilienceStack<std::io::Error> = ResilienceStackBuilder::new()
//!         .retry(retry)
//!         .circuit_breaker(5, Duration::from_secs(30))
//!         .bulkhead(32)
//!         .timeout(Duration::from_secs(2))
//!         .expect("valid timeout config")
//!         .build();
//!
//!     stack.execute(|| flaky_operation(attempts.clone())).await?;
//!     Ok(())
//! }
//! ```

mod backfill;
mod backoff;
mod broadcaster;
mod bulkhead;
mod cache;
mod circuit_breaker;
mod circuit_breaker_registry;
mod clock;
mod config;
mod enricher;
mod error;
mod event_store;
mod http_client;
mod ingest;
mod jitter;
mod models;
mod rate_limit;
mod retry;
mod sleeper;
mod stack;
mod subscription;
mod telemetry;
mod timeout;

// Re-exports
pub use backfill::{Backfill, BackfillHandle};
pub use backoff::Backoff;
pub use broadcaster::{Broadcaster, BroadcasterHandle, ChannelMessage};
pub use bulkhead::BulkheadPolicy;
pub use cache::{default_ttl, Cache};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use circuit_breaker_registry::{CircuitBreakerHandle, CircuitBreakerRegistry};
pub use clock::{Clock, MonotonicClock};
pub use config::{Config, ConfigBuilder, ConfigError};
pub use enricher::{Enricher, NoStaticNames, StaticNameLookup};
pub use error::{PipelineError, ResilienceError};
pub use event_store::EventStore;
pub use http_client::HttpClient;
pub use ingest::{IngestHandle, IngestWorker, PollOutcome};
pub use jitter::Jitter;
pub use models::{
    Attacker, BackfillConfig, CombatantRef, EnrichedKillmail, Entity, EntityKind, Event,
    RawKillmail, ResolvedAttacker, ResolvedCombatant, ResolvedName, Subscription, ValueSummary,
    ZkbMeta,
};
pub use rate_limit::{
    RateLimited, RateLimiter, RateLimiterRegistry, ENRICHMENT_SOURCE, FEED_SOURCE,
};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder, StackError};
pub use subscription::SubscriptionRegistry;
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};

pub use telemetry::{
    emit_best_effort, BackfillEvent, BroadcastEvent, BulkheadEvent, CacheSnapshot,
    CircuitBreakerEvent, ComposedSinkError, EnrichmentEvent, EventStoreSnapshot, FallbackSink,
    FeedCounters, FeedEvent, FeedSnapshot, LogSink, MemorySink, MulticastSink, NonBlockingSink,
    NullSink, PipelineEvent, PolicyEvent, RateLimitAvailability, RateLimitEvent, RequestOutcome,
    RetryEvent, StatusAggregator, StatusHandle, StatusProviders, StatusSnapshot, StreamingSink,
    SubscriptionEvent, SubscriptionSnapshot, TelemetrySink, TimeoutEvent, DEFAULT_POLL_INTERVAL,
};
#[cfg(feature = "telemetry-json")]
pub use telemetry::event_to_json;

pub mod prelude;
