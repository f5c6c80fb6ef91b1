//! Convenient re-exports for common killfeed-core types.
pub use crate::{
    backfill::{Backfill, BackfillHandle},
    backoff::Backoff,
    broadcaster::{Broadcaster, BroadcasterHandle, ChannelMessage},
    bulkhead::BulkheadPolicy,
    cache::{default_ttl, Cache},
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState},
    circuit_breaker_registry::{CircuitBreakerHandle, CircuitBreakerRegistry},
    clock::{Clock, MonotonicClock},
    config::{Config, ConfigBuilder, ConfigError},
    enricher::{Enricher, NoStaticNames, StaticNameLookup},
    error::{PipelineError, ResilienceError},
    event_store::EventStore,
    http_client::HttpClient,
    ingest::{IngestHandle, IngestWorker, PollOutcome},
    jitter::Jitter,
    models::{
        Attacker, BackfillConfig, CombatantRef, EnrichedKillmail, Entity, EntityKind, Event,
        RawKillmail, ResolvedAttacker, ResolvedCombatant, ResolvedName, Subscription, ValueSummary,
        ZkbMeta,
    },
    rate_limit::{RateLimited, RateLimiter, RateLimiterRegistry, ENRICHMENT_SOURCE, FEED_SOURCE},
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper},
    stack::{ResilienceStack, ResilienceStackBuilder, StackError},
    subscription::SubscriptionRegistry,
    telemetry::{
        emit_best_effort, BackfillEvent, BroadcastEvent, BulkheadEvent, CacheSnapshot,
        CircuitBreakerEvent, ComposedSinkError, EnrichmentEvent, EventStoreSnapshot, FallbackSink,
        FeedCounters, FeedEvent, FeedSnapshot, LogSink, MemorySink, MulticastSink, NonBlockingSink,
        NullSink, PipelineEvent, PolicyEvent, RateLimitAvailability, RateLimitEvent,
        RequestOutcome, RetryEvent, StatusAggregator, StatusHandle, StatusProviders,
        StatusSnapshot, StreamingSink, SubscriptionEvent, SubscriptionSnapshot, TelemetrySink,
        TimeoutEvent, DEFAULT_POLL_INTERVAL,
    },
    timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT},
};
