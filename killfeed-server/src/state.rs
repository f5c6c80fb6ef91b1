//! Shared application state threaded through every HTTP and websocket handler.

use std::sync::Arc;

use killfeed_core::{
    Backfill, BackfillHandle, Broadcaster, BroadcasterHandle, Cache, CircuitBreakerRegistry, Clock,
    Config, Enricher, EventStore, FeedCounters, HttpClient, IngestHandle, IngestWorker,
    MulticastSink, RateLimiterRegistry, StatusHandle, SubscriptionRegistry, TokioSleeper,
};
use killfeed_jsonl::JsonlSink;
use killfeed_prometheus::PrometheusSink;

/// Concrete telemetry sink: every event reaches both Prometheus counters and the
/// JSONL audit log. Neither side is optional, so `MulticastSink` (not `FallbackSink`)
/// models the fan-out.
pub type Sink = MulticastSink<PrometheusSink, JsonlSink>;

/// Everything an axum handler needs, cheaply cloneable (every field is an `Arc` or
/// already-cloneable handle).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub cache: Cache,
    pub event_store: EventStore,
    pub subscriptions: SubscriptionRegistry,
    pub broadcaster: Broadcaster<Sink>,
    pub http: HttpClient<Sink>,
    pub rate_limiters: RateLimiterRegistry,
    pub breaker_registry: CircuitBreakerRegistry,
    pub status: StatusHandle,
    pub sink: Sink,
    pub metrics_registry: Arc<prometheus::Registry>,
}

/// Handles to every background actor spawned at startup, held only so `main` can
/// shut them down in order on SIGINT/SIGTERM.
pub struct Background {
    pub ingest: IngestHandle,
    pub broadcaster: BroadcasterHandle,
    pub backfill: BackfillHandle,
}

impl Background {
    pub async fn shutdown(self) {
        self.ingest.shutdown().await;
        self.backfill.shutdown().await;
        self.broadcaster.shutdown().await;
    }
}

#[allow(clippy::too_many_arguments)]
pub fn build_ingest(
    http: HttpClient<Sink>,
    enricher: Enricher<Sink>,
    event_store: EventStore,
    cache: Cache,
    config: &Config,
    counters: Arc<FeedCounters>,
    clock: Arc<dyn Clock>,
    sink: Sink,
) -> IngestWorker<Sink> {
    IngestWorker::new(
        http,
        enricher,
        event_store,
        cache,
        config.feed_url.clone(),
        config.legacy_killmail_base.clone(),
        config.cutoff,
        config.fast_interval,
        config.idle_interval,
        config.max_backoff,
        config.backoff_factor,
        counters,
        clock,
        sink,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn build_backfill(
    http: HttpClient<Sink>,
    enricher: Enricher<Sink>,
    broadcaster: Broadcaster<Sink>,
    subscriptions: SubscriptionRegistry,
    config: &Config,
    clock: Arc<dyn Clock>,
    sink: Sink,
) -> Backfill<Sink> {
    Backfill::new(
        http,
        enricher,
        broadcaster,
        subscriptions,
        config.historical_feed_url.clone(),
        config.legacy_killmail_base.clone(),
        config.backfill_max_concurrent,
        clock,
        Arc::new(TokioSleeper),
        sink,
    )
}
