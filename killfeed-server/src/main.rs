//! HTTP and websocket server wiring every `killfeed-core` pipeline component
//! together behind the routes described in §6.

mod routes;
mod state;
mod ws;

use std::sync::Arc;

use clap::Parser;
use killfeed_core::{
    Broadcaster, Cache, CircuitBreakerRegistry, Clock, Config, Enricher, EventStore, FeedCounters,
    HttpClient, MonotonicClock, MulticastSink, RateLimiter, RateLimiterRegistry, StatusAggregator,
    StatusProviders, SubscriptionRegistry, ENRICHMENT_SOURCE, FEED_SOURCE,
};
use killfeed_jsonl::JsonlSink;
use killfeed_prometheus::PrometheusSink;

use crate::state::{build_backfill, build_ingest, AppState, Background};

/// CLI flags that sit outside `Config::from_env` because they configure the
/// telemetry sinks rather than the pipeline itself.
#[derive(Parser, Debug)]
#[command(name = "killfeed-server", about = "Killmail ingestion/enrichment/broadcast server")]
struct Args {
    /// Path the JSONL telemetry sink appends one line per event to.
    #[arg(long, default_value = "killfeed-events.jsonl")]
    jsonl_path: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    tracing::info!(bind_addr = %config.bind_addr, "loaded configuration");

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());

    let metrics_registry = Arc::new(prometheus::Registry::new());
    let prometheus_sink = PrometheusSink::new(metrics_registry.clone())?;
    let jsonl_sink = JsonlSink::new(args.jsonl_path);
    let sink: MulticastSink<PrometheusSink, JsonlSink> =
        MulticastSink::new(prometheus_sink, jsonl_sink);

    let rate_limiters = RateLimiterRegistry::new();
    rate_limiters.register(
        FEED_SOURCE,
        RateLimiter::new(config.feed_rl_capacity, config.feed_rl_refill_per_min, clock.clone()),
    );
    rate_limiters.register(
        ENRICHMENT_SOURCE,
        RateLimiter::new(config.enrich_rl_capacity, config.enrich_rl_refill_per_min, clock.clone()),
    );
    let breaker_registry = CircuitBreakerRegistry::default();

    let http = HttpClient::with_sink(&config, rate_limiters.clone(), breaker_registry.clone(), sink.clone());
    let cache = Cache::new(clock.clone());
    let enricher = Enricher::new(
        cache.clone(),
        http.clone(),
        config.entity_api_base.clone(),
        config.min_attackers_for_parallel,
        config.enricher_max_concurrency,
        config.enricher_task_timeout,
        sink.clone(),
    );

    let event_store = EventStore::new().with_max_events_per_system(config.max_events_per_system);
    let subscriptions =
        SubscriptionRegistry::new(config.max_system_id, config.max_subscribed_systems, clock.clone());
    let broadcaster = Broadcaster::new(event_store.clone(), subscriptions.clone(), sink.clone());

    let counters = Arc::new(FeedCounters::new());
    let ingest = build_ingest(
        http.clone(),
        enricher.clone(),
        event_store.clone(),
        cache.clone(),
        &config,
        counters.clone(),
        clock.clone(),
        sink.clone(),
    );
    let backfill = build_backfill(
        http.clone(),
        enricher.clone(),
        broadcaster.clone(),
        subscriptions.clone(),
        &config,
        clock.clone(),
        sink.clone(),
    );

    let providers = {
        let counters = counters.clone();
        let cache = cache.clone();
        let event_store = event_store.clone();
        let subscriptions = subscriptions.clone();
        let rate_limiters = rate_limiters.clone();
        let breaker_registry = breaker_registry.clone();
        StatusProviders {
            feed: Box::new(move || counters.snapshot()),
            cache: Box::new(move || cache.snapshot()),
            event_store: Box::new(move || event_store.snapshot()),
            subscriptions: Box::new(move || subscriptions.snapshot()),
            rate_limits: Box::new(move || rate_limiters.snapshot()),
            breakers: Box::new(move || breaker_registry.snapshot()),
        }
    };
    let (status_aggregator, status_handle) =
        StatusAggregator::spawn(config.status_poll_interval, clock.clone(), providers);

    let state = AppState {
        config: Arc::new(config.clone()),
        clock: clock.clone(),
        cache,
        event_store,
        subscriptions,
        broadcaster: broadcaster.clone(),
        http,
        rate_limiters,
        breaker_registry,
        status: status_handle,
        sink,
        metrics_registry,
    };

    let ingest_handle = ingest.spawn();
    let broadcaster_handle = broadcaster.spawn();
    let backfill_handle = backfill.spawn();
    let background = Background { ingest: ingest_handle, broadcaster: broadcaster_handle, backfill: backfill_handle };

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "killfeed-server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("shutting down background workers");
    background.shutdown().await;
    status_aggregator.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
