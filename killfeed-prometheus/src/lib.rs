//! Prometheus metrics sink for `killfeed-core` pipeline telemetry.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.

use killfeed_core::{
    BackfillEvent, BroadcastEvent, BulkheadEvent, CircuitBreakerEvent, EnrichmentEvent, FeedEvent,
    PipelineEvent, PolicyEvent, RateLimitEvent, RequestOutcome, RetryEvent, SubscriptionEvent,
    TelemetrySink, TimeoutEvent,
};
use prometheus::{IntCounterVec, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            prometheus::Opts::new("killfeed_events_total", "Pipeline events"),
            &["component", "event"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        Ok(Self { registry, counter })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn labels(event: &PipelineEvent) -> (&'static str, &'static str) {
        match event {
            PipelineEvent::Policy(p) => match p {
                PolicyEvent::RateLimit(r) => (
                    "rate_limit",
                    match r {
                        RateLimitEvent::Acquired { .. } => "acquired",
                        RateLimitEvent::Denied { .. } => "denied",
                    },
                ),
                PolicyEvent::Retry(r) => (
                    "retry",
                    match r {
                        RetryEvent::Attempt { .. } => "attempt",
                        RetryEvent::Exhausted { .. } => "exhausted",
                    },
                ),
                PolicyEvent::CircuitBreaker(c) => (
                    "circuit_breaker",
                    match c {
                        CircuitBreakerEvent::Opened { .. } => "opened",
                        CircuitBreakerEvent::HalfOpen { .. } => "half_open",
                        CircuitBreakerEvent::Closed { .. } => "closed",
                    },
                ),
                PolicyEvent::Bulkhead(b) => (
                    "bulkhead",
                    match b {
                        BulkheadEvent::Acquired { .. } => "acquired",
                        BulkheadEvent::Rejected { .. } => "rejected",
                    },
                ),
                PolicyEvent::Timeout(t) => (
                    "timeout",
                    match t {
                        TimeoutEvent::Occurred { .. } => "occurred",
                    },
                ),
                PolicyEvent::Request(r) => (
                    "request",
                    match r {
                        RequestOutcome::Success { .. } => "success",
                        RequestOutcome::Failure { .. } => "failure",
                    },
                ),
            },
            PipelineEvent::Feed(f) => (
                "feed",
                match f {
                    FeedEvent::KillReceived { .. } => "kill_received",
                    FeedEvent::NoKills => "no_kills",
                    FeedEvent::KillOlder { .. } => "kill_older",
                    FeedEvent::KillSkipped { .. } => "kill_skipped",
                    FeedEvent::Error { .. } => "error",
                },
            ),
            PipelineEvent::Enrichment(e) => (
                "enrichment",
                match e {
                    EnrichmentEvent::EntityResolved { .. } => "entity_resolved",
                    EnrichmentEvent::EntityDegraded { .. } => "entity_degraded",
                    EnrichmentEvent::KillmailDegraded { .. } => "killmail_degraded",
                },
            ),
            PipelineEvent::Broadcast(b) => (
                "broadcast",
                match b {
                    BroadcastEvent::ChannelDelivered { .. } => "channel_delivered",
                    BroadcastEvent::WebhookDelivered { .. } => "webhook_delivered",
                    BroadcastEvent::WebhookFailed { .. } => "webhook_failed",
                    BroadcastEvent::KillCountUpdated { .. } => "kill_count_updated",
                },
            ),
            PipelineEvent::Subscription(s) => (
                "subscription",
                match s {
                    SubscriptionEvent::Subscribed { .. } => "subscribed",
                    SubscriptionEvent::Unsubscribed { .. } => "unsubscribed",
                    SubscriptionEvent::Rejected { .. } => "rejected",
                },
            ),
            PipelineEvent::Backfill(b) => (
                "backfill",
                match b {
                    BackfillEvent::Started { .. } => "started",
                    BackfillEvent::Queued { .. } => "queued",
                    BackfillEvent::BatchDelivered { .. } => "batch_delivered",
                    BackfillEvent::Completed { .. } => "completed",
                    BackfillEvent::Failed { .. } => "failed",
                },
            ),
        }
    }
}

impl tower_service::Service<PipelineEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PipelineEvent) -> Self::Future {
        let (component_label, event_label) = Self::labels(&event);
        self.counter.with_label_values(&[component_label, event_label]).inc();
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
