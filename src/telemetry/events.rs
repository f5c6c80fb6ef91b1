//! Structured telemetry events emitted by every pipeline component.
//!
//! Each component emits a `(name, measurements, metadata)`-shaped event (§4.M). We model
//! that as one variant per component family inside [`PipelineEvent`], rather than a single
//! stringly-typed tuple, so sinks can pattern-match instead of parsing.

use std::fmt;
use std::time::Duration;

/// Events emitted by the resilience primitives (rate limiter, circuit breaker, retry,
/// bulkhead, timeout) that guard every outbound call (components B, C, D, E).
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    RateLimit(RateLimitEvent),
    Retry(RetryEvent),
    CircuitBreaker(CircuitBreakerEvent),
    Bulkhead(BulkheadEvent),
    Timeout(TimeoutEvent),
    Request(RequestOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitEvent {
    Acquired { service: String, remaining: f64 },
    Denied { service: String, wait: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    Attempt { attempt: usize, delay: Duration },
    Exhausted { total_attempts: usize, total_duration: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerEvent {
    Opened { service: String, failure_count: usize },
    HalfOpen { service: String },
    Closed { service: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkheadEvent {
    Acquired { active_count: usize, max_concurrency: usize },
    Rejected { active_count: usize, max_concurrency: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutEvent {
    Occurred { timeout: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Success { duration: Duration },
    Failure { duration: Duration },
}

/// Events emitted by the ingest worker's poll loop (component I).
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    KillReceived { killmail_id: u64, system_id: u32 },
    NoKills,
    KillOlder { killmail_id: u64 },
    KillSkipped { killmail_id: u64 },
    Error { reason: String },
}

/// Events emitted by the enricher (component H).
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentEvent {
    EntityResolved { namespace: String, id: u64 },
    EntityDegraded { namespace: String, id: u64 },
    KillmailDegraded { killmail_id: u64 },
}

/// Events emitted by the broadcaster (component K).
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastEvent {
    ChannelDelivered { sub_id: String, system_id: u32 },
    WebhookDelivered { sub_id: String, status: u16 },
    WebhookFailed { sub_id: String, reason: String },
    KillCountUpdated { system_id: u32, count: u64 },
}

/// Events emitted by the subscription registry (component J).
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Subscribed { sub_id: String, system_count: usize },
    Unsubscribed { subscriber_id: String },
    Rejected { reason: String },
}

/// Events emitted by the historical backfill scheduler (component L).
#[derive(Debug, Clone, PartialEq)]
pub enum BackfillEvent {
    Started { sub_id: String },
    Queued { sub_id: String },
    BatchDelivered { sub_id: String, count: usize },
    Completed { sub_id: String },
    Failed { sub_id: String, reason: String },
}

/// The top-level event type consumed by [`super::sinks::TelemetrySink`] implementations.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Policy(PolicyEvent),
    Feed(FeedEvent),
    Enrichment(EnrichmentEvent),
    Broadcast(BroadcastEvent),
    Subscription(SubscriptionEvent),
    Backfill(BackfillEvent),
}

impl From<PolicyEvent> for PipelineEvent {
    fn from(e: PolicyEvent) -> Self {
        PipelineEvent::Policy(e)
    }
}
impl From<FeedEvent> for PipelineEvent {
    fn from(e: FeedEvent) -> Self {
        PipelineEvent::Feed(e)
    }
}
impl From<EnrichmentEvent> for PipelineEvent {
    fn from(e: EnrichmentEvent) -> Self {
        PipelineEvent::Enrichment(e)
    }
}
impl From<BroadcastEvent> for PipelineEvent {
    fn from(e: BroadcastEvent) -> Self {
        PipelineEvent::Broadcast(e)
    }
}
impl From<SubscriptionEvent> for PipelineEvent {
    fn from(e: SubscriptionEvent) -> Self {
        PipelineEvent::Subscription(e)
    }
}
impl From<BackfillEvent> for PipelineEvent {
    fn from(e: BackfillEvent) -> Self {
        PipelineEvent::Backfill(e)
    }
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::RateLimit(RateLimitEvent::Acquired { service, remaining }) => {
                write!(f, "rate_limit[{service}] acquired, {remaining:.1} remaining")
            }
            PolicyEvent::RateLimit(RateLimitEvent::Denied { service, wait }) => {
                write!(f, "rate_limit[{service}] denied, retry after {wait:?}")
            }
            PolicyEvent::Retry(RetryEvent::Attempt { attempt, delay }) => {
                write!(f, "retry attempt {attempt} after {delay:?}")
            }
            PolicyEvent::Retry(RetryEvent::Exhausted { total_attempts, total_duration }) => {
                write!(f, "retry exhausted after {total_attempts} attempts ({total_duration:?})")
            }
            PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened { service, failure_count }) => {
                write!(f, "circuit[{service}] opened after {failure_count} failures")
            }
            PolicyEvent::CircuitBreaker(CircuitBreakerEvent::HalfOpen { service }) => {
                write!(f, "circuit[{service}] half-open")
            }
            PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Closed { service }) => {
                write!(f, "circuit[{service}] closed")
            }
            PolicyEvent::Bulkhead(BulkheadEvent::Acquired { active_count, max_concurrency }) => {
                write!(f, "bulkhead acquired {active_count}/{max_concurrency}")
            }
            PolicyEvent::Bulkhead(BulkheadEvent::Rejected { active_count, max_concurrency }) => {
                write!(f, "bulkhead rejected at {active_count}/{max_concurrency}")
            }
            PolicyEvent::Timeout(TimeoutEvent::Occurred { timeout }) => {
                write!(f, "timeout after {timeout:?}")
            }
            PolicyEvent::Request(RequestOutcome::Success { duration }) => {
                write!(f, "request success in {duration:?}")
            }
            PolicyEvent::Request(RequestOutcome::Failure { duration }) => {
                write!(f, "request failure after {duration:?}")
            }
        }
    }
}

impl fmt::Display for FeedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedEvent::KillReceived { killmail_id, system_id } => {
                write!(f, "kill_received id={killmail_id} system={system_id}")
            }
            FeedEvent::NoKills => write!(f, "no_kills"),
            FeedEvent::KillOlder { killmail_id } => write!(f, "kill_older id={killmail_id}"),
            FeedEvent::KillSkipped { killmail_id } => write!(f, "kill_skipped id={killmail_id}"),
            FeedEvent::Error { reason } => write!(f, "feed_error {reason}"),
        }
    }
}

impl fmt::Display for EnrichmentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrichmentEvent::EntityResolved { namespace, id } => {
                write!(f, "entity_resolved {namespace}/{id}")
            }
            EnrichmentEvent::EntityDegraded { namespace, id } => {
                write!(f, "entity_degraded {namespace}/{id}")
            }
            EnrichmentEvent::KillmailDegraded { killmail_id } => {
                write!(f, "killmail_degraded id={killmail_id}")
            }
        }
    }
}

impl fmt::Display for BroadcastEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastEvent::ChannelDelivered { sub_id, system_id } => {
                write!(f, "channel_delivered sub={sub_id} system={system_id}")
            }
            BroadcastEvent::WebhookDelivered { sub_id, status } => {
                write!(f, "webhook_delivered sub={sub_id} status={status}")
            }
            BroadcastEvent::WebhookFailed { sub_id, reason } => {
                write!(f, "webhook_failed sub={sub_id} reason={reason}")
            }
            BroadcastEvent::KillCountUpdated { system_id, count } => {
                write!(f, "kill_count_updated system={system_id} count={count}")
            }
        }
    }
}

impl fmt::Display for SubscriptionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionEvent::Subscribed { sub_id, system_count } => {
                write!(f, "subscribed sub={sub_id} systems={system_count}")
            }
            SubscriptionEvent::Unsubscribed { subscriber_id } => {
                write!(f, "unsubscribed subscriber={subscriber_id}")
            }
            SubscriptionEvent::Rejected { reason } => write!(f, "subscription_rejected {reason}"),
        }
    }
}

impl fmt::Display for BackfillEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackfillEvent::Started { sub_id } => write!(f, "backfill_started sub={sub_id}"),
            BackfillEvent::Queued { sub_id } => write!(f, "backfill_queued sub={sub_id}"),
            BackfillEvent::BatchDelivered { sub_id, count } => {
                write!(f, "backfill_batch sub={sub_id} count={count}")
            }
            BackfillEvent::Completed { sub_id } => write!(f, "backfill_completed sub={sub_id}"),
            BackfillEvent::Failed { sub_id, reason } => {
                write!(f, "backfill_failed sub={sub_id} reason={reason}")
            }
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::Policy(e) => write!(f, "{e}"),
            PipelineEvent::Feed(e) => write!(f, "{e}"),
            PipelineEvent::Enrichment(e) => write!(f, "{e}"),
            PipelineEvent::Broadcast(e) => write!(f, "{e}"),
            PipelineEvent::Subscription(e) => write!(f, "{e}"),
            PipelineEvent::Backfill(e) => write!(f, "{e}"),
        }
    }
}

/// Renders an event as a `serde_json::Value` for line-delimited JSON sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &PipelineEvent) -> serde_json::Value {
    use serde_json::json;

    fn clamp_u64(v: u128) -> u64 {
        v.min(u64::MAX as u128) as u64
    }

    match event {
        PipelineEvent::Policy(PolicyEvent::RateLimit(RateLimitEvent::Acquired {
            service,
            remaining,
        })) => json!({"kind": "rate_limit_acquired", "service": service, "remaining": remaining}),
        PipelineEvent::Policy(PolicyEvent::RateLimit(RateLimitEvent::Denied { service, wait })) => {
            json!({"kind": "rate_limit_denied", "service": service, "wait_ms": clamp_u64(wait.as_millis())})
        }
        PipelineEvent::Policy(PolicyEvent::Retry(RetryEvent::Attempt { attempt, delay })) => {
            json!({"kind": "retry_attempt", "attempt": attempt, "delay_ms": clamp_u64(delay.as_millis())})
        }
        PipelineEvent::Policy(PolicyEvent::Retry(RetryEvent::Exhausted {
            total_attempts,
            total_duration,
        })) => {
            json!({"kind": "retry_exhausted", "attempts": total_attempts, "duration_ms": clamp_u64(total_duration.as_millis())})
        }
        PipelineEvent::Policy(PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened {
            service,
            failure_count,
        })) => json!({"kind": "circuit_opened", "service": service, "failures": failure_count}),
        PipelineEvent::Policy(PolicyEvent::CircuitBreaker(CircuitBreakerEvent::HalfOpen {
            service,
        })) => json!({"kind": "circuit_half_open", "service": service}),
        PipelineEvent::Policy(PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Closed {
            service,
        })) => json!({"kind": "circuit_closed", "service": service}),
        PipelineEvent::Policy(PolicyEvent::Bulkhead(BulkheadEvent::Acquired {
            active_count,
            max_concurrency,
        })) => json!({"kind": "bulkhead_acquired", "active": active_count, "max": max_concurrency}),
        PipelineEvent::Policy(PolicyEvent::Bulkhead(BulkheadEvent::Rejected {
            active_count,
            max_concurrency,
        })) => json!({"kind": "bulkhead_rejected", "active": active_count, "max": max_concurrency}),
        PipelineEvent::Policy(PolicyEvent::Timeout(TimeoutEvent::Occurred { timeout })) => {
            json!({"kind": "timeout", "timeout_ms": clamp_u64(timeout.as_millis())})
        }
        PipelineEvent::Policy(PolicyEvent::Request(RequestOutcome::Success { duration })) => {
            json!({"kind": "request_success", "duration_ms": clamp_u64(duration.as_millis())})
        }
        PipelineEvent::Policy(PolicyEvent::Request(RequestOutcome::Failure { duration })) => {
            json!({"kind": "request_failure", "duration_ms": clamp_u64(duration.as_millis())})
        }
        PipelineEvent::Feed(FeedEvent::KillReceived { killmail_id, system_id }) => {
            json!({"kind": "kill_received", "killmail_id": killmail_id, "system_id": system_id})
        }
        PipelineEvent::Feed(FeedEvent::NoKills) => json!({"kind": "no_kills"}),
        PipelineEvent::Feed(FeedEvent::KillOlder { killmail_id }) => {
            json!({"kind": "kill_older", "killmail_id": killmail_id})
        }
        PipelineEvent::Feed(FeedEvent::KillSkipped { killmail_id }) => {
            json!({"kind": "kill_skipped", "killmail_id": killmail_id})
        }
        PipelineEvent::Feed(FeedEvent::Error { reason }) => {
            json!({"kind": "feed_error", "reason": reason})
        }
        PipelineEvent::Enrichment(EnrichmentEvent::EntityResolved { namespace, id }) => {
            json!({"kind": "entity_resolved", "namespace": namespace, "id": id})
        }
        PipelineEvent::Enrichment(EnrichmentEvent::EntityDegraded { namespace, id }) => {
            json!({"kind": "entity_degraded", "namespace": namespace, "id": id})
        }
        PipelineEvent::Enrichment(EnrichmentEvent::KillmailDegraded { killmail_id }) => {
            json!({"kind": "killmail_degraded", "killmail_id": killmail_id})
        }
        PipelineEvent::Broadcast(BroadcastEvent::ChannelDelivered { sub_id, system_id }) => {
            json!({"kind": "channel_delivered", "sub_id": sub_id, "system_id": system_id})
        }
        PipelineEvent::Broadcast(BroadcastEvent::WebhookDelivered { sub_id, status }) => {
            json!({"kind": "webhook_delivered", "sub_id": sub_id, "status": status})
        }
        PipelineEvent::Broadcast(BroadcastEvent::WebhookFailed { sub_id, reason }) => {
            json!({"kind": "webhook_failed", "sub_id": sub_id, "reason": reason})
        }
        PipelineEvent::Broadcast(BroadcastEvent::KillCountUpdated { system_id, count }) => {
            json!({"kind": "kill_count_updated", "system_id": system_id, "count": count})
        }
        PipelineEvent::Subscription(SubscriptionEvent::Subscribed { sub_id, system_count }) => {
            json!({"kind": "subscribed", "sub_id": sub_id, "system_count": system_count})
        }
        PipelineEvent::Subscription(SubscriptionEvent::Unsubscribed { subscriber_id }) => {
            json!({"kind": "unsubscribed", "subscriber_id": subscriber_id})
        }
        PipelineEvent::Subscription(SubscriptionEvent::Rejected { reason }) => {
            json!({"kind": "subscription_rejected", "reason": reason})
        }
        PipelineEvent::Backfill(BackfillEvent::Started { sub_id }) => {
            json!({"kind": "backfill_started", "sub_id": sub_id})
        }
        PipelineEvent::Backfill(BackfillEvent::Queued { sub_id }) => {
            json!({"kind": "backfill_queued", "sub_id": sub_id})
        }
        PipelineEvent::Backfill(BackfillEvent::BatchDelivered { sub_id, count }) => {
            json!({"kind": "backfill_batch_delivered", "sub_id": sub_id, "count": count})
        }
        PipelineEvent::Backfill(BackfillEvent::Completed { sub_id }) => {
            json!({"kind": "backfill_completed", "sub_id": sub_id})
        }
        PipelineEvent::Backfill(BackfillEvent::Failed { sub_id, reason }) => {
            json!({"kind": "backfill_failed", "sub_id": sub_id, "reason": reason})
        }
    }
}
