//! Telemetry and observability for the killfeed pipeline (component M).
//!
//! Every component emits a [`events::PipelineEvent`]. Events flow through `TelemetrySink`
//! implementations which can log, aggregate, or forward events to external systems
//! (see the `killfeed-jsonl` and `killfeed-prometheus` sink crates).
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<PipelineEvent>` for composability.

pub mod events;
pub mod sinks;
pub mod status;

pub use events::{
    BackfillEvent, BroadcastEvent, BulkheadEvent, CircuitBreakerEvent, EnrichmentEvent, FeedEvent,
    PipelineEvent, PolicyEvent, RateLimitEvent, RequestOutcome, RetryEvent, SubscriptionEvent,
    TimeoutEvent,
};
pub use sinks::{
    emit_best_effort, ComposedSinkError, FallbackSink, LogSink, MemorySink, MulticastSink,
    NonBlockingSink, NullSink, StreamingSink, TelemetrySink,
};
pub use status::{
    CacheSnapshot, EventStoreSnapshot, FeedCounters, FeedSnapshot, RateLimitAvailability,
    StatusAggregator, StatusHandle, StatusProviders, StatusSnapshot, SubscriptionSnapshot,
    DEFAULT_POLL_INTERVAL,
};