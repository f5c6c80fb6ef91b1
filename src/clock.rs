//! Clock abstractions used by circuit breakers, retry, and the ingest worker (§4.A).
//!
//! All time-based decisions route through [`Clock`] — no direct OS-time calls elsewhere
//! in this crate — so tests can inject a fixed or manually-advanced clock.

use chrono::{DateTime, Utc};
use std::time::Instant;

/// Clock abstraction so timing can be faked in tests.
///
/// `now_millis` is a monotonic millisecond counter (used by the resilience primitives);
/// `now_utc` is wall-clock UTC (used to compare against killmail `killmail_time` strings).
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Production clock: monotonic millis from process start, wall clock from the OS.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
