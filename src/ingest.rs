//! Long-polling ingest worker against the feed source (§4.I).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::Cache;
use crate::clock::Clock;
use crate::enricher::Enricher;
use crate::event_store::EventStore;
use crate::http_client::HttpClient;
use crate::models::{Attacker, CombatantRef, RawKillmail, ZkbMeta};
use crate::rate_limit::FEED_SOURCE;
use crate::telemetry::sinks::emit_best_effort;
use crate::telemetry::status::FeedCounters;
use crate::telemetry::{FeedEvent, NullSink, TelemetrySink};

const QUEUE_ID_PREFIX: &str = "killfeed-";
const QUEUE_ID_SUFFIX_LEN: usize = 16;

fn generate_queue_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..QUEUE_ID_SUFFIX_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{QUEUE_ID_PREFIX}{suffix}")
}

/// Outcome of a single poll, drives the backoff schedule (§4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    KillReceived,
    NoKills,
    KillOlder,
    KillSkipped,
    Error,
}

/// Determine event time from `killmail_time`, then `kill_time`, then
/// `zkb.killmail_time`, in that order (§4.I step 4).
fn extract_event_time(killmail: &Value, zkb: &Value) -> Option<DateTime<Utc>> {
    for key in ["killmail_time", "kill_time"] {
        if let Some(raw) = killmail.get(key).and_then(Value::as_str) {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Some(parsed.with_timezone(&Utc));
            }
        }
    }
    zkb.get("killmail_time")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn extract_u64(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| value.get(key).and_then(Value::as_u64))
}

/// Fetches a legacy-format killmail's full body by `(kill_id, hash)`, shared
/// between the real-time legacy-format path (§4.I) and historical backfill
/// (§4.L), since both consume the same zkillboard-style killmail lookup.
pub(crate) async fn fetch_legacy_killmail<S: crate::telemetry::TelemetrySink>(
    http: &HttpClient<S>,
    legacy_killmail_base: &str,
    kill_id: u64,
    hash: &str,
) -> Result<Value, crate::error::PipelineError> {
    let url = format!("{legacy_killmail_base}/{kill_id}/{hash}");
    http.get_json::<Value>(FEED_SOURCE, &url).await
}

/// Parses the merged `(killmail, zkb)` pair into our normalized [`RawKillmail`]
/// shape. Returns `None` on any malformed/missing field (§4.I step 4: "drop as
/// malformed").
pub(crate) fn parse_raw_killmail(killmail: &Value, zkb: &Value) -> Option<RawKillmail> {
    let id = extract_u64(killmail, &["killmail_id", "killID", "id"])?;
    let system_id = extract_u64(killmail, &["solar_system_id", "system_id"])? as u32;
    let time = extract_event_time(killmail, zkb)?;
    let victim: CombatantRef = serde_json::from_value(killmail.get("victim")?.clone()).ok()?;
    let attackers: Vec<Attacker> =
        serde_json::from_value(killmail.get("attackers")?.clone()).ok()?;
    let zkb: ZkbMeta = serde_json::from_value(zkb.clone()).ok()?;
    Some(RawKillmail { id, time, system_id, victim, attackers, zkb })
}

/// Classifies one poll response into a `(killmail, zkb)` pair, fetching the
/// full killmail for legacy-format responses (§4.I step 3).
enum Classified {
    NoKills,
    Killmail(Value, Value),
    UnexpectedFormat,
}

/// Long-polls the feed source, classifies responses, and drives raw killmails
/// through the Enricher and Event Store (§4.I).
#[derive(Clone)]
pub struct IngestWorker<S: TelemetrySink = NullSink> {
    http: HttpClient<S>,
    enricher: Enricher<S>,
    event_store: EventStore,
    cache: Cache,
    feed_url: String,
    legacy_killmail_base: String,
    queue_id: String,
    cutoff: Duration,
    fast_interval: Duration,
    idle_interval: Duration,
    max_backoff: Duration,
    backoff_factor: u32,
    counters: Arc<FeedCounters>,
    clock: Arc<dyn Clock>,
    seen: Arc<Mutex<HashMap<u64, u64>>>,
    sink: S,
}

impl<S: TelemetrySink> IngestWorker<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: HttpClient<S>,
        enricher: Enricher<S>,
        event_store: EventStore,
        cache: Cache,
        feed_url: impl Into<String>,
        legacy_killmail_base: impl Into<String>,
        cutoff: Duration,
        fast_interval: Duration,
        idle_interval: Duration,
        max_backoff: Duration,
        backoff_factor: u32,
        counters: Arc<FeedCounters>,
        clock: Arc<dyn Clock>,
        sink: S,
    ) -> Self {
        Self {
            http,
            enricher,
            event_store,
            cache,
            feed_url: feed_url.into(),
            legacy_killmail_base: legacy_killmail_base.into(),
            queue_id: generate_queue_id(),
            cutoff,
            fast_interval,
            idle_interval,
            max_backoff,
            backoff_factor,
            counters,
            clock,
            seen: Arc::new(Mutex::new(HashMap::new())),
            sink,
        }
    }

    /// Drops dedup entries older than the rolling `cutoff` window (§4.I).
    fn prune_seen(&self) {
        let cutoff_millis = self.cutoff.as_millis() as u64;
        let now = self.clock.now_millis();
        self.seen.lock().unwrap().retain(|_, &mut seen_at| now.saturating_sub(seen_at) <= cutoff_millis);
    }

    /// Returns `true` if this id was already seen within the window, else records it.
    fn check_and_record_seen(&self, killmail_id: u64) -> bool {
        self.prune_seen();
        let mut seen = self.seen.lock().unwrap();
        if seen.contains_key(&killmail_id) {
            true
        } else {
            seen.insert(killmail_id, self.clock.now_millis());
            false
        }
    }

    async fn classify(&self, response: Value) -> Classified {
        let package = match response.get("package") {
            Some(p) if !p.is_null() => p.clone(),
            _ => return Classified::NoKills,
        };

        if let (Some(killmail), Some(zkb)) = (package.get("killmail"), package.get("zkb")) {
            return Classified::Killmail(killmail.clone(), zkb.clone());
        }

        if let (Some(kill_id), Some(zkb)) = (package.get("killID"), package.get("zkb")) {
            let Some(kill_id) = kill_id.as_u64() else { return Classified::UnexpectedFormat };
            let Some(hash) = zkb.get("hash").and_then(Value::as_str) else {
                return Classified::UnexpectedFormat;
            };
            match fetch_legacy_killmail(&self.http, &self.legacy_killmail_base, kill_id, hash).await {
                Ok(killmail) => return Classified::Killmail(killmail, zkb.clone()),
                Err(_) => return Classified::UnexpectedFormat,
            }
        }

        Classified::UnexpectedFormat
    }

    /// Runs one poll/classify/ingest cycle (§4.I steps 2-6).
    pub async fn poll_once(&self) -> PollOutcome {
        let url = format!("{}?queueID={}&ttw=1", self.feed_url, self.queue_id);
        let response = match self.http.get_json::<Value>(FEED_SOURCE, &url).await {
            Ok(body) => body,
            Err(e) => {
                self.counters.record_error();
                emit_best_effort(self.sink.clone(), FeedEvent::Error { reason: e.to_string() }.into())
                    .await;
                return PollOutcome::Error;
            }
        };

        let (killmail, zkb) = match self.classify(response).await {
            Classified::NoKills => {
                emit_best_effort(self.sink.clone(), FeedEvent::NoKills.into()).await;
                return PollOutcome::NoKills;
            }
            Classified::UnexpectedFormat => {
                self.counters.record_error();
                emit_best_effort(
                    self.sink.clone(),
                    FeedEvent::Error { reason: "unexpected feed format".into() }.into(),
                )
                .await;
                return PollOutcome::Error;
            }
            Classified::Killmail(killmail, zkb) => (killmail, zkb),
        };

        let Some(raw) = parse_raw_killmail(&killmail, &zkb) else {
            self.counters.record_error();
            emit_best_effort(
                self.sink.clone(),
                FeedEvent::Error { reason: "malformed killmail".into() }.into(),
            )
            .await;
            return PollOutcome::Error;
        };

        if self.check_and_record_seen(raw.id) {
            self.counters.record_skipped();
            emit_best_effort(self.sink.clone(), FeedEvent::KillSkipped { killmail_id: raw.id }.into())
                .await;
            return PollOutcome::KillSkipped;
        }

        let now = self.clock.now_utc();
        let age_millis = (now.timestamp_millis() - raw.time.timestamp_millis()).max(0) as u64;
        if age_millis > self.cutoff.as_millis() as u64 {
            self.counters.record_older();
            emit_best_effort(self.sink.clone(), FeedEvent::KillOlder { killmail_id: raw.id }.into())
                .await;
            return PollOutcome::KillOlder;
        }

        let system_id = raw.system_id;
        let killmail_id = raw.id;
        self.cache.mark_system_active(system_id);
        let enriched = self.enricher.enrich(raw).await;
        self.event_store.insert(system_id, enriched, now);
        self.cache.record_system_killmail(system_id, killmail_id);
        self.counters.record_received();
        emit_best_effort(
            self.sink.clone(),
            FeedEvent::KillReceived { killmail_id, system_id }.into(),
        )
        .await;
        PollOutcome::KillReceived
    }

    /// Next poll delay given `outcome`, and the error-backoff value to carry
    /// into the following iteration (§4.I backoff table).
    fn next_delay(&self, outcome: PollOutcome, error_backoff: Duration) -> (Duration, Duration) {
        match outcome {
            PollOutcome::KillReceived => (self.fast_interval, self.idle_interval),
            PollOutcome::NoKills | PollOutcome::KillOlder | PollOutcome::KillSkipped => {
                (self.idle_interval, self.idle_interval)
            }
            PollOutcome::Error => {
                let grown = error_backoff
                    .saturating_mul(self.backoff_factor)
                    .min(self.max_backoff);
                (grown, grown)
            }
        }
    }
}

impl<S: TelemetrySink> IngestWorker<S> {
    /// Spawn the long-poll loop as a background actor with cooperative shutdown
    /// (§5: `watch`-based stop signal, matching the rest of this crate's
    /// long-lived actors).
    pub fn spawn(self) -> IngestHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let idle_interval = self.idle_interval;

        let worker = tokio::spawn(async move {
            let mut error_backoff = idle_interval;
            let mut delay = idle_interval;
            tracing::info!("ingest worker started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {
                        let outcome = self.poll_once().await;
                        let (next, backoff) = self.next_delay(outcome, error_backoff);
                        delay = next;
                        error_backoff = backoff;
                    }
                }
            }
            tracing::info!("ingest worker stopped");
        });

        IngestHandle { shutdown_tx, worker: Mutex::new(Some(worker)) }
    }
}

/// Handle for shutting down a spawned [`IngestWorker`].
pub struct IngestHandle {
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IngestHandle {
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker_registry::CircuitBreakerRegistry;
    use crate::clock::MonotonicClock;
    use crate::config::Config;
    use crate::rate_limit::RateLimiterRegistry;
    use serde_json::json;

    fn worker() -> IngestWorker<NullSink> {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let cache = Cache::new(clock.clone());
        let config = Config::default();
        let http =
            HttpClient::new(&config, RateLimiterRegistry::new(), CircuitBreakerRegistry::default());
        let enricher = Enricher::new(
            cache.clone(),
            http.clone(),
            "http://127.0.0.1:1/entities",
            config.min_attackers_for_parallel,
            config.enricher_max_concurrency,
            Duration::from_millis(20),
            NullSink,
        );
        IngestWorker::new(
            http,
            enricher,
            EventStore::new(),
            cache,
            "http://127.0.0.1:1/feed",
            "http://127.0.0.1:1/legacy",
            config.cutoff,
            config.fast_interval,
            config.idle_interval,
            config.max_backoff,
            config.backoff_factor,
            Arc::new(FeedCounters::new()),
            clock,
            NullSink,
        )
    }

    #[test]
    fn queue_id_has_expected_shape() {
        let id = generate_queue_id();
        assert!(id.starts_with(QUEUE_ID_PREFIX));
        assert_eq!(id.len(), QUEUE_ID_PREFIX.len() + QUEUE_ID_SUFFIX_LEN);
    }

    #[test]
    fn extract_event_time_prefers_killmail_time() {
        let killmail = json!({"killmail_time": "2024-01-01T00:00:00Z", "kill_time": "2020-01-01T00:00:00Z"});
        let zkb = json!({});
        let time = extract_event_time(&killmail, &zkb).expect("parsed");
        assert_eq!(time.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn extract_event_time_falls_back_to_zkb() {
        let killmail = json!({});
        let zkb = json!({"killmail_time": "2024-02-02T00:00:00Z"});
        assert!(extract_event_time(&killmail, &zkb).is_some());
    }

    #[test]
    fn extract_event_time_none_when_unparseable() {
        let killmail = json!({"killmail_time": "not-a-date"});
        let zkb = json!({});
        assert!(extract_event_time(&killmail, &zkb).is_none());
    }

    #[test]
    fn parse_raw_killmail_builds_full_record() {
        let killmail = json!({
            "killmail_id": 1,
            "killmail_time": "2024-01-01T00:00:00Z",
            "solar_system_id": 30000142,
            "victim": {"character_id": 1, "corporation_id": 2, "alliance_id": null, "ship_type_id": 3},
            "attackers": [{"character_id": 4, "corporation_id": 5, "alliance_id": null, "ship_type_id": 6, "weapon_type_id": 7, "final_blow": true}],
        });
        let zkb = json!({"hash": "abc", "totalValue": 1.0});
        let raw = parse_raw_killmail(&killmail, &zkb).expect("valid killmail");
        assert_eq!(raw.id, 1);
        assert_eq!(raw.system_id, 30000142);
        assert_eq!(raw.attackers.len(), 1);
    }

    #[test]
    fn parse_raw_killmail_none_when_missing_victim() {
        let killmail = json!({"killmail_id": 1, "killmail_time": "2024-01-01T00:00:00Z", "solar_system_id": 1, "attackers": []});
        let zkb = json!({"hash": "abc"});
        assert!(parse_raw_killmail(&killmail, &zkb).is_none());
    }

    #[tokio::test]
    async fn dedup_marks_repeat_ids_as_skipped() {
        let w = worker();
        assert!(!w.check_and_record_seen(1));
        assert!(w.check_and_record_seen(1));
    }

    #[test]
    fn backoff_grows_on_error_and_resets_on_success() {
        let w = worker();
        let (delay, backoff) = w.next_delay(PollOutcome::Error, w.idle_interval);
        assert_eq!(delay, w.idle_interval * w.backoff_factor);
        assert_eq!(backoff, delay);

        let (delay, backoff) = w.next_delay(PollOutcome::KillReceived, backoff);
        assert_eq!(delay, w.fast_interval);
        assert_eq!(backoff, w.idle_interval);
    }

    #[test]
    fn backoff_caps_at_max_backoff() {
        let w = worker();
        let (delay, _) = w.next_delay(PollOutcome::Error, w.max_backoff);
        assert_eq!(delay, w.max_backoff);
    }
}
