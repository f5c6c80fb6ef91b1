//! Historical Backfill scheduler: preloads recent events for newly-arrived
//! subscribers within external rate limits (§4.L).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::broadcaster::{Broadcaster, ChannelMessage};
use crate::clock::Clock;
use crate::enricher::Enricher;
use crate::error::PipelineError;
use crate::http_client::HttpClient;
use crate::ingest::{fetch_legacy_killmail, parse_raw_killmail};
use crate::models::{EnrichedKillmail, Subscription};
use crate::rate_limit::FEED_SOURCE;
use crate::sleeper::Sleeper;
use crate::subscription::SubscriptionRegistry;
use crate::telemetry::sinks::emit_best_effort;
use crate::telemetry::{BackfillEvent, NullSink, TelemetrySink};

const HISTORICAL_PAGE_SIZE: usize = 200;
const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Preloads recent killmails for each newly-registered subscription (§4.L).
/// Cheaply cloneable; each new subscription runs on its own spawned task,
/// admission-gated by a shared semaphore (step 2).
#[derive(Clone)]
pub struct Backfill<S: TelemetrySink = NullSink> {
    http: HttpClient<S>,
    enricher: Enricher<S>,
    broadcaster: Broadcaster<S>,
    subscriptions: SubscriptionRegistry,
    historical_feed_url: String,
    legacy_killmail_base: String,
    admission: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: S,
}

impl<S: TelemetrySink> Backfill<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: HttpClient<S>,
        enricher: Enricher<S>,
        broadcaster: Broadcaster<S>,
        subscriptions: SubscriptionRegistry,
        historical_feed_url: impl Into<String>,
        legacy_killmail_base: impl Into<String>,
        backfill_max_concurrent: usize,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        sink: S,
    ) -> Self {
        Self {
            http,
            enricher,
            broadcaster,
            subscriptions,
            historical_feed_url: historical_feed_url.into(),
            legacy_killmail_base: legacy_killmail_base.into(),
            admission: Arc::new(Semaphore::new(backfill_max_concurrent.max(1))),
            clock,
            sleeper,
            sink,
        }
    }

    fn page_url(&self, system_id: u32, page: usize) -> String {
        format!(
            "{}?system_id={system_id}&page={page}&page_size={HISTORICAL_PAGE_SIZE}",
            self.historical_feed_url
        )
    }

    /// Flushes `buffer` as one batch to `sub`'s channel/webhook and clears it
    /// (§4.L step 5).
    async fn flush_batch(&self, sub: &Subscription, system_id: u32, buffer: &mut Vec<EnrichedKillmail>) {
        if buffer.is_empty() {
            return;
        }
        let kills = std::mem::take(buffer);
        emit_best_effort(
            self.sink.clone(),
            BackfillEvent::BatchDelivered { sub_id: sub.sub_id.clone(), count: kills.len() }.into(),
        )
        .await;
        self.broadcaster
            .deliver_preload(
                sub,
                ChannelMessage::PreloadBatch {
                    sub_id: sub.sub_id.clone(),
                    system_id,
                    kills,
                    timestamp: self.clock.now_utc(),
                },
            )
            .await;
    }

    /// Runs the full preload for one subscription: every `system_id`, paginated,
    /// bounded by `limit_per_system` and `since_hours` (§4.L steps 3-6).
    async fn run(&self, sub: Subscription) {
        let _permit = self.admission.clone().acquire_owned().await.expect("semaphore is never closed");

        emit_best_effort(self.sink.clone(), BackfillEvent::Started { sub_id: sub.sub_id.clone() }.into())
            .await;
        self.broadcaster
            .deliver_preload(
                &sub,
                ChannelMessage::PreloadStatus {
                    sub_id: sub.sub_id.clone(),
                    status: "fetching".to_string(),
                    timestamp: self.clock.now_utc(),
                },
            )
            .await;

        let since_cutoff_millis = self
            .clock
            .now_utc()
            .timestamp_millis()
            .saturating_sub(sub.backfill.since_hours.saturating_mul(3_600_000) as i64);

        let mut buffer: Vec<EnrichedKillmail> = Vec::new();

        for system_id in sub.system_ids.iter().copied() {
            let mut delivered = 0usize;
            let mut page = 0usize;

            'paging: loop {
                // Cancellation (§4.L step 7): if the subscription was removed,
                // stop at this page boundary rather than racing a removed record.
                if self.subscriptions.get(&sub.sub_id).is_none() {
                    return;
                }
                if delivered >= sub.backfill.limit_per_system {
                    break;
                }

                let url = self.page_url(system_id, page);
                let items = match self.http.get_json::<Vec<Value>>(FEED_SOURCE, &url).await {
                    Ok(items) => items,
                    Err(PipelineError::RateLimited { .. }) => {
                        self.sleeper.sleep(RATE_LIMIT_RETRY_DELAY).await;
                        continue 'paging;
                    }
                    Err(e) => {
                        self.flush_batch(&sub, system_id, &mut buffer).await;
                        emit_best_effort(
                            self.sink.clone(),
                            BackfillEvent::Failed { sub_id: sub.sub_id.clone(), reason: e.to_string() }
                                .into(),
                        )
                        .await;
                        self.broadcaster
                            .deliver_preload(
                                &sub,
                                ChannelMessage::PreloadFailed {
                                    sub_id: sub.sub_id.clone(),
                                    reason: e.to_string(),
                                    timestamp: self.clock.now_utc(),
                                },
                            )
                            .await;
                        return;
                    }
                };

                if items.is_empty() {
                    break;
                }

                for item in &items {
                    if delivered >= sub.backfill.limit_per_system {
                        break;
                    }
                    let Some(kill_id) = item.get("killmail_id").and_then(Value::as_u64) else {
                        continue;
                    };
                    let Some(zkb) = item.get("zkb") else { continue };
                    let Some(hash) = zkb.get("hash").and_then(Value::as_str) else { continue };

                    let killmail =
                        match fetch_legacy_killmail(&self.http, &self.legacy_killmail_base, kill_id, hash)
                            .await
                        {
                            Ok(killmail) => killmail,
                            Err(_) => continue,
                        };
                    let Some(raw) = parse_raw_killmail(&killmail, zkb) else { continue };
                    if raw.time.timestamp_millis() < since_cutoff_millis {
                        continue;
                    }

                    let enriched = self.enricher.enrich(raw).await;
                    delivered += 1;
                    buffer.push(enriched);

                    if buffer.len() >= sub.backfill.delivery_batch_size {
                        self.flush_batch(&sub, system_id, &mut buffer).await;
                        self.sleeper.sleep(Duration::from_millis(sub.backfill.delivery_interval_ms)).await;
                    }
                }

                if items.len() < HISTORICAL_PAGE_SIZE {
                    break;
                }
                page += 1;
            }

            self.flush_batch(&sub, system_id, &mut buffer).await;
        }

        emit_best_effort(self.sink.clone(), BackfillEvent::Completed { sub_id: sub.sub_id.clone() }.into())
            .await;
        self.broadcaster
            .deliver_preload(
                &sub,
                ChannelMessage::PreloadComplete { sub_id: sub.sub_id.clone(), timestamp: self.clock.now_utc() },
            )
            .await;
    }

    /// Spawn the scheduler: listens for new subscriptions and runs one
    /// admission-gated preload task per subscription (§4.L).
    pub fn spawn(self) -> BackfillHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut new_subs = self.subscriptions.new_subscriptions();

        let worker = tokio::spawn(async move {
            tracing::info!("backfill scheduler started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    received = new_subs.recv() => {
                        match received {
                            Ok(sub) => {
                                if sub.backfill.enabled {
                                    let this = self.clone();
                                    tokio::spawn(async move { this.run(sub).await; });
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            tracing::info!("backfill scheduler stopped");
        });

        BackfillHandle { shutdown_tx, worker: Mutex::new(Some(worker)) }
    }
}

/// Handle for shutting down a spawned [`Backfill`] scheduler. Per-subscription
/// preload tasks already in flight are not awaited here; they observe their
/// subscription's removal at the next page boundary (§4.L step 7).
pub struct BackfillHandle {
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackfillHandle {
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
    use crate::cache::Cache;
    use crate::circuit_breaker_registry::CircuitBreakerRegistry;
    use crate::clock::MonotonicClock;
    use crate::config::Config;
    use crate::event_store::EventStore;
    use crate::models::BackfillConfig;
    use crate::rate_limit::RateLimiterRegistry;
    use crate::sleeper::InstantSleeper;
    use crate::telemetry::MemorySink;
    use std::collections::HashSet;

    fn backfill() -> (Backfill<MemorySink>, SubscriptionRegistry) {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let cache = Cache::new(clock.clone());
        let config = Config::default();
        let http =
            HttpClient::new(&config, RateLimiterRegistry::new(), CircuitBreakerRegistry::default());
        let enricher = Enricher::new(
            cache,
            http.clone(),
            "http://127.0.0.1:1/entities",
            config.min_attackers_for_parallel,
            config.enricher_max_concurrency,
            Duration::from_millis(20),
            NullSink,
        );
        let event_store = EventStore::new();
        let subscriptions = SubscriptionRegistry::new(70_000_000, 100, clock.clone());
        let broadcaster = Broadcaster::new(event_store, subscriptions.clone(), MemorySink::new());
        let backfill = Backfill::new(
            http,
            enricher,
            broadcaster,
            subscriptions.clone(),
            "http://127.0.0.1:1/historical",
            "http://127.0.0.1:1/legacy",
            config.backfill_max_concurrent,
            clock,
            Arc::new(InstantSleeper),
            MemorySink::new(),
        );
        (backfill, subscriptions)
    }

    #[tokio::test]
    async fn run_reports_failure_when_historical_endpoint_is_unreachable() {
        let (backfill, subscriptions) = backfill();
        let sub = subscriptions
            .subscribe("alice", HashSet::from([30000142]), None, BackfillConfig::default())
            .unwrap();

        backfill.run(sub.clone()).await;

        let events = backfill.sink.events();
        assert!(events.iter().any(|e| matches!(
            e,
            crate::telemetry::PipelineEvent::Backfill(BackfillEvent::Started { .. })
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            crate::telemetry::PipelineEvent::Backfill(BackfillEvent::Failed { .. })
        )));
    }

    #[tokio::test]
    async fn run_stops_at_page_boundary_once_subscription_is_removed() {
        let (backfill, subscriptions) = backfill();
        let sub = subscriptions
            .subscribe("alice", HashSet::from([30000142]), None, BackfillConfig::default())
            .unwrap();
        subscriptions.unsubscribe("alice");

        // The page-boundary check fires before the first HTTP call, so this
        // exits without ever reaching Completed or Failed.
        backfill.run(sub).await;
        let events = backfill.sink.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, crate::telemetry::PipelineEvent::Backfill(BackfillEvent::Started { .. }))));
        assert!(!events
            .iter()
            .any(|e| matches!(e, crate::telemetry::PipelineEvent::Backfill(BackfillEvent::Completed { .. }))));
    }

    #[tokio::test]
    async fn admission_semaphore_is_sized_from_backfill_max_concurrent() {
        let (backfill, _subscriptions) = backfill();
        assert_eq!(backfill.admission.available_permits(), Config::default().backfill_max_concurrent);
    }
}
