//! Fans inserted events out to channel sessions and webhook subscribers (§4.K).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::event_store::EventStore;
use crate::models::{EnrichedKillmail, Event, Subscription};
use crate::subscription::SubscriptionRegistry;
use crate::telemetry::sinks::emit_best_effort;
use crate::telemetry::{BroadcastEvent, NullSink, TelemetrySink};

/// Per-subscription outbound queue depth. A slow channel client falls behind and
/// starts missing sends rather than blocking the broadcaster; the dropped range is
/// surfaced to the receiver as `RecvError::Lagged`, matching the "drop oldest,
/// signal a gap" backpressure contract (§5) without the broadcaster tracking which
/// messages were dropped itself.
const CHANNEL_QUEUE_CAPACITY: usize = 256;
const DISPATCH_CONCURRENCY: usize = 32;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages pushed to an attached channel session (§6 channel protocol).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ChannelMessage {
    #[serde(rename = "detailed_kill_update")]
    DetailedKillUpdate {
        solar_system_id: u32,
        kills: Vec<EnrichedKillmail>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "kill_count_update")]
    KillCountUpdate { solar_system_id: u32, count: u64, timestamp: DateTime<Utc> },
    /// Historical Backfill progress (§4.L step 6, §6 channel protocol).
    #[serde(rename = "preload_status")]
    PreloadStatus { sub_id: String, status: String, timestamp: DateTime<Utc> },
    #[serde(rename = "preload_batch")]
    PreloadBatch { sub_id: String, system_id: u32, kills: Vec<EnrichedKillmail>, timestamp: DateTime<Utc> },
    #[serde(rename = "preload_complete")]
    PreloadComplete { sub_id: String, timestamp: DateTime<Utc> },
    #[serde(rename = "preload_failed")]
    PreloadFailed { sub_id: String, reason: String, timestamp: DateTime<Utc> },
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: WebhookData<'a>,
}

#[derive(Serialize)]
struct WebhookData<'a> {
    solar_system_id: u32,
    kills: &'a [EnrichedKillmail],
    timestamp: DateTime<Utc>,
}

/// Dispatches Event Store inserts to matching subscriptions (§4.K). Cheaply cloneable.
#[derive(Clone)]
pub struct Broadcaster<S: TelemetrySink = NullSink> {
    event_store: EventStore,
    subscriptions: SubscriptionRegistry,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<ChannelMessage>>>>,
    system_counts: Arc<Mutex<HashMap<u32, u64>>>,
    webhook_client: Client,
    sink: S,
}

impl<S: TelemetrySink> Broadcaster<S> {
    pub fn new(event_store: EventStore, subscriptions: SubscriptionRegistry, sink: S) -> Self {
        let webhook_client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("reqwest client configuration is always valid");
        Self {
            event_store,
            subscriptions,
            channels: Arc::new(Mutex::new(HashMap::new())),
            system_counts: Arc::new(Mutex::new(HashMap::new())),
            webhook_client,
            sink,
        }
    }

    /// Attach a channel session for `sub_id`. Repeated attaches for the same id
    /// share one outbound queue; each caller gets its own receiver handle.
    pub fn attach_channel(&self, sub_id: &str) -> broadcast::Receiver<ChannelMessage> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(tx) = channels.get(sub_id) {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(CHANNEL_QUEUE_CAPACITY);
        channels.insert(sub_id.to_string(), tx);
        rx
    }

    pub fn detach_channel(&self, sub_id: &str) {
        self.channels.lock().unwrap().remove(sub_id);
    }

    fn next_count(&self, system_id: u32) -> u64 {
        let mut counts = self.system_counts.lock().unwrap();
        let count = counts.entry(system_id).or_insert(0);
        *count += 1;
        *count
    }

    /// Current running kill count for `system_id` (`GET /kill_count/:system_id`, §6).
    pub fn kill_count(&self, system_id: u32) -> u64 {
        self.system_counts.lock().unwrap().get(&system_id).copied().unwrap_or(0)
    }

    async fn dispatch_channel(&self, sub_id: &str, system_id: u32, message: ChannelMessage) {
        let tx = self.channels.lock().unwrap().get(sub_id).cloned();
        let Some(tx) = tx else { return };
        // An error here only means no receivers are currently attached to drain it.
        if tx.send(message).is_ok() {
            emit_best_effort(
                self.sink.clone(),
                BroadcastEvent::ChannelDelivered { sub_id: sub_id.to_string(), system_id }.into(),
            )
            .await;
        }
    }

    async fn dispatch_webhook(
        &self,
        sub_id: &str,
        callback_url: &str,
        system_id: u32,
        kills: &[EnrichedKillmail],
        timestamp: DateTime<Utc>,
    ) {
        let payload = WebhookPayload {
            kind: "detailed_kill_update",
            data: WebhookData { solar_system_id: system_id, kills, timestamp },
        };
        self.post_webhook(sub_id, callback_url, &payload).await;
    }

    /// Shared POST + telemetry for any JSON-serializable webhook payload (§4.K,
    /// reused by Historical Backfill's batch/progress deliveries — §4.L step 5-6).
    async fn post_webhook(&self, sub_id: &str, callback_url: &str, payload: &impl Serialize) {
        let outcome = self.webhook_client.post(callback_url).json(payload).send().await;
        match outcome {
            Ok(response) if response.status().is_success() => {
                emit_best_effort(
                    self.sink.clone(),
                    BroadcastEvent::WebhookDelivered {
                        sub_id: sub_id.to_string(),
                        status: response.status().as_u16(),
                    }
                    .into(),
                )
                .await;
            }
            Ok(response) => {
                emit_best_effort(
                    self.sink.clone(),
                    BroadcastEvent::WebhookFailed {
                        sub_id: sub_id.to_string(),
                        reason: format!("status {}", response.status()),
                    }
                    .into(),
                )
                .await;
            }
            Err(e) => {
                emit_best_effort(
                    self.sink.clone(),
                    BroadcastEvent::WebhookFailed { sub_id: sub_id.to_string(), reason: e.to_string() }
                        .into(),
                )
                .await;
            }
        }
    }

    async fn dispatch_one(
        &self,
        sub: Subscription,
        system_id: u32,
        kills: Arc<Vec<EnrichedKillmail>>,
        timestamp: DateTime<Utc>,
        count: u64,
    ) {
        self.dispatch_channel(
            &sub.sub_id,
            system_id,
            ChannelMessage::DetailedKillUpdate {
                solar_system_id: system_id,
                kills: (*kills).clone(),
                timestamp,
            },
        )
        .await;
        self.dispatch_channel(
            &sub.sub_id,
            system_id,
            ChannelMessage::KillCountUpdate { solar_system_id: system_id, count, timestamp },
        )
        .await;

        if let Some(callback_url) = &sub.callback_url {
            self.dispatch_webhook(&sub.sub_id, callback_url, system_id, &kills, timestamp).await;
        }
    }

    /// Delivers one `ChannelMessage` to `sub`'s channel and, if set, webhook
    /// (§4.L step 5: "flush as one batch to the subscription (channel or
    /// webhook)"). Shared by Historical Backfill for all `preload_*` kinds.
    pub async fn deliver_preload(&self, sub: &Subscription, message: ChannelMessage) {
        let (kind, system_id) = match &message {
            ChannelMessage::PreloadStatus { .. } => ("preload_status", 0),
            ChannelMessage::PreloadBatch { system_id, .. } => ("preload_batch", *system_id),
            ChannelMessage::PreloadComplete { .. } => ("preload_complete", 0),
            ChannelMessage::PreloadFailed { .. } => ("preload_failed", 0),
            ChannelMessage::DetailedKillUpdate { solar_system_id, .. } => {
                ("detailed_kill_update", *solar_system_id)
            }
            ChannelMessage::KillCountUpdate { solar_system_id, .. } => {
                ("kill_count_update", *solar_system_id)
            }
        };
        self.dispatch_channel(&sub.sub_id, system_id, message.clone()).await;
        if let Some(callback_url) = &sub.callback_url {
            #[derive(Serialize)]
            struct PreloadWebhookPayload<'a> {
                #[serde(rename = "type")]
                kind: &'static str,
                data: &'a ChannelMessage,
            }
            self.post_webhook(&sub.sub_id, callback_url, &PreloadWebhookPayload { kind, data: &message })
                .await;
        }
    }

    /// Fans one inserted event out to every matching subscription with bounded
    /// concurrency (§4.K step 2). Per-system ordering is preserved because the
    /// caller processes events sequentially off the Event Store's notify channel.
    async fn handle_event(&self, event: Event) {
        let system_id = event.system_id;
        let timestamp = event.inserted_at;
        let count = self.next_count(system_id);
        emit_best_effort(
            self.sink.clone(),
            BroadcastEvent::KillCountUpdated { system_id, count }.into(),
        )
        .await;

        let matches = self.subscriptions.matching(system_id);
        if matches.is_empty() {
            return;
        }

        let kills = Arc::new(vec![event.killmail]);
        let semaphore = Arc::new(Semaphore::new(DISPATCH_CONCURRENCY));
        let dispatches = matches.into_iter().map(|sub| {
            let this = self.clone();
            let kills = kills.clone();
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                this.dispatch_one(sub, system_id, kills, timestamp, count).await;
            }
        });
        futures::future::join_all(dispatches).await;
    }

    /// Spawn the dispatch loop as a background actor with cooperative shutdown.
    pub fn spawn(self) -> BroadcasterHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut events = self.event_store.subscribe();

        let worker = tokio::spawn(async move {
            tracing::info!("broadcaster started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    received = events.recv() => {
                        match received {
                            Ok(event) => self.handle_event(event).await,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            tracing::info!("broadcaster stopped");
        });

        BroadcasterHandle { shutdown_tx, worker: Mutex::new(Some(worker)) }
    }
}

/// Handle for shutting down a spawned [`Broadcaster`].
pub struct BroadcasterHandle {
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcasterHandle {
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
