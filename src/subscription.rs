//! Subscription registry (§4.J): register/remove/list subscriptions and
//! validate their parameters.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use url::Url;

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::models::{BackfillConfig, Subscription};
use crate::telemetry::status::SubscriptionSnapshot;

const NEW_SUBSCRIPTION_CHANNEL_CAPACITY: usize = 256;

/// Singleton subscription store (§3: "Subscription Registry exclusively owns
/// subscription records"). Cheaply cloneable.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    subs: Arc<Mutex<HashMap<String, Subscription>>>,
    by_subscriber: Arc<Mutex<HashMap<String, HashSet<String>>>>,
    new_subs: broadcast::Sender<Subscription>,
    max_system_id: u64,
    max_subscribed_systems: usize,
    clock: Arc<dyn Clock>,
}

impl SubscriptionRegistry {
    pub fn new(max_system_id: u64, max_subscribed_systems: usize, clock: Arc<dyn Clock>) -> Self {
        let (new_subs, _rx) = broadcast::channel(NEW_SUBSCRIPTION_CHANNEL_CAPACITY);
        Self {
            subs: Arc::new(Mutex::new(HashMap::new())),
            by_subscriber: Arc::new(Mutex::new(HashMap::new())),
            new_subs,
            max_system_id,
            max_subscribed_systems,
            clock,
        }
    }

    /// Notified on every successful `subscribe`, for the Historical Backfill
    /// scheduler (§4.J, §4.L) to pick up.
    pub fn new_subscriptions(&self) -> broadcast::Receiver<Subscription> {
        self.new_subs.subscribe()
    }

    /// `sub_id` = lowercase hex of SHA-256(subscriber_id || ":" || microsecond
    /// timestamp), truncated to 16 chars (§4.J).
    fn generate_sub_id(&self, subscriber_id: &str) -> String {
        let micros = self.clock.now_utc().timestamp_micros();
        let mut hasher = Sha256::new();
        hasher.update(subscriber_id.as_bytes());
        hasher.update(b":");
        hasher.update(micros.to_string().as_bytes());
        let digest = hasher.finalize();
        hex::encode(digest)[..16].to_string()
    }

    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        system_ids: HashSet<u32>,
        callback_url: Option<String>,
        backfill: BackfillConfig,
    ) -> Result<Subscription, PipelineError> {
        let subscriber_id = subscriber_id.into();
        if subscriber_id.is_empty() {
            return Err(PipelineError::Validation("subscriber_id must not be empty".into()));
        }
        if system_ids.is_empty() {
            return Err(PipelineError::Validation("system_ids must not be empty".into()));
        }
        if system_ids.len() > self.max_subscribed_systems {
            return Err(PipelineError::Validation(format!(
                "system_ids exceeds max of {}",
                self.max_subscribed_systems
            )));
        }
        if system_ids.iter().any(|&id| id == 0 || id as u64 > self.max_system_id) {
            return Err(PipelineError::Validation(
                "system_id must be a positive integer no greater than max_system_id".into(),
            ));
        }
        if let Some(url) = &callback_url {
            Url::parse(url).map_err(|_| {
                PipelineError::Validation(format!("callback_url is not a valid absolute URL: {url}"))
            })?;
        }

        let sub_id = self.generate_sub_id(&subscriber_id);
        let subscription = Subscription {
            sub_id: sub_id.clone(),
            subscriber_id: subscriber_id.clone(),
            system_ids,
            callback_url,
            created_at: self.clock.now_utc(),
            backfill,
        };

        self.subs.lock().unwrap().insert(sub_id.clone(), subscription.clone());
        self.by_subscriber.lock().unwrap().entry(subscriber_id).or_default().insert(sub_id);

        let _ = self.new_subs.send(subscription.clone());
        Ok(subscription)
    }

    /// Removes every subscription owned by `subscriber_id`. Returns the count removed.
    pub fn unsubscribe(&self, subscriber_id: &str) -> usize {
        let sub_ids = self.by_subscriber.lock().unwrap().remove(subscriber_id).unwrap_or_default();
        let mut subs = self.subs.lock().unwrap();
        for sub_id in &sub_ids {
            subs.remove(sub_id);
        }
        sub_ids.len()
    }

    pub fn list(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self.subs.lock().unwrap().values().cloned().collect();
        subs.sort_by(|a, b| a.sub_id.cmp(&b.sub_id));
        subs
    }

    pub fn get(&self, sub_id: &str) -> Option<Subscription> {
        self.subs.lock().unwrap().get(sub_id).cloned()
    }

    /// Applies `delta` to the subscription in place, if it exists.
    pub fn update<F>(&self, sub_id: &str, delta: F) -> Result<Subscription, PipelineError>
    where
        F: FnOnce(&mut Subscription),
    {
        let mut subs = self.subs.lock().unwrap();
        let sub = subs
            .get_mut(sub_id)
            .ok_or_else(|| PipelineError::NotFound(format!("subscription {sub_id}")))?;
        delta(sub);
        Ok(sub.clone())
    }

    /// Subscriptions whose `system_ids` contains `system_id`, for the Broadcaster (§4.K).
    pub fn matching(&self, system_id: u32) -> Vec<Subscription> {
        self.subs
            .lock()
            .unwrap()
            .values()
            .filter(|sub| sub.system_ids.contains(&system_id))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        let subs = self.subs.lock().unwrap();
        let webhook_subscribers = subs.values().filter(|s| s.callback_url.is_some()).count();
        let channel_subscribers = subs.len() - webhook_subscribers;
        SubscriptionSnapshot { channel_subscribers, webhook_subscribers }
    }
}
