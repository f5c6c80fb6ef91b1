//! Namespaced TTL cache with single-flight fetch (§4.F).
//!
//! Single-flight is built on `tokio::sync::OnceCell`: the first caller for a given
//! `(namespace, key)` inserts a fresh, empty cell under a short-held mutex; every
//! concurrent caller for the same key finds that cell and awaits the same
//! `get_or_try_init` future. An error is *not* cached — `OnceCell` stays uninitialized
//! on failure, so the next caller retries the fetch.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::OnceCell;

use crate::clock::Clock;
use crate::telemetry::status::CacheSnapshot;

/// Default TTL per namespace (§4.F).
pub fn default_ttl(namespace: &str) -> Duration {
    match namespace {
        "killmails" => Duration::from_secs(5 * 60),
        "systems" => Duration::from_secs(60 * 60),
        "characters" | "corporations" | "alliances" | "ship_types" | "groups" => {
            Duration::from_secs(24 * 60 * 60)
        }
        _ => Duration::from_secs(60 * 60),
    }
}

struct Slot {
    once: OnceCell<Value>,
    expires_at_millis: AtomicU64,
}

impl Slot {
    fn fresh(expires_at_millis: u64) -> Self {
        Self { once: OnceCell::new(), expires_at_millis: AtomicU64::new(expires_at_millis) }
    }

    fn filled(value: Value, expires_at_millis: u64) -> Self {
        Self {
            once: OnceCell::new_with(Some(value)),
            expires_at_millis: AtomicU64::new(expires_at_millis),
        }
    }
}

type Key = (String, String);

/// Namespaced, TTL'd, single-flight cache (§4.F). Cheaply cloneable.
#[derive(Clone)]
pub struct Cache {
    slots: Arc<Mutex<HashMap<Key, Arc<Slot>>>>,
    system_lists: Arc<Mutex<HashMap<u32, VecDeque<u64>>>>,
    active_systems: Arc<Mutex<std::collections::HashSet<u32>>>,
    killmails_per_system_cap: usize,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl Cache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            system_lists: Arc::new(Mutex::new(HashMap::new())),
            active_systems: Arc::new(Mutex::new(std::collections::HashSet::new())),
            killmails_per_system_cap: 50,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            clock,
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    fn is_live(&self, slot: &Slot, now: u64) -> bool {
        slot.once.initialized() && slot.expires_at_millis.load(Ordering::Acquire) > now
    }

    /// Lazy-TTL read. Expired entries read as a miss, matching "expired reads return
    /// NotFound" (§4.F).
    pub fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        let now = self.now_millis();
        let slot = {
            let map = self.slots.lock().unwrap();
            map.get(&(namespace.to_string(), key.to_string())).cloned()
        }?;
        if self.is_live(&slot, now) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            slot.once.get().cloned()
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn put(&self, namespace: &str, key: &str, value: Value) {
        let expires_at = self.now_millis() + default_ttl(namespace).as_millis() as u64;
        let slot = Arc::new(Slot::filled(value, expires_at));
        self.slots.lock().unwrap().insert((namespace.to_string(), key.to_string()), slot);
    }

    pub fn delete(&self, namespace: &str, key: &str) {
        self.slots.lock().unwrap().remove(&(namespace.to_string(), key.to_string()));
    }

    pub fn exists(&self, namespace: &str, key: &str) -> bool {
        self.get(namespace, key).is_some()
    }

    /// Single-flight fetch-or-populate. Concurrent callers for the same `(ns, key)`
    /// share exactly one invocation of `fetch`; if it errors, the error reaches every
    /// waiter but nothing is cached (§4.F).
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        namespace: &str,
        key: &str,
        fetch: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value, E>>,
    {
        let now = self.now_millis();
        let map_key = (namespace.to_string(), key.to_string());

        let slot = {
            let mut map = self.slots.lock().unwrap();
            match map.get(&map_key) {
                Some(existing) if self.is_live(existing, now) => existing.clone(),
                _ => {
                    let expires_at = now + default_ttl(namespace).as_millis() as u64;
                    let fresh = Arc::new(Slot::fresh(expires_at));
                    map.insert(map_key, fresh.clone());
                    fresh
                }
            }
        };

        let was_initialized = slot.once.initialized();
        let result = slot.once.get_or_try_init(fetch).await.map(|v| v.clone());
        if was_initialized {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Remove all entries whose TTL has elapsed. Called by a periodic sweeper
    /// (default every 60s, §4.F) rather than a background timer owned by the cache.
    pub fn sweep(&self) {
        let now = self.now_millis();
        let mut map = self.slots.lock().unwrap();
        map.retain(|_, slot| self.is_live(slot, now) || !slot.once.initialized());
    }

    /// Mark a system as known-active (`systems:active_list`, §4.F).
    pub fn mark_system_active(&self, system_id: u32) {
        self.active_systems.lock().unwrap().insert(system_id);
    }

    pub fn active_systems(&self) -> Vec<u32> {
        let mut v: Vec<u32> = self.active_systems.lock().unwrap().iter().copied().collect();
        v.sort_unstable();
        v
    }

    /// Record a killmail id as recently seen in `system_id` (`systems:killmails:<sid>`),
    /// capped to the N most recent (§4.F).
    pub fn record_system_killmail(&self, system_id: u32, killmail_id: u64) {
        let mut lists = self.system_lists.lock().unwrap();
        let list = lists.entry(system_id).or_default();
        list.push_front(killmail_id);
        list.truncate(self.killmails_per_system_cap);
    }

    pub fn recent_system_killmails(&self, system_id: u32) -> Vec<u64> {
        self.system_lists.lock().unwrap().get(&system_id).cloned().unwrap_or_default().into()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            size: self.slots.lock().unwrap().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<StdAtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(StdAtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
        fn now_utc(&self) -> chrono::DateTime<chrono::Utc> {
            chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap()
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let cache = Cache::new(clock);
        cache.put("characters", "1", serde_json::json!({"name": "Capsuleer"}));
        assert_eq!(cache.get("characters", "1"), Some(serde_json::json!({"name": "Capsuleer"})));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let manual = Arc::new(ManualClock::new());
        let clock: Arc<dyn Clock> = manual.clone();
        let cache = Cache::new(clock);
        cache.put("killmails", "1", serde_json::json!(1));
        manual.advance(default_ttl("killmails").as_millis() as u64 + 1);
        assert_eq!(cache.get("killmails", "1"), None);
    }

    #[test]
    fn delete_removes_entry() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let cache = Cache::new(clock);
        cache.put("systems", "30000142", serde_json::json!("Jita"));
        cache.delete("systems", "30000142");
        assert!(!cache.exists("systems", "30000142"));
    }

    #[tokio::test]
    async fn get_or_fetch_is_single_flight() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let cache = Cache::new(clock);
        let call_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let cache = cache.clone();
            let call_count = call_count.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("characters", "42", || {
                        let call_count = call_count.clone();
                        async move {
                            call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<_, String>(serde_json::json!({"name": "Someone"}))
                        }
                    })
                    .await
            }));
        }

        for h in handles {
            h.await.unwrap().expect("fetch ok");
        }

        assert_eq!(call_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_fetch_does_not_cache_errors() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let cache = Cache::new(clock);

        let first = cache
            .get_or_fetch("characters", "1", || async { Err::<Value, String>("boom".into()) })
            .await;
        assert!(first.is_err());

        let second = cache
            .get_or_fetch("characters", "1", || async { Ok::<Value, String>(serde_json::json!(1)) })
            .await;
        assert_eq!(second.unwrap(), serde_json::json!(1));
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let manual = Arc::new(ManualClock::new());
        let clock: Arc<dyn Clock> = manual.clone();
        let cache = Cache::new(clock);
        cache.put("killmails", "short", serde_json::json!(1));
        cache.put("systems", "long", serde_json::json!(2));

        manual.advance(default_ttl("killmails").as_millis() as u64 + 1);
        cache.sweep();

        assert!(!cache.exists("killmails", "short"));
        assert!(cache.exists("systems", "long"));
    }

    #[test]
    fn recent_system_killmails_caps_and_orders_newest_first() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let cache = Cache { killmails_per_system_cap: 3, ..Cache::new(clock) };
        for id in 1..=5u64 {
            cache.record_system_killmail(30000142, id);
        }
        assert_eq!(cache.recent_system_killmails(30000142), vec![5, 4, 3]);
    }
}
