//! Append-only, sequence-numbered event log keyed by system id, with per-client
//! offsets and watermark-based GC (§4.G).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::models::{EnrichedKillmail, Event};
use crate::telemetry::status::EventStoreSnapshot;

/// Soft cap on per-system broadcast backlog for newly-subscribed listeners; the log
/// itself is unbounded until GC runs (§5 backpressure is handled by the broadcaster,
/// not here).
const NOTIFY_CHANNEL_CAPACITY: usize = 4096;

/// Fallback per-system log size cap used when a store isn't wired to `Config`
/// (matches `Config::default().max_events_per_system`). GC normally keeps logs
/// small by watermark once a client has read them (§4.G); this cap only bites
/// when a system accumulates events with no subscriber ever reading them.
const DEFAULT_MAX_EVENTS_PER_SYSTEM: usize = 10_000;

type PerSystemLog = Arc<Mutex<BTreeMap<u64, Event>>>;

/// Singleton append-only event log (§3, §4.G). Cheaply cloneable; all mutable state is
/// behind `Arc`.
#[derive(Clone)]
pub struct EventStore {
    systems: Arc<Mutex<HashMap<u32, PerSystemLog>>>,
    offsets: Arc<Mutex<HashMap<String, HashMap<u32, u64>>>>,
    seq: Arc<AtomicU64>,
    notify: broadcast::Sender<Event>,
    max_events_per_system: usize,
    capped_systems: Arc<Mutex<HashSet<u32>>>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    pub fn new() -> Self {
        let (notify, _rx) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        Self {
            systems: Arc::new(Mutex::new(HashMap::new())),
            offsets: Arc::new(Mutex::new(HashMap::new())),
            seq: Arc::new(AtomicU64::new(0)),
            notify,
            max_events_per_system: DEFAULT_MAX_EVENTS_PER_SYSTEM,
            capped_systems: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Overrides the soft per-system cap (§9 Design Notes #3), normally sourced from
    /// `Config::max_events_per_system`.
    pub fn with_max_events_per_system(mut self, cap: usize) -> Self {
        self.max_events_per_system = cap;
        self
    }

    /// Subscribe to newly-inserted events across all systems; callers filter by
    /// `system_id` themselves (internal bus topic `system:<id>`, §4.G).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.notify.subscribe()
    }

    fn system_log(&self, system_id: u32) -> PerSystemLog {
        let mut systems = self.systems.lock().unwrap();
        systems.entry(system_id).or_insert_with(|| Arc::new(Mutex::new(BTreeMap::new()))).clone()
    }

    /// Atomically assigns the next sequence number, stores the event, and notifies
    /// subscribers on `system:<system_id>` (§4.G).
    pub fn insert(&self, system_id: u32, killmail: EnrichedKillmail, inserted_at: chrono::DateTime<chrono::Utc>) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event { seq, system_id, killmail, inserted_at };

        let log = self.system_log(system_id);
        {
            let mut log = log.lock().unwrap();
            log.insert(seq, event.clone());
            if log.len() > self.max_events_per_system {
                if self.capped_systems.lock().unwrap().insert(system_id) {
                    tracing::warn!(
                        system_id,
                        max_events_per_system = self.max_events_per_system,
                        "system event log exceeded the soft cap with no client ever reading it; forcing GC of oldest events",
                    );
                }
                while log.len() > self.max_events_per_system {
                    log.pop_first();
                }
            }
        }

        let _ = self.notify.send(event);
        seq
    }

    fn client_offset(&self, client_id: &str, system_id: u32) -> u64 {
        self.offsets
            .lock()
            .unwrap()
            .get(client_id)
            .and_then(|by_system| by_system.get(&system_id))
            .copied()
            .unwrap_or(0)
    }

    fn advance_offset(&self, client_id: &str, system_id: u32, seq: u64) {
        let mut offsets = self.offsets.lock().unwrap();
        let by_system = offsets.entry(client_id.to_string()).or_default();
        let current = by_system.entry(system_id).or_insert(0);
        if seq > *current {
            *current = seq;
        }
    }

    /// Events with `system_id ∈ system_ids` and `seq > offsets[client][system_id]`,
    /// sorted ascending by `seq`; advances offsets to the max seq seen per system
    /// (§4.G).
    pub fn fetch(&self, client_id: &str, system_ids: &[u32]) -> Vec<Event> {
        let mut collected = Vec::new();
        let mut max_seq_per_system: HashMap<u32, u64> = HashMap::new();

        for &system_id in system_ids {
            let since = self.client_offset(client_id, system_id);
            let log = self.system_log(system_id);
            let log = log.lock().unwrap();
            for (&seq, event) in log.range((since + 1)..) {
                collected.push(event.clone());
                max_seq_per_system.entry(system_id).and_modify(|m| *m = (*m).max(seq)).or_insert(seq);
            }
        }

        collected.sort_by_key(|e| e.seq);
        for (system_id, max_seq) in max_seq_per_system {
            self.advance_offset(client_id, system_id, max_seq);
        }
        collected
    }

    /// The single event with the smallest `seq` across the filter; advances only that
    /// system's offset (§4.G).
    pub fn fetch_one(&self, client_id: &str, system_ids: &[u32]) -> Option<Event> {
        let mut best: Option<Event> = None;
        for &system_id in system_ids {
            let since = self.client_offset(client_id, system_id);
            let log = self.system_log(system_id);
            let log = log.lock().unwrap();
            if let Some((_, event)) = log.range((since + 1)..).next() {
                if best.as_ref().map_or(true, |b| event.seq < b.seq) {
                    best = Some(event.clone());
                }
            }
        }
        if let Some(event) = &best {
            self.advance_offset(client_id, event.system_id, event.seq);
        }
        best
    }

    /// Deletes events with `seq ≤ min(offsets)` across every registered client. With no
    /// clients registered, no deletion occurs — prevents data loss before any
    /// subscriber exists (§4.G).
    pub fn gc(&self) {
        let min_offset = {
            let offsets = self.offsets.lock().unwrap();
            if offsets.is_empty() {
                return;
            }
            offsets.values().flat_map(|by_system| by_system.values().copied()).min()
        };
        let Some(min_offset) = min_offset else { return };

        let systems: Vec<PerSystemLog> = self.systems.lock().unwrap().values().cloned().collect();
        for log in systems {
            log.lock().unwrap().retain(|&seq, _| seq > min_offset);
        }
    }

    /// The `limit` most recently inserted killmails for `system_id`, newest first
    /// (`GET /system_killmails/:system_id`, §6).
    pub fn recent(&self, system_id: u32, limit: usize) -> Vec<EnrichedKillmail> {
        let log = self.system_log(system_id);
        let log = log.lock().unwrap();
        log.values().rev().take(limit).map(|event| event.killmail.clone()).collect()
    }

    /// Linear scan for the killmail with this id, for `GET /killmail/:id` (§6). Bounded
    /// by the event log's own GC watermark, not indexed separately.
    pub fn find_by_killmail_id(&self, killmail_id: u64) -> Option<EnrichedKillmail> {
        let systems = self.systems.lock().unwrap();
        for log in systems.values() {
            let log = log.lock().unwrap();
            if let Some(event) = log.values().find(|e| e.killmail.id == killmail_id) {
                return Some(event.killmail.clone());
            }
        }
        None
    }

    pub fn snapshot(&self) -> EventStoreSnapshot {
        let systems = self.systems.lock().unwrap();
        let mut total_events = 0usize;
        let mut min_seq: Option<u64> = None;
        let mut max_seq: Option<u64> = None;
        for log in systems.values() {
            let log = log.lock().unwrap();
            total_events += log.len();
            if let Some((&first, _)) = log.iter().next() {
                min_seq = Some(min_seq.map_or(first, |m| m.min(first)));
            }
            if let Some((&last, _)) = log.iter().next_back() {
                max_seq = Some(max_seq.map_or(last, |m| m.max(last)));
            }
        }
        EventStoreSnapshot { total_events, min_seq, max_seq, active_systems: systems.len() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CombatantRef, EntityKind, ResolvedCombatant, ValueSummary, ZkbMeta};
    use chrono::Utc;

    fn sample_killmail(id: u64) -> EnrichedKillmail {
        EnrichedKillmail {
            id,
            time: Utc::now(),
            system_id: 30000142,
            system_name: Some("Jita".into()),
            victim: CombatantRef::default(),
            victim_resolved: ResolvedCombatant::default(),
            attackers: vec![],
            attackers_resolved: vec![],
            value: ValueSummary::default(),
            zkb: ZkbMeta {
                hash: "h".into(),
                location_id: None,
                total_value: None,
                points: None,
                npc: None,
                solo: None,
                awox: None,
            },
        }
    }

    #[test]
    fn insert_assigns_strictly_increasing_seq() {
        let store = EventStore::new();
        let a = store.insert(30000142, sample_killmail(1), Utc::now());
        let b = store.insert(30000142, sample_killmail(2), Utc::now());
        assert!(b > a);
    }

    #[test]
    fn fetch_returns_only_new_events_and_advances_offset() {
        let store = EventStore::new();
        store.insert(30000142, sample_killmail(1), Utc::now());
        store.insert(30000142, sample_killmail(2), Utc::now());

        let first_fetch = store.fetch("client-a", &[30000142]);
        assert_eq!(first_fetch.len(), 2);

        store.insert(30000142, sample_killmail(3), Utc::now());
        let second_fetch = store.fetch("client-a", &[30000142]);
        assert_eq!(second_fetch.len(), 1);
        assert_eq!(second_fetch[0].killmail.id, 3);
    }

    #[test]
    fn fetch_one_returns_smallest_seq_and_advances_only_that_system() {
        let store = EventStore::new();
        store.insert(1, sample_killmail(1), Utc::now());
        store.insert(2, sample_killmail(2), Utc::now());

        let event = store.fetch_one("client-a", &[1, 2]).expect("one event");
        assert_eq!(event.system_id, 1);

        // system 2's offset must be untouched: fetching again still returns it.
        let next = store.fetch_one("client-a", &[2]).expect("system 2 event");
        assert_eq!(next.system_id, 2);
    }

    #[test]
    fn gc_is_noop_with_no_clients() {
        let store = EventStore::new();
        store.insert(30000142, sample_killmail(1), Utc::now());
        store.gc();
        assert_eq!(store.snapshot().total_events, 1);
    }

    #[test]
    fn gc_deletes_up_to_min_offset_across_clients() {
        let store = EventStore::new();
        store.insert(30000142, sample_killmail(1), Utc::now());
        store.insert(30000142, sample_killmail(2), Utc::now());
        store.insert(30000142, sample_killmail(3), Utc::now());

        // client-a consumes everything; client-b hasn't read anything yet.
        store.fetch("client-a", &[30000142]);
        store.advance_offset_for_test("client-b", 30000142, 0);

        store.gc();
        assert_eq!(store.snapshot().total_events, 3, "min offset is 0, nothing should be collected");

        store.fetch("client-b", &[30000142]);
        store.gc();
        assert_eq!(store.snapshot().total_events, 0);
    }

    impl EventStore {
        fn advance_offset_for_test(&self, client_id: &str, system_id: u32, seq: u64) {
            let mut offsets = self.offsets.lock().unwrap();
            offsets.entry(client_id.to_string()).or_default().entry(system_id).or_insert(seq);
        }
    }

    #[test]
    fn recent_returns_newest_first_bounded_by_limit() {
        let store = EventStore::new();
        store.insert(30000142, sample_killmail(1), Utc::now());
        store.insert(30000142, sample_killmail(2), Utc::now());
        store.insert(30000142, sample_killmail(3), Utc::now());

        let recent = store.recent(30000142, 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, 3);
        assert_eq!(recent[1].id, 2);
    }

    #[test]
    fn recent_on_unknown_system_is_empty() {
        let store = EventStore::new();
        assert!(store.recent(999, 10).is_empty());
    }

    #[test]
    fn find_by_killmail_id_scans_all_systems() {
        let store = EventStore::new();
        store.insert(1, sample_killmail(1), Utc::now());
        store.insert(2, sample_killmail(2), Utc::now());

        let found = store.find_by_killmail_id(2).expect("present");
        assert_eq!(found.id, 2);
        assert!(store.find_by_killmail_id(404).is_none());
    }

    #[test]
    fn snapshot_reports_min_max_seq_and_active_systems() {
        let store = EventStore::new();
        store.insert(1, sample_killmail(1), Utc::now());
        store.insert(1, sample_killmail(2), Utc::now());
        store.insert(2, sample_killmail(3), Utc::now());

        let snap = store.snapshot();
        assert_eq!(snap.total_events, 3);
        assert_eq!(snap.min_seq, Some(1));
        assert_eq!(snap.max_seq, Some(3));
        assert_eq!(snap.active_systems, 2);
    }

    #[test]
    fn insert_enforces_soft_cap_with_no_clients() {
        let store = EventStore::new().with_max_events_per_system(3);
        for id in 1..=5u64 {
            store.insert(30000142, sample_killmail(id), Utc::now());
        }

        let recent = store.recent(30000142, 10);
        assert_eq!(recent.len(), 3, "oldest events should have been force-collected");
        assert_eq!(recent[0].id, 5);
        assert_eq!(recent[2].id, 3);
    }

    #[test]
    fn insert_soft_cap_only_affects_the_offending_system() {
        let store = EventStore::new().with_max_events_per_system(2);
        for id in 1..=4u64 {
            store.insert(1, sample_killmail(id), Utc::now());
        }
        store.insert(2, sample_killmail(100), Utc::now());

        assert_eq!(store.recent(1, 10).len(), 2);
        assert_eq!(store.recent(2, 10).len(), 1);
    }
}
