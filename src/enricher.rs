//! Transforms a raw killmail into an enriched one by resolving entity names (§4.H).

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::cache::Cache;
use crate::http_client::HttpClient;
use crate::models::{
    Attacker, CombatantRef, EnrichedKillmail, EntityKind, RawKillmail, ResolvedAttacker,
    ResolvedCombatant, ResolvedName, ValueSummary,
};
use crate::rate_limit::ENRICHMENT_SOURCE;
use crate::telemetry::sinks::emit_best_effort;
use crate::telemetry::{EnrichmentEvent, NullSink, TelemetrySink};

/// Seam for the out-of-scope CSV-backed static reference bootstrap (§1, §4.H):
/// callers may plug in a CSV-backed implementation; the core ships [`NoStaticNames`],
/// which always misses, proving the seam without importing CSV parsing itself.
pub trait StaticNameLookup: Send + Sync {
    fn lookup(&self, kind: EntityKind, id: u64) -> Option<String>;
}

/// Default [`StaticNameLookup`]: always misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStaticNames;

impl StaticNameLookup for NoStaticNames {
    fn lookup(&self, _kind: EntityKind, _id: u64) -> Option<String> {
        None
    }
}

/// Transforms raw killmails into enriched ones (§4.H). Cheaply cloneable.
#[derive(Clone)]
pub struct Enricher<S: TelemetrySink = NullSink> {
    cache: Cache,
    http: HttpClient<S>,
    entity_api_base: String,
    min_attackers_for_parallel: usize,
    enricher_max_concurrency: usize,
    enricher_task_timeout: Duration,
    static_names: Arc<dyn StaticNameLookup>,
    sink: S,
}

impl<S: TelemetrySink> Enricher<S> {
    pub fn new(
        cache: Cache,
        http: HttpClient<S>,
        entity_api_base: impl Into<String>,
        min_attackers_for_parallel: usize,
        enricher_max_concurrency: usize,
        enricher_task_timeout: Duration,
        sink: S,
    ) -> Self {
        Self {
            cache,
            http,
            entity_api_base: entity_api_base.into(),
            min_attackers_for_parallel,
            enricher_max_concurrency,
            enricher_task_timeout,
            static_names: Arc::new(NoStaticNames),
            sink,
        }
    }

    /// Plug in a static-data fallback (e.g. CSV-backed) for when the HTTP/cache
    /// path degrades a name to "unknown" (§4.H [EXPANDED]).
    pub fn with_static_names(mut self, lookup: Arc<dyn StaticNameLookup>) -> Self {
        self.static_names = lookup;
        self
    }

    /// Resolve one entity reference, degrading to the static fallback (then `None`)
    /// on any cache/HTTP/timeout failure — never propagated as a hard error (§4.H).
    async fn resolve(&self, kind: EntityKind, id: u64) -> ResolvedName {
        let ns = kind.cache_namespace();
        let key = id.to_string();
        let entity_api_base = self.entity_api_base.clone();
        let http = self.http.clone();
        let fetch = move || {
            let http = http.clone();
            let url = format!("{entity_api_base}/{ns}/{id}");
            async move {
                http.get_json::<serde_json::Value>(ENRICHMENT_SOURCE, &url)
                    .await
                    .map_err(|e| e.to_string())
            }
        };

        let fetched =
            tokio::time::timeout(self.enricher_task_timeout, self.cache.get_or_fetch(ns, &key, fetch))
                .await;

        let name = match fetched {
            Ok(Ok(value)) => value.get("name").and_then(|v| v.as_str()).map(str::to_string),
            _ => None,
        };

        match name {
            Some(name) => {
                emit_best_effort(
                    self.sink.clone(),
                    EnrichmentEvent::EntityResolved { namespace: ns.to_string(), id }.into(),
                )
                .await;
                Some(name)
            }
            None => {
                emit_best_effort(
                    self.sink.clone(),
                    EnrichmentEvent::EntityDegraded { namespace: ns.to_string(), id }.into(),
                )
                .await;
                self.static_names.lookup(kind, id)
            }
        }
    }

    async fn maybe_resolve(&self, kind: EntityKind, id: Option<u64>) -> ResolvedName {
        match id {
            Some(id) => self.resolve(kind, id).await,
            None => None,
        }
    }

    async fn resolve_combatant(&self, combatant: &CombatantRef) -> ResolvedCombatant {
        let (character_name, corporation_name, alliance_name, ship_type_name) = tokio::join!(
            self.maybe_resolve(EntityKind::Character, combatant.character_id),
            self.maybe_resolve(EntityKind::Corporation, combatant.corporation_id),
            self.maybe_resolve(EntityKind::Alliance, combatant.alliance_id),
            self.maybe_resolve(EntityKind::ShipType, combatant.ship_type_id),
        );
        ResolvedCombatant { character_name, corporation_name, alliance_name, ship_type_name }
    }

    async fn resolve_attacker(&self, attacker: &Attacker) -> ResolvedAttacker {
        // Weapon types share the same EVE item-type namespace as ship hulls.
        let (resolved, weapon_type_name) = tokio::join!(
            self.resolve_combatant(&attacker.combatant),
            self.maybe_resolve(EntityKind::ShipType, attacker.weapon_type_id),
        );
        ResolvedAttacker { resolved, weapon_type_name, final_blow: attacker.final_blow }
    }

    /// Builds a new enriched record without mutating `raw` (§4.H step 4).
    pub async fn enrich(&self, raw: RawKillmail) -> EnrichedKillmail {
        let (system_name, victim_resolved) = tokio::join!(
            self.maybe_resolve(EntityKind::SolarSystem, Some(raw.system_id as u64)),
            self.resolve_combatant(&raw.victim),
        );

        // Only fan out with bounded concurrency once there are enough attackers
        // to make it worthwhile (§4.H step 3); otherwise resolve one at a time.
        let concurrency = if raw.attackers.len() > self.min_attackers_for_parallel {
            self.enricher_max_concurrency.max(1)
        } else {
            1
        };
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let attacker_futures = raw.attackers.iter().map(|attacker| {
            let this = self.clone();
            let semaphore = semaphore.clone();
            let attacker = attacker.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                this.resolve_attacker(&attacker).await
            }
        });
        let attackers_resolved = join_all(attacker_futures).await;

        if system_name.is_none()
            && victim_resolved == ResolvedCombatant::default()
            && attackers_resolved.iter().all(|a| a.resolved == ResolvedCombatant::default())
        {
            emit_best_effort(
                self.sink.clone(),
                EnrichmentEvent::KillmailDegraded { killmail_id: raw.id }.into(),
            )
            .await;
        }

        EnrichedKillmail {
            id: raw.id,
            time: raw.time,
            system_id: raw.system_id,
            system_name,
            victim: raw.victim,
            victim_resolved,
            attackers: raw.attackers,
            attackers_resolved,
            value: ValueSummary { total_value: raw.zkb.total_value.unwrap_or(0.0) },
            zkb: raw.zkb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker_registry::CircuitBreakerRegistry;
    use crate::clock::MonotonicClock;
    use crate::config::Config;
    use crate::models::ZkbMeta;
    use crate::rate_limit::RateLimiterRegistry;

    fn sample_raw(id: u64, attacker_count: usize) -> RawKillmail {
        RawKillmail {
            id,
            time: chrono::Utc::now(),
            system_id: 30000142,
            victim: CombatantRef {
                character_id: Some(1),
                corporation_id: Some(2),
                alliance_id: None,
                ship_type_id: Some(3),
            },
            attackers: (0..attacker_count)
                .map(|i| Attacker {
                    combatant: CombatantRef {
                        character_id: Some(100 + i as u64),
                        corporation_id: None,
                        alliance_id: None,
                        ship_type_id: None,
                    },
                    weapon_type_id: None,
                    final_blow: i == 0,
                })
                .collect(),
            zkb: ZkbMeta {
                hash: "abc".into(),
                location_id: None,
                total_value: Some(1_000_000.0),
                points: None,
                npc: None,
                solo: None,
                awox: None,
            },
        }
    }

    fn enricher() -> Enricher<NullSink> {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let cache = Cache::new(clock);
        let config = Config::default();
        let http = HttpClient::new(&config, RateLimiterRegistry::new(), CircuitBreakerRegistry::default());
        Enricher::new(
            cache,
            http,
            "http://127.0.0.1:1/entities",
            config.min_attackers_for_parallel,
            config.enricher_max_concurrency,
            Duration::from_millis(50),
            NullSink,
        )
    }

    #[tokio::test]
    async fn enrich_preserves_killmail_id_and_zkb() {
        let raw = sample_raw(7, 1);
        let enriched = enricher().enrich(raw.clone()).await;
        assert_eq!(enriched.id, raw.id);
        assert_eq!(enriched.zkb, raw.zkb);
        assert_eq!(enriched.value.total_value, 1_000_000.0);
    }

    #[tokio::test]
    async fn enrich_degrades_to_none_when_everything_fails() {
        // Every entity lookup hits an unroutable address and times out almost
        // instantly, so every field should degrade to None rather than error.
        let raw = sample_raw(1, 1);
        let enriched = enricher().enrich(raw).await;
        assert!(enriched.system_name.is_none());
        assert!(enriched.victim_resolved.character_name.is_none());
    }

    #[tokio::test]
    async fn enrich_preserves_attacker_order() {
        let raw = sample_raw(1, 5);
        let enriched = enricher().enrich(raw.clone()).await;
        assert_eq!(enriched.attackers_resolved.len(), 5);
        assert_eq!(enriched.attackers.len(), raw.attackers.len());
        assert!(enriched.attackers[0].final_blow);
    }

    #[tokio::test]
    async fn enrich_does_not_mutate_input_semantics() {
        let raw = sample_raw(1, 1);
        let raw_clone = raw.clone();
        let enriched = enricher().enrich(raw).await;
        assert_eq!(enriched.victim, raw_clone.victim);
        assert_eq!(enriched.attackers, raw_clone.attackers);
    }

    #[test]
    fn no_static_names_always_misses() {
        assert_eq!(NoStaticNames.lookup(EntityKind::Character, 1), None);
    }
}
