//! Core data model (§3): killmails, entities, events, and subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A single combatant reference as it appears on a raw killmail (victim or attacker).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CombatantRef {
    pub character_id: Option<u64>,
    pub corporation_id: Option<u64>,
    pub alliance_id: Option<u64>,
    pub ship_type_id: Option<u64>,
}

/// An attacker entry: a [`CombatantRef`] plus weapon and final-blow flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attacker {
    #[serde(flatten)]
    pub combatant: CombatantRef,
    pub weapon_type_id: Option<u64>,
    pub final_blow: bool,
}

/// The zkillboard-style opaque metadata map carried verbatim end-to-end (§3, Open
/// Question resolved in favor of preserving these flags as-is).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZkbMeta {
    pub hash: String,
    #[serde(rename = "locationID")]
    pub location_id: Option<u64>,
    #[serde(rename = "totalValue")]
    pub total_value: Option<f64>,
    pub points: Option<u32>,
    pub npc: Option<bool>,
    pub solo: Option<bool>,
    pub awox: Option<bool>,
}

/// Feed payload as received from the external source, before enrichment (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawKillmail {
    pub id: u64,
    pub time: DateTime<Utc>,
    pub system_id: u32,
    pub victim: CombatantRef,
    pub attackers: Vec<Attacker>,
    pub zkb: ZkbMeta,
}

/// Value summary attached to an enriched killmail. The core never prices items itself;
/// `total_value` is `zkb.totalValue` verbatim, or `0.0` when absent (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ValueSummary {
    pub total_value: f64,
}

/// A resolved name for one entity reference, or `None` when enrichment degraded it to
/// "unknown" (§4.H failure policy).
pub type ResolvedName = Option<String>;

/// Victim/attacker entity references resolved to display names, parallel in shape to
/// the raw references they were built from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResolvedCombatant {
    pub character_name: ResolvedName,
    pub corporation_name: ResolvedName,
    pub alliance_name: ResolvedName,
    pub ship_type_name: ResolvedName,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedAttacker {
    #[serde(flatten)]
    pub resolved: ResolvedCombatant,
    pub weapon_type_name: ResolvedName,
    pub final_blow: bool,
}

/// Raw + resolved entity names/types for victim and attackers, plus a value summary
/// (§3). `enriched.id == raw.id` always; enriching twice yields the same record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichedKillmail {
    pub id: u64,
    pub time: DateTime<Utc>,
    pub system_id: u32,
    pub system_name: ResolvedName,
    pub victim: CombatantRef,
    pub victim_resolved: ResolvedCombatant,
    pub attackers: Vec<Attacker>,
    pub attackers_resolved: Vec<ResolvedAttacker>,
    pub value: ValueSummary,
    pub zkb: ZkbMeta,
}

/// Tagged union of entity kinds the Enrichment Cache resolves names for (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Character,
    Corporation,
    Alliance,
    ShipType,
    Group,
    SolarSystem,
}

impl EntityKind {
    /// Cache namespace this entity kind lives under (§4.F).
    pub fn cache_namespace(self) -> &'static str {
        match self {
            EntityKind::Character => "characters",
            EntityKind::Corporation => "corporations",
            EntityKind::Alliance => "alliances",
            EntityKind::ShipType => "ship_types",
            EntityKind::Group => "groups",
            EntityKind::SolarSystem => "systems",
        }
    }
}

/// A resolved entity, keyed by `(kind, id)`; attributes beyond `name` are opaque (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub kind: EntityKind,
    pub id: u64,
    pub name: Option<String>,
    #[serde(flatten)]
    pub attributes: HashMap<String, serde_json::Value>,
}

/// An inserted, immutable record in the Event Store (§3, §4.G).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub seq: u64,
    pub system_id: u32,
    pub killmail: EnrichedKillmail,
    pub inserted_at: DateTime<Utc>,
}

/// Historical-backfill parameters attached to a subscription (§4.L).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackfillConfig {
    pub enabled: bool,
    pub limit_per_system: usize,
    pub since_hours: u64,
    pub delivery_batch_size: usize,
    pub delivery_interval_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit_per_system: 100,
            since_hours: 168,
            delivery_batch_size: 10,
            delivery_interval_ms: 1000,
        }
    }
}

/// A registered subscription (§3, §4.J). Exactly one of `has_channel`/`callback_url`
/// must be reachable; enforced by the registry at `subscribe` time, not here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub sub_id: String,
    pub subscriber_id: String,
    pub system_ids: HashSet<u32>,
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub backfill: BackfillConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_maps_to_cache_namespace() {
        assert_eq!(EntityKind::Character.cache_namespace(), "characters");
        assert_eq!(EntityKind::SolarSystem.cache_namespace(), "systems");
    }

    #[test]
    fn raw_killmail_round_trips_through_json() {
        let raw = RawKillmail {
            id: 1,
            time: Utc::now(),
            system_id: 30000142,
            victim: CombatantRef {
                character_id: Some(1),
                corporation_id: Some(2),
                alliance_id: None,
                ship_type_id: Some(3),
            },
            attackers: vec![Attacker {
                combatant: CombatantRef {
                    character_id: Some(4),
                    corporation_id: Some(5),
                    alliance_id: None,
                    ship_type_id: Some(6),
                },
                weapon_type_id: Some(7),
                final_blow: true,
            }],
            zkb: ZkbMeta {
                hash: "abc".into(),
                location_id: Some(1),
                total_value: Some(1_000_000.0),
                points: Some(1),
                npc: Some(false),
                solo: Some(true),
                awox: Some(false),
            },
        };

        let json = serde_json::to_string(&raw).expect("serialize");
        let back: RawKillmail = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(raw, back);
    }

    #[test]
    fn value_summary_defaults_to_zero() {
        assert_eq!(ValueSummary::default().total_value, 0.0);
    }
}
