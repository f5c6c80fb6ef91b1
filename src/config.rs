//! Typed configuration surface (§6) and `ConfigBuilder`/`from_env()` loader (§4.A [AMBIENT]).

use std::time::Duration;

/// Frozen set of tunables loaded once at startup and passed by value (§4.A).
#[derive(Debug, Clone)]
pub struct Config {
    pub cutoff: Duration,
    pub fast_interval: Duration,
    pub idle_interval: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: u32,
    pub enricher_max_concurrency: usize,
    pub enricher_task_timeout: Duration,
    pub min_attackers_for_parallel: usize,
    pub gc_interval: Duration,
    pub max_events_per_system: usize,
    pub feed_rl_capacity: u32,
    pub feed_rl_refill_per_min: u32,
    pub enrich_rl_capacity: u32,
    pub enrich_rl_refill_per_min: u32,
    pub breaker_threshold: usize,
    pub breaker_cooldown: Duration,
    pub max_subscribed_systems: usize,
    pub max_system_id: u64,
    pub backfill_max_concurrent: usize,
    pub status_poll_interval: Duration,
    pub feed_url: String,
    pub entity_api_base: String,
    pub historical_feed_url: String,
    pub legacy_killmail_base: String,
    pub user_agent: String,
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cutoff: Duration::from_secs(3600),
            fast_interval: Duration::from_millis(1000),
            idle_interval: Duration::from_millis(5000),
            max_backoff: Duration::from_millis(30_000),
            backoff_factor: 2,
            enricher_max_concurrency: 10,
            enricher_task_timeout: Duration::from_secs(30),
            min_attackers_for_parallel: 3,
            gc_interval: Duration::from_millis(60_000),
            max_events_per_system: 10_000,
            feed_rl_capacity: 10,
            feed_rl_refill_per_min: 10,
            enrich_rl_capacity: 100,
            enrich_rl_refill_per_min: 100,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            max_subscribed_systems: 100,
            max_system_id: 40_000_000,
            backfill_max_concurrent: 3,
            status_poll_interval: Duration::from_secs(300),
            feed_url: "https://zkillboard.example/listener.php".to_string(),
            entity_api_base: "https://esi.example".to_string(),
            historical_feed_url: "https://zkillboard.example/api/history".to_string(),
            legacy_killmail_base: "https://zkillboard.example/api/killmails".to_string(),
            user_agent: format!("killfeed-core/{}", env!("CARGO_PKG_VERSION")),
            bind_addr: "0.0.0.0:4000".to_string(),
        }
    }
}

/// Errors raised while loading configuration from the environment.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Builder for [`Config`]; every setter is infallible, `from_env` is the only fallible entry point.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self { config: Config::default() }
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cutoff(mut self, d: Duration) -> Self {
        self.config.cutoff = d;
        self
    }

    pub fn fast_interval(mut self, d: Duration) -> Self {
        self.config.fast_interval = d;
        self
    }

    pub fn idle_interval(mut self, d: Duration) -> Self {
        self.config.idle_interval = d;
        self
    }

    pub fn feed_url(mut self, url: impl Into<String>) -> Self {
        self.config.feed_url = url.into();
        self
    }

    pub fn entity_api_base(mut self, url: impl Into<String>) -> Self {
        self.config.entity_api_base = url.into();
        self
    }

    pub fn historical_feed_url(mut self, url: impl Into<String>) -> Self {
        self.config.historical_feed_url = url.into();
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

fn env_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue { key, value: v }),
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue { key, value: v }),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidValue { key, value: v }),
        Err(_) => Ok(default),
    }
}

fn env_string(key: &'static str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables named per §6, falling back to defaults.
    /// Never panics; invalid values produce [`ConfigError`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        Ok(Config {
            cutoff: env_u64("KILLFEED_CUTOFF_SECONDS", defaults.cutoff.as_secs())
                .map(Duration::from_secs)?,
            fast_interval: env_millis("KILLFEED_FAST_INTERVAL_MS", defaults.fast_interval)?,
            idle_interval: env_millis("KILLFEED_IDLE_INTERVAL_MS", defaults.idle_interval)?,
            max_backoff: env_millis("KILLFEED_MAX_BACKOFF_MS", defaults.max_backoff)?,
            backoff_factor: env_u32("KILLFEED_BACKOFF_FACTOR", defaults.backoff_factor)?,
            enricher_max_concurrency: env_u64(
                "KILLFEED_ENRICHER_MAX_CONCURRENCY",
                defaults.enricher_max_concurrency as u64,
            )? as usize,
            enricher_task_timeout: defaults.enricher_task_timeout,
            min_attackers_for_parallel: defaults.min_attackers_for_parallel,
            gc_interval: env_millis("KILLFEED_GC_INTERVAL_MS", defaults.gc_interval)?,
            max_events_per_system: env_u64(
                "KILLFEED_MAX_EVENTS_PER_SYSTEM",
                defaults.max_events_per_system as u64,
            )? as usize,
            feed_rl_capacity: env_u32("KILLFEED_FEED_RL_CAPACITY", defaults.feed_rl_capacity)?,
            feed_rl_refill_per_min: env_u32(
                "KILLFEED_FEED_RL_REFILL_PER_MIN",
                defaults.feed_rl_refill_per_min,
            )?,
            enrich_rl_capacity: env_u32(
                "KILLFEED_ENRICH_RL_CAPACITY",
                defaults.enrich_rl_capacity,
            )?,
            enrich_rl_refill_per_min: env_u32(
                "KILLFEED_ENRICH_RL_REFILL_PER_MIN",
                defaults.enrich_rl_refill_per_min,
            )?,
            breaker_threshold: env_u64("KILLFEED_BREAKER_THRESHOLD", defaults.breaker_threshold as u64)?
                as usize,
            breaker_cooldown: env_millis("KILLFEED_BREAKER_COOLDOWN_MS", defaults.breaker_cooldown)?,
            max_subscribed_systems: env_u64(
                "KILLFEED_MAX_SUBSCRIBED_SYSTEMS",
                defaults.max_subscribed_systems as u64,
            )? as usize,
            max_system_id: defaults.max_system_id,
            backfill_max_concurrent: env_u64(
                "KILLFEED_BACKFILL_MAX_CONCURRENT",
                defaults.backfill_max_concurrent as u64,
            )? as usize,
            status_poll_interval: defaults.status_poll_interval,
            feed_url: env_string("KILLFEED_FEED_URL", &defaults.feed_url),
            entity_api_base: env_string("KILLFEED_ENTITY_API_BASE", &defaults.entity_api_base),
            historical_feed_url: env_string(
                "KILLFEED_HISTORICAL_FEED_URL",
                &defaults.historical_feed_url,
            ),
            legacy_killmail_base: env_string(
                "KILLFEED_LEGACY_KILLMAIL_BASE",
                &defaults.legacy_killmail_base,
            ),
            user_agent: env_string("KILLFEED_USER_AGENT", &defaults.user_agent),
            bind_addr: env_string("KILLFEED_BIND_ADDR", &defaults.bind_addr),
        })
    }
}
