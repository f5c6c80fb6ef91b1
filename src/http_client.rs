//! Rate-limited, circuit-broken, retrying HTTP GET client (§4.E).
//!
//! Every call first `try_acquire`s the service's rate-limit bucket (a manual
//! pre-check, not a stack layer), then runs the request inside the service's
//! circuit breaker, then applies retry. Telemetry is emitted through a
//! pluggable [`TelemetrySink`] rather than printed directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::backoff::Backoff;
use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::config::Config;
use crate::error::{PipelineError, ResilienceError};
use crate::jitter::Jitter;
use crate::rate_limit::RateLimiterRegistry;
use crate::retry::RetryPolicy;
use crate::telemetry::sinks::emit_best_effort;
use crate::telemetry::{
    NullSink, PolicyEvent, RateLimitEvent, RequestOutcome, TelemetrySink,
};

/// Rate-limited, circuit-broken, retrying JSON GET client (§4.E).
///
/// One [`HttpClient`] is shared across the Enricher (H), Historical Backfill
/// (L), and Ingest Worker (I); each call site passes its own `service` id so
/// rate limits and breaker state stay per-service (§4.B, §4.C).
#[derive(Clone)]
pub struct HttpClient<S: TelemetrySink = NullSink> {
    http: Client,
    rate_limiters: RateLimiterRegistry,
    breaker_registry: CircuitBreakerRegistry,
    breakers: Arc<Mutex<HashMap<String, CircuitBreakerPolicy>>>,
    breaker_threshold: usize,
    breaker_cooldown: Duration,
    retry: RetryPolicy<PipelineError>,
    sink: S,
}

impl HttpClient<NullSink> {
    /// Build a client with no telemetry sink attached.
    pub fn new(
        config: &Config,
        rate_limiters: RateLimiterRegistry,
        breaker_registry: CircuitBreakerRegistry,
    ) -> Self {
        Self::with_sink(config, rate_limiters, breaker_registry, NullSink)
    }
}

impl<S: TelemetrySink> HttpClient<S> {
    pub fn with_sink(
        config: &Config,
        rate_limiters: RateLimiterRegistry,
        breaker_registry: CircuitBreakerRegistry,
        sink: S,
    ) -> Self {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .expect("reqwest client configuration is always valid");

        let retry = RetryPolicy::builder()
            .max_attempts(3)
            .expect("3 > 0")
            .backoff(Backoff::exponential(Duration::from_secs(1)))
            .with_jitter(Jitter::full())
            .should_retry(PipelineError::is_retryable)
            .build();

        Self {
            http,
            rate_limiters,
            breaker_registry,
            breakers: Arc::new(Mutex::new(HashMap::new())),
            breaker_threshold: config.breaker_threshold,
            breaker_cooldown: config.breaker_cooldown,
            retry,
            sink,
        }
    }

    /// Lazily create and register a breaker for `service`, sharing state with
    /// the registry handed out at construction so admin ops see it (§4.C).
    fn breaker_for(&self, service: &str) -> CircuitBreakerPolicy {
        let mut breakers = self.breakers.lock().unwrap();
        if let Some(policy) = breakers.get(service) {
            return policy.clone();
        }
        let policy = CircuitBreakerPolicy::new(self.breaker_threshold, self.breaker_cooldown);
        self.breaker_registry.register_policy(service.to_string(), &policy);
        breakers.insert(service.to_string(), policy.clone());
        policy
    }

    /// `GET <url>` against `service`'s bucket/breaker, decoded as JSON (§4.E).
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        service: &str,
        url: &str,
    ) -> Result<T, PipelineError> {
        match self.rate_limiters.try_acquire(service) {
            Ok(Ok(())) => {
                let remaining = self
                    .rate_limiters
                    .get(service)
                    .map(|l| l.available())
                    .unwrap_or_default();
                emit_best_effort(
                    self.sink.clone(),
                    PolicyEvent::RateLimit(RateLimitEvent::Acquired {
                        service: service.to_string(),
                        remaining,
                    })
                    .into(),
                )
                .await;
            }
            Ok(Err(limited)) => {
                emit_best_effort(
                    self.sink.clone(),
                    PolicyEvent::RateLimit(RateLimitEvent::Denied {
                        service: service.to_string(),
                        wait: limited.retry_after,
                    })
                    .into(),
                )
                .await;
                return Err(PipelineError::RateLimited {
                    service: service.to_string(),
                    retry_after: limited.retry_after,
                });
            }
            // No bucket registered for this service: proceed unthrottled.
            Err(_) => {}
        }

        let breaker = self.breaker_for(service);
        let http = self.http.clone();
        let url = url.to_string();
        let start = Instant::now();

        let outcome = self
            .retry
            .execute(|| {
                let breaker = breaker.clone();
                let http = http.clone();
                let url = url.clone();
                async move {
                    breaker
                        .execute(|| {
                            let http = http.clone();
                            let url = url.clone();
                            async move { fetch_json_once::<T>(&http, &url).await.map_err(ResilienceError::Inner) }
                        })
                        .await
                }
            })
            .await;

        let duration = start.elapsed();
        let result = resolve_outcome(service, outcome);
        emit_best_effort(
            self.sink.clone(),
            PolicyEvent::Request(if result.is_ok() {
                RequestOutcome::Success { duration }
            } else {
                RequestOutcome::Failure { duration }
            })
            .into(),
        )
        .await;
        result
    }
}

fn resolve_outcome<T>(
    service: &str,
    outcome: Result<T, ResilienceError<PipelineError>>,
) -> Result<T, PipelineError> {
    match outcome {
        Ok(value) => Ok(value),
        Err(ResilienceError::CircuitOpen { failure_count, .. }) => {
            Err(PipelineError::CircuitOpen { service: service.to_string(), failure_count })
        }
        Err(ResilienceError::RetryExhausted { attempts, failures }) => {
            let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
            Err(PipelineError::MaxRetriesExceeded { attempts, last })
        }
        Err(ResilienceError::Inner(e)) => Err(e),
        Err(ResilienceError::Timeout { .. }) | Err(ResilienceError::Bulkhead { .. }) => {
            unreachable!("http_client's stack uses only retry + circuit breaker")
        }
    }
}

async fn fetch_json_once<T: DeserializeOwned>(
    http: &Client,
    url: &str,
) -> Result<T, PipelineError> {
    let response = http.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(PipelineError::HttpStatus { status: status.as_u16(), url: url.to_string() });
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(PipelineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;

    fn test_config() -> Config {
        Config::default()
    }

    #[tokio::test]
    async fn rate_limit_denial_short_circuits_before_any_request() {
        let rate_limiters = RateLimiterRegistry::new();
        rate_limiters.register(
            "test-service",
            crate::rate_limit::RateLimiter::new(0, 10, Arc::new(MonotonicClock::default())),
        );
        let breakers = CircuitBreakerRegistry::default();
        let client = HttpClient::new(&test_config(), rate_limiters, breakers);

        let result = client.get_json::<serde_json::Value>("test-service", "http://127.0.0.1:1/x").await;
        assert!(matches!(result, Err(PipelineError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn unregistered_service_proceeds_without_rate_limiting() {
        let rate_limiters = RateLimiterRegistry::new();
        let breakers = CircuitBreakerRegistry::default();
        let client = HttpClient::new(&test_config(), rate_limiters, breakers);

        // No bucket registered for "unknown-service"; the request still attempts
        // the network call (and fails with a transport error against this
        // unroutable address, not a RateLimited error).
        let result =
            client.get_json::<serde_json::Value>("unknown-service", "http://127.0.0.1:1/x").await;
        assert!(!matches!(result, Err(PipelineError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn breaker_is_registered_under_the_service_name() {
        let rate_limiters = RateLimiterRegistry::new();
        let breakers = CircuitBreakerRegistry::default();
        let client = HttpClient::new(&test_config(), rate_limiters, breakers.clone());

        let _ = client.get_json::<serde_json::Value>("some-service", "http://127.0.0.1:1/x").await;
        assert!(breakers.get("some-service").is_some());
    }
}
