//! Registry for managing named circuit breakers.
//!
//! Allows global access and control (reset/inspection) of circuit breakers by ID.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::circuit_breaker::{CircuitBreakerPolicy, CircuitBreakerState, CircuitState};

/// Handle to reset/query a circuit breaker instance.
#[derive(Clone, Debug)]
pub struct CircuitBreakerHandle {
    pub(crate) state: Arc<CircuitBreakerState>,
}

impl CircuitBreakerHandle {
    /// Reset the circuit breaker state to Closed, clearing failure counts.
    pub fn reset(&self) {
        self.state.reset();
    }

    /// Current breaker state.
    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    /// Admin operation: force the breaker open (§4.C).
    pub fn force_open(&self, now_millis: u64) {
        self.state.force_open(now_millis);
    }

    /// Admin operation: force the breaker closed (§4.C).
    pub fn force_close(&self) {
        self.state.force_close();
    }
}

/// Registry keyed by breaker id.
#[derive(Default, Clone, Debug)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<String, CircuitBreakerHandle>>>,
}

impl CircuitBreakerRegistry {
    /// Register a new circuit breaker handle with the given ID.
    /// If an entry already exists, it is overwritten.
    pub fn register(&self, id: String, handle: CircuitBreakerHandle) {
        self.inner.lock().unwrap().insert(id, handle);
    }

    /// Retrieve a handle to a registered circuit breaker by ID.
    pub fn get(&self, id: &str) -> Option<CircuitBreakerHandle> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    /// Reset a registered circuit breaker by ID.
    /// Returns error if the ID is not found.
    pub fn reset(&self, id: &str) -> Result<(), String> {
        if let Some(handle) = self.get(id) {
            handle.reset();
            Ok(())
        } else {
            Err(format!("breaker id not found: {id}"))
        }
    }

    /// Convenience: create and register a fresh state with the given id.
    pub fn register_new(&self, id: String) {
        let state = Arc::new(CircuitBreakerState::new());
        let handle = CircuitBreakerHandle { state };
        self.register(id, handle);
    }

    /// Register a breaker policy under `id`, sharing its underlying state so admin
    /// operations issued through the registry (`force_open`/`force_close`) and calls
    /// made through the policy observe the same state.
    pub fn register_policy(&self, id: String, policy: &CircuitBreakerPolicy) {
        self.register(id, policy.handle());
    }

    /// Admin operation (§4.C / status endpoint): force a breaker open by id.
    pub fn force_open(&self, id: &str, now_millis: u64) -> Result<(), String> {
        self.get(id)
            .map(|h| h.force_open(now_millis))
            .ok_or_else(|| format!("breaker id not found: {id}"))
    }

    /// Admin operation (§4.C / status endpoint): force a breaker closed by id.
    pub fn force_close(&self, id: &str) -> Result<(), String> {
        self.get(id).map(|h| h.force_close()).ok_or_else(|| format!("breaker id not found: {id}"))
    }

    /// Snapshot of all breaker states (id -> state), for the status endpoint (§4.M).
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().unwrap();
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
