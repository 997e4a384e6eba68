//! Per-provider circuit breaker. `Open` providers are skipped until the
//! cooldown elapses, then exactly one half-open probe is admitted.

use conduit_core::ProviderId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

#[derive(Debug)]
struct ProviderCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
}

impl Default for ProviderCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            total_successes: 0,
            total_failures: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    circuits: DashMap<ProviderId, Mutex<ProviderCircuit>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    /// Whether traffic may be attempted against the provider right now.
    /// Transitions `Open → HalfOpen` once the cooldown has elapsed and
    /// admits a single probe in that state.
    pub fn admit(&self, provider: &ProviderId) -> bool {
        let entry = self
            .circuits
            .entry(provider.clone())
            .or_default();
        let mut circuit = entry.lock();
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_in_flight = true;
                    tracing::info!(%provider, "circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    false
                } else {
                    circuit.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self, provider: &ProviderId) {
        let entry = self.circuits.entry(provider.clone()).or_default();
        let mut circuit = entry.lock();
        if circuit.state != CircuitState::Closed {
            tracing::info!(%provider, "circuit closed");
        }
        circuit.state = CircuitState::Closed;
        circuit.consecutive_failures = 0;
        circuit.opened_at = None;
        circuit.probe_in_flight = false;
        circuit.total_successes += 1;
    }

    pub fn record_failure(&self, provider: &ProviderId) {
        let entry = self.circuits.entry(provider.clone()).or_default();
        let mut circuit = entry.lock();
        circuit.total_failures += 1;
        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Instant::now());
                circuit.probe_in_flight = false;
                tracing::warn!(%provider, "half-open probe failed, circuit re-opened");
            }
            _ => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Instant::now());
                    tracing::warn!(
                        %provider,
                        failures = circuit.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
        }
    }

    pub fn state(&self, provider: &ProviderId) -> CircuitState {
        self.circuits
            .get(provider)
            .map(|c| c.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Lifetime error fraction for the provider, for health gauges.
    pub fn error_rate(&self, provider: &ProviderId) -> f64 {
        self.circuits
            .get(provider)
            .map(|c| {
                let circuit = c.lock();
                let total = circuit.total_successes + circuit.total_failures;
                if total == 0 {
                    0.0
                } else {
                    circuit.total_failures as f64 / total as f64
                }
            })
            .unwrap_or(0.0)
    }
}
