//! Executes one health check under its timeout and circuit breaker.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use vigil_core::config::HealthCheckConfig;
use vigil_core::duration::{format_duration, MAX_DURATION};
use vigil_core::{epoch_secs, HealthStatus, MetaValue, Metadata};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::error::HealthResult;
use crate::probe::{Probe, ProbeContext, ProbeRegistry};

/// Static definition of a health check.
#[derive(Clone)]
pub struct HealthCheckDefinition {
    pub name: String,
    pub probe: Arc<dyn Probe>,
    pub timeout: Duration,
    pub enabled: bool,
    pub tags: BTreeMap<String, String>,
    pub failure_threshold: u32,
    pub breaker_timeout: Duration,
}

impl HealthCheckDefinition {
    pub fn new(name: &str, probe: Arc<dyn Probe>) -> Self {
        Self {
            name: name.to_string(),
            probe,
            timeout: Duration::from_secs(10),
            enabled: true,
            tags: BTreeMap::new(),
            failure_threshold: 5,
            breaker_timeout: Duration::from_secs(60),
        }
    }

    /// Resolve a config entry, building its probe from the registry.
    pub fn from_config(config: &HealthCheckConfig, registry: &ProbeRegistry) -> HealthResult<Self> {
        Ok(Self {
            name: config.name.clone(),
            probe: registry.build(&config.name, &config.probe)?,
            timeout: config.timeout()?,
            enabled: config.enabled,
            tags: config.tags.clone(),
            failure_threshold: config.failure_threshold,
            breaker_timeout: config.breaker_timeout()?,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_breaker(mut self, failure_threshold: u32, timeout: Duration) -> Self {
        self.failure_threshold = failure_threshold;
        self.breaker_timeout = timeout;
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub(crate) fn new_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(self.failure_threshold, self.breaker_timeout)
    }
}

impl std::fmt::Debug for HealthCheckDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckDefinition")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("enabled", &self.enabled)
            .field("tags", &self.tags)
            .field("failure_threshold", &self.failure_threshold)
            .field("breaker_timeout", &self.breaker_timeout)
            .finish_non_exhaustive()
    }
}

/// Why a result is critical without the probe saying so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The probe did not finish within its timeout.
    Timeout,
    /// The probe returned an error.
    ProbeError,
    /// The breaker was open; the probe was not called.
    CircuitOpen,
    /// The probe task panicked.
    Panicked,
}

/// Outcome of one check execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub latency_ms: f64,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
    pub metadata: Metadata,
    pub tags: BTreeMap<String, String>,
    pub failure: Option<FailureKind>,
}

/// A result plus whether it tripped the breaker.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: HealthCheckResult,
    pub breaker_opened: bool,
}

/// Runs one check. The breaker lives in the manager's shared breaker map;
/// each runner only ever touches its own entry.
pub struct HealthCheckRunner {
    definition: HealthCheckDefinition,
    enabled: AtomicBool,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl HealthCheckRunner {
    pub fn new(
        definition: HealthCheckDefinition,
        breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(definition.enabled),
            definition,
            breakers,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &HealthCheckDefinition {
        &self.definition
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Execute the check once.
    pub async fn execute(&self) -> RunOutcome {
        let def = &self.definition;

        if !self.is_enabled() {
            return RunOutcome {
                result: self.result(HealthStatus::Unknown, "check disabled".to_string(), 0.0),
                breaker_opened: false,
            };
        }

        let rejected_for = {
            let mut breakers = self.breakers.lock().await;
            let breaker = breakers
                .entry(def.name.clone())
                .or_insert_with(|| def.new_breaker());
            let now = Instant::now();
            if breaker.is_call_allowed_at(now) {
                None
            } else {
                Some((breaker.state(), breaker.retry_in_at(now).unwrap_or_default()))
            }
        };

        if let Some((state, retry_in)) = rejected_for {
            debug!(check = %def.name, ?state, retry_in_ms = retry_in.as_millis() as u64, "breaker rejected call, skipping probe");
            let message = match state {
                BreakerState::HalfOpen => "circuit breaker half-open, trial call in progress",
                _ => "circuit breaker open",
            };
            let mut result = self.result(HealthStatus::Critical, message.to_string(), 0.0);
            result.failure = Some(FailureKind::CircuitOpen);
            result.metadata.insert(
                "retry_in_ms".to_string(),
                MetaValue::from(retry_in.as_millis() as u64),
            );
            return RunOutcome {
                result,
                breaker_opened: false,
            };
        }

        let timeout = def.timeout.min(MAX_DURATION);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let started = Instant::now();
        let ctx = ProbeContext::new(&def.name, started + timeout, cancel_rx);
        let outcome = tokio::time::timeout(timeout, def.probe.check(ctx)).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = match outcome {
            Ok(Ok(outcome)) => {
                let mut result = self.result(outcome.status, outcome.message, latency_ms);
                result.metadata = outcome.metadata;
                result
            }
            Ok(Err(e)) => {
                warn!(check = %def.name, error = %e, "probe failed");
                let mut result = self.result(HealthStatus::Critical, format!("{e:#}"), latency_ms);
                result.failure = Some(FailureKind::ProbeError);
                result
                    .metadata
                    .insert("error".to_string(), MetaValue::from(format!("{e:#}")));
                result
            }
            Err(_) => {
                // Stop waiting; anything the probe spawned is told to stop.
                let _ = cancel_tx.send(true);
                warn!(check = %def.name, timeout = %format_duration(timeout), "probe timed out");
                let mut result = self.result(
                    HealthStatus::Critical,
                    format!("timed out after {}", format_duration(timeout)),
                    latency_ms,
                );
                result.failure = Some(FailureKind::Timeout);
                result
            }
        };

        let breaker_opened = self.record(result.status.is_passing()).await;

        debug!(
            check = %def.name,
            status = %result.status,
            latency_ms = result.latency_ms,
            "health check finished"
        );

        RunOutcome {
            result,
            breaker_opened,
        }
    }

    /// Turn a panicked execution into a critical result and a breaker failure.
    pub async fn record_panic(&self, reason: &str) -> RunOutcome {
        warn!(check = %self.definition.name, %reason, "probe panicked");
        let mut result = self.result(
            HealthStatus::Critical,
            format!("probe panicked: {reason}"),
            0.0,
        );
        result.failure = Some(FailureKind::Panicked);
        let breaker_opened = self.record(false).await;
        RunOutcome {
            result,
            breaker_opened,
        }
    }

    async fn record(&self, passing: bool) -> bool {
        let def = &self.definition;
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(def.name.clone())
            .or_insert_with(|| def.new_breaker());
        if passing {
            breaker.record_success();
            false
        } else {
            let opened = breaker.record_failure();
            if opened {
                warn!(check = %def.name, "circuit breaker opened");
            }
            opened
        }
    }

    fn result(&self, status: HealthStatus, message: String, latency_ms: f64) -> HealthCheckResult {
        HealthCheckResult {
            name: self.definition.name.clone(),
            status,
            message,
            latency_ms,
            timestamp: epoch_secs(),
            metadata: Metadata::new(),
            tags: self.definition.tags.clone(),
            failure: None,
        }
    }
}
