//! Health check manager: fans out every enabled check each cycle.
//!
//! Each check runs in its own task, so a slow probe costs at most its own
//! timeout and a panicking probe only fails its own result. Results are
//! kept in a bounded per-check history that backs the status summary and
//! the metric export consumed by alert rules.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, info};

use vigil_core::{epoch_secs, HealthStatus, MetaValue, MetricSnapshot, VigilConfig};

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::error::{HealthError, HealthResult};
use crate::probe::ProbeRegistry;
use crate::runner::{HealthCheckDefinition, HealthCheckResult, HealthCheckRunner, RunOutcome};

/// Default number of results retained per check.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Outcome of one `run_all` cycle.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Most severe status among this cycle's results.
    pub status: HealthStatus,
    pub results: Vec<HealthCheckResult>,
    /// Checks whose breaker opened during this cycle.
    pub opened_breakers: Vec<String>,
    pub elapsed: Duration,
}

/// Aggregate view exposed to status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub counts: BTreeMap<HealthStatus, usize>,
    pub checks: Vec<CheckSummary>,
    /// Unix timestamp (seconds).
    pub generated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSummary {
    pub name: String,
    pub enabled: bool,
    pub tags: BTreeMap<String, String>,
    pub latest: Option<HealthCheckResult>,
    pub breaker: Option<BreakerSnapshot>,
    /// Share of retained results that were healthy or degraded.
    pub uptime_ratio: Option<f64>,
}

/// Owns every check definition, its breaker, and its result history.
pub struct HealthCheckManager {
    runners: Vec<Arc<HealthCheckRunner>>,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    history: RwLock<HashMap<String, VecDeque<HealthCheckResult>>>,
    history_limit: usize,
    limiter: Option<Arc<Semaphore>>,
}

impl HealthCheckManager {
    /// Create a manager. Check names must be unique.
    pub fn new(definitions: Vec<HealthCheckDefinition>) -> HealthResult<Self> {
        let mut seen = HashSet::new();
        let mut breakers = HashMap::new();
        for def in &definitions {
            if !seen.insert(def.name.clone()) {
                return Err(HealthError::DuplicateCheck(def.name.clone()));
            }
            breakers.insert(def.name.clone(), def.new_breaker());
        }

        let breakers = Arc::new(Mutex::new(breakers));
        let runners = definitions
            .into_iter()
            .map(|def| Arc::new(HealthCheckRunner::new(def, breakers.clone())))
            .collect();

        Ok(Self {
            runners,
            breakers,
            history: RwLock::new(HashMap::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            limiter: None,
        })
    }

    /// Build from the `[[health_check]]` and `[engine]` sections.
    pub fn from_config(config: &VigilConfig, registry: &ProbeRegistry) -> HealthResult<Self> {
        let definitions = config
            .health_checks
            .iter()
            .map(|c| HealthCheckDefinition::from_config(c, registry))
            .collect::<HealthResult<Vec<_>>>()?;
        Ok(Self::new(definitions)?
            .with_history_limit(config.engine.history_limit)
            .with_max_concurrency(config.engine.max_concurrency))
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Bound the number of probes running at once.
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.limiter = limit.map(|n| Arc::new(Semaphore::new(n.max(1))));
        self
    }

    pub fn check_names(&self) -> Vec<String> {
        self.runners.iter().map(|r| r.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Enable or disable a check; applies from the next cycle.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> HealthResult<()> {
        let runner = self.runner(name)?;
        runner.set_enabled(enabled);
        info!(check = %name, enabled, "health check toggled");
        Ok(())
    }

    /// Run every enabled check concurrently and wait for all of them.
    pub async fn run_all(&self) -> HealthReport {
        let started = Instant::now();

        let mut handles = Vec::new();
        for runner in self.runners.iter().filter(|r| r.is_enabled()) {
            let task_runner = runner.clone();
            let limiter = self.limiter.clone();
            let handle = tokio::spawn(async move {
                let _permit = match limiter {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                task_runner.execute().await
            });
            handles.push((runner.clone(), handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (runner, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => runner.record_panic(&panic_message(e)).await,
            };
            outcomes.push(outcome);
        }

        let mut results = Vec::with_capacity(outcomes.len());
        let mut opened_breakers = Vec::new();
        for RunOutcome {
            result,
            breaker_opened,
        } in outcomes
        {
            if breaker_opened {
                opened_breakers.push(result.name.clone());
            }
            results.push(result);
        }

        self.append_history(&results).await;

        let status = HealthStatus::most_severe(results.iter().map(|r| r.status));
        let elapsed = started.elapsed();
        debug!(
            checks = results.len(),
            %status,
            elapsed_ms = elapsed.as_millis() as u64,
            "health cycle finished"
        );

        HealthReport {
            status,
            results,
            opened_breakers,
            elapsed,
        }
    }

    /// Run a single check now, regardless of the schedule.
    pub async fn run_check(&self, name: &str) -> HealthResult<HealthCheckResult> {
        let runner = self.runner(name)?.clone();
        let handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.execute().await })
        };
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => runner.record_panic(&panic_message(e)).await,
        };
        self.append_history(std::slice::from_ref(&outcome.result))
            .await;
        Ok(outcome.result)
    }

    pub async fn latest(&self, name: &str) -> Option<HealthCheckResult> {
        let history = self.history.read().await;
        history.get(name).and_then(|h| h.back().cloned())
    }

    /// Retained results for a check, oldest first.
    pub async fn history(&self, name: &str) -> Vec<HealthCheckResult> {
        let history = self.history.read().await;
        history
            .get(name)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn breaker(&self, name: &str) -> Option<BreakerSnapshot> {
        let breakers = self.breakers.lock().await;
        breakers.get(name).map(|b| b.snapshot())
    }

    /// Most severe latest status across enabled checks.
    pub async fn status(&self) -> HealthStatus {
        let history = self.history.read().await;
        HealthStatus::most_severe(
            self.runners
                .iter()
                .filter(|r| r.is_enabled())
                .filter_map(|r| history.get(r.name()).and_then(|h| h.back()))
                .map(|r| r.status),
        )
    }

    pub async fn summary(&self) -> HealthSummary {
        let breakers: HashMap<String, BreakerSnapshot> = {
            let breakers = self.breakers.lock().await;
            breakers
                .iter()
                .map(|(name, b)| (name.clone(), b.snapshot()))
                .collect()
        };

        let history = self.history.read().await;
        let mut counts: BTreeMap<HealthStatus, usize> =
            HealthStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut checks = Vec::with_capacity(self.runners.len());
        let mut aggregate = HealthStatus::Unknown;

        for runner in &self.runners {
            let name = runner.name();
            let retained = history.get(name);
            let latest = retained.and_then(|h| h.back()).cloned();
            if let Some(result) = &latest {
                *counts.entry(result.status).or_insert(0) += 1;
                if runner.is_enabled() {
                    aggregate = aggregate.max(result.status);
                }
            }
            let uptime_ratio = retained.filter(|h| !h.is_empty()).map(|h| {
                h.iter().filter(|r| r.status.is_passing()).count() as f64 / h.len() as f64
            });

            checks.push(CheckSummary {
                name: name.to_string(),
                enabled: runner.is_enabled(),
                tags: runner.definition().tags.clone(),
                latest,
                breaker: breakers.get(name).cloned(),
                uptime_ratio,
            });
        }

        HealthSummary {
            status: aggregate,
            counts,
            checks,
            generated_at: epoch_secs(),
        }
    }

    /// Export the latest results as named metrics.
    pub async fn metrics(&self) -> MetricSnapshot {
        let history = self.history.read().await;
        let mut snapshot = MetricSnapshot::new();
        let mut failing = 0usize;
        let mut total = 0usize;

        for runner in self.runners.iter().filter(|r| r.is_enabled()) {
            let Some(result) = history.get(runner.name()).and_then(|h| h.back()) else {
                continue;
            };
            total += 1;
            if result.status.is_failing() {
                failing += 1;
            }

            let prefix = format!("health_check.{}", result.name);
            snapshot.insert(format!("{prefix}.latency_ms"), result.latency_ms);
            snapshot.insert(format!("{prefix}.severity"), result.status.severity() as f64);
            snapshot.insert(
                format!("{prefix}.up"),
                if result.status.is_passing() { 1.0 } else { 0.0 },
            );
            for (key, value) in &result.metadata {
                if let MetaValue::Number(n) = value {
                    snapshot.insert(format!("{prefix}.{key}"), *n);
                }
            }
        }

        snapshot.insert("health_checks.failing", failing as f64);
        snapshot.insert("health_checks.total", total as f64);
        snapshot
    }

    fn runner(&self, name: &str) -> HealthResult<&Arc<HealthCheckRunner>> {
        self.runners
            .iter()
            .find(|r| r.name() == name)
            .ok_or_else(|| HealthError::UnknownCheck(name.to_string()))
    }

    async fn append_history(&self, results: &[HealthCheckResult]) {
        let mut history = self.history.write().await;
        for result in results {
            let ring = history.entry(result.name.clone()).or_default();
            ring.push_back(result.clone());
            while ring.len() > self.history_limit {
                ring.pop_front();
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
