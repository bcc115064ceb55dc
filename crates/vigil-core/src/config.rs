//! vigil.toml configuration parser.
//!
//! Health checks, alert rules, and recovery rules are declared once at
//! start-up. Durations stay as strings here and are parsed by the typed
//! accessors, so a bad value is reported with the entry that carries it.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::duration_field;
use crate::error::{ConfigError, ConfigResult};
use crate::types::{Comparator, MatchCondition, Severity, TriggerCondition};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default, rename = "health_check")]
    pub health_checks: Vec<HealthCheckConfig>,
    #[serde(default, rename = "alert_rule")]
    pub alert_rules: Vec<AlertRuleConfig>,
    #[serde(default, rename = "recovery_rule")]
    pub recovery_rules: Vec<RecoveryRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tick interval of the periodic driver.
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Upper bound on probes running at once; unbounded when absent.
    pub max_concurrency: Option<usize>,
    /// Results retained per probe.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Resolved alerts retained.
    #[serde(default = "default_long_history")]
    pub alert_history_limit: usize,
    /// Recovery executions retained.
    #[serde(default = "default_long_history")]
    pub recovery_history_limit: usize,
    /// Context labels used to scope alert rule conditions.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            max_concurrency: None,
            history_limit: default_history_limit(),
            alert_history_limit: default_long_history(),
            recovery_history_limit: default_long_history(),
            labels: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn interval(&self) -> ConfigResult<Duration> {
        duration_field("engine", "interval", &self.interval)
    }
}

/// A `{ kind = "...", ... }` table naming a registered implementation.
///
/// Every key except `kind` is passed to the factory as parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindSpec {
    pub kind: String,
    #[serde(flatten)]
    pub params: toml::Table,
}

impl KindSpec {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            params: toml::Table::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn int_param(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(|v| v.as_integer())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub name: String,
    pub probe: KindSpec,
    #[serde(default = "default_probe_timeout")]
    pub timeout: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the breaker stays open before a half-open trial call.
    #[serde(default = "default_breaker_timeout")]
    pub breaker_timeout: String,
}

impl HealthCheckConfig {
    pub fn timeout(&self) -> ConfigResult<Duration> {
        duration_field(&self.name, "timeout", &self.timeout)
    }

    pub fn breaker_timeout(&self) -> ConfigResult<Duration> {
        duration_field(&self.name, "breaker_timeout", &self.breaker_timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    pub name: String,
    pub metric: String,
    pub threshold: f64,
    pub comparator: Comparator,
    /// How long the condition must hold before notifying.
    #[serde(default = "default_zero")]
    pub duration: String,
    /// Minimum time between two notifications of one alert.
    #[serde(default = "default_cooldown")]
    pub cooldown: String,
    /// Re-send the notification every `cooldown` while the condition holds.
    #[serde(default)]
    pub renotify: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
    /// Values within `epsilon` of the threshold count as equal for every
    /// comparator: `>`/`<` exclude them, `>=`/`<=`/`==` include them.
    pub epsilon: Option<f64>,
    /// Recovery trigger raised when the alert fires.
    pub trigger: Option<TriggerCondition>,
}

impl AlertRuleConfig {
    pub fn duration(&self) -> ConfigResult<Duration> {
        duration_field(&self.name, "duration", &self.duration)
    }

    pub fn cooldown(&self) -> ConfigResult<Duration> {
        duration_field(&self.name, "cooldown", &self.cooldown)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRuleConfig {
    pub name: String,
    pub trigger: TriggerCondition,
    pub actions: Vec<KindSpec>,
    /// Actions run when the main pipeline fails.
    #[serde(default)]
    pub rollback: Vec<KindSpec>,
    #[serde(default = "default_cooldown")]
    pub cooldown: String,
    /// Executions allowed per rolling 24h window.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-action timeout.
    #[serde(default = "default_action_timeout")]
    pub timeout: String,
    #[serde(default)]
    pub conditions: Vec<MatchCondition>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RecoveryRuleConfig {
    pub fn cooldown(&self) -> ConfigResult<Duration> {
        duration_field(&self.name, "cooldown", &self.cooldown)
    }

    pub fn timeout(&self) -> ConfigResult<Duration> {
        duration_field(&self.name, "timeout", &self.timeout)
    }
}

impl VigilConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a config document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: VigilConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Check names are unique and every duration and limit is usable.
    pub fn validate(&self) -> ConfigResult<()> {
        self.engine.interval()?;
        if self.engine.max_concurrency == Some(0) {
            return Err(invalid("engine", "max_concurrency must be at least 1"));
        }
        if self.engine.history_limit == 0 {
            return Err(invalid("engine", "history_limit must be at least 1"));
        }

        unique("health_check", self.health_checks.iter().map(|c| &c.name))?;
        unique("alert_rule", self.alert_rules.iter().map(|r| &r.name))?;
        unique("recovery_rule", self.recovery_rules.iter().map(|r| &r.name))?;

        for check in &self.health_checks {
            check.timeout()?;
            check.breaker_timeout()?;
            if check.failure_threshold == 0 {
                return Err(invalid(&check.name, "failure_threshold must be at least 1"));
            }
            if check.probe.kind.is_empty() {
                return Err(invalid(&check.name, "probe kind is empty"));
            }
        }

        for rule in &self.alert_rules {
            rule.duration()?;
            rule.cooldown()?;
            if !rule.threshold.is_finite() {
                return Err(invalid(&rule.name, "threshold must be finite"));
            }
            if rule.epsilon.is_some_and(|e| !(e >= 0.0)) {
                return Err(invalid(&rule.name, "epsilon must be non-negative"));
            }
        }

        for rule in &self.recovery_rules {
            rule.cooldown()?;
            rule.timeout()?;
            if rule.actions.is_empty() {
                return Err(invalid(&rule.name, "at least one action is required"));
            }
            if rule.max_attempts == 0 {
                return Err(invalid(&rule.name, "max_attempts must be at least 1"));
            }
        }

        Ok(())
    }
}

fn unique<'a>(
    section: &'static str,
    names: impl Iterator<Item = &'a String>,
) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(ConfigError::Duplicate {
                section,
                name: name.clone(),
            });
        }
    }
    Ok(())
}

fn invalid(entry: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        entry: entry.to_string(),
        reason: reason.to_string(),
    }
}

fn default_true() -> bool {
    true
}

fn default_interval() -> String {
    "30s".to_string()
}

fn default_history_limit() -> usize {
    100
}

fn default_long_history() -> usize {
    1000
}

fn default_probe_timeout() -> String {
    "10s".to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> String {
    "60s".to_string()
}

fn default_zero() -> String {
    "0s".to_string()
}

fn default_cooldown() -> String {
    "5m".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_action_timeout() -> String {
    "30s".to_string()
}
