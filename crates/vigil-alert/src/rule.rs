//! Alert rule definition and per-cycle condition check.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vigil_core::config::AlertRuleConfig;
use vigil_core::{Comparator, MetricSnapshot, Severity, TriggerCondition};

use crate::error::{AlertResult, ConditionError};

/// A threshold rule over one named metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: String,
    pub threshold: f64,
    pub comparator: Comparator,
    /// How long the condition must hold before the first notification.
    pub duration: Duration,
    /// Minimum gap between two notifications of the same alert.
    pub cooldown: Duration,
    /// Send a reminder every `cooldown` while the alert stays active.
    /// Off by default: an alert notifies once until it resolves.
    pub renotify: bool,
    pub enabled: bool,
    pub severity: Severity,
    /// Label scope: every key present in the engine labels must match.
    pub conditions: BTreeMap<String, String>,
    pub epsilon: Option<f64>,
    /// Recovery trigger raised when the alert fires.
    pub trigger: Option<TriggerCondition>,
}

impl AlertRule {
    pub fn new(name: &str, metric: &str, comparator: Comparator, threshold: f64) -> Self {
        Self {
            name: name.to_string(),
            metric: metric.to_string(),
            threshold,
            comparator,
            duration: Duration::ZERO,
            cooldown: Duration::from_secs(300),
            renotify: false,
            enabled: true,
            severity: Severity::default(),
            conditions: BTreeMap::new(),
            epsilon: None,
            trigger: None,
        }
    }

    pub fn from_config(config: &AlertRuleConfig) -> AlertResult<Self> {
        Ok(Self {
            name: config.name.clone(),
            metric: config.metric.clone(),
            threshold: config.threshold,
            comparator: config.comparator,
            duration: config.duration()?,
            cooldown: config.cooldown()?,
            renotify: config.renotify,
            enabled: config.enabled,
            severity: config.severity,
            conditions: config.conditions.clone(),
            epsilon: config.epsilon,
            trigger: config.trigger,
        })
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_renotify(mut self) -> Self {
        self.renotify = true;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_condition(mut self, key: &str, value: &str) -> Self {
        self.conditions.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerCondition) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether the rule is in scope for these labels. Labels the rule
    /// names but the engine does not carry are ignored.
    pub fn applies_to(&self, labels: &BTreeMap<String, String>) -> bool {
        self.conditions
            .iter()
            .all(|(key, want)| labels.get(key).is_none_or(|have| have == want))
    }

    /// Look up the metric and test the condition. Returns the observed
    /// value alongside the verdict.
    pub fn check(&self, snapshot: &MetricSnapshot) -> Result<(f64, bool), ConditionError> {
        let value = snapshot
            .get(&self.metric)
            .ok_or_else(|| ConditionError::MissingMetric(self.metric.clone()))?;
        if value.is_nan() {
            return Err(ConditionError::NotANumber(self.metric.clone()));
        }
        Ok((
            value,
            self.comparator.compare(value, self.threshold, self.epsilon),
        ))
    }

    /// `cpu_usage_percent = 85 > 80`
    pub fn describe(&self, value: f64) -> String {
        format!(
            "{} = {} {} {}",
            self.metric, value, self.comparator, self.threshold
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, f64)]) -> MetricSnapshot {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn check_reports_value_and_verdict() {
        let rule = AlertRule::new("cpu", "cpu_usage_percent", Comparator::Gt, 80.0);
        assert_eq!(
            rule.check(&snapshot(&[("cpu_usage_percent", 85.0)])),
            Ok((85.0, true))
        );
        assert_eq!(
            rule.check(&snapshot(&[("cpu_usage_percent", 80.0)])),
            Ok((80.0, false))
        );
    }

    #[test]
    fn missing_metric_is_an_evaluation_error() {
        let rule = AlertRule::new("cpu", "cpu_usage_percent", Comparator::Gt, 80.0);
        assert_eq!(
            rule.check(&MetricSnapshot::new()),
            Err(ConditionError::MissingMetric("cpu_usage_percent".into()))
        );
    }

    #[test]
    fn nan_metric_is_an_evaluation_error() {
        let rule = AlertRule::new("err", "error_rate", Comparator::Ge, 0.05);
        assert!(matches!(
            rule.check(&snapshot(&[("error_rate", f64::NAN)])),
            Err(ConditionError::NotANumber(_))
        ));
    }

    #[test]
    fn epsilon_widens_equality() {
        let exact = AlertRule::new("ratio", "ratio", Comparator::Eq, 0.3);
        let tolerant = exact.clone().with_epsilon(1e-9);
        let snap = snapshot(&[("ratio", 0.1 + 0.2)]);
        assert_eq!(exact.check(&snap).map(|(_, met)| met), Ok(false));
        assert_eq!(tolerant.check(&snap).map(|(_, met)| met), Ok(true));
    }

    #[test]
    fn label_scope() {
        let rule = AlertRule::new("cpu", "cpu", Comparator::Gt, 1.0)
            .with_condition("env", "prod")
            .with_condition("region", "eu");
        let mut labels = BTreeMap::new();
        labels.insert("env".to_string(), "prod".to_string());
        assert!(rule.applies_to(&labels));

        labels.insert("region".to_string(), "us".to_string());
        assert!(!rule.applies_to(&labels));
        assert!(rule.applies_to(&BTreeMap::new()));
    }

    #[test]
    fn from_config_parses_durations() {
        let doc = r#"
[[alert_rule]]
name = "cpu-high"
metric = "cpu_usage_percent"
threshold = 80.0
comparator = ">"
duration = "5m"
cooldown = "30m"
severity = "critical"
trigger = "high_resource_usage"
"#;
        let config = vigil_core::VigilConfig::from_toml_str(doc).unwrap();
        let rule = AlertRule::from_config(&config.alert_rules[0]).unwrap();
        assert_eq!(rule.duration, Duration::from_secs(300));
        assert_eq!(rule.cooldown, Duration::from_secs(1800));
        assert!(!rule.renotify);
        assert_eq!(rule.severity, Severity::Critical);
        assert_eq!(rule.trigger, Some(TriggerCondition::HighResourceUsage));
        assert_eq!(rule.describe(85.0), "cpu_usage_percent = 85 > 80");
    }

    #[test]
    fn from_config_reads_renotify() {
        let doc = r#"
[[alert_rule]]
name = "disk-full"
metric = "disk_usage_percent"
threshold = 95.0
comparator = ">="
cooldown = "1h"
renotify = true
"#;
        let config = vigil_core::VigilConfig::from_toml_str(doc).unwrap();
        let rule = AlertRule::from_config(&config.alert_rules[0]).unwrap();
        assert!(rule.renotify);
        assert_eq!(rule.cooldown, Duration::from_secs(3600));
    }
}
