//! Domain types shared by the health, alert, and recovery subsystems.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ── Health ────────────────────────────────────────────────────────

/// Health status reported by a probe.
///
/// Variants are declared in ascending severity so the derived `Ord`
/// ranks `Critical` highest and `Unknown` lowest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    /// All statuses, least severe first.
    pub const ALL: [HealthStatus; 5] = [
        HealthStatus::Unknown,
        HealthStatus::Healthy,
        HealthStatus::Degraded,
        HealthStatus::Unhealthy,
        HealthStatus::Critical,
    ];

    /// Numeric severity rank (0 = unknown … 4 = critical).
    pub fn severity(self) -> u8 {
        self as u8
    }

    /// Whether a probe returning this status counts as a breaker success.
    pub fn is_passing(self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Whether this status should raise a `health_check_failed` trigger.
    pub fn is_failing(self) -> bool {
        matches!(self, HealthStatus::Unhealthy | HealthStatus::Critical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Critical => "critical",
        }
    }

    /// The most severe status of a set; `Unknown` for an empty set.
    pub fn most_severe<I>(statuses: I) -> HealthStatus
    where
        I: IntoIterator<Item = HealthStatus>,
    {
        statuses.into_iter().max().unwrap_or(HealthStatus::Unknown)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Metadata ──────────────────────────────────────────────────────

/// A typed metadata value attached to results and triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl MetaValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Bool(b) => write!(f, "{b}"),
            MetaValue::Number(n) => write!(f, "{n}"),
            MetaValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Number(v)
    }
}

impl From<u64> for MetaValue {
    fn from(v: u64) -> Self {
        MetaValue::Number(v as f64)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Text(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Text(v)
    }
}

/// Free-form key → value metadata.
pub type Metadata = BTreeMap<String, MetaValue>;

// ── Metrics ───────────────────────────────────────────────────────

/// A point-in-time map of metric name → value consumed by alert rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricSnapshot {
    values: BTreeMap<String, f64>,
}

impl MetricSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn remove(&mut self, name: &str) -> Option<f64> {
        self.values.remove(name)
    }

    /// Merge another snapshot into this one; later values win.
    pub fn merge(&mut self, other: MetricSnapshot) {
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for MetricSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

// ── Alerts ────────────────────────────────────────────────────────

/// Alert severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        })
    }
}

/// Comparison operator of an alert rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = ">=", alias = "ge")]
    Ge,
    #[serde(rename = "<=", alias = "le")]
    Le,
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
}

impl Comparator {
    /// Compare `value` against `threshold`.
    ///
    /// Equality is exact unless `epsilon` is given, in which case values
    /// within `epsilon` of each other are equal for every comparator:
    /// `>`/`<`/`!=` exclude them, `>=`/`<=`/`==` include them.
    pub fn compare(self, value: f64, threshold: f64, epsilon: Option<f64>) -> bool {
        let equal = match epsilon {
            Some(eps) => (value - threshold).abs() <= eps,
            None => value == threshold,
        };
        match self {
            Comparator::Gt => value > threshold && !equal,
            Comparator::Lt => value < threshold && !equal,
            Comparator::Ge => value > threshold || equal,
            Comparator::Le => value < threshold || equal,
            Comparator::Eq => equal,
            Comparator::Ne => !equal,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

// ── Recovery ──────────────────────────────────────────────────────

/// The category of event a recovery rule listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCondition {
    HealthCheckFailed,
    HighErrorRate,
    HighResourceUsage,
    ServiceUnavailable,
    CircuitBreakerOpen,
    SloViolation,
    Manual,
}

impl fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerCondition::HealthCheckFailed => "health_check_failed",
            TriggerCondition::HighErrorRate => "high_error_rate",
            TriggerCondition::HighResourceUsage => "high_resource_usage",
            TriggerCondition::ServiceUnavailable => "service_unavailable",
            TriggerCondition::CircuitBreakerOpen => "circuit_breaker_open",
            TriggerCondition::SloViolation => "slo_violation",
            TriggerCondition::Manual => "manual",
        })
    }
}

/// A typed comparison against one key of trigger metadata.
///
/// A key missing from the metadata is ignored (the condition holds).
/// A key present with the wrong value type does not match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MatchCondition {
    /// `metadata[key] >= value`
    AtLeast { key: String, value: f64 },
    /// `metadata[key] <= value`
    AtMost { key: String, value: f64 },
    /// `metadata[key] == value`
    Equals { key: String, value: f64 },
    /// `metadata[key]` is exactly the string `value`.
    Is { key: String, value: String },
}

impl MatchCondition {
    pub fn key(&self) -> &str {
        match self {
            MatchCondition::AtLeast { key, .. }
            | MatchCondition::AtMost { key, .. }
            | MatchCondition::Equals { key, .. }
            | MatchCondition::Is { key, .. } => key,
        }
    }

    /// Whether `metadata` satisfies this condition.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        let Some(actual) = metadata.get(self.key()) else {
            return true;
        };
        match self {
            MatchCondition::AtLeast { value, .. } => actual.as_f64().is_some_and(|v| v >= *value),
            MatchCondition::AtMost { value, .. } => actual.as_f64().is_some_and(|v| v <= *value),
            MatchCondition::Equals { value, .. } => actual.as_f64().is_some_and(|v| v == *value),
            MatchCondition::Is { value, .. } => actual.as_str() == Some(value.as_str()),
        }
    }
}

/// Unix timestamp in seconds, for display and serialization only.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, MetaValue)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn most_severe_orders_critical_first() {
        use HealthStatus::*;
        assert_eq!(HealthStatus::most_severe([Healthy, Critical, Degraded]), Critical);
        assert_eq!(HealthStatus::most_severe([Unknown, Healthy]), Healthy);
        assert_eq!(HealthStatus::most_severe([Degraded, Unhealthy]), Unhealthy);
        assert_eq!(HealthStatus::most_severe(std::iter::empty()), Unknown);
    }

    fn permutations(items: &[HealthStatus]) -> Vec<Vec<HealthStatus>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn most_severe_is_order_independent() {
        let all = permutations(&HealthStatus::ALL);
        assert_eq!(all.len(), 120);
        for perm in &all {
            assert_eq!(HealthStatus::most_severe(perm.iter().copied()), HealthStatus::Critical);
            // Every prefix aggregates to its own maximum rank.
            for n in 1..perm.len() {
                let expected = perm[..n].iter().map(|s| s.severity()).max().unwrap();
                assert_eq!(
                    HealthStatus::most_severe(perm[..n].iter().copied()).severity(),
                    expected
                );
            }
        }
    }

    #[test]
    fn passing_statuses() {
        assert!(HealthStatus::Healthy.is_passing());
        assert!(HealthStatus::Degraded.is_passing());
        assert!(!HealthStatus::Unhealthy.is_passing());
        assert!(!HealthStatus::Critical.is_passing());
        assert!(!HealthStatus::Unknown.is_passing());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&HealthStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }

    #[test]
    fn comparator_exact() {
        assert!(Comparator::Gt.compare(85.0, 80.0, None));
        assert!(!Comparator::Gt.compare(80.0, 80.0, None));
        assert!(Comparator::Ge.compare(80.0, 80.0, None));
        assert!(Comparator::Lt.compare(1.0, 2.0, None));
        assert!(Comparator::Le.compare(2.0, 2.0, None));
        assert!(Comparator::Eq.compare(0.5, 0.5, None));
        assert!(!Comparator::Eq.compare(0.1 + 0.2, 0.3, None));
        assert!(Comparator::Ne.compare(0.1 + 0.2, 0.3, None));
    }

    #[test]
    fn comparator_epsilon() {
        let eps = Some(1e-9);
        assert!(Comparator::Eq.compare(0.1 + 0.2, 0.3, eps));
        assert!(!Comparator::Ne.compare(0.1 + 0.2, 0.3, eps));
        assert!(!Comparator::Gt.compare(0.3 + 1e-12, 0.3, eps));
        assert!(Comparator::Le.compare(0.3 + 1e-12, 0.3, eps));
    }

    #[test]
    fn comparator_epsilon_applies_to_every_comparator() {
        let eps = Some(0.5);
        // 10.3 is within 0.5 of 10: equal.
        assert!(!Comparator::Gt.compare(10.3, 10.0, eps));
        assert!(Comparator::Ge.compare(9.7, 10.0, eps));
        assert!(!Comparator::Lt.compare(9.7, 10.0, eps));
        assert!(Comparator::Le.compare(10.3, 10.0, eps));
        assert!(Comparator::Eq.compare(10.3, 10.0, eps));
        assert!(!Comparator::Ne.compare(10.3, 10.0, eps));
        // Outside the tolerance the ordering is plain.
        assert!(Comparator::Gt.compare(10.6, 10.0, eps));
        assert!(Comparator::Lt.compare(9.4, 10.0, eps));
        assert!(!Comparator::Ge.compare(9.4, 10.0, eps));
    }

    #[test]
    fn comparator_nan_never_breaches_ordering() {
        assert!(!Comparator::Gt.compare(f64::NAN, 1.0, None));
        assert!(!Comparator::Le.compare(f64::NAN, 1.0, None));
    }

    #[test]
    fn comparator_parses_symbols() {
        #[derive(Deserialize)]
        struct Wrapper {
            op: Comparator,
        }
        let w: Wrapper = toml::from_str("op = \">=\"").unwrap();
        assert_eq!(w.op, Comparator::Ge);
        let w: Wrapper = toml::from_str("op = \"ne\"").unwrap();
        assert_eq!(w.op, Comparator::Ne);
    }

    #[test]
    fn match_numeric_threshold() {
        let cond = MatchCondition::AtLeast {
            key: "error_rate".into(),
            value: 0.1,
        };
        assert!(cond.matches(&meta(&[("error_rate", 0.25.into())])));
        assert!(!cond.matches(&meta(&[("error_rate", 0.05.into())])));
    }

    #[test]
    fn match_ignores_missing_keys() {
        let cond = MatchCondition::Is {
            key: "service".into(),
            value: "api".into(),
        };
        assert!(cond.matches(&Metadata::new()));
        assert!(cond.matches(&meta(&[("other", "x".into())])));
    }

    #[test]
    fn match_string_is_exact() {
        let cond = MatchCondition::Is {
            key: "service".into(),
            value: "api".into(),
        };
        assert!(cond.matches(&meta(&[("service", "api".into())])));
        assert!(!cond.matches(&meta(&[("service", "API".into())])));
    }

    #[test]
    fn match_wrong_type_does_not_match() {
        let cond = MatchCondition::AtMost {
            key: "cpu".into(),
            value: 90.0,
        };
        assert!(!cond.matches(&meta(&[("cpu", "50".into())])));
    }

    #[test]
    fn meta_value_untagged() {
        let m: Metadata = serde_json::from_str(r#"{"a": 1.5, "b": "x", "c": true}"#).unwrap();
        assert_eq!(m["a"], MetaValue::Number(1.5));
        assert_eq!(m["b"], MetaValue::Text("x".into()));
        assert_eq!(m["c"], MetaValue::Bool(true));
    }

    #[test]
    fn snapshot_merge_overrides() {
        let mut a: MetricSnapshot = [("cpu", 10.0), ("mem", 20.0)].into_iter().collect();
        let b: MetricSnapshot = [("cpu", 99.0)].into_iter().collect();
        a.merge(b);
        assert_eq!(a.get("cpu"), Some(99.0));
        assert_eq!(a.get("mem"), Some(20.0));
        assert_eq!(a.len(), 2);
    }
}
