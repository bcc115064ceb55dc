//! Alert evaluator: per-rule alert state machine.
//!
//! Holds at most one open alert per rule. Pending alerts (condition true,
//! not yet held for the rule's duration) live in the same map as fired
//! ones; they only differ in never having been notified. Notifications
//! are sent after the state lock is released.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vigil_core::config::VigilConfig;
use vigil_core::{
    epoch_secs, Comparator, Event, EventKind, MetricSnapshot, NotificationSink, Severity,
    TriggerCondition,
};

use crate::error::{AlertError, AlertResult};
use crate::rule::AlertRule;

/// Default number of resolved alerts retained.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

/// One alert, from first breach to resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInstance {
    pub id: String,
    pub rule: String,
    pub status: AlertStatus,
    pub severity: Severity,
    pub metric: String,
    /// Latest observed metric value.
    pub value: f64,
    pub threshold: f64,
    pub comparator: Comparator,
    /// Unix timestamps (seconds).
    pub started_at: u64,
    pub resolved_at: Option<u64>,
    pub acknowledged_at: Option<u64>,
    pub acknowledged_by: Option<String>,
    pub last_notified_at: Option<u64>,
    /// Notifications sent for this alert, reminders included.
    pub notifications: u32,
    pub trigger: Option<TriggerCondition>,
}

impl AlertInstance {
    /// Whether the sustain window has elapsed and the alert was announced.
    pub fn is_firing(&self) -> bool {
        self.notifications > 0
    }
}

/// A state change produced by one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    /// First notification of an alert.
    Fired(AlertInstance),
    /// Reminder after the cooldown while the condition still holds.
    Renotified(AlertInstance),
    Resolved(AlertInstance),
}

impl AlertTransition {
    pub fn instance(&self) -> &AlertInstance {
        match self {
            AlertTransition::Fired(a)
            | AlertTransition::Renotified(a)
            | AlertTransition::Resolved(a) => a,
        }
    }

    fn event(&self) -> Event {
        let alert = self.instance();
        let summary = format!(
            "{} = {} {} {}",
            alert.metric, alert.value, alert.comparator, alert.threshold
        );
        let (kind, message) = match self {
            AlertTransition::Fired(_) => (EventKind::AlertFired, format!("alert fired: {summary}")),
            AlertTransition::Renotified(_) => (
                EventKind::AlertFired,
                format!("alert still firing: {summary}"),
            ),
            AlertTransition::Resolved(_) => (
                EventKind::AlertResolved,
                format!("alert resolved: {} = {}", alert.metric, alert.value),
            ),
        };
        Event::new(kind, &alert.rule, message)
            .with_severity(alert.severity)
            .with_payload(alert)
    }
}

/// Monotonic bookkeeping kept next to the serializable instance.
struct OpenAlert {
    instance: AlertInstance,
    started: Instant,
    last_notified: Option<Instant>,
}

struct RuleEntry {
    rule: AlertRule,
    enabled: AtomicBool,
}

/// Evaluates alert rules against metric snapshots.
pub struct AlertEvaluator {
    rules: Vec<RuleEntry>,
    open: Mutex<HashMap<String, OpenAlert>>,
    history: Mutex<VecDeque<AlertInstance>>,
    history_limit: usize,
    sink: Arc<dyn NotificationSink>,
    evaluation_errors: AtomicU64,
}

impl AlertEvaluator {
    /// Create an evaluator. Rule names must be unique.
    pub fn new(rules: Vec<AlertRule>, sink: Arc<dyn NotificationSink>) -> AlertResult<Self> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.name.clone()) {
                return Err(AlertError::DuplicateRule(rule.name.clone()));
            }
        }
        Ok(Self {
            rules: rules
                .into_iter()
                .map(|rule| RuleEntry {
                    enabled: AtomicBool::new(rule.enabled),
                    rule,
                })
                .collect(),
            open: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            sink,
            evaluation_errors: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &VigilConfig, sink: Arc<dyn NotificationSink>) -> AlertResult<Self> {
        let rules = config
            .alert_rules
            .iter()
            .map(AlertRule::from_config)
            .collect::<AlertResult<Vec<_>>>()?;
        Ok(Self::new(rules, sink)?.with_history_limit(config.engine.alert_history_limit))
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn rules(&self) -> impl Iterator<Item = &AlertRule> {
        self.rules.iter().map(|e| &e.rule)
    }

    pub fn rule(&self, name: &str) -> Option<&AlertRule> {
        self.entry(name).ok().map(|e| &e.rule)
    }

    /// Enable or disable a rule. A disabled rule's alert resolves on the
    /// next evaluation.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> AlertResult<()> {
        self.entry(name)?.enabled.store(enabled, Ordering::Relaxed);
        info!(rule = %name, enabled, "alert rule toggled");
        Ok(())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.entry(name)
            .map(|e| e.enabled.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Cycles in which a rule could not be evaluated.
    pub fn evaluation_errors(&self) -> u64 {
        self.evaluation_errors.load(Ordering::Relaxed)
    }

    pub async fn evaluate_all(
        &self,
        snapshot: &MetricSnapshot,
        labels: &BTreeMap<String, String>,
    ) -> Vec<AlertTransition> {
        self.evaluate_all_at(snapshot, labels, Instant::now()).await
    }

    /// Evaluate every rule against `snapshot` as of `now`.
    pub async fn evaluate_all_at(
        &self,
        snapshot: &MetricSnapshot,
        labels: &BTreeMap<String, String>,
        now: Instant,
    ) -> Vec<AlertTransition> {
        let mut transitions = Vec::new();
        let mut closed = Vec::new();

        {
            let mut open = self.open.lock().await;
            for entry in &self.rules {
                let rule = &entry.rule;
                let in_scope = entry.enabled.load(Ordering::Relaxed) && rule.applies_to(labels);

                let met = if in_scope {
                    match rule.check(snapshot) {
                        Ok(verdict) => Some(verdict),
                        Err(e) => {
                            self.evaluation_errors.fetch_add(1, Ordering::Relaxed);
                            warn!(rule = %rule.name, error = %e, "alert rule skipped");
                            continue;
                        }
                    }
                } else {
                    None
                };

                match (met, open.remove(&rule.name)) {
                    (Some((value, true)), None) => {
                        let mut alert = OpenAlert {
                            instance: new_instance(rule, value),
                            started: now,
                            last_notified: None,
                        };
                        debug!(rule = %rule.name, value, "alert condition breached");
                        if rule.duration.is_zero() {
                            transitions.push(AlertTransition::Fired(notify(&mut alert, now)));
                            info!(rule = %rule.name, value, "alert fired");
                        }
                        open.insert(rule.name.clone(), alert);
                    }
                    (Some((value, true)), Some(mut alert)) => {
                        alert.instance.value = value;
                        let held = now.saturating_duration_since(alert.started);
                        if held >= rule.duration {
                            match alert.last_notified {
                                None => {
                                    transitions
                                        .push(AlertTransition::Fired(notify(&mut alert, now)));
                                    info!(rule = %rule.name, value, held_secs = held.as_secs(), "alert fired");
                                }
                                Some(last)
                                    if rule.renotify
                                        && alert.instance.status == AlertStatus::Active
                                        && now.saturating_duration_since(last) >= rule.cooldown =>
                                {
                                    transitions.push(AlertTransition::Renotified(notify(
                                        &mut alert, now,
                                    )));
                                    debug!(rule = %rule.name, value, "alert reminder");
                                }
                                Some(_) => {}
                            }
                        }
                        open.insert(rule.name.clone(), alert);
                    }
                    (_, Some(alert)) => {
                        let mut instance = alert.instance;
                        if let Some((value, _)) = met {
                            instance.value = value;
                        }
                        instance.status = AlertStatus::Resolved;
                        instance.resolved_at = Some(epoch_secs());
                        if instance.is_firing() {
                            info!(rule = %rule.name, value = instance.value, "alert resolved");
                            transitions.push(AlertTransition::Resolved(instance.clone()));
                        } else {
                            debug!(rule = %rule.name, "pending alert cleared before firing");
                        }
                        closed.push(instance);
                    }
                    (_, None) => {}
                }
            }
        }

        if !closed.is_empty() {
            let mut history = self.history.lock().await;
            for instance in closed {
                history.push_back(instance);
                while history.len() > self.history_limit {
                    history.pop_front();
                }
            }
        }

        for transition in &transitions {
            self.sink.notify(transition.event()).await;
        }

        transitions
    }

    /// Mark a rule's open alert as acknowledged. Reminders stop; the alert
    /// still resolves once the condition clears.
    pub async fn acknowledge(&self, rule: &str, actor: &str) -> AlertResult<AlertInstance> {
        self.entry(rule)?;
        let mut open = self.open.lock().await;
        let alert = open
            .get_mut(rule)
            .ok_or_else(|| AlertError::NotActive(rule.to_string()))?;
        alert.instance.status = AlertStatus::Acknowledged;
        alert.instance.acknowledged_at = Some(epoch_secs());
        alert.instance.acknowledged_by = Some(actor.to_string());
        info!(%rule, %actor, "alert acknowledged");
        Ok(alert.instance.clone())
    }

    /// Open alerts that have fired, acknowledged ones included.
    pub async fn active_alerts(&self) -> Vec<AlertInstance> {
        let open = self.open.lock().await;
        let mut alerts: Vec<AlertInstance> = open
            .values()
            .filter(|a| a.instance.is_firing())
            .map(|a| a.instance.clone())
            .collect();
        alerts.sort_by(|a, b| a.rule.cmp(&b.rule));
        alerts
    }

    pub async fn active_count(&self) -> usize {
        let open = self.open.lock().await;
        open.values().filter(|a| a.instance.is_firing()).count()
    }

    /// Breaches still inside their sustain window.
    pub async fn pending_count(&self) -> usize {
        let open = self.open.lock().await;
        open.values().filter(|a| !a.instance.is_firing()).count()
    }

    /// Resolved alerts, newest first.
    pub async fn history(&self, limit: Option<usize>) -> Vec<AlertInstance> {
        let history = self.history.lock().await;
        history
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    fn entry(&self, name: &str) -> AlertResult<&RuleEntry> {
        self.rules
            .iter()
            .find(|e| e.rule.name == name)
            .ok_or_else(|| AlertError::UnknownRule(name.to_string()))
    }
}

fn new_instance(rule: &AlertRule, value: f64) -> AlertInstance {
    AlertInstance {
        id: uuid::Uuid::now_v7().to_string(),
        rule: rule.name.clone(),
        status: AlertStatus::Active,
        severity: rule.severity,
        metric: rule.metric.clone(),
        value,
        threshold: rule.threshold,
        comparator: rule.comparator,
        started_at: epoch_secs(),
        resolved_at: None,
        acknowledged_at: None,
        acknowledged_by: None,
        last_notified_at: None,
        notifications: 0,
        trigger: rule.trigger,
    }
}

fn notify(alert: &mut OpenAlert, now: Instant) -> AlertInstance {
    alert.last_notified = Some(now);
    alert.instance.last_notified_at = Some(epoch_secs());
    alert.instance.notifications += 1;
    alert.instance.clone()
}
