//! The engine and its builder.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vigil_alert::{AlertEvaluator, AlertTransition};
use vigil_core::{
    epoch_secs, MetaValue, Metadata, MetricSnapshot, NotificationSink, TracingSink,
    TriggerCondition, VigilConfig,
};
use vigil_health::{FailureKind, HealthCheckManager, HealthCheckResult, HealthReport, ProbeRegistry};
use vigil_recovery::{ActionRegistry, RecoveryOrchestrator};

use crate::error::EngineResult;
use crate::source::MetricSource;
use crate::status::{StatusSnapshot, RECENT_LIMIT};

/// What one tick did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub health: HealthReport,
    pub metrics: MetricSnapshot,
    pub transitions: Vec<AlertTransition>,
    /// Recovery triggers handed to the background dispatcher.
    pub triggers: Vec<(TriggerCondition, Metadata)>,
    pub elapsed: Duration,
}

/// Assembles an [`Engine`] from configuration and host registries.
pub struct EngineBuilder {
    config: VigilConfig,
    probes: ProbeRegistry,
    actions: ActionRegistry,
    sink: Arc<dyn NotificationSink>,
    sources: Vec<Arc<dyn MetricSource>>,
}

impl EngineBuilder {
    pub fn new(config: VigilConfig) -> Self {
        Self {
            config,
            probes: ProbeRegistry::new(),
            actions: ActionRegistry::new(),
            sink: Arc::new(TracingSink),
            sources: Vec::new(),
        }
    }

    pub fn with_probes(mut self, probes: ProbeRegistry) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_metric_source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Validate the config and resolve every probe and action kind.
    pub fn build(self) -> EngineResult<Engine> {
        self.config.validate()?;
        let health = HealthCheckManager::from_config(&self.config, &self.probes)?;
        let alerts = AlertEvaluator::from_config(&self.config, self.sink.clone())?;
        let recovery = RecoveryOrchestrator::from_config(&self.config, &self.actions, self.sink)?;

        info!(
            checks = health.len(),
            alert_rules = self.config.alert_rules.len(),
            recovery_rules = self.config.recovery_rules.len(),
            "engine assembled"
        );

        let mut engine = Engine::new(health, alerts, recovery)
            .with_labels(self.config.engine.labels.clone())
            .with_interval(self.config.engine.interval()?);
        engine.sources = self.sources;
        Ok(engine)
    }
}

/// Owns the health manager, alert evaluator and recovery orchestrator and
/// drives them one tick at a time.
pub struct Engine {
    health: Arc<HealthCheckManager>,
    alerts: Arc<AlertEvaluator>,
    recovery: Arc<RecoveryOrchestrator>,
    sources: Vec<Arc<dyn MetricSource>>,
    labels: BTreeMap<String, String>,
    interval: Duration,
    dispatched: Mutex<JoinSet<Vec<String>>>,
    ticks: AtomicU64,
}

impl Engine {
    pub fn new(
        health: HealthCheckManager,
        alerts: AlertEvaluator,
        recovery: RecoveryOrchestrator,
    ) -> Self {
        Self {
            health: Arc::new(health),
            alerts: Arc::new(alerts),
            recovery: Arc::new(recovery),
            sources: Vec::new(),
            labels: BTreeMap::new(),
            interval: Duration::from_secs(30),
            dispatched: Mutex::new(JoinSet::new()),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_metric_source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn health(&self) -> &Arc<HealthCheckManager> {
        &self.health
    }

    pub fn alerts(&self) -> &Arc<AlertEvaluator> {
        &self.alerts
    }

    pub fn recovery(&self) -> &Arc<RecoveryOrchestrator> {
        &self.recovery
    }

    /// Configured tick interval; [`Engine::run`] takes its own.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Run one evaluation cycle. Recovery work is started but not awaited;
    /// see [`Engine::drain_recovery`].
    pub async fn tick(&self) -> TickReport {
        let started = Instant::now();

        let report = self.health.run_all().await;
        let metrics = self.collect_metrics().await;
        let transitions = self.alerts.evaluate_all(&metrics, &self.labels).await;

        let mut triggers = Vec::new();
        for result in &report.results {
            if result.status.is_failing() && result.failure != Some(FailureKind::CircuitOpen) {
                triggers.push((TriggerCondition::HealthCheckFailed, check_metadata(result)));
            }
        }
        for name in &report.opened_breakers {
            let mut meta: Metadata = report
                .results
                .iter()
                .find(|r| &r.name == name)
                .map(|r| {
                    r.tags
                        .iter()
                        .map(|(k, v)| (k.clone(), MetaValue::from(v.as_str())))
                        .collect()
                })
                .unwrap_or_default();
            meta.insert("check".to_string(), MetaValue::from(name.as_str()));
            triggers.push((TriggerCondition::CircuitBreakerOpen, meta));
        }
        for transition in &transitions {
            if let AlertTransition::Fired(alert) = transition
                && let Some(trigger) = alert.trigger
            {
                let mut meta = Metadata::new();
                meta.insert("alert".to_string(), MetaValue::from(alert.rule.as_str()));
                meta.insert("metric".to_string(), MetaValue::from(alert.metric.as_str()));
                meta.insert("value".to_string(), MetaValue::from(alert.value));
                meta.insert("threshold".to_string(), MetaValue::from(alert.threshold));
                meta.insert(
                    "severity".to_string(),
                    MetaValue::from(alert.severity.to_string()),
                );
                triggers.push((trigger, meta));
            }
        }

        self.dispatch(&triggers).await;

        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let elapsed = started.elapsed();
        debug!(
            tick,
            status = %report.status,
            alerts = transitions.len(),
            triggers = triggers.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "tick finished"
        );

        TickReport {
            health: report,
            metrics,
            transitions,
            triggers,
            elapsed,
        }
    }

    /// Wait for every recovery dispatched so far. Returns the ids of the
    /// executions that ran.
    pub async fn drain_recovery(&self) -> Vec<String> {
        let mut pending = {
            let mut dispatched = self.dispatched.lock().await;
            std::mem::take(&mut *dispatched)
        };
        let mut ids = Vec::new();
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(mut executed) => ids.append(&mut executed),
                Err(e) => warn!(error = %e, "recovery dispatch task failed"),
            }
        }
        ids
    }

    /// Read-only view of the whole engine.
    pub async fn status(&self) -> StatusSnapshot {
        let health = self.health.summary().await;
        StatusSnapshot {
            status: health.status,
            health,
            active_alerts: self.alerts.active_alerts().await,
            resolved_alerts: self.alerts.history(Some(RECENT_LIMIT)).await,
            running_recoveries: self.recovery.running().await,
            recent_recoveries: self.recovery.history(Some(RECENT_LIMIT)).await,
            recovery_stats: self.recovery.stats().await,
            ticks: self.ticks(),
            generated_at: epoch_secs(),
        }
    }

    /// Tick every `interval` until `shutdown` flips, then wait for
    /// in-flight recovery.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "engine started");

        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("engine shutting down");
                    break;
                }
            }
        }

        let finished = self.drain_recovery().await;
        info!(recoveries = finished.len(), "engine stopped");
    }

    async fn collect_metrics(&self) -> MetricSnapshot {
        let mut metrics = self.health.metrics().await;
        for source in &self.sources {
            match source.collect().await {
                Ok(snapshot) => metrics.merge(snapshot),
                Err(e) => warn!(source = %source.name(), error = %e, "metric source failed"),
            }
        }
        metrics
    }

    async fn dispatch(&self, triggers: &[(TriggerCondition, Metadata)]) {
        let mut dispatched = self.dispatched.lock().await;
        // Reap finished work so the set does not grow between drains.
        while let Some(joined) = dispatched.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "recovery dispatch task failed");
            }
        }
        for (condition, metadata) in triggers {
            let recovery = self.recovery.clone();
            let condition = *condition;
            let metadata = metadata.clone();
            dispatched.spawn(async move { recovery.trigger(condition, metadata).await });
        }
    }
}

/// Trigger metadata for a failing check: numeric probe metadata, tags,
/// then the check's own fields.
fn check_metadata(result: &HealthCheckResult) -> Metadata {
    let mut meta: Metadata = result
        .metadata
        .iter()
        .filter(|(_, v)| matches!(v, MetaValue::Number(_)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    meta.extend(
        result
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), MetaValue::from(v.as_str()))),
    );
    meta.insert("check".to_string(), MetaValue::from(result.name.as_str()));
    meta.insert("status".to_string(), MetaValue::from(result.status.as_str()));
    meta.insert("latency_ms".to_string(), MetaValue::from(result.latency_ms));
    meta.insert("message".to_string(), MetaValue::from(result.message.as_str()));
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use vigil_alert::AlertRule;
    use vigil_core::{Comparator, EventKind, HealthStatus, MemorySink};
    use vigil_health::{HealthCheckDefinition, Probe, ProbeContext, ProbeOutcome};
    use vigil_recovery::{ActionContext, ActionHandler, ExecutionStatus, RecoveryRule};

    use crate::source::SharedMetrics;

    fn fixed(outcome: ProbeOutcome) -> Arc<dyn Probe> {
        Arc::new(move |_ctx: ProbeContext| {
            let outcome = outcome.clone();
            async move { Ok::<_, anyhow::Error>(outcome) }
        })
    }

    fn counting(calls: Arc<AtomicUsize>) -> Arc<dyn ActionHandler> {
        Arc::new(move |_ctx: ActionContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(true) }
        })
    }

    #[test]
    fn check_metadata_layers_fields() {
        let mut metadata = Metadata::new();
        metadata.insert("connections".into(), MetaValue::from(3.0));
        metadata.insert("error".into(), MetaValue::from("refused"));
        let mut tags = BTreeMap::new();
        tags.insert("tier".to_string(), "data".to_string());
        let result = HealthCheckResult {
            name: "db".into(),
            status: HealthStatus::Critical,
            message: "refused".into(),
            latency_ms: 12.5,
            timestamp: 0,
            metadata,
            tags,
            failure: Some(FailureKind::ProbeError),
        };

        let meta = check_metadata(&result);
        assert_eq!(meta["check"], MetaValue::from("db"));
        assert_eq!(meta["status"], MetaValue::from("critical"));
        assert_eq!(meta["latency_ms"], MetaValue::from(12.5));
        assert_eq!(meta["connections"], MetaValue::from(3.0));
        assert_eq!(meta["tier"], MetaValue::from("data"));
        assert_eq!(meta["message"], MetaValue::from("refused"));
        assert!(!meta.contains_key("error"));
    }

    #[tokio::test]
    async fn failing_check_triggers_recovery() {
        let sink = Arc::new(MemorySink::new());
        let restarts = Arc::new(AtomicUsize::new(0));

        let health = HealthCheckManager::new(vec![
            HealthCheckDefinition::new("api", fixed(ProbeOutcome::critical("down"))),
            HealthCheckDefinition::new("db", fixed(ProbeOutcome::healthy("ok"))),
        ])
        .unwrap();
        let alerts = AlertEvaluator::new(Vec::new(), sink.clone()).unwrap();
        let recovery = RecoveryOrchestrator::new(
            vec![RecoveryRule::new("restart", TriggerCondition::HealthCheckFailed)
                .with_action("restart_service", counting(restarts.clone()))],
            sink.clone(),
        )
        .unwrap();
        let engine = Engine::new(health, alerts, recovery);

        let report = engine.tick().await;
        assert_eq!(report.health.status, HealthStatus::Critical);
        assert_eq!(report.triggers.len(), 1);
        assert_eq!(report.triggers[0].0, TriggerCondition::HealthCheckFailed);

        let ids = engine.drain_recovery().await;
        assert_eq!(ids.len(), 1);
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(EventKind::RecoveryCompleted).await, 1);

        let status = engine.status().await;
        assert_eq!(status.ticks, 1);
        assert_eq!(status.recent_recoveries[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn fired_alert_raises_its_trigger() {
        let sink = Arc::new(MemorySink::new());
        let scaled = Arc::new(AtomicUsize::new(0));
        let host = SharedMetrics::new("host");
        host.set("cpu_usage_percent", 95.0).await;

        let health = HealthCheckManager::new(Vec::new()).unwrap();
        let alerts = AlertEvaluator::new(
            vec![AlertRule::new("cpu-high", "cpu_usage_percent", Comparator::Gt, 80.0)
                .with_trigger(TriggerCondition::HighResourceUsage)],
            sink.clone(),
        )
        .unwrap();
        let recovery = RecoveryOrchestrator::new(
            vec![RecoveryRule::new("scale-out", TriggerCondition::HighResourceUsage)
                .with_action("scale", counting(scaled.clone()))],
            sink.clone(),
        )
        .unwrap();
        let engine =
            Engine::new(health, alerts, recovery).with_metric_source(Arc::new(host.clone()));

        let report = engine.tick().await;
        assert!(matches!(report.transitions.as_slice(), [AlertTransition::Fired(_)]));
        let (condition, meta) = &report.triggers[0];
        assert_eq!(*condition, TriggerCondition::HighResourceUsage);
        assert_eq!(meta["alert"], MetaValue::from("cpu-high"));
        assert_eq!(meta["value"], MetaValue::from(95.0));

        engine.drain_recovery().await;
        assert_eq!(scaled.load(Ordering::SeqCst), 1);
        assert_eq!(engine.status().await.active_alerts.len(), 1);

        host.set("cpu_usage_percent", 20.0).await;
        let report = engine.tick().await;
        assert!(matches!(report.transitions.as_slice(), [AlertTransition::Resolved(_)]));
        assert!(report.triggers.is_empty());
    }

    #[tokio::test]
    async fn open_breaker_raises_trigger_once() {
        let sink = Arc::new(MemorySink::new());
        let health = HealthCheckManager::new(vec![HealthCheckDefinition::new(
            "cache",
            fixed(ProbeOutcome::unhealthy("evicting")),
        )
        .with_breaker(1, Duration::from_secs(60))
        .with_tag("tier", "cache")])
        .unwrap();
        let alerts = AlertEvaluator::new(Vec::new(), sink.clone()).unwrap();
        let recovery = RecoveryOrchestrator::new(Vec::new(), sink).unwrap();
        let engine = Engine::new(health, alerts, recovery);

        let first = engine.tick().await;
        let conditions: Vec<_> = first.triggers.iter().map(|(c, _)| *c).collect();
        assert_eq!(
            conditions,
            vec![
                TriggerCondition::HealthCheckFailed,
                TriggerCondition::CircuitBreakerOpen
            ]
        );
        assert_eq!(first.triggers[1].1["tier"], MetaValue::from("cache"));

        // Fail-fast results while open do not re-trigger.
        let second = engine.tick().await;
        assert!(second.triggers.is_empty());
        assert!(engine.drain_recovery().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let probe: Arc<dyn Probe> = Arc::new(move |_ctx: ProbeContext| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(ProbeOutcome::healthy("ok")) }
        });
        let sink: Arc<dyn NotificationSink> = Arc::new(MemorySink::new());
        let engine = Arc::new(Engine::new(
            HealthCheckManager::new(vec![HealthCheckDefinition::new("api", probe)]).unwrap(),
            AlertEvaluator::new(Vec::new(), sink.clone()).unwrap(),
            RecoveryOrchestrator::new(Vec::new(), sink).unwrap(),
        )
        .with_interval(Duration::from_secs(10)));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = {
            let engine = engine.clone();
            let interval = engine.interval();
            tokio::spawn(async move { engine.run(interval, shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        // Ticks at t=0, 10 and 20.
        assert_eq!(engine.ticks(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
