//! End-to-end tests driving the engine from a `vigil.toml` document.
//!
//! Probes and actions are registered under test kinds so each tick's
//! outcome is controlled by the test.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use vigil_core::{EventKind, HealthStatus, MemorySink, VigilConfig};
use vigil_engine::{Engine, EngineBuilder, SharedMetrics};
use vigil_health::{Probe, ProbeContext, ProbeOutcome, ProbeRegistry};
use vigil_recovery::{ActionContext, ActionHandler, ActionRegistry, ExecutionStatus};

const CONFIG: &str = r#"
[engine]
interval = "1s"
labels = { env = "test" }

[[health_check]]
name = "api"
probe = { kind = "flag" }
timeout = "1s"
failure_threshold = 2
breaker_timeout = "1h"
tags = { tier = "frontend" }

[[alert_rule]]
name = "cpu-high"
metric = "cpu_usage_percent"
threshold = 90.0
comparator = ">"
severity = "critical"
trigger = "high_resource_usage"
conditions = { env = "test" }

[[recovery_rule]]
name = "restart-api"
trigger = "health_check_failed"
actions = [{ kind = "count", counter = "restart" }]
cooldown = "0s"
max_attempts = 5
conditions = [{ op = "is", key = "check", value = "api" }]

[[recovery_rule]]
name = "isolate-api"
trigger = "circuit_breaker_open"
actions = [{ kind = "count", counter = "isolate" }]

[[recovery_rule]]
name = "scale-out"
trigger = "high_resource_usage"
actions = [{ kind = "count", counter = "scale" }]
"#;

type Counters = Arc<Mutex<BTreeMap<String, usize>>>;

struct Harness {
    engine: Engine,
    up: Arc<AtomicBool>,
    host: SharedMetrics,
    counters: Counters,
    sink: Arc<MemorySink>,
}

impl Harness {
    fn new() -> Self {
        let up = Arc::new(AtomicBool::new(true));
        let counters: Counters = Arc::new(Mutex::new(BTreeMap::new()));
        let host = SharedMetrics::new("host");
        let sink = Arc::new(MemorySink::new());

        let mut probes = ProbeRegistry::new();
        let flag = up.clone();
        probes.register("flag", move |_spec| {
            let flag = flag.clone();
            let probe: Arc<dyn Probe> = Arc::new(move |_ctx: ProbeContext| {
                let healthy = flag.load(Ordering::SeqCst);
                async move {
                    Ok::<_, anyhow::Error>(if healthy {
                        ProbeOutcome::healthy("ok")
                    } else {
                        ProbeOutcome::unhealthy("connection refused")
                    })
                }
            });
            Ok(probe)
        });

        let mut actions = ActionRegistry::new();
        let shared = counters.clone();
        actions.register("count", move |spec| {
            let counter = spec
                .str_param("counter")
                .ok_or_else(|| anyhow::anyhow!("counter is required"))?
                .to_string();
            let shared = shared.clone();
            let handler: Arc<dyn ActionHandler> = Arc::new(move |_ctx: ActionContext| {
                *shared.lock().unwrap().entry(counter.clone()).or_default() += 1;
                async { Ok::<_, anyhow::Error>(true) }
            });
            Ok(handler)
        });

        let config = VigilConfig::from_toml_str(CONFIG).unwrap();
        let engine = EngineBuilder::new(config)
            .with_probes(probes)
            .with_actions(actions)
            .with_sink(sink.clone())
            .with_metric_source(Arc::new(host.clone()))
            .build()
            .unwrap();

        Self {
            engine,
            up,
            host,
            counters,
            sink,
        }
    }

    fn count(&self, counter: &str) -> usize {
        self.counters.lock().unwrap().get(counter).copied().unwrap_or(0)
    }

    async fn tick(&self) {
        self.engine.tick().await;
        self.engine.drain_recovery().await;
    }
}

#[tokio::test]
async fn healthy_system_does_nothing() {
    let h = Harness::new();
    h.host.set("cpu_usage_percent", 40.0).await;

    h.tick().await;
    h.tick().await;

    assert_eq!(h.engine.ticks(), 2);
    assert!(h.counters.lock().unwrap().is_empty());
    assert!(h.sink.events().await.is_empty());
    assert_eq!(h.engine.health().status().await, HealthStatus::Healthy);
}

#[tokio::test]
async fn failing_check_recovers_then_breaker_isolates() {
    let h = Harness::new();
    h.tick().await;

    h.up.store(false, Ordering::SeqCst);
    h.tick().await;
    assert_eq!(h.count("restart"), 1);
    assert_eq!(h.count("isolate"), 0);

    // Second consecutive failure opens the breaker.
    h.tick().await;
    assert_eq!(h.count("restart"), 2);
    assert_eq!(h.count("isolate"), 1);

    // Open breaker fails fast and raises nothing new.
    h.tick().await;
    assert_eq!(h.count("restart"), 2);
    assert_eq!(h.count("isolate"), 1);

    let stats = h.engine.recovery().stats().await;
    assert_eq!(stats.completed, 3);
    assert_eq!(h.sink.count(EventKind::RecoveryCompleted).await, 3);
}

#[tokio::test]
async fn resource_alert_scales_out_once() {
    let h = Harness::new();
    h.host.set("cpu_usage_percent", 97.0).await;

    h.tick().await;
    h.tick().await;
    assert_eq!(h.count("scale"), 1);
    assert_eq!(h.sink.count(EventKind::AlertFired).await, 1);

    h.host.set("cpu_usage_percent", 30.0).await;
    h.tick().await;
    assert_eq!(h.sink.count(EventKind::AlertResolved).await, 1);
    assert!(h.engine.alerts().active_alerts().await.is_empty());
}

#[tokio::test]
async fn status_serializes_whole_engine() {
    let h = Harness::new();
    h.host.set("cpu_usage_percent", 99.0).await;
    h.up.store(false, Ordering::SeqCst);
    h.tick().await;

    let status = h.engine.status().await;
    assert_eq!(status.status, HealthStatus::Unhealthy);
    assert_eq!(status.active_alerts.len(), 1);
    assert_eq!(status.recent_recoveries.len(), 2);
    assert!(
        status
            .recent_recoveries
            .iter()
            .all(|e| e.status == ExecutionStatus::Completed)
    );

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["status"], "unhealthy");
    assert_eq!(json["ticks"], 1);
    assert_eq!(json["health"]["checks"][0]["name"], "api");
    assert_eq!(json["active_alerts"][0]["rule"], "cpu-high");
    assert_eq!(json["recovery_stats"]["completed"], 2);
}

#[test]
fn unknown_action_kind_fails_build() {
    let config = VigilConfig::from_toml_str(
        r#"
[[recovery_rule]]
name = "restart"
trigger = "manual"
actions = [{ kind = "teleport" }]
"#,
    )
    .unwrap();

    let err = EngineBuilder::new(config).build().err().unwrap();
    assert!(err.to_string().contains("teleport"), "{err}");
}
