//! Recovery orchestrator: selects rules for a trigger and runs their
//! action pipelines.
//!
//! Per-rule bookkeeping (in-flight flag, completion time for the cooldown,
//! the rolling 24h attempt window) lives in one map behind a mutex. The
//! lock is held only to reserve a slot and to record completion, never
//! while an action runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vigil_core::config::VigilConfig;
use vigil_core::duration::{format_duration, MAX_DURATION};
use vigil_core::{epoch_secs, Event, EventKind, Metadata, NotificationSink, TriggerCondition};

use crate::action::{ActionContext, ActionRegistry};
use crate::error::{ActionFailure, RecoveryError, RecoveryResult};
use crate::rule::{RecoveryAction, RecoveryRule};

/// Default number of executions retained.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Width of the max-attempts window.
pub const ATTEMPT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// The pipeline failed and every rollback action succeeded.
    RolledBack,
}

impl ExecutionStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::RolledBack
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Action,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Rejected,
    Errored,
    TimedOut,
    Panicked,
}

/// Audit record of one action call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub action: String,
    pub phase: StepPhase,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// One run of a recovery rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryExecution {
    pub id: String,
    pub rule: String,
    pub trigger: TriggerCondition,
    /// Action kinds as configured when the execution started.
    pub actions: Vec<String>,
    pub status: ExecutionStatus,
    /// Unix timestamps (seconds).
    pub started_at: u64,
    pub completed_at: Option<u64>,
    /// Position of this execution in the rule's 24h attempt window.
    pub attempt: u32,
    pub error: Option<String>,
    pub metadata: Metadata,
    pub steps: Vec<ActionStep>,
    pub duration_ms: u64,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub executions: u64,
    pub completed: u64,
    pub failed: u64,
    pub rolled_back: u64,
    pub skipped_cooldown: u64,
    pub skipped_max_attempts: u64,
    pub skipped_in_flight: u64,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Skip {
    InFlight,
    Cooldown,
    MaxAttempts,
}

#[derive(Default)]
struct RuleState {
    running: Option<RecoveryExecution>,
    last_completed: Option<Instant>,
    attempts: VecDeque<Instant>,
    last_execution: Option<RecoveryExecution>,
}

struct RuleEntry {
    rule: RecoveryRule,
    enabled: AtomicBool,
}

#[derive(Default)]
struct Counters {
    executions: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rolled_back: AtomicU64,
    skipped_cooldown: AtomicU64,
    skipped_max_attempts: AtomicU64,
    skipped_in_flight: AtomicU64,
}

/// A reserved execution slot for one rule.
struct Reservation {
    index: usize,
    execution: RecoveryExecution,
}

/// Runs recovery rules in response to trigger conditions.
pub struct RecoveryOrchestrator {
    rules: Vec<RuleEntry>,
    state: Mutex<HashMap<String, RuleState>>,
    history: Mutex<VecDeque<RecoveryExecution>>,
    history_limit: usize,
    sink: Arc<dyn NotificationSink>,
    counters: Counters,
}

impl RecoveryOrchestrator {
    /// Create an orchestrator. Rule names must be unique.
    pub fn new(rules: Vec<RecoveryRule>, sink: Arc<dyn NotificationSink>) -> RecoveryResult<Self> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.name.clone()) {
                return Err(RecoveryError::DuplicateRule(rule.name.clone()));
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
            state: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            sink,
            counters: Counters::default(),
        })
    }

    pub fn from_config(
        config: &VigilConfig,
        registry: &ActionRegistry,
        sink: Arc<dyn NotificationSink>,
    ) -> RecoveryResult<Self> {
        let rules = config
            .recovery_rules
            .iter()
            .map(|r| RecoveryRule::from_config(r, registry))
            .collect::<RecoveryResult<Vec<_>>>()?;
        Ok(Self::new(rules, sink)?.with_history_limit(config.engine.recovery_history_limit))
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn rules(&self) -> impl Iterator<Item = &RecoveryRule> {
        self.rules.iter().map(|e| &e.rule)
    }

    /// Enable or disable a rule; applies to the next trigger.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> RecoveryResult<()> {
        self.position(name)
            .map(|i| self.rules[i].enabled.store(enabled, Ordering::Relaxed))?;
        info!(rule = %name, enabled, "recovery rule toggled");
        Ok(())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.position(name)
            .map(|i| self.rules[i].enabled.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Run every enabled rule that matches the trigger. Returns the ids of
    /// the executions that ran; rules that were skipped contribute nothing.
    pub async fn trigger(
        self: &Arc<Self>,
        condition: TriggerCondition,
        metadata: Metadata,
    ) -> Vec<String> {
        let selected: Vec<usize> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.enabled.load(Ordering::Relaxed) && e.rule.matches(condition, &metadata)
            })
            .map(|(i, _)| i)
            .collect();

        if selected.is_empty() {
            debug!(%condition, "no recovery rule matched");
            return Vec::new();
        }

        let reservations = self.reserve_all(&selected, condition, &metadata).await;
        let reserved: Vec<RecoveryExecution> =
            reservations.iter().map(|r| r.execution.clone()).collect();

        let mut tasks = JoinSet::new();
        for reservation in reservations {
            let this = self.clone();
            tasks.spawn(async move { this.run(reservation).await });
        }
        let mut panics = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(%condition, error = %e, "recovery execution task failed");
                panics.push(e.to_string());
            }
        }
        if !panics.is_empty() {
            let reason = panics.join("; ");
            for execution in &reserved {
                self.abandon(execution, &reason).await;
            }
        }

        reserved.into_iter().map(|e| e.id).collect()
    }

    /// Run one rule regardless of its trigger and match conditions.
    ///
    /// Cooldown, attempt limit and the in-flight guard still apply;
    /// `Ok(None)` means the rule was skipped.
    pub async fn manual_trigger(
        self: &Arc<Self>,
        name: &str,
        metadata: Metadata,
    ) -> RecoveryResult<Option<RecoveryExecution>> {
        let index = self.position(name)?;
        if !self.rules[index].enabled.load(Ordering::Relaxed) {
            return Err(RecoveryError::RuleDisabled(name.to_string()));
        }
        let mut reservations = self
            .reserve_all(&[index], TriggerCondition::Manual, &metadata)
            .await;
        let Some(reservation) = reservations.pop() else {
            return Ok(None);
        };
        let reserved = reservation.execution.clone();
        let this = self.clone();
        match tokio::spawn(async move { this.run(reservation).await }).await {
            Ok(execution) => Ok(Some(execution)),
            Err(e) => {
                warn!(rule = %name, error = %e, "recovery execution task failed");
                let abandoned = self.abandon(&reserved, &e.to_string()).await;
                Ok(Some(abandoned.unwrap_or(reserved)))
            }
        }
    }

    /// Release the slot of an execution whose task died before `finish`.
    ///
    /// The execution is recorded as failed and the cooldown starts; the
    /// sink is not called. Returns `None` if the execution had already
    /// finished.
    async fn abandon(
        &self,
        reserved: &RecoveryExecution,
        reason: &str,
    ) -> Option<RecoveryExecution> {
        let execution = {
            let mut state = self.state.lock().await;
            let entry = state.get_mut(&reserved.rule)?;
            if entry.running.as_ref().is_none_or(|r| r.id != reserved.id) {
                return None;
            }
            let mut execution = entry.running.take()?;
            execution.status = ExecutionStatus::Failed;
            execution.error = Some(format!("execution task panicked: {reason}"));
            execution.completed_at = Some(epoch_secs());
            entry.last_completed = Some(Instant::now());
            entry.last_execution = Some(execution.clone());
            execution
        };
        {
            let mut history = self.history.lock().await;
            history.push_back(execution.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(rule = %execution.rule, execution = %execution.id, "recovery execution abandoned");
        Some(execution)
    }

    async fn reserve_all(
        &self,
        indices: &[usize],
        condition: TriggerCondition,
        metadata: &Metadata,
    ) -> Vec<Reservation> {
        let now = Instant::now();
        let mut reserved = Vec::new();
        let mut state = self.state.lock().await;

        for &index in indices {
            let rule = &self.rules[index].rule;
            let entry = state.entry(rule.name.clone()).or_default();

            match reserve(entry, rule, now) {
                Ok(attempt) => {
                    let execution = RecoveryExecution {
                        id: uuid::Uuid::now_v7().to_string(),
                        rule: rule.name.clone(),
                        trigger: condition,
                        actions: rule.action_kinds(),
                        status: ExecutionStatus::Pending,
                        started_at: epoch_secs(),
                        completed_at: None,
                        attempt,
                        error: None,
                        metadata: metadata.clone(),
                        steps: Vec::new(),
                        duration_ms: 0,
                    };
                    entry.running = Some(execution.clone());
                    reserved.push(Reservation { index, execution });
                }
                Err(skip) => {
                    let counter = match skip {
                        Skip::InFlight => &self.counters.skipped_in_flight,
                        Skip::Cooldown => &self.counters.skipped_cooldown,
                        Skip::MaxAttempts => &self.counters.skipped_max_attempts,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    debug!(rule = %rule.name, %condition, reason = ?skip, "recovery skipped");
                }
            }
        }

        reserved
    }

    async fn run(&self, reservation: Reservation) -> RecoveryExecution {
        let Reservation {
            index,
            mut execution,
        } = reservation;
        let rule = &self.rules[index].rule;
        let started = Instant::now();

        execution.status = ExecutionStatus::InProgress;
        self.set_running(&execution).await;
        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        info!(
            rule = %rule.name,
            execution = %execution.id,
            trigger = %execution.trigger,
            attempt = execution.attempt,
            "recovery started"
        );
        self.sink
            .notify(
                Event::new(
                    EventKind::RecoveryStarted,
                    &rule.name,
                    format!("recovery started: {}", execution.actions.join(" → ")),
                )
                .with_payload(&execution),
            )
            .await;

        let failure = self
            .run_pipeline(rule, &rule.actions, StepPhase::Action, &mut execution)
            .await;

        match failure {
            None => execution.status = ExecutionStatus::Completed,
            Some(failure) if rule.rollback.is_empty() => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(failure.to_string());
            }
            Some(failure) => {
                warn!(rule = %rule.name, error = %failure, "recovery failed, rolling back");
                let rollback = self
                    .run_pipeline(rule, &rule.rollback, StepPhase::Rollback, &mut execution)
                    .await;
                match rollback {
                    None => {
                        execution.status = ExecutionStatus::RolledBack;
                        execution.error = Some(failure.to_string());
                    }
                    Some(rollback_failure) => {
                        execution.status = ExecutionStatus::Failed;
                        execution.error =
                            Some(format!("{failure}; rollback: {rollback_failure}"));
                    }
                }
            }
        }

        execution.completed_at = Some(epoch_secs());
        execution.duration_ms = started.elapsed().as_millis() as u64;
        self.finish(&execution).await;
        execution
    }

    /// Run `actions` in order. Returns the first failure, if any.
    async fn run_pipeline(
        &self,
        rule: &RecoveryRule,
        actions: &[RecoveryAction],
        phase: StepPhase,
        execution: &mut RecoveryExecution,
    ) -> Option<ActionFailure> {
        for action in actions {
            let started = Instant::now();
            let result = self.run_action(rule, action, execution).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (outcome, error) = match &result {
                Ok(()) => (StepOutcome::Succeeded, None),
                Err(f) => (step_outcome(f), Some(f.to_string())),
            };
            debug!(
                rule = %rule.name,
                action = %action.kind,
                ?phase,
                ?outcome,
                duration_ms,
                "recovery action finished"
            );
            execution.steps.push(ActionStep {
                action: action.kind.clone(),
                phase,
                outcome,
                duration_ms,
                error,
            });

            if let Err(failure) = result {
                return Some(failure);
            }
        }
        None
    }

    /// Run one action in its own task under the rule timeout.
    async fn run_action(
        &self,
        rule: &RecoveryRule,
        action: &RecoveryAction,
        execution: &RecoveryExecution,
    ) -> Result<(), ActionFailure> {
        let timeout = rule.timeout.min(MAX_DURATION);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = ActionContext::new(
            &rule.name,
            &execution.id,
            &action.kind,
            execution.trigger,
            execution.metadata.clone(),
            Instant::now() + timeout,
            cancel_rx,
        );
        let handler = action.handler.clone();
        let mut task = tokio::spawn(async move { handler.run(ctx).await });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(true))) => Ok(()),
            Ok(Ok(Ok(false))) => Err(ActionFailure::Rejected {
                action: action.kind.clone(),
            }),
            Ok(Ok(Err(e))) => Err(ActionFailure::Error {
                action: action.kind.clone(),
                message: format!("{e:#}"),
            }),
            Ok(Err(join)) => Err(ActionFailure::Panicked {
                action: action.kind.clone(),
                message: join.to_string(),
            }),
            Err(_) => {
                let _ = cancel_tx.send(true);
                task.abort();
                warn!(
                    rule = %rule.name,
                    action = %action.kind,
                    timeout = %format_duration(timeout),
                    "recovery action timed out"
                );
                Err(ActionFailure::Timeout {
                    action: action.kind.clone(),
                    timeout: format_duration(timeout),
                })
            }
        }
    }

    async fn set_running(&self, execution: &RecoveryExecution) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(&execution.rule) {
            entry.running = Some(execution.clone());
        }
    }

    async fn finish(&self, execution: &RecoveryExecution) {
        {
            let mut state = self.state.lock().await;
            let entry = state.entry(execution.rule.clone()).or_default();
            entry.running = None;
            entry.last_completed = Some(Instant::now());
            entry.last_execution = Some(execution.clone());
        }
        {
            let mut history = self.history.lock().await;
            history.push_back(execution.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }

        let (kind, message) = match execution.status {
            ExecutionStatus::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    rule = %execution.rule,
                    execution = %execution.id,
                    duration_ms = execution.duration_ms,
                    "recovery completed"
                );
                (EventKind::RecoveryCompleted, "recovery completed".to_string())
            }
            ExecutionStatus::RolledBack => {
                self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
                warn!(rule = %execution.rule, execution = %execution.id, "recovery rolled back");
                (
                    EventKind::RecoveryFailed,
                    format!(
                        "recovery rolled back: {}",
                        execution.error.as_deref().unwrap_or("unknown error")
                    ),
                )
            }
            _ => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    rule = %execution.rule,
                    execution = %execution.id,
                    error = execution.error.as_deref().unwrap_or(""),
                    "recovery failed"
                );
                (
                    EventKind::RecoveryFailed,
                    format!(
                        "recovery failed: {}",
                        execution.error.as_deref().unwrap_or("unknown error")
                    ),
                )
            }
        };

        self.sink
            .notify(Event::new(kind, &execution.rule, message).with_payload(execution))
            .await;
    }

    /// Most recent finished execution of a rule.
    pub async fn last_execution(&self, rule: &str) -> Option<RecoveryExecution> {
        let state = self.state.lock().await;
        state.get(rule).and_then(|s| s.last_execution.clone())
    }

    /// Look up an execution, running or finished.
    pub async fn execution(&self, id: &str) -> Option<RecoveryExecution> {
        {
            let state = self.state.lock().await;
            if let Some(running) = state
                .values()
                .filter_map(|s| s.running.as_ref())
                .find(|e| e.id == id)
            {
                return Some(running.clone());
            }
        }
        let history = self.history.lock().await;
        history.iter().rev().find(|e| e.id == id).cloned()
    }

    /// Executions currently running.
    pub async fn running(&self) -> Vec<RecoveryExecution> {
        let state = self.state.lock().await;
        let mut running: Vec<RecoveryExecution> =
            state.values().filter_map(|s| s.running.clone()).collect();
        running.sort_by(|a, b| a.rule.cmp(&b.rule));
        running
    }

    /// Finished executions, newest first.
    pub async fn history(&self, limit: Option<usize>) -> Vec<RecoveryExecution> {
        let history = self.history.lock().await;
        history
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> RecoveryStats {
        let in_flight = {
            let state = self.state.lock().await;
            state.values().filter(|s| s.running.is_some()).count()
        };
        let c = &self.counters;
        RecoveryStats {
            executions: c.executions.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            rolled_back: c.rolled_back.load(Ordering::Relaxed),
            skipped_cooldown: c.skipped_cooldown.load(Ordering::Relaxed),
            skipped_max_attempts: c.skipped_max_attempts.load(Ordering::Relaxed),
            skipped_in_flight: c.skipped_in_flight.load(Ordering::Relaxed),
            in_flight,
        }
    }

    fn position(&self, name: &str) -> RecoveryResult<usize> {
        self.rules
            .iter()
            .position(|e| e.rule.name == name)
            .ok_or_else(|| RecoveryError::UnknownRule(name.to_string()))
    }
}

/// Claim an execution slot, or say why the rule must be skipped.
fn reserve(state: &mut RuleState, rule: &RecoveryRule, now: Instant) -> Result<u32, Skip> {
    if state.running.is_some() {
        return Err(Skip::InFlight);
    }
    if let Some(last) = state.last_completed {
        if now.saturating_duration_since(last) < rule.cooldown {
            return Err(Skip::Cooldown);
        }
    }
    while state
        .attempts
        .front()
        .is_some_and(|t| now.saturating_duration_since(*t) >= ATTEMPT_WINDOW)
    {
        state.attempts.pop_front();
    }
    if state.attempts.len() >= rule.max_attempts as usize {
        return Err(Skip::MaxAttempts);
    }
    state.attempts.push_back(now);
    Ok(state.attempts.len() as u32)
}

fn step_outcome(failure: &ActionFailure) -> StepOutcome {
    match failure {
        ActionFailure::Rejected { .. } => StepOutcome::Rejected,
        ActionFailure::Error { .. } => StepOutcome::Errored,
        ActionFailure::Timeout { .. } => StepOutcome::TimedOut,
        ActionFailure::Panicked { .. } => StepOutcome::Panicked,
    }
}
