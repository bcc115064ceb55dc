//! Recovery rule definition.

use std::sync::Arc;
use std::time::Duration;

use vigil_core::config::{KindSpec, RecoveryRuleConfig};
use vigil_core::{MatchCondition, Metadata, TriggerCondition};

use crate::action::{ActionHandler, ActionRegistry};
use crate::error::RecoveryResult;

/// A resolved action: its kind name and the handler that runs it.
#[derive(Clone)]
pub struct RecoveryAction {
    pub kind: String,
    pub handler: Arc<dyn ActionHandler>,
}

impl RecoveryAction {
    pub fn new(kind: &str, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            kind: kind.to_string(),
            handler,
        }
    }
}

impl std::fmt::Debug for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryAction")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryRule {
    pub name: String,
    pub trigger: TriggerCondition,
    /// Run in order; the first failure aborts the rest.
    pub actions: Vec<RecoveryAction>,
    /// Run in order after a failed pipeline.
    pub rollback: Vec<RecoveryAction>,
    /// Measured from the completion of the previous execution.
    pub cooldown: Duration,
    /// Executions allowed per rolling 24h window.
    pub max_attempts: u32,
    /// Per-action timeout.
    pub timeout: Duration,
    pub conditions: Vec<MatchCondition>,
    pub enabled: bool,
}

impl RecoveryRule {
    pub fn new(name: &str, trigger: TriggerCondition) -> Self {
        Self {
            name: name.to_string(),
            trigger,
            actions: Vec::new(),
            rollback: Vec::new(),
            cooldown: Duration::from_secs(300),
            max_attempts: 3,
            timeout: Duration::from_secs(30),
            conditions: Vec::new(),
            enabled: true,
        }
    }

    /// Resolve a config entry, building each action from the registry.
    pub fn from_config(config: &RecoveryRuleConfig, registry: &ActionRegistry) -> RecoveryResult<Self> {
        let build = |specs: &[KindSpec]| {
            specs
                .iter()
                .map(|spec| -> RecoveryResult<RecoveryAction> {
                    Ok(RecoveryAction::new(
                        &spec.kind,
                        registry.build(&config.name, spec)?,
                    ))
                })
                .collect::<RecoveryResult<Vec<_>>>()
        };

        Ok(Self {
            name: config.name.clone(),
            trigger: config.trigger,
            actions: build(&config.actions)?,
            rollback: build(&config.rollback)?,
            cooldown: config.cooldown()?,
            max_attempts: config.max_attempts,
            timeout: config.timeout()?,
            conditions: config.conditions.clone(),
            enabled: config.enabled,
        })
    }

    pub fn with_action(mut self, kind: &str, handler: Arc<dyn ActionHandler>) -> Self {
        self.actions.push(RecoveryAction::new(kind, handler));
        self
    }

    pub fn with_rollback(mut self, kind: &str, handler: Arc<dyn ActionHandler>) -> Self {
        self.rollback.push(RecoveryAction::new(kind, handler));
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_condition(mut self, condition: MatchCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn action_kinds(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.kind.clone()).collect()
    }

    /// Whether a trigger selects this rule. Enablement is checked by the
    /// orchestrator.
    pub fn matches(&self, condition: TriggerCondition, metadata: &Metadata) -> bool {
        self.trigger == condition && self.conditions.iter().all(|c| c.matches(metadata))
    }
}
