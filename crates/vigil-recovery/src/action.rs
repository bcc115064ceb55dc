//! The action-handler contract and the kind → factory registry.
//!
//! Handlers are registered by the host (service restart, cache clear,
//! scaling). Each call is bounded by the rule timeout; when it elapses
//! the handler's task is told to stop via [`ActionContext::cancelled`]
//! and then aborted at its next await point.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use vigil_core::config::KindSpec;
use vigil_core::{BoxFuture, Metadata, TriggerCondition};

use crate::error::{RecoveryError, RecoveryResult};

/// Per-call context handed to an action handler.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub rule: String,
    pub execution_id: String,
    /// Kind of the action being run.
    pub action: String,
    pub trigger: TriggerCondition,
    /// Metadata of the trigger that started the execution.
    pub metadata: Metadata,
    pub deadline: Instant,
    cancel: watch::Receiver<bool>,
}

impl ActionContext {
    pub fn new(
        rule: &str,
        execution_id: &str,
        action: &str,
        trigger: TriggerCondition,
        metadata: Metadata,
        deadline: Instant,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            rule: rule.to_string(),
            execution_id: execution_id.to_string(),
            action: action.to_string(),
            trigger,
            metadata,
            deadline,
            cancel,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the orchestrator has given up on this call.
    pub async fn cancelled(&mut self) {
        while !*self.cancel.borrow_and_update() {
            if self.cancel.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One remediation step.
///
/// `Ok(false)` and `Err` both fail the step and abort the pipeline.
pub trait ActionHandler: Send + Sync {
    fn run(&self, ctx: ActionContext) -> BoxFuture<'_, anyhow::Result<bool>>;
}

impl<F, Fut> ActionHandler for F
where
    F: Fn(ActionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    fn run(&self, ctx: ActionContext) -> BoxFuture<'_, anyhow::Result<bool>> {
        Box::pin((self)(ctx))
    }
}

/// Builds a handler from its `{ kind = ..., ... }` config table.
pub type ActionFactory =
    Arc<dyn Fn(&KindSpec) -> anyhow::Result<Arc<dyn ActionHandler>> + Send + Sync>;

/// Registered action kinds, resolved when the config is loaded.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    factories: HashMap<String, ActionFactory>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: &str, factory: F) -> &mut Self
    where
        F: Fn(&KindSpec) -> anyhow::Result<Arc<dyn ActionHandler>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
        self
    }

    /// Register one shared handler for every use of `kind`.
    pub fn register_handler(&mut self, kind: &str, handler: Arc<dyn ActionHandler>) -> &mut Self {
        self.register(kind, move |_| Ok(handler.clone()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn build(&self, rule: &str, spec: &KindSpec) -> RecoveryResult<Arc<dyn ActionHandler>> {
        let factory =
            self.factories
                .get(&spec.kind)
                .ok_or_else(|| RecoveryError::UnknownActionKind {
                    rule: rule.to_string(),
                    kind: spec.kind.clone(),
                })?;
        factory(spec).map_err(|source| RecoveryError::ActionFactory {
            rule: rule.to_string(),
            kind: spec.kind.clone(),
            source,
        })
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
