//! The probe contract and the kind → factory registry.
//!
//! Probes are supplied by the host application. The runner bounds each
//! call with a timeout and stops waiting when it elapses; it cannot kill
//! work the probe has handed off elsewhere. Probes that spawn their own
//! tasks should watch [`ProbeContext::cancelled`] and stop when it fires.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use vigil_core::config::KindSpec;
use vigil_core::{BoxFuture, HealthStatus, MetaValue, Metadata};

use crate::error::{HealthError, HealthResult};

/// Per-call context handed to a probe.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    /// Name of the check being run.
    pub check: String,
    /// When the runner stops waiting for this call.
    pub deadline: Instant,
    cancel: watch::Receiver<bool>,
}

impl ProbeContext {
    pub fn new(check: &str, deadline: Instant, cancel: watch::Receiver<bool>) -> Self {
        Self {
            check: check.to_string(),
            deadline,
            cancel,
        }
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the runner has given up on this call.
    pub async fn cancelled(&mut self) {
        while !*self.cancel.borrow_and_update() {
            if self.cancel.changed().await.is_err() {
                // Runner dropped the sender: nobody is waiting any more.
                return;
            }
        }
    }
}

/// What a probe reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: HealthStatus,
    pub message: String,
    pub metadata: Metadata,
}

impl ProbeOutcome {
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Healthy, message)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, message)
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Critical, message)
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A unit of work that reports the health of one dependency.
///
/// Returning `Err` is reported as a critical result carrying the error.
pub trait Probe: Send + Sync {
    fn check(&self, ctx: ProbeContext) -> BoxFuture<'_, anyhow::Result<ProbeOutcome>>;
}

impl<F, Fut> Probe for F
where
    F: Fn(ProbeContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ProbeOutcome>> + Send + 'static,
{
    fn check(&self, ctx: ProbeContext) -> BoxFuture<'_, anyhow::Result<ProbeOutcome>> {
        Box::pin((self)(ctx))
    }
}

/// Builds a probe from its `{ kind = ..., ... }` config table.
pub type ProbeFactory =
    Arc<dyn Fn(&KindSpec) -> anyhow::Result<Arc<dyn Probe>> + Send + Sync>;

/// Registered probe kinds, resolved when the config is loaded.
#[derive(Clone, Default)]
pub struct ProbeRegistry {
    factories: HashMap<String, ProbeFactory>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a probe kind, replacing any previous one.
    pub fn register<F>(&mut self, kind: &str, factory: F) -> &mut Self
    where
        F: Fn(&KindSpec) -> anyhow::Result<Arc<dyn Probe>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
        self
    }

    /// Register a single shared probe instance under a kind.
    pub fn register_instance(&mut self, kind: &str, probe: Arc<dyn Probe>) -> &mut Self {
        self.register(kind, move |_| Ok(probe.clone()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Build the probe for one check.
    pub fn build(&self, check: &str, spec: &KindSpec) -> HealthResult<Arc<dyn Probe>> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| HealthError::UnknownProbeKind {
                check: check.to_string(),
                kind: spec.kind.clone(),
            })?;
        factory(spec).map_err(|source| HealthError::ProbeFactory {
            check: check.to_string(),
            source,
        })
    }
}

impl std::fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
