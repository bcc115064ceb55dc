//! vigil-recovery: automated remediation.
//!
//! Recovery rules listen for a [`TriggerCondition`](vigil_core::TriggerCondition)
//! and run an ordered list of actions when one arrives:
//!
//! ```text
//! trigger(condition, metadata)
//!   ├── select enabled rules: same condition, match conditions hold
//!   ├── per rule: skip if in flight, cooling down, or out of attempts
//!   └── run actions in order, each under the rule timeout
//!       ├── first failure aborts the rest → rollback actions (if any)
//!       └── RecoveryExecution recorded, cooldown starts, sink notified
//! ```
//!
//! Executions for different rules run concurrently. Actions within one
//! execution never do.

pub mod action;
pub mod error;
pub mod orchestrator;
pub mod rule;

pub use action::{ActionContext, ActionHandler, ActionRegistry};
pub use error::{ActionFailure, RecoveryError, RecoveryResult};
pub use orchestrator::{
    ActionStep, ExecutionStatus, RecoveryExecution, RecoveryOrchestrator, RecoveryStats,
    StepOutcome, StepPhase,
};
pub use rule::{RecoveryAction, RecoveryRule};
