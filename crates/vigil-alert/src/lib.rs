//! vigil-alert: threshold alerting over metric snapshots.
//!
//! Each cycle the evaluator compares every enabled rule against the latest
//! [`MetricSnapshot`](vigil_core::MetricSnapshot) and moves its alert
//! through a small state machine:
//!
//! ```text
//! condition true,  no alert        → pending alert (started_at = now)
//! condition true,  held ≥ duration → fire (first notification)
//! condition true,  fired           → re-notify once per cooldown
//! condition false, alert exists    → resolve, one resolution notification
//! ```
//!
//! A missing or non-numeric metric skips the rule for that cycle and
//! leaves its alert untouched.

pub mod error;
pub mod evaluator;
pub mod rule;

pub use error::{AlertError, AlertResult, ConditionError};
pub use evaluator::{AlertEvaluator, AlertInstance, AlertStatus, AlertTransition};
pub use rule::AlertRule;
