//! vigil-health: health checking with per-probe failure isolation.
//!
//! # Architecture
//!
//! ```text
//! HealthCheckManager
//!   ├── run_all() → one task per enabled check (bounded by a semaphore)
//!   │   └── HealthCheckRunner::execute()
//!   │       ├── CircuitBreaker gate (closed / open / half-open)
//!   │       ├── Probe::check() under a timeout → ProbeOutcome
//!   │       └── HealthCheckResult + breaker success/failure
//!   ├── bounded result history per check
//!   └── summary() / metrics() for status queries and alert evaluation
//! ```
//!
//! # Failure isolation
//!
//! A check whose breaker is open fails fast without touching the probe.
//! After the breaker timeout one trial call is let through; success closes
//! the breaker, failure re-opens it for another full timeout. Timeouts,
//! probe errors, and panics all become `critical` results rather than
//! errors, so one broken probe never stalls the cycle.

pub mod breaker;
pub mod error;
pub mod manager;
pub mod probe;
pub mod runner;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use error::{HealthError, HealthResult};
pub use manager::{CheckSummary, HealthCheckManager, HealthReport, HealthSummary};
pub use probe::{Probe, ProbeContext, ProbeOutcome, ProbeRegistry};
pub use runner::{FailureKind, HealthCheckDefinition, HealthCheckResult, HealthCheckRunner, RunOutcome};
