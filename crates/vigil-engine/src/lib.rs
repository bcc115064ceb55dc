//! vigil-engine: the self-healing loop.
//!
//! ```text
//! Engine::tick()
//!   ├── HealthCheckManager::run_all()          probes, breakers, history
//!   ├── metrics = health metrics + every MetricSource
//!   ├── AlertEvaluator::evaluate_all(metrics)  fired / reminded / resolved
//!   └── dispatch recovery triggers (background)
//!         health_check_failed   per failing check
//!         circuit_breaker_open  per breaker opened this tick
//!         <rule trigger>        per fired alert that names one
//! ```
//!
//! The three components never call each other; the engine is the only
//! thing that moves data between them. Recovery runs off the tick path so
//! a slow remediation never delays the next round of health checks.

pub mod engine;
pub mod error;
pub mod source;
pub mod status;

pub use engine::{Engine, EngineBuilder, TickReport};
pub use error::{EngineError, EngineResult};
pub use source::{MetricSource, SharedMetrics};
pub use status::StatusSnapshot;
