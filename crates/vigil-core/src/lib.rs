//! vigil-core: shared vocabulary for the Vigil monitoring engine.
//!
//! Holds the types every subsystem agrees on (health statuses, metadata
//! values, metric snapshots, trigger conditions), the `vigil.toml`
//! configuration model, and the `NotificationSink` contract through which
//! alert and recovery events leave the engine.

pub mod config;
pub mod duration;
pub mod error;
pub mod event;
pub mod types;

pub use config::VigilConfig;
pub use error::{ConfigError, ConfigResult};
pub use event::{BoxFuture, Event, EventKind, MemorySink, NotificationSink, NullSink, TracingSink};
pub use types::*;
