//! Read-only status snapshot for dashboards and CLIs.

use serde::{Deserialize, Serialize};

use vigil_alert::AlertInstance;
use vigil_core::HealthStatus;
use vigil_health::HealthSummary;
use vigil_recovery::{RecoveryExecution, RecoveryStats};

/// Number of resolved alerts and finished executions included.
pub const RECENT_LIMIT: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Aggregate health status.
    pub status: HealthStatus,
    pub health: HealthSummary,
    pub active_alerts: Vec<AlertInstance>,
    pub resolved_alerts: Vec<AlertInstance>,
    pub running_recoveries: Vec<RecoveryExecution>,
    pub recent_recoveries: Vec<RecoveryExecution>,
    pub recovery_stats: RecoveryStats,
    pub ticks: u64,
    /// Unix timestamp (seconds).
    pub generated_at: u64,
}
