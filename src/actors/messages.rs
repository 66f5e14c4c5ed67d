//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to specific actors via mpsc
//! 2. **Events**: Broadcast notifications published to multiple subscribers
//! 3. **Immutability**: All messages are cloneable for multi-subscriber patterns

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::monitors::health::HealthScore;
use crate::queue::QueueMetrics;
use crate::storage::Alert;

/// Delivery counts for one calendar day.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryMetrics {
    pub date: Option<NaiveDate>,
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub sent: usize,
    pub delivered: usize,
    pub failed: usize,
    pub fallback: usize,
    /// Mean scheduled-to-sent latency of sent deliveries
    pub avg_delivery_ms: f64,
    /// (sent + delivered) / total
    pub delivery_rate: f64,
    /// failed / (sent + delivered + failed)
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlaMetrics {
    pub current: f64,
    pub target: f64,
    pub samples: usize,
    pub violations: usize,
    pub failures: usize,
    pub avg_delivery_ms: f64,
    pub p95_delivery_ms: Option<i64>,
    pub p99_delivery_ms: Option<i64>,
}

/// Snapshot published after every monitor cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub generated_at: DateTime<Utc>,
    pub delivery: DeliveryMetrics,
    pub sla: SlaMetrics,
    pub queues: Vec<QueueMetrics>,
    pub health: HealthScore,
    /// Alerts raised in the last 24 hours, newest first
    pub recent_alerts: Vec<Alert>,
}

/// Commands that can be sent to the MonitorActor
#[derive(Debug)]
pub enum MonitorCommand {
    /// Run a monitor cycle immediately (bypassing the interval timer)
    PollNow {
        respond_to: oneshot::Sender<anyhow::Result<Dashboard>>,
    },

    /// Latest snapshot, `None` before the first cycle
    GetDashboard {
        respond_to: oneshot::Sender<Option<Dashboard>>,
    },

    /// Gracefully shut down the monitor
    Shutdown,
}

/// Commands that can be sent to a DailyTriggerActor
#[derive(Debug)]
pub enum TriggerCommand {
    /// Run the task now without waiting for its time of day
    RunNow {
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },

    /// When the task will run next
    NextRun {
        respond_to: oneshot::Sender<DateTime<Utc>>,
    },

    Shutdown,
}

/// Commands that can be sent to the AlertActor
#[derive(Debug)]
pub enum AlertCommand {
    /// Hold back outbound notifications for a duration
    ///
    /// Useful for maintenance windows. Alerts are still recorded.
    MuteAlerts { duration_secs: u64 },

    /// Gracefully shut down the alert actor
    Shutdown,
}
