//! Persisted record types
//!
//! Every component talks to the others through these rows: the scheduler
//! writes `DeliveryRecord`s and `SlaMetricRecord`s, the fallback assigner
//! reads and updates `FallbackContentEntry`s, and the monitor reads all of
//! them and writes `Alert`s.
//!
//! Timestamps are UTC; the SQLite backend stores them as Unix milliseconds
//! and calendar dates as `YYYY-MM-DD` text.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{DeliveryJob, DeliveryStatus, FallbackReason, RiskLevel, Tier};

/// One delivery per advisor per calendar day.
///
/// `(advisor_id, delivery_date)` is the idempotency key: the scheduler claims
/// it before admitting a job, so a second scheduling run cannot enqueue the
/// same advisor twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub advisor_id: String,
    pub delivery_date: NaiveDate,
    pub content_id: String,
    pub tier: Tier,
    pub scheduled_time: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub is_fallback: bool,
    pub fallback_reason: Option<FallbackReason>,
    pub message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// `sent_at − scheduled_time`, never negative
    pub delivery_time_ms: Option<i64>,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// A pending record for a job that is about to be admitted.
    pub fn pending(job: &DeliveryJob, now: DateTime<Utc>) -> Self {
        Self {
            advisor_id: job.advisor_id.clone(),
            delivery_date: job.delivery_date,
            content_id: job.content_id.clone(),
            tier: job.tier,
            scheduled_time: job.scheduled_time,
            status: DeliveryStatus::Pending,
            is_fallback: job.is_fallback,
            fallback_reason: job.fallback_reason,
            message_id: None,
            sent_at: None,
            delivered_at: None,
            delivery_time_ms: None,
            failure_reason: None,
            attempts: 0,
            created_at: now,
        }
    }
}

/// A pre-approved piece of generic content that can stand in for an
/// advisor's own submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackContentEntry {
    pub id: String,
    pub category: String,
    pub market_focus: String,
    pub risk_level: RiskLevel,
    pub tier: Tier,
    pub text: String,
    pub language: String,
    pub usage_count: u32,
    pub last_used: Option<DateTime<Utc>>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

/// Which pool entry an advisor received on which day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackUsage {
    pub advisor_id: String,
    pub entry_id: String,
    pub delivery_date: NaiveDate,
}

/// Filter for fallback candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    pub advisor_id: String,
    pub tier: Tier,
    /// Entries the advisor received on or after this date are excluded
    pub exclude_used_since: NaiveDate,
    pub max_usage: u32,
    pub limit: usize,
}

/// One final-attempt outcome of a delivery job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaMetricRecord {
    pub job_id: String,
    pub advisor_id: String,
    pub tier: Tier,
    pub delivery_time_ms: i64,
    pub within_sla: bool,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlaViolation,
    HighErrorRate,
    QueueBacklog,
    SystemFailure,
}

impl AlertKind {
    pub const ALL: [AlertKind; 4] = [
        AlertKind::SlaViolation,
        AlertKind::HighErrorRate,
        AlertKind::QueueBacklog,
        AlertKind::SystemFailure,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::SlaViolation => "sla_violation",
            AlertKind::HighErrorRate => "high_error_rate",
            AlertKind::QueueBacklog => "queue_backlog",
            AlertKind::SystemFailure => "system_failure",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlertKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown alert type '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// A raised alert. No other alert of the same kind is accepted before
/// `cooldown_until`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
}
