//! Alert rule evaluation
//!
//! | Rule              | Fires when                                        |
//! |-------------------|---------------------------------------------------|
//! | `sla_violation`   | SLA% < warning and samples > minimum              |
//! | `high_error_rate` | failed / finished deliveries > threshold          |
//! | `queue_backlog`   | waiting jobs across queues > threshold            |
//! | `system_failure`  | failed / (completed + failed) jobs > threshold    |
//!
//! Rules only produce candidates. Whether a candidate becomes an alert is
//! decided by the cooldown check in the store.

use std::time::Duration;

use serde::Serialize;

use crate::config::MonitorConfig;
use crate::storage::{AlertKind, Severity};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertCandidate {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleInputs {
    pub sla_percentage: f64,
    pub sla_samples: usize,
    /// Failed / finished deliveries today (0.0..=1.0)
    pub error_rate: f64,
    pub waiting_jobs: u64,
    /// Failed / (completed + failed) queue jobs (0.0..=1.0)
    pub failure_ratio: f64,
}

pub fn cooldown_for(kind: AlertKind, config: &MonitorConfig) -> Duration {
    match kind {
        AlertKind::SlaViolation => config.cooldowns.sla_violation,
        AlertKind::HighErrorRate => config.cooldowns.high_error_rate,
        AlertKind::QueueBacklog => config.cooldowns.queue_backlog,
        AlertKind::SystemFailure => config.cooldowns.system_failure,
    }
}

/// The SLA rule on its own; the scheduler runs it after every sample.
pub fn sla_violation(
    percentage: f64,
    samples: usize,
    config: &MonitorConfig,
) -> Option<AlertCandidate> {
    if samples <= config.min_sla_samples || percentage >= config.sla_warning {
        return None;
    }

    let severity = if percentage < config.sla_critical {
        Severity::Critical
    } else {
        Severity::Warning
    };

    Some(AlertCandidate {
        kind: AlertKind::SlaViolation,
        severity,
        message: format!(
            "SLA at {percentage:.2}% over {samples} deliveries (target {:.2}%)",
            config.sla_target
        ),
    })
}

pub fn evaluate_rules(inputs: &RuleInputs, config: &MonitorConfig) -> Vec<AlertCandidate> {
    let mut candidates = Vec::new();

    if let Some(sla) = sla_violation(inputs.sla_percentage, inputs.sla_samples, config) {
        candidates.push(sla);
    }

    if inputs.error_rate > config.error_rate_threshold {
        candidates.push(AlertCandidate {
            kind: AlertKind::HighErrorRate,
            severity: Severity::Warning,
            message: format!(
                "delivery error rate {:.2}% exceeds {:.2}%",
                inputs.error_rate * 100.0,
                config.error_rate_threshold * 100.0
            ),
        });
    }

    if inputs.waiting_jobs > config.backlog_threshold {
        let severity = if inputs.waiting_jobs > config.backlog_threshold.saturating_mul(2) {
            Severity::Critical
        } else {
            Severity::Warning
        };
        candidates.push(AlertCandidate {
            kind: AlertKind::QueueBacklog,
            severity,
            message: format!(
                "{} jobs waiting (threshold {})",
                inputs.waiting_jobs, config.backlog_threshold
            ),
        });
    }

    if inputs.failure_ratio > config.system_failure_ratio {
        candidates.push(AlertCandidate {
            kind: AlertKind::SystemFailure,
            severity: Severity::Critical,
            message: format!(
                "{:.1}% of queue jobs failed permanently",
                inputs.failure_ratio * 100.0
            ),
        });
    }

    candidates
}
