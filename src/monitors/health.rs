//! System health score
//!
//! ```text
//! score = 100
//!       − min(40, (sla_target − sla%) × 4)
//!       − min(30, (error% − error_baseline%) × 1.5)
//!       − min(30, 30 × (backlog − baseline) / (threshold − baseline))
//! ```
//!
//! Each penalty is zero while its input is on the good side of the target
//! or baseline.

use serde::Serialize;

const SLA_PENALTY_MAX: f64 = 40.0;
const SLA_PENALTY_PER_POINT: f64 = 4.0;
const ERROR_PENALTY_MAX: f64 = 30.0;
const ERROR_PENALTY_PER_POINT: f64 = 1.5;
const BACKLOG_PENALTY_MAX: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Critical,
}

impl HealthState {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            HealthState::Healthy
        } else if score >= 50.0 {
            HealthState::Degraded
        } else {
            HealthState::Critical
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthInputs {
    pub sla_percentage: f64,
    pub sla_target: f64,
    /// Error rate in percent
    pub error_rate_pct: f64,
    pub error_baseline_pct: f64,
    pub backlog: u64,
    pub backlog_baseline: u64,
    pub backlog_threshold: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthScore {
    pub score: f64,
    pub state: HealthState,
    pub sla_penalty: f64,
    pub error_penalty: f64,
    pub backlog_penalty: f64,
}

pub fn health_score(inputs: &HealthInputs) -> HealthScore {
    let sla_penalty = ((inputs.sla_target - inputs.sla_percentage).max(0.0)
        * SLA_PENALTY_PER_POINT)
        .min(SLA_PENALTY_MAX);

    let error_penalty = ((inputs.error_rate_pct - inputs.error_baseline_pct).max(0.0)
        * ERROR_PENALTY_PER_POINT)
        .min(ERROR_PENALTY_MAX);

    let backlog_penalty = if inputs.backlog <= inputs.backlog_baseline {
        0.0
    } else {
        let span = inputs
            .backlog_threshold
            .saturating_sub(inputs.backlog_baseline)
            .max(1) as f64;
        let excess = (inputs.backlog - inputs.backlog_baseline) as f64;
        (BACKLOG_PENALTY_MAX * excess / span).min(BACKLOG_PENALTY_MAX)
    };

    let score = (100.0 - sla_penalty - error_penalty - backlog_penalty).clamp(0.0, 100.0);

    HealthScore {
        score,
        state: HealthState::from_score(score),
        sla_penalty,
        error_penalty,
        backlog_penalty,
    }
}
