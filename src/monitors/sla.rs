use serde::Serialize;

use crate::storage::SlaMetricRecord;

/// Aggregate of a set of SLA samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlaSummary {
    pub samples: usize,
    /// Successful and within the SLA window
    pub within_sla: usize,
    pub failures: usize,
    /// `within_sla / samples × 100`, 100.0 without samples
    pub percentage: f64,
    pub avg_delivery_ms: f64,
    pub p95_delivery_ms: Option<i64>,
    pub p99_delivery_ms: Option<i64>,
}

impl SlaSummary {
    pub fn from_samples(samples: &[SlaMetricRecord]) -> Self {
        let within_sla = samples.iter().filter(|s| s.success && s.within_sla).count();
        let failures = samples.iter().filter(|s| !s.success).count();

        let mut latencies: Vec<i64> = samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.delivery_time_ms)
            .collect();
        latencies.sort_unstable();

        let avg_delivery_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<i64>() as f64 / latencies.len() as f64
        };

        Self {
            samples: samples.len(),
            within_sla,
            failures,
            percentage: sla_percentage(within_sla, samples.len()),
            avg_delivery_ms,
            p95_delivery_ms: percentile(&latencies, 95.0),
            p99_delivery_ms: percentile(&latencies, 99.0),
        }
    }

    /// Samples that missed the window or failed.
    pub fn violations(&self) -> usize {
        self.samples - self.within_sla
    }
}

pub fn sla_percentage(within: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    within as f64 * 100.0 / total as f64
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile(sorted: &[i64], p: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[index])
}
