use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::trace;

use crate::RiskLevel;
use crate::queue::QueueSettings;

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./dispatch.db")
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// IANA timezone the daily anchors are expressed in
    #[serde(default = "default_timezone")]
    pub timezone: Tz,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Storage configuration (defaults to SQLite)
    #[serde(default)]
    pub storage: StorageConfig,

    pub channel: Option<ChannelConfig>,

    #[serde(default)]
    pub alerts: Vec<Alert>,

    #[serde(default)]
    pub directory: DirectoryConfig,
}

fn default_timezone() -> Tz {
    chrono_tz::UTC
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Local time of day deliveries are centred on
    #[serde(with = "hh_mm")]
    pub anchor_time: NaiveTime,

    /// Local time of day the scheduling run is triggered
    #[serde(with = "hh_mm")]
    pub schedule_time: NaiveTime,

    /// A run this long after today's anchor still targets today
    #[serde(with = "duration_secs", rename = "catch_up_secs")]
    pub catch_up: Duration,

    /// Upper bound for a single channel send
    #[serde(with = "duration_secs", rename = "send_timeout_secs")]
    pub send_timeout: Duration,

    /// Maximum scheduled-to-sent latency counted as within SLA
    #[serde(with = "duration_secs", rename = "sla_target_secs")]
    pub sla_target: Duration,

    pub default_language: String,

    /// Channel template per language; `default_language` must be present
    pub templates: BTreeMap<String, String>,

    /// Advisors admitted concurrently during a scheduling run
    pub batch_concurrency: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            anchor_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN),
            schedule_time: NaiveTime::from_hms_opt(5, 30, 0).unwrap_or(NaiveTime::MIN),
            catch_up: Duration::from_secs(30 * 60),
            send_timeout: Duration::from_secs(30),
            sla_target: Duration::from_secs(5 * 60),
            default_language: "en".to_string(),
            templates: BTreeMap::from([("en".to_string(), "daily_update".to_string())]),
            batch_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub delivery: QueueSettings,
    pub fallback: QueueSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Local time after which advisors without content get fallback content
    #[serde(with = "hh_mm")]
    pub cutoff_time: NaiveTime,

    /// Entries used this often are archived
    pub max_usage: u32,

    /// Entries older than this are archived
    pub rotation_days: u32,

    /// Non-archived entries kept per tier and category
    pub min_pool_size: usize,

    /// An advisor does not get the same entry twice within this many days
    pub exclusion_days: u32,

    pub candidate_limit: usize,

    pub categories: Vec<String>,

    pub risk_levels: Vec<RiskLevel>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            cutoff_time: NaiveTime::from_hms_opt(21, 30, 0).unwrap_or(NaiveTime::MIN),
            max_usage: 10,
            rotation_days: 30,
            min_pool_size: 50,
            exclusion_days: 30,
            candidate_limit: 10,
            categories: vec![
                "market_update".to_string(),
                "educational".to_string(),
                "portfolio_tips".to_string(),
            ],
            risk_levels: RiskLevel::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_secs", rename = "poll_interval_secs")]
    pub poll_interval: Duration,

    /// SLA percentage the system aims for
    pub sla_target: f64,

    /// Below this an `sla_violation` warning is raised
    pub sla_warning: f64,

    /// Below this the violation is critical
    pub sla_critical: f64,

    /// SLA alerts need strictly more samples than this
    pub min_sla_samples: usize,

    /// Fraction of failed deliveries (0.0..=1.0) raising `high_error_rate`
    pub error_rate_threshold: f64,

    /// Error percentage considered normal by the health score
    pub error_baseline_pct: f64,

    /// Waiting jobs raising `queue_backlog`
    pub backlog_threshold: u64,

    /// Waiting jobs considered normal by the health score
    pub backlog_baseline: u64,

    /// Failed / (completed + failed) ratio raising `system_failure`
    pub system_failure_ratio: f64,

    /// Job outcomes older than this are ignored by `system_failure`
    #[serde(with = "duration_secs", rename = "system_failure_window_secs")]
    pub system_failure_window: Duration,

    pub cooldowns: AlertCooldowns,

    /// SLA samples and alerts older than this are deleted daily
    pub retention_days: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            sla_target: 99.0,
            sla_warning: 97.0,
            sla_critical: 95.0,
            min_sla_samples: 50,
            error_rate_threshold: 0.05,
            error_baseline_pct: 1.0,
            backlog_threshold: 1_000,
            backlog_baseline: 100,
            system_failure_ratio: 0.2,
            system_failure_window: Duration::from_secs(15 * 60),
            cooldowns: AlertCooldowns::default(),
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AlertCooldowns {
    #[serde(with = "duration_secs")]
    pub sla_violation: Duration,
    #[serde(with = "duration_secs")]
    pub high_error_rate: Duration,
    #[serde(with = "duration_secs")]
    pub queue_backlog: Duration,
    #[serde(with = "duration_secs")]
    pub system_failure: Duration,
}

impl Default for AlertCooldowns {
    fn default() -> Self {
        Self {
            sla_violation: Duration::from_secs(15 * 60),
            high_error_rate: Duration::from_secs(10 * 60),
            queue_backlog: Duration::from_secs(5 * 60),
            system_failure: Duration::from_secs(5 * 60),
        }
    }
}

/// Messaging relay the deliveries are sent through
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub url: String,

    /// Falls back to `DISPATCH_RELAY_TOKEN` when absent
    pub token: Option<String>,

    /// Whether the relay reports delivery receipts
    #[serde(default)]
    pub confirms_delivery: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alert {
    Discord(Discord),
    Webhook(Webhook),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webhook {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Discord {
    pub url: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryConfig {
    /// JSON file with advisors and submitted content
    pub seed: Option<PathBuf>,
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    let config: Config =
        serde_json::from_str(content).context("Invalid configuration file provided!")?;
    config.validate()?;
    trace!("loaded config: {config:?}");
    Ok(config)
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if !self
            .delivery
            .templates
            .contains_key(&self.delivery.default_language)
        {
            anyhow::bail!(
                "no template configured for default language '{}'",
                self.delivery.default_language
            );
        }
        let m = &self.monitor;
        if !(m.sla_critical <= m.sla_warning && m.sla_warning <= m.sla_target) {
            anyhow::bail!("SLA thresholds must satisfy critical <= warning <= target");
        }
        if self.fallback.categories.is_empty() {
            anyhow::bail!("at least one fallback category is required");
        }
        Ok(())
    }
}

/// `Duration` as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// `Duration` as milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Local time of day as `"HH:MM"` or `"HH:MM:SS"`.
pub mod hh_mm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(|e| D::Error::custom(format!("invalid time of day '{raw}': {e}")))
    }
}
