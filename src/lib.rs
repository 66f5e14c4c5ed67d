pub mod actors;
pub mod alerts;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod discord;
pub mod error;
pub mod fallback;
pub mod monitors;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod util;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::JobPayload;

/// Subscription level of an advisor.
///
/// Determines the jitter band a delivery lands in, the priority it is
/// dequeued with and the fallback pool segment it draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Pro,
    Standard,
    Free,
}

impl Tier {
    /// All tiers in delivery order (pro first).
    pub const ALL: [Tier; 3] = [Tier::Pro, Tier::Standard, Tier::Free];

    /// Jitter band around the delivery anchor, as millisecond offsets (inclusive).
    pub fn jitter_band_ms(self) -> (i64, i64) {
        match self {
            Tier::Pro => (-30_000, 30_000),
            Tier::Standard => (0, 120_000),
            Tier::Free => (120_000, 270_000),
        }
    }

    /// Queue priority, higher values are dequeued first.
    pub fn priority(self) -> u32 {
        match self {
            Tier::Pro => 10,
            Tier::Standard => 5,
            Tier::Free => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Pro => "pro",
            Tier::Standard => "standard",
            Tier::Free => "free",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pro" => Ok(Tier::Pro),
            "standard" => Ok(Tier::Standard),
            "free" => Ok(Tier::Free),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 3] = [
        RiskLevel::Conservative,
        RiskLevel::Moderate,
        RiskLevel::Aggressive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Conservative => "conservative",
            RiskLevel::Moderate => "moderate",
            RiskLevel::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conservative" => Ok(RiskLevel::Conservative),
            "moderate" => Ok(RiskLevel::Moderate),
            "aggressive" => Ok(RiskLevel::Aggressive),
            other => Err(format!("unknown risk level '{other}'")),
        }
    }
}

/// Why an advisor received fallback content instead of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    NoContentSubmitted,
    EmergencyGenerated,
}

impl FallbackReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackReason::NoContentSubmitted => "no_content_submitted",
            FallbackReason::EmergencyGenerated => "emergency_generated",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FallbackReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_content_submitted" => Ok(FallbackReason::NoContentSubmitted),
            "emergency_generated" => Ok(FallbackReason::EmergencyGenerated),
            other => Err(format!("unknown fallback reason '{other}'")),
        }
    }
}

/// Lifecycle of a single delivery.
///
/// ```text
/// pending → active → sent → delivered
///              └──→ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Active,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Active => "active",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// Whether the record may move from `self` to `next`.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Active, Active)
                | (Active, Sent)
                | (Active, Failed)
                | (Sent, Delivered)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "active" => Ok(DeliveryStatus::Active),
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status '{other}'")),
        }
    }
}

/// Payload of a delivery job, produced by the scheduler only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub advisor_id: String,
    pub content_id: String,
    pub phone_number: String,
    pub tier: Tier,
    pub language: String,
    pub retry_count: u32,
    pub is_fallback: bool,
    pub fallback_reason: Option<FallbackReason>,
    pub delivery_date: NaiveDate,
    pub scheduled_time: DateTime<Utc>,
}

impl JobPayload for DeliveryJob {
    fn on_retry(&mut self, retry_count: u32) {
        self.retry_count = retry_count;
    }
}

/// Advisor preferences used when matching fallback content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub market_focus: Option<String>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
}

/// An active, channel-enabled subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advisor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub tier: Tier,
    pub phone_number: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub preferences: Preferences,
}

fn default_language() -> String {
    "en".to_string()
}

/// Where a piece of advisor content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    Submitted,
    FallbackPool,
    EmergencyGenerated,
}

/// Approved content ready to be delivered to one advisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub id: String,
    pub advisor_id: String,
    pub delivery_date: NaiveDate,
    /// Rendered text keyed by language code
    pub variants: BTreeMap<String, String>,
    pub source: ContentSource,
}

impl Content {
    /// Pick the text for `language`, falling back to `default_language`.
    pub fn text_for(&self, language: &str, default_language: &str) -> Option<&str> {
        self.variants
            .get(language)
            .or_else(|| self.variants.get(default_language))
            .map(String::as_str)
    }
}

/// Row returned by the content repository for a delivery date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentForDelivery {
    pub advisor_id: String,
    pub content_id: String,
    pub language: String,
    pub tier: Tier,
}

/// Content to be created on behalf of an advisor.
#[derive(Debug, Clone, PartialEq)]
pub struct NewContent {
    pub advisor_id: String,
    pub delivery_date: NaiveDate,
    pub variants: BTreeMap<String, String>,
    pub source: ContentSource,
}
