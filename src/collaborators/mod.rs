//! Interfaces to the systems the delivery core depends on but does not own
//!
//! - content and advisor records (CRUD lives elsewhere)
//! - the messaging channel that actually sends messages
//! - the content generator producing pre-approved text
//!
//! Each is an async trait so the composition root can plug in real clients
//! and tests can plug in fakes.

pub mod channel;
pub mod directory;
pub mod generator;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::{Advisor, Content, ContentForDelivery, NewContent, RiskLevel, Tier};

pub use channel::HttpRelayChannel;
pub use directory::InMemoryDirectory;
pub use generator::TemplateContentGenerator;

/// Failure of a repository or generator call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// The collaborator could not be reached or timed out
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The request was understood and refused
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Failure of a channel send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("invalid recipient '{0}'")]
    InvalidRecipient(String),

    /// Permanent refusal (4xx, unknown template, ...)
    #[error("channel rejected message ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Temporary failure (5xx, connection, rate limit)
    #[error("channel unavailable: {0}")]
    Unavailable(String),
}

/// Returned by the channel on a successful send.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct SentMessage {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedContent {
    pub text: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFallback {
    pub text: String,
    pub market_focus: String,
}

#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// Approved content for every advisor that submitted for `date`.
    async fn content_for_delivery(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<ContentForDelivery>, CollaboratorError>;

    async fn advisor_has_content_for_date(
        &self,
        advisor_id: &str,
        date: NaiveDate,
    ) -> Result<bool, CollaboratorError>;

    async fn create_content(&self, content: NewContent) -> Result<Content, CollaboratorError>;

    async fn get_content(&self, content_id: &str) -> Result<Option<Content>, CollaboratorError>;

    /// Remove content that was never admitted. Returns `false` if unknown.
    async fn delete_content(&self, content_id: &str) -> Result<bool, CollaboratorError>;
}

#[async_trait]
pub trait AdvisorRepository: Send + Sync {
    /// Advisors that are active and have the messaging channel enabled.
    async fn list_active_channel_enabled(&self) -> Result<Vec<Advisor>, CollaboratorError>;
}

#[async_trait]
pub trait MessagingChannel: Send + Sync {
    /// Whether `recipient` is a well-formed address for this channel.
    fn validate_recipient(&self, recipient: &str) -> bool;

    async fn send_template(
        &self,
        recipient: &str,
        template: &str,
        language: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<SentMessage, SendError>;

    /// Channels that report delivery receipts leave records in `sent` until
    /// the receipt arrives.
    fn confirms_delivery(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate_emergency_content(
        &self,
        advisor: &Advisor,
    ) -> Result<GeneratedContent, CollaboratorError>;

    async fn generate_fallback_content(
        &self,
        category: &str,
        tier: Tier,
        risk_level: RiskLevel,
    ) -> Result<GeneratedFallback, CollaboratorError>;
}

/// The external systems shared by the scheduler and the fallback assigner.
#[derive(Clone)]
pub struct Collaborators {
    pub content: Arc<dyn ContentRepository>,
    pub advisors: Arc<dyn AdvisorRepository>,
    pub channel: Arc<dyn MessagingChannel>,
    pub generator: Arc<dyn ContentGenerator>,
}
