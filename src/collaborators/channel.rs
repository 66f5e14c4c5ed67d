//! HTTP relay client for the messaging channel
//!
//! The relay accepts templated messages and answers with a message id:
//!
//! ```text
//! POST {url}/messages
//! Authorization: Bearer <token>
//! { "to": "+14155550100", "template": "daily_update", "language": "en",
//!   "variables": { "body": "..." } }
//!
//! 200 { "message_id": "wamid.123" }
//! ```
//!
//! 5xx responses and connection errors are reported as `Unavailable` so the
//! job is retried; 4xx responses are permanent.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::{MessagingChannel, SendError, SentMessage};

/// E.164: a plus sign, no leading zero, 8 to 15 digits in total.
static E164: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9]\d{7,14}$").expect("valid E.164 pattern"));

pub fn is_e164(recipient: &str) -> bool {
    E164.is_match(recipient)
}

#[derive(Debug, Clone)]
pub struct HttpRelayChannel {
    client: Client,
    base_url: String,
    token: Option<String>,
    confirms_delivery: bool,
}

impl HttpRelayChannel {
    pub fn new(base_url: impl Into<String>, token: Option<String>, confirms_delivery: bool) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            confirms_delivery,
        }
    }
}

#[async_trait]
impl MessagingChannel for HttpRelayChannel {
    fn validate_recipient(&self, recipient: &str) -> bool {
        is_e164(recipient)
    }

    #[instrument(skip(self, variables), fields(template = %template, language = %language))]
    async fn send_template(
        &self,
        recipient: &str,
        template: &str,
        language: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<SentMessage, SendError> {
        if !is_e164(recipient) {
            return Err(SendError::InvalidRecipient(recipient.to_string()));
        }

        let payload = json!({
            "to": recipient,
            "template": template,
            "language": language,
            "variables": variables,
        });

        let mut request = self
            .client
            .post(format!("{}/messages", self.base_url))
            .json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SendError::Unavailable(format!("relay request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let sent: SentMessage = response
                .json()
                .await
                .map_err(|e| SendError::Unavailable(format!("invalid relay response: {e}")))?;
            debug!(message_id = %sent.message_id, "message accepted by relay");
            return Ok(sent);
        }

        let body = response.text().await.unwrap_or_default();
        warn!("relay answered {}: {}", status, body);

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(SendError::Unavailable(format!("relay answered {status}")))
        } else {
            Err(SendError::Rejected {
                status: status.as_u16(),
                message: body,
            })
        }
    }

    fn confirms_delivery(&self) -> bool {
        self.confirms_delivery
    }
}
