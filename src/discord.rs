use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::config::Discord;
use crate::storage::{Alert, AlertKind, Severity};

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self {
            content: None,
            embeds: Vec::new(),
        }
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscordManager {
    client: Client,
}

impl DiscordManager {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn build_alert_embed(&self, alert: &Alert) -> Embed {
        let title = match alert.kind {
            AlertKind::SlaViolation => "📉 SLA Violation",
            AlertKind::HighErrorRate => "❌ High Error Rate",
            AlertKind::QueueBacklog => "📬 Queue Backlog",
            AlertKind::SystemFailure => "🔥 System Failure",
        };

        let color = match alert.severity {
            Severity::Critical => 15158332, // Red
            Severity::Warning => 15105570,  // Orange
        };

        Embed {
            title: Some(title.to_string()),
            description: Some(alert.message.clone()),
            color: Some(color),
            fields: vec![
                EmbedField {
                    name: "Severity".to_string(),
                    value: alert.severity.to_string(),
                    inline: true,
                },
                EmbedField {
                    name: "⏱️ Quiet until".to_string(),
                    value: alert.cooldown_until.format("%H:%M UTC").to_string(),
                    inline: true,
                },
            ],
            footer: Some(EmbedFooter {
                text: format!("daily-dispatch | {}", alert.kind),
            }),
            timestamp: Some(alert.timestamp.to_rfc3339()),
        }
    }

    #[instrument(skip(self, discord, message))]
    pub async fn send_message(&self, discord: &Discord, message: &Message) {
        match self.client.post(&discord.url).json(message).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Successfully sent Discord message");
                } else {
                    error!("Discord message failed with status: {}", response.status());
                    if let Ok(error_text) = response.text().await {
                        error!("Discord API error response: {}", error_text);
                    }
                }
            }
            Err(e) => {
                error!("Failed to send Discord message: {}", e);
            }
        }
    }
}

impl Default for DiscordManager {
    fn default() -> Self {
        Self::new()
    }
}
