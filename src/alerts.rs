use std::sync::Arc;

use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::{Alert as AlertSink, MonitorConfig, Webhook};
use crate::discord::{DiscordManager, MessageBuilder};
use crate::monitors::rules::{AlertCandidate, cooldown_for};
use crate::storage::{Alert, DeliveryStore, Severity, StorageResult};

/// Capacity of the alert broadcast channel.
const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Turns alert candidates into raised alerts.
///
/// The cooldown is checked and recorded in the store in one step, so the
/// scheduler and the monitor can both publish without raising duplicates.
/// Raised alerts are broadcast to every subscriber.
#[derive(Clone)]
pub struct AlertPublisher {
    store: Arc<dyn DeliveryStore>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    sender: broadcast::Sender<Alert>,
}

impl AlertPublisher {
    pub fn new(store: Arc<dyn DeliveryStore>, clock: Arc<dyn Clock>, config: MonitorConfig) -> Self {
        let (sender, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            store,
            clock,
            config,
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }

    /// Returns the alert when it was raised, `None` while its kind is cooling down.
    #[instrument(skip(self, candidate), fields(kind = %candidate.kind))]
    pub async fn publish(&self, candidate: AlertCandidate) -> StorageResult<Option<Alert>> {
        let now = self.clock.now();
        let cooldown = chrono::Duration::from_std(cooldown_for(candidate.kind, &self.config))
            .unwrap_or_else(|_| chrono::Duration::zero());

        let alert = Alert {
            kind: candidate.kind,
            severity: candidate.severity,
            message: candidate.message,
            timestamp: now,
            cooldown_until: now + cooldown,
        };

        if !self.store.insert_alert_if_cooled(&alert).await? {
            debug!("alert suppressed by cooldown");
            return Ok(None);
        }

        match alert.severity {
            Severity::Critical => error!(kind = %alert.kind, "{}", alert.message),
            Severity::Warning => warn!(kind = %alert.kind, "{}", alert.message),
        }

        // No subscribers is fine, the alert is persisted either way
        let _ = self.sender.send(alert.clone());
        Ok(Some(alert))
    }
}

/// Delivers raised alerts to the configured outbound sinks.
#[derive(Debug, Clone)]
pub struct AlertManager {
    client: Client,
    sinks: Vec<AlertSink>,
    discord_manager: DiscordManager,
}

impl AlertManager {
    pub fn new(sinks: Vec<AlertSink>) -> Self {
        Self {
            client: Client::new(),
            sinks,
            discord_manager: DiscordManager::new(),
        }
    }

    pub fn has_sinks(&self) -> bool {
        !self.sinks.is_empty()
    }

    #[instrument(skip(self, alert), fields(kind = %alert.kind, severity = %alert.severity))]
    pub async fn send_alert(&self, alert: &Alert) {
        for sink in &self.sinks {
            match sink {
                AlertSink::Discord(discord) => {
                    let embed = self.discord_manager.build_alert_embed(alert);
                    let mut message_builder = MessageBuilder::new().add_embed(embed);
                    if let Some(user_id) = &discord.user_id {
                        let emoji = match alert.severity {
                            Severity::Critical => "🔴",
                            Severity::Warning => "⚠️",
                        };
                        message_builder = message_builder
                            .content(format!("{emoji} `{}` <@{user_id}>", alert.kind));
                    }

                    self.discord_manager
                        .send_message(discord, &message_builder.build())
                        .await;
                }
                AlertSink::Webhook(webhook) => {
                    self.send_webhook_alert(webhook, alert).await;
                }
            }
        }
    }

    fn format_message(alert: &Alert) -> String {
        match alert.severity {
            Severity::Critical => format!("🔴 **Critical** `{}`: {}", alert.kind, alert.message),
            Severity::Warning => format!("⚠️ **Warning** `{}`: {}", alert.kind, alert.message),
        }
    }

    #[instrument(skip(self, webhook, alert))]
    async fn send_webhook_alert(&self, webhook: &Webhook, alert: &Alert) {
        let payload = json!({
            "message": Self::format_message(alert),
            "type": alert.kind,
            "severity": alert.severity,
            "raised_at": alert.timestamp.to_rfc3339(),
            "cooldown_until": alert.cooldown_until.to_rfc3339(),
            "timestamp": Utc::now().to_rfc3339()
        });

        match self.client.post(&webhook.url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Successfully sent webhook alert");
                } else {
                    error!("Webhook alert failed with status: {}", response.status());
                }
            }
            Err(e) => {
                error!("Failed to send webhook alert: {}", e);
            }
        }
    }
}
