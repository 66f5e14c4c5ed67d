//! AlertActor - Forwards raised alerts to outbound sinks
//!
//! Alerts are deduplicated before they reach this actor (the cooldown is
//! enforced by the store when they are raised), so every alert received
//! here is sent. Muting holds notifications back for a maintenance window
//! without affecting what is recorded.

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

use crate::alerts::AlertManager;
use crate::storage::Alert;

use super::messages::AlertCommand;

/// Actor that sends alerts to webhooks and Discord
pub struct AlertActor {
    alert_manager: AlertManager,

    /// Command receiver
    command_rx: mpsc::Receiver<AlertCommand>,

    /// Alert receiver (broadcast subscription)
    alert_rx: broadcast::Receiver<Alert>,

    /// Notifications are held back until this instant
    muted_until: Option<Instant>,
}

impl AlertActor {
    pub fn new(
        alert_manager: AlertManager,
        command_rx: mpsc::Receiver<AlertCommand>,
        alert_rx: broadcast::Receiver<Alert>,
    ) -> Self {
        Self {
            alert_manager,
            command_rx,
            alert_rx,
            muted_until: None,
        }
    }

    fn is_muted(&mut self) -> bool {
        match self.muted_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                debug!("mute window elapsed");
                self.muted_until = None;
                false
            }
            None => false,
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting alert actor");

        loop {
            tokio::select! {
                result = self.alert_rx.recv() => {
                    match result {
                        Ok(alert) => {
                            if self.is_muted() {
                                trace!(kind = %alert.kind, "alert muted");
                            } else {
                                self.alert_manager.send_alert(&alert).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("alert actor lagged, skipped {skipped} alerts");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("alert channel closed, shutting down");
                            break;
                        }
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        AlertCommand::MuteAlerts { duration_secs } => {
                            debug!("muting alerts for {duration_secs}s");
                            self.muted_until =
                                Some(Instant::now() + Duration::from_secs(duration_secs));
                        }

                        AlertCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("alert actor stopped");
    }
}

/// Handle for controlling the AlertActor
#[derive(Clone)]
pub struct AlertHandle {
    sender: mpsc::Sender<AlertCommand>,
}

impl AlertHandle {
    pub fn spawn(alert_manager: AlertManager, alert_rx: broadcast::Receiver<Alert>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = AlertActor::new(alert_manager, cmd_rx, alert_rx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Mute alerts for a duration
    pub async fn mute_alerts(&self, duration_secs: u64) {
        let _ = self
            .sender
            .send(AlertCommand::MuteAlerts { duration_secs })
            .await;
    }

    /// Shutdown the alert actor
    pub async fn shutdown(&self) {
        let _ = self.sender.send(AlertCommand::Shutdown).await;
    }
}
