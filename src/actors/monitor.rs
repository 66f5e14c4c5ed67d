//! MonitorActor - Periodic delivery, SLA and queue health evaluation
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → gather metrics → evaluate rules → publish alerts
//!     ↑                       └─► health score → publish Dashboard
//!     └─── Commands (PollNow, GetDashboard, Shutdown)
//! ```
//!
//! Once per local day the actor also enforces retention on SLA samples and
//! alert rows.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use chrono_tz::Tz;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use super::messages::{Dashboard, DeliveryMetrics, MonitorCommand, SlaMetrics};
use crate::alerts::AlertPublisher;
use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::monitors::health::{HealthInputs, health_score};
use crate::monitors::rules::{RuleInputs, evaluate_rules};
use crate::monitors::sla::SlaSummary;
use crate::queue::{QueueManager, QueueMetrics, QueueName};
use crate::storage::{Alert, DeliveryRecord, DeliveryStore};
use crate::util::{local_date, local_day_bounds};
use crate::{DeliveryJob, DeliveryStatus};

/// Capacity of the dashboard broadcast channel.
const DASHBOARD_CHANNEL_CAPACITY: usize = 16;

/// Finished queue jobs older than this are dropped from the history.
const QUEUE_HISTORY_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

pub fn delivery_metrics_from(date: NaiveDate, records: &[DeliveryRecord]) -> DeliveryMetrics {
    let mut metrics = DeliveryMetrics {
        date: Some(date),
        total: records.len(),
        ..Default::default()
    };

    let mut latency_sum = 0i64;
    let mut latency_count = 0usize;
    for record in records {
        match record.status {
            DeliveryStatus::Pending => metrics.pending += 1,
            DeliveryStatus::Active => metrics.active += 1,
            DeliveryStatus::Sent => metrics.sent += 1,
            DeliveryStatus::Delivered => metrics.delivered += 1,
            DeliveryStatus::Failed => metrics.failed += 1,
        }
        if record.is_fallback {
            metrics.fallback += 1;
        }
        if let Some(ms) = record.delivery_time_ms {
            latency_sum += ms;
            latency_count += 1;
        }
    }

    let succeeded = metrics.sent + metrics.delivered;
    let finished = succeeded + metrics.failed;
    if latency_count > 0 {
        metrics.avg_delivery_ms = latency_sum as f64 / latency_count as f64;
    }
    if metrics.total > 0 {
        metrics.delivery_rate = succeeded as f64 / metrics.total as f64;
    }
    if finished > 0 {
        metrics.error_rate = metrics.failed as f64 / finished as f64;
    }
    metrics
}

/// Read side of the monitor: computes metrics from the store and the queues.
#[derive(Clone)]
pub struct DeliveryMonitor {
    config: MonitorConfig,
    timezone: Tz,
    store: Arc<dyn DeliveryStore>,
    queues: Arc<QueueManager<DeliveryJob>>,
    clock: Arc<dyn Clock>,
}

impl DeliveryMonitor {
    pub fn new(
        config: MonitorConfig,
        timezone: Tz,
        store: Arc<dyn DeliveryStore>,
        queues: Arc<QueueManager<DeliveryJob>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            timezone,
            store,
            queues,
            clock,
        }
    }

    fn today(&self) -> NaiveDate {
        local_date(self.clock.now(), self.timezone)
    }

    pub async fn delivery_metrics(&self, date: Option<NaiveDate>) -> Result<DeliveryMetrics> {
        let date = date.unwrap_or_else(|| self.today());
        let records = self
            .store
            .deliveries_for_date(date)
            .await
            .context("failed to load delivery records")?;
        Ok(delivery_metrics_from(date, &records))
    }

    /// SLA compliance over the current local day.
    pub async fn sla_metrics(&self) -> Result<SlaMetrics> {
        let (start, end) = local_day_bounds(self.today(), self.timezone);
        let samples = self
            .store
            .sla_samples_between(start, end)
            .await
            .context("failed to load SLA samples")?;
        let summary = SlaSummary::from_samples(&samples);

        Ok(SlaMetrics {
            current: summary.percentage,
            target: self.config.sla_target,
            samples: summary.samples,
            violations: summary.violations(),
            failures: summary.failures,
            avg_delivery_ms: summary.avg_delivery_ms,
            p95_delivery_ms: summary.p95_delivery_ms,
            p99_delivery_ms: summary.p99_delivery_ms,
        })
    }

    pub async fn queue_stats(&self) -> Vec<QueueMetrics> {
        self.queues.queue_stats().await
    }

    /// Final job outcomes across all queues inside the system-failure window.
    fn recent_outcomes(&self) -> (u64, u64) {
        QueueName::ALL
            .into_iter()
            .filter_map(|queue| {
                self.queues
                    .outcomes_within(queue, self.config.system_failure_window)
                    .ok()
            })
            .fold((0, 0), |(ok, failed), (o, f)| (ok + o, failed + f))
    }

    pub async fn recent_alerts(&self) -> Result<Vec<Alert>> {
        let since = self.clock.now() - chrono::Duration::hours(24);
        self.store
            .recent_alerts(since)
            .await
            .context("failed to load recent alerts")
    }

    /// Gather everything, evaluate the alert rules and build a snapshot.
    pub async fn evaluate(&self, alerts: &AlertPublisher) -> Result<Dashboard> {
        let delivery = self.delivery_metrics(None).await?;
        let sla = self.sla_metrics().await?;
        let queues = self.queue_stats().await;

        let waiting: u64 = queues.iter().map(|q| q.waiting).sum();
        let (completed, failed) = self.recent_outcomes();
        let failure_ratio = if completed + failed > 0 {
            failed as f64 / (completed + failed) as f64
        } else {
            0.0
        };

        let inputs = RuleInputs {
            sla_percentage: sla.current,
            sla_samples: sla.samples,
            error_rate: delivery.error_rate,
            waiting_jobs: waiting,
            failure_ratio,
        };
        for candidate in evaluate_rules(&inputs, &self.config) {
            if let Err(e) = alerts.publish(candidate).await {
                error!("failed to publish alert: {e}");
            }
        }

        let health = health_score(&HealthInputs {
            sla_percentage: sla.current,
            sla_target: self.config.sla_target,
            error_rate_pct: delivery.error_rate * 100.0,
            error_baseline_pct: self.config.error_baseline_pct,
            backlog: waiting,
            backlog_baseline: self.config.backlog_baseline,
            backlog_threshold: self.config.backlog_threshold,
        });

        Ok(Dashboard {
            generated_at: self.clock.now(),
            delivery,
            sla,
            queues,
            health,
            recent_alerts: self.recent_alerts().await?,
        })
    }

    /// Drop SLA samples and alerts past the retention period.
    pub async fn enforce_retention(&self) -> Result<()> {
        let before =
            self.clock.now() - chrono::Duration::days(i64::from(self.config.retention_days));
        let samples = self
            .store
            .cleanup_sla_samples(before)
            .await
            .context("failed to clean SLA samples")?;
        let alerts = self
            .store
            .cleanup_alerts(before)
            .await
            .context("failed to clean alerts")?;

        let mut jobs = 0;
        for queue in QueueName::ALL {
            jobs += self.queues.clean(queue, QUEUE_HISTORY_GRACE).unwrap_or(0);
        }

        info!(samples, alerts, jobs, "retention cleanup finished");
        Ok(())
    }
}

/// Actor that evaluates delivery health on a fixed interval
pub struct MonitorActor {
    monitor: DeliveryMonitor,
    alerts: AlertPublisher,
    poll_interval: Duration,

    /// Command receiver for control messages
    command_rx: mpsc::Receiver<MonitorCommand>,

    /// Broadcast sender for dashboard snapshots
    dashboard_tx: broadcast::Sender<Dashboard>,

    latest: Option<Dashboard>,

    /// Local day retention last ran for
    last_cleanup: Option<NaiveDate>,
}

impl MonitorActor {
    pub fn new(
        monitor: DeliveryMonitor,
        alerts: AlertPublisher,
        command_rx: mpsc::Receiver<MonitorCommand>,
        dashboard_tx: broadcast::Sender<Dashboard>,
    ) -> Self {
        Self {
            poll_interval: monitor.config.poll_interval,
            monitor,
            alerts,
            command_rx,
            dashboard_tx,
            latest: None,
            last_cleanup: None,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting monitor actor");

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll().await {
                        error!("monitor cycle failed: {:#}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        MonitorCommand::PollNow { respond_to } => {
                            debug!("received PollNow command");
                            let result = self.poll().await;
                            let _ = respond_to.send(result);
                        }

                        MonitorCommand::GetDashboard { respond_to } => {
                            let _ = respond_to.send(self.latest.clone());
                        }

                        MonitorCommand::Shutdown => {
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

        debug!("monitor actor stopped");
    }

    async fn poll(&mut self) -> Result<Dashboard> {
        let today = self.monitor.today();
        if self.last_cleanup != Some(today) {
            match self.monitor.enforce_retention().await {
                Ok(()) => self.last_cleanup = Some(today),
                Err(e) => warn!("retention cleanup failed: {:#}", e),
            }
        }

        let dashboard = self.monitor.evaluate(&self.alerts).await?;
        trace!(
            health = dashboard.health.score,
            sla = dashboard.sla.current,
            "monitor cycle complete"
        );

        // No subscribers is fine
        let _ = self.dashboard_tx.send(dashboard.clone());
        self.latest = Some(dashboard.clone());
        Ok(dashboard)
    }
}

/// Handle for controlling the MonitorActor and reading metrics
///
/// Metric queries go straight to the store; only snapshots and polls go
/// through the actor.
#[derive(Clone)]
pub struct MonitorHandle {
    sender: mpsc::Sender<MonitorCommand>,
    monitor: DeliveryMonitor,
    alerts: AlertPublisher,
    dashboard_tx: broadcast::Sender<Dashboard>,
}

impl MonitorHandle {
    pub fn spawn(monitor: DeliveryMonitor, alerts: AlertPublisher) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (dashboard_tx, _) = broadcast::channel(DASHBOARD_CHANNEL_CAPACITY);

        let actor = MonitorActor::new(
            monitor.clone(),
            alerts.clone(),
            cmd_rx,
            dashboard_tx.clone(),
        );
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            monitor,
            alerts,
            dashboard_tx,
        }
    }

    /// Run a monitor cycle now and return its snapshot
    pub async fn poll_now(&self) -> Result<Dashboard> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("failed to receive response")?
    }

    /// Latest snapshot, running a cycle first if none exists yet
    pub async fn dashboard(&self) -> Result<Dashboard> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MonitorCommand::GetDashboard { respond_to: tx })
            .await
            .context("failed to send GetDashboard command")?;

        match rx.await.context("failed to receive response")? {
            Some(dashboard) => Ok(dashboard),
            None => self.poll_now().await,
        }
    }

    pub async fn delivery_metrics(&self, date: Option<NaiveDate>) -> Result<DeliveryMetrics> {
        self.monitor.delivery_metrics(date).await
    }

    pub async fn sla_metrics(&self) -> Result<SlaMetrics> {
        self.monitor.sla_metrics().await
    }

    pub async fn queue_stats(&self) -> Vec<QueueMetrics> {
        self.monitor.queue_stats().await
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn subscribe_dashboard(&self) -> broadcast::Receiver<Dashboard> {
        self.dashboard_tx.subscribe()
    }

    /// Gracefully shut down the monitor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(MonitorCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
