//! DailyTriggerActor - Runs a task once a day at a local time of day
//!
//! The next run is recomputed from the wall clock before every sleep, so a
//! long task or a DST change never shifts later runs:
//!
//! ```text
//! now ─► next_local_occurrence(time, tz) ─► sleep ─► still early? ─► sleep again
//!                                                 └─► run task ─► loop
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use super::messages::TriggerCommand;
use crate::clock::Clock;
use crate::fallback::FallbackAssigner;
use crate::scheduler::Scheduler;
use crate::util::next_local_occurrence;

/// Work run by a daily trigger.
#[async_trait]
pub trait DailyTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> Result<()>;
}

#[async_trait]
impl DailyTask for Scheduler {
    fn name(&self) -> &'static str {
        "daily-delivery"
    }

    async fn run(&self) -> Result<()> {
        let report = self
            .schedule_daily_delivery()
            .await
            .context("scheduling run failed")?;
        for err in &report.errors {
            debug!(advisor = %err.advisor_id, kind = %err.kind, "{}", err.message);
        }
        Ok(())
    }
}

#[async_trait]
impl DailyTask for FallbackAssigner {
    fn name(&self) -> &'static str {
        "fallback-assignment"
    }

    async fn run(&self) -> Result<()> {
        let report = self
            .run_fallback_assignment()
            .await
            .context("fallback assignment failed")?;
        for err in &report.errors {
            debug!(advisor = %err.advisor_id, kind = %err.kind, "{}", err.message);
        }
        Ok(())
    }
}

pub struct DailyTriggerActor {
    task: Arc<dyn DailyTask>,
    time: NaiveTime,
    timezone: Tz,
    clock: Arc<dyn Clock>,
    command_rx: mpsc::Receiver<TriggerCommand>,
}

impl DailyTriggerActor {
    pub fn new(
        task: Arc<dyn DailyTask>,
        time: NaiveTime,
        timezone: Tz,
        clock: Arc<dyn Clock>,
        command_rx: mpsc::Receiver<TriggerCommand>,
    ) -> Self {
        Self {
            task,
            time,
            timezone,
            clock,
            command_rx,
        }
    }

    fn next_run(&self) -> DateTime<Utc> {
        next_local_occurrence(self.clock.now(), self.time, self.timezone)
    }

    #[instrument(skip(self), fields(task = self.task.name()))]
    pub async fn run(mut self) {
        debug!("starting daily trigger");

        let mut next = self.next_run();
        info!(%next, "next run scheduled");

        loop {
            let wait = (next - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if self.clock.now() < next {
                        // woke early against the wall clock
                        continue;
                    }
                    self.execute().await.ok();
                    next = self.next_run();
                    info!(%next, "next run scheduled");
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        TriggerCommand::RunNow { respond_to } => {
                            debug!("received RunNow command");
                            let result = self.execute().await;
                            let _ = respond_to.send(result);
                        }

                        TriggerCommand::NextRun { respond_to } => {
                            let _ = respond_to.send(next);
                        }

                        TriggerCommand::Shutdown => {
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

        debug!("daily trigger stopped");
    }

    async fn execute(&self) -> Result<()> {
        let started = tokio::time::Instant::now();
        let result = self.task.run().await;
        match &result {
            Ok(()) => info!(elapsed_ms = started.elapsed().as_millis() as u64, "task finished"),
            Err(e) => error!("task failed: {:#}", e),
        }
        result
    }
}

/// Handle for controlling a DailyTriggerActor
#[derive(Clone)]
pub struct TriggerHandle {
    sender: mpsc::Sender<TriggerCommand>,
    pub name: &'static str,
}

impl TriggerHandle {
    pub fn spawn(
        task: Arc<dyn DailyTask>,
        time: NaiveTime,
        timezone: Tz,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let name = task.name();

        let actor = DailyTriggerActor::new(task, time, timezone, clock, cmd_rx);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            name,
        }
    }

    /// Run the task immediately and wait for it to finish
    pub async fn run_now(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TriggerCommand::RunNow { respond_to: tx })
            .await
            .context("failed to send RunNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn next_run(&self) -> Result<DateTime<Utc>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TriggerCommand::NextRun { respond_to: tx })
            .await
            .context("failed to send NextRun command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(TriggerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
