//! Daily delivery scheduling and job processing
//!
//! A scheduling run turns the day's approved content into delayed queue
//! jobs. Each advisor's job is spread over a tier-specific jitter band
//! around the delivery anchor so the channel never sees the whole
//! population at once:
//!
//! ```text
//!            anchor (06:00 local)
//!                  │
//!   pro      ├─────┼─────┤                      −30 s .. +30 s
//!   standard       ├───────────┤                  0 s .. +120 s
//!   free                       ├──────────────┤ +120 s .. +270 s
//! ```
//!
//! The scheduler is also the queue's job handler: it sends the message,
//! keeps the delivery record in step and records one SLA sample per final
//! outcome.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::alerts::AlertPublisher;
use crate::clock::Clock;
use crate::collaborators::Collaborators;
use crate::config::{Config, DeliveryConfig, MonitorConfig};
use crate::error::{BatchError, DeliveryError, DeliveryResult};
use crate::monitors::rules;
use crate::monitors::sla::sla_percentage;
use crate::queue::{
    JobContext, JobFailure, JobHandle, JobHandler, JobOptions, QueueError, QueueManager, QueueName,
};
use crate::storage::{DeliveryRecord, DeliveryStore, SlaMetricRecord};
use crate::util::{local_date, local_day_bounds, next_anchor};
use crate::{Advisor, DeliveryJob, DeliveryStatus, FallbackReason, Tier};

/// Random offset inside the tier's jitter band.
pub fn jitter_offset<R: Rng>(tier: Tier, rng: &mut R) -> chrono::Duration {
    let (low, high) = tier.jitter_band_ms();
    chrono::Duration::milliseconds(rng.gen_range(low..=high))
}

/// How long the queue should hold a job due at `delivery_time`.
pub fn admission_delay(delivery_time: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (delivery_time - now).to_std().unwrap_or(Duration::ZERO)
}

/// A single advisor's content, ready to be admitted.
#[derive(Debug, Clone)]
pub struct Admission {
    pub advisor: Advisor,
    pub content_id: String,
    pub language: String,
    pub delivery_date: NaiveDate,
    pub anchor: DateTime<Utc>,
    pub fallback_reason: Option<FallbackReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmitOutcome {
    Scheduled {
        handle: JobHandle,
        scheduled_time: DateTime<Utc>,
    },
    /// A delivery for this advisor and date already exists
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleReport {
    pub delivery_date: Option<NaiveDate>,
    pub scheduled: usize,
    pub failed: usize,
    pub skipped: usize,
    pub per_tier: BTreeMap<Tier, usize>,
    pub errors: Vec<BatchError>,
}

impl ScheduleReport {
    fn record(&mut self, advisor_id: &str, tier: Tier, outcome: DeliveryResult<AdmitOutcome>) {
        match outcome {
            Ok(AdmitOutcome::Scheduled { .. }) => {
                self.scheduled += 1;
                *self.per_tier.entry(tier).or_default() += 1;
            }
            Ok(AdmitOutcome::Skipped) => self.skipped += 1,
            Err(e) => {
                self.failed += 1;
                self.errors.push(BatchError::new(advisor_id, &e));
            }
        }
    }
}

pub struct Scheduler {
    config: DeliveryConfig,
    monitor: MonitorConfig,
    timezone: Tz,
    store: Arc<dyn DeliveryStore>,
    queues: Arc<QueueManager<DeliveryJob>>,
    collaborators: Collaborators,
    alerts: AlertPublisher,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        store: Arc<dyn DeliveryStore>,
        queues: Arc<QueueManager<DeliveryJob>>,
        collaborators: Collaborators,
        alerts: AlertPublisher,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: config.delivery.clone(),
            monitor: config.monitor.clone(),
            timezone: config.timezone,
            store,
            queues,
            collaborators,
            alerts,
            clock,
        })
    }

    /// Make this scheduler the worker of both delivery queues.
    pub fn register_workers(self: &Arc<Self>) -> Result<(), QueueError> {
        for queue in QueueName::ALL {
            self.queues
                .register_worker(queue, self.clone() as Arc<dyn JobHandler<DeliveryJob>>)?;
        }
        Ok(())
    }

    /// The anchor a run at the current instant targets, and its local date.
    pub fn target_anchor(&self) -> (DateTime<Utc>, NaiveDate) {
        let catch_up = chrono::Duration::from_std(self.config.catch_up)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let anchor = next_anchor(
            self.clock.now(),
            self.config.anchor_time,
            self.timezone,
            catch_up,
        );
        (anchor, local_date(anchor, self.timezone))
    }

    /// Admit every submitted content item for the next delivery anchor.
    #[instrument(skip(self))]
    pub async fn schedule_daily_delivery(&self) -> DeliveryResult<ScheduleReport> {
        let (anchor, date) = self.target_anchor();
        info!(%date, %anchor, "scheduling daily delivery");

        let items = self.collaborators.content.content_for_delivery(date).await?;
        let advisors: HashMap<String, Advisor> = self
            .collaborators
            .advisors
            .list_active_channel_enabled()
            .await?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();

        let outcomes: Vec<(String, Tier, DeliveryResult<AdmitOutcome>)> =
            futures::stream::iter(items)
                .map(|item| {
                    let advisor = advisors.get(&item.advisor_id).cloned();
                    async move {
                        let Some(advisor) = advisor else {
                            let err = DeliveryError::Validation(format!(
                                "advisor {} is not active or has the channel disabled",
                                item.advisor_id
                            ));
                            return (item.advisor_id, item.tier, Err(err));
                        };
                        let tier = advisor.tier;
                        let admission = Admission {
                            advisor,
                            content_id: item.content_id,
                            language: item.language,
                            delivery_date: date,
                            anchor,
                            fallback_reason: None,
                        };
                        (item.advisor_id, tier, self.admit(admission).await)
                    }
                })
                .buffer_unordered(self.config.batch_concurrency.max(1))
                .collect()
                .await;

        let mut report = ScheduleReport {
            delivery_date: Some(date),
            ..Default::default()
        };
        for (advisor_id, tier, outcome) in outcomes {
            if let Err(e) = &outcome {
                warn!(advisor = %advisor_id, "could not schedule delivery: {e}");
            }
            report.record(&advisor_id, tier, outcome);
        }

        info!(
            scheduled = report.scheduled,
            failed = report.failed,
            skipped = report.skipped,
            "daily delivery scheduled"
        );
        Ok(report)
    }

    /// Claim the advisor's delivery for the day and enqueue the job.
    ///
    /// The claim is released again when the queue refuses the job, so a
    /// later run can retry the advisor.
    #[instrument(skip(self, admission), fields(advisor = %admission.advisor.id, tier = %admission.advisor.tier))]
    pub async fn admit(&self, admission: Admission) -> DeliveryResult<AdmitOutcome> {
        let now = self.clock.now();
        let tier = admission.advisor.tier;
        let scheduled_time = admission.anchor + jitter_offset(tier, &mut rand::thread_rng());

        let is_fallback = admission.fallback_reason.is_some();
        let job = DeliveryJob {
            advisor_id: admission.advisor.id,
            content_id: admission.content_id,
            phone_number: admission.advisor.phone_number,
            tier,
            language: admission.language,
            retry_count: 0,
            is_fallback,
            fallback_reason: admission.fallback_reason,
            delivery_date: admission.delivery_date,
            scheduled_time,
        };

        if !self
            .store
            .claim_delivery(DeliveryRecord::pending(&job, now))
            .await?
        {
            debug!("delivery already claimed for {}", job.delivery_date);
            return Ok(AdmitOutcome::Skipped);
        }

        let queue = if is_fallback {
            QueueName::FallbackDelivery
        } else {
            QueueName::Delivery
        };
        let options = JobOptions {
            delay: admission_delay(scheduled_time, now),
            priority: tier.priority(),
            ..Default::default()
        };
        let advisor_id = job.advisor_id.clone();
        let delivery_date = job.delivery_date;

        match self
            .queues
            .add_job(queue, format!("deliver:{advisor_id}"), job, options)
            .await
        {
            Ok(handle) => {
                debug!(job = %handle.key(), %scheduled_time, "delivery admitted");
                Ok(AdmitOutcome::Scheduled {
                    handle,
                    scheduled_time,
                })
            }
            Err(e) => {
                if let Err(release) = self.store.remove_delivery(&advisor_id, delivery_date).await {
                    error!("failed to release delivery claim: {release}");
                }
                Err(e.into())
            }
        }
    }

    /// Send one delivery job.
    #[instrument(skip(self, ctx, job), fields(job = %ctx.job_key(), advisor = %job.advisor_id, attempt = ctx.attempt))]
    pub async fn process_delivery(&self, ctx: &JobContext, job: &DeliveryJob) -> DeliveryResult<()> {
        let mut record = self
            .store
            .get_delivery(&job.advisor_id, job.delivery_date)
            .await?
            .ok_or_else(|| {
                DeliveryError::Validation(format!(
                    "no delivery record for {} on {}",
                    job.advisor_id, job.delivery_date
                ))
            })?;

        if matches!(record.status, DeliveryStatus::Sent | DeliveryStatus::Delivered) {
            debug!("delivery already sent, nothing to do");
            return Ok(());
        }
        transition(&mut record, DeliveryStatus::Active)?;
        record.attempts = ctx.attempt;
        self.store.update_delivery(&record).await?;

        if !self.collaborators.channel.validate_recipient(&job.phone_number) {
            return Err(DeliveryError::Validation(format!(
                "invalid recipient '{}'",
                job.phone_number
            )));
        }

        let content = self
            .collaborators
            .content
            .get_content(&job.content_id)
            .await?
            .ok_or_else(|| {
                DeliveryError::Validation(format!("content {} not found", job.content_id))
            })?;

        let language = if content.variants.contains_key(&job.language) {
            job.language.as_str()
        } else {
            self.config.default_language.as_str()
        };
        let text = content
            .text_for(language, &self.config.default_language)
            .ok_or_else(|| {
                DeliveryError::Validation(format!(
                    "content {} has no '{}' or '{}' variant",
                    content.id, job.language, self.config.default_language
                ))
            })?;
        let template = self.config.templates.get(language).ok_or_else(|| {
            DeliveryError::Configuration(format!("no template for language '{language}'"))
        })?;

        let variables = BTreeMap::from([("body".to_string(), text.to_string())]);
        let sent = tokio::time::timeout(
            self.config.send_timeout,
            self.collaborators
                .channel
                .send_template(&job.phone_number, template, language, &variables),
        )
        .await
        .map_err(|_| {
            DeliveryError::Transient(format!(
                "send timed out after {}s",
                self.config.send_timeout.as_secs()
            ))
        })??;

        let now = self.clock.now();
        let delivery_time_ms = (now - job.scheduled_time).num_milliseconds().max(0);

        transition(&mut record, DeliveryStatus::Sent)?;
        record.message_id = Some(sent.message_id);
        record.sent_at = Some(now);
        record.delivery_time_ms = Some(delivery_time_ms);
        if !self.collaborators.channel.confirms_delivery() {
            transition(&mut record, DeliveryStatus::Delivered)?;
            record.delivered_at = Some(now);
        }
        self.store.update_delivery(&record).await?;

        debug!(delivery_time_ms, "delivery sent");
        self.record_sla_sample(ctx, job, delivery_time_ms, true, now)
            .await
    }

    /// Move a `sent` delivery to `delivered` when the channel's receipt arrives.
    ///
    /// Returns `false` for unknown message ids and records not in `sent`.
    #[instrument(skip(self))]
    pub async fn confirm_delivery(&self, message_id: &str) -> DeliveryResult<bool> {
        let Some(mut record) = self.store.find_delivery_by_message_id(message_id).await? else {
            debug!("no delivery for message id");
            return Ok(false);
        };
        if record.status != DeliveryStatus::Sent {
            return Ok(false);
        }
        transition(&mut record, DeliveryStatus::Delivered)?;
        record.delivered_at = Some(self.clock.now());
        self.store.update_delivery(&record).await?;
        Ok(true)
    }

    async fn record_failure(
        &self,
        ctx: &JobContext,
        job: &DeliveryJob,
        reason: &str,
    ) -> DeliveryResult<()> {
        let now = self.clock.now();
        if let Some(mut record) = self
            .store
            .get_delivery(&job.advisor_id, job.delivery_date)
            .await?
        {
            if matches!(record.status, DeliveryStatus::Sent | DeliveryStatus::Delivered) {
                warn!(
                    job = %ctx.job_key(),
                    "message already sent, keeping its outcome: {reason}"
                );
                return Ok(());
            }
            if record.status == DeliveryStatus::Pending {
                transition(&mut record, DeliveryStatus::Active)?;
            }
            if record.status == DeliveryStatus::Active {
                transition(&mut record, DeliveryStatus::Failed)?;
                record.failure_reason = Some(reason.to_string());
                record.attempts = ctx.attempt;
                self.store.update_delivery(&record).await?;
            }
        }

        let delivery_time_ms = (now - job.scheduled_time).num_milliseconds().max(0);
        self.record_sla_sample(ctx, job, delivery_time_ms, false, now)
            .await
    }

    async fn record_sla_sample(
        &self,
        ctx: &JobContext,
        job: &DeliveryJob,
        delivery_time_ms: i64,
        success: bool,
        now: DateTime<Utc>,
    ) -> DeliveryResult<()> {
        let target_ms = self.config.sla_target.as_millis() as i64;
        self.store
            .insert_sla_sample(SlaMetricRecord {
                job_id: ctx.job_key(),
                advisor_id: job.advisor_id.clone(),
                tier: job.tier,
                delivery_time_ms,
                within_sla: success && delivery_time_ms <= target_ms,
                success,
                timestamp: now,
            })
            .await?;

        // The outcome is already recorded; alerting must not change it
        if let Err(e) = self.check_sla_alert(now).await {
            error!(job = %ctx.job_key(), "SLA alert check failed: {e}");
        }
        Ok(())
    }

    /// Raise an SLA alert when today's compliance dropped under the warning level.
    async fn check_sla_alert(&self, now: DateTime<Utc>) -> DeliveryResult<()> {
        let (start, end) = local_day_bounds(local_date(now, self.timezone), self.timezone);
        let (within, total) = self.store.sla_counts_between(start, end).await?;

        if let Some(candidate) =
            rules::sla_violation(sla_percentage(within, total), total, &self.monitor)
        {
            self.alerts.publish(candidate).await?;
        }
        Ok(())
    }
}

fn transition(record: &mut DeliveryRecord, next: DeliveryStatus) -> DeliveryResult<()> {
    if !record.status.can_transition_to(next) {
        return Err(DeliveryError::Validation(format!(
            "delivery for {} cannot move from {} to {}",
            record.advisor_id, record.status, next
        )));
    }
    record.status = next;
    Ok(())
}

#[async_trait]
impl JobHandler<DeliveryJob> for Scheduler {
    async fn handle(&self, ctx: &JobContext, payload: &DeliveryJob) -> Result<(), JobFailure> {
        self.process_delivery(ctx, payload).await.map_err(|e| {
            if e.is_retryable() && !ctx.is_final_attempt() {
                debug!(job = %ctx.job_key(), "attempt failed, will retry: {e}");
            } else {
                warn!(job = %ctx.job_key(), "delivery failed: {e}");
            }
            JobFailure::from(e)
        })
    }

    async fn on_failed(&self, ctx: &JobContext, payload: &DeliveryJob, failure: &JobFailure) {
        if let Err(e) = self.record_failure(ctx, payload, &failure.message).await {
            error!(job = %ctx.job_key(), "failed to record delivery failure: {e}");
        }
    }
}
