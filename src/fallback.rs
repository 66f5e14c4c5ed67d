//! Fallback content assignment
//!
//! After the daily cutoff every active advisor without content for the next
//! delivery date receives a pre-approved pool entry, or freshly generated
//! emergency content when the pool has nothing suitable. Either way the
//! content goes through the scheduler's admission path, so it is claimed,
//! jittered and queued like any submission.
//!
//! Candidates are ranked by
//!
//! ```text
//! score = 3 × (market focus matches) + 2 × (risk level matches)
//!       + (max_usage − usage_count) / max_usage
//! ```
//!
//! with ties broken by the lower usage count.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::clock::Clock;
use crate::collaborators::Collaborators;
use crate::config::{Config, FallbackConfig};
use crate::error::{BatchError, DeliveryError, DeliveryResult};
use crate::scheduler::{AdmitOutcome, Admission, Scheduler};
use crate::storage::{CandidateQuery, DeliveryStore, FallbackContentEntry, FallbackUsage};
use crate::{Advisor, ContentSource, FallbackReason, NewContent, Preferences, RiskLevel, Tier};

const FOCUS_WEIGHT: f64 = 3.0;
const RISK_WEIGHT: f64 = 2.0;

pub fn score_candidate(
    entry: &FallbackContentEntry,
    preferences: &Preferences,
    max_usage: u32,
) -> f64 {
    let mut score = 0.0;
    if preferences.market_focus.as_deref() == Some(entry.market_focus.as_str()) {
        score += FOCUS_WEIGHT;
    }
    if preferences.risk_level == Some(entry.risk_level) {
        score += RISK_WEIGHT;
    }
    if max_usage > 0 {
        score += max_usage.saturating_sub(entry.usage_count) as f64 / max_usage as f64;
    }
    score
}

/// Best candidate for an advisor's preferences.
pub fn select_candidate<'a>(
    candidates: &'a [FallbackContentEntry],
    preferences: &Preferences,
    max_usage: u32,
) -> Option<&'a FallbackContentEntry> {
    candidates.iter().max_by(|a, b| {
        score_candidate(a, preferences, max_usage)
            .partial_cmp(&score_candidate(b, preferences, max_usage))
            .unwrap_or(Ordering::Equal)
            // max_by keeps the last maximum, so prefer the lower usage explicitly
            .then_with(|| b.usage_count.cmp(&a.usage_count))
    })
}

enum Assignment {
    Pool,
    Emergency,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FallbackReport {
    pub delivery_date: Option<NaiveDate>,
    pub assigned: usize,
    pub emergency: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rotated: usize,
    pub refilled: usize,
    pub errors: Vec<BatchError>,
}

pub struct FallbackAssigner {
    config: FallbackConfig,
    default_language: String,
    batch_concurrency: usize,
    store: Arc<dyn DeliveryStore>,
    scheduler: Arc<Scheduler>,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
}

impl FallbackAssigner {
    pub fn new(
        config: &Config,
        store: Arc<dyn DeliveryStore>,
        scheduler: Arc<Scheduler>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: config.fallback.clone(),
            default_language: config.delivery.default_language.clone(),
            batch_concurrency: config.delivery.batch_concurrency,
            store,
            scheduler,
            collaborators,
            clock,
        })
    }

    /// Give every uncovered advisor content for the next delivery date.
    #[instrument(skip(self))]
    pub async fn run_fallback_assignment(&self) -> DeliveryResult<FallbackReport> {
        let mut report = FallbackReport::default();

        match self.rotate_old_content().await {
            Ok(rotated) => report.rotated = rotated,
            Err(e) => warn!("fallback rotation failed: {e}"),
        }

        let (anchor, date) = self.scheduler.target_anchor();
        report.delivery_date = Some(date);
        info!(%date, "assigning fallback content");

        let advisors = self
            .collaborators
            .advisors
            .list_active_channel_enabled()
            .await?;

        let outcomes: Vec<(String, DeliveryResult<Assignment>)> = futures::stream::iter(advisors)
            .map(|advisor| async move {
                let advisor_id = advisor.id.clone();
                (advisor_id, self.assign(advisor, date, anchor).await)
            })
            .buffer_unordered(self.batch_concurrency.max(1))
            .collect()
            .await;

        for (advisor_id, outcome) in outcomes {
            match outcome {
                Ok(Assignment::Pool) => report.assigned += 1,
                Ok(Assignment::Emergency) => {
                    report.assigned += 1;
                    report.emergency += 1;
                }
                Ok(Assignment::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(advisor = %advisor_id, "fallback assignment failed: {e}");
                    report.failed += 1;
                    report.errors.push(BatchError::new(advisor_id, &e));
                }
            }
        }

        match self.refill_pool_if_needed().await {
            Ok(refilled) => report.refilled = refilled,
            Err(e) => warn!("fallback refill failed: {e}"),
        }

        info!(
            assigned = report.assigned,
            emergency = report.emergency,
            failed = report.failed,
            skipped = report.skipped,
            "fallback assignment finished"
        );
        Ok(report)
    }

    #[instrument(skip(self, advisor, anchor), fields(advisor = %advisor.id))]
    async fn assign(
        &self,
        advisor: Advisor,
        date: NaiveDate,
        anchor: DateTime<Utc>,
    ) -> DeliveryResult<Assignment> {
        if self
            .collaborators
            .content
            .advisor_has_content_for_date(&advisor.id, date)
            .await?
            || self.store.get_delivery(&advisor.id, date).await?.is_some()
        {
            return Ok(Assignment::Skipped);
        }

        let now = self.clock.now();
        let exclude_since = date - chrono::Duration::days(i64::from(self.config.exclusion_days));
        let candidates = self
            .store
            .fallback_candidates(&CandidateQuery {
                advisor_id: advisor.id.clone(),
                tier: advisor.tier,
                exclude_used_since: exclude_since,
                // the pick below adds one use
                max_usage: self.config.max_usage.saturating_sub(1),
                limit: self.config.candidate_limit,
            })
            .await?;

        let chosen = select_candidate(&candidates, &advisor.preferences, self.config.max_usage);

        let (text, language, reason, source) = match chosen {
            Some(entry) => {
                debug!(entry = %entry.id, usage = entry.usage_count, "pool entry selected");
                (
                    entry.text.clone(),
                    entry.language.clone(),
                    FallbackReason::NoContentSubmitted,
                    ContentSource::FallbackPool,
                )
            }
            None => {
                debug!("no pool candidate, generating emergency content");
                let generated = self
                    .collaborators
                    .generator
                    .generate_emergency_content(&advisor)
                    .await?;
                (
                    generated.text,
                    generated.language,
                    FallbackReason::EmergencyGenerated,
                    ContentSource::EmergencyGenerated,
                )
            }
        };

        let content = self
            .collaborators
            .content
            .create_content(NewContent {
                advisor_id: advisor.id.clone(),
                delivery_date: date,
                variants: BTreeMap::from([(language, text)]),
                source,
            })
            .await?;

        let language = advisor.language.clone();
        let outcome = self
            .scheduler
            .admit(Admission {
                advisor: advisor.clone(),
                content_id: content.id.clone(),
                language,
                delivery_date: date,
                anchor,
                fallback_reason: Some(reason),
            })
            .await;

        // Content without a delivery would count as submitted on the next run
        match outcome {
            Ok(AdmitOutcome::Scheduled { .. }) => {}
            Ok(AdmitOutcome::Skipped) => {
                self.discard_content(&content.id).await;
                return Ok(Assignment::Skipped);
            }
            Err(e) => {
                self.discard_content(&content.id).await;
                return Err(e);
            }
        }

        if let Some(entry) = chosen {
            if let Err(e) = self.charge_usage(entry, &advisor.id, date, now).await {
                error!(entry = %entry.id, "failed to record fallback usage: {e}");
            }
        }

        Ok(match reason {
            FallbackReason::EmergencyGenerated => Assignment::Emergency,
            FallbackReason::NoContentSubmitted => Assignment::Pool,
        })
    }

    async fn discard_content(&self, content_id: &str) {
        if let Err(e) = self.collaborators.content.delete_content(content_id).await {
            error!(
                content = content_id,
                "failed to discard unadmitted fallback content: {e}"
            );
        }
    }

    async fn charge_usage(
        &self,
        entry: &FallbackContentEntry,
        advisor_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> DeliveryResult<()> {
        let usage = self.store.increment_fallback_usage(&entry.id, now).await?;
        trace!(entry = %entry.id, usage, "fallback usage incremented");
        self.store
            .record_fallback_usage(FallbackUsage {
                advisor_id: advisor_id.to_string(),
                entry_id: entry.id.clone(),
                delivery_date: date,
            })
            .await?;
        Ok(())
    }

    /// Bring every (tier, category) segment up to the minimum pool size.
    #[instrument(skip(self))]
    pub async fn initialize_fallback_pool(&self) -> DeliveryResult<usize> {
        let created = self.top_up_segments().await?;
        info!(created, "fallback pool initialized");
        Ok(created)
    }

    /// Archive entries that hit the usage cap or aged past the rotation period.
    #[instrument(skip(self))]
    pub async fn rotate_old_content(&self) -> DeliveryResult<usize> {
        let cutoff =
            self.clock.now() - chrono::Duration::days(i64::from(self.config.rotation_days));
        let archived = self
            .store
            .archive_fallback_entries(self.config.max_usage, cutoff)
            .await?;
        if archived > 0 {
            info!(archived, "rotated fallback content");
        }
        Ok(archived)
    }

    /// Top up every segment that fell under the minimum pool size.
    #[instrument(skip(self))]
    pub async fn refill_pool_if_needed(&self) -> DeliveryResult<usize> {
        let created = self.top_up_segments().await?;
        if created > 0 {
            info!(created, "refilled fallback pool");
        }
        Ok(created)
    }

    async fn top_up_segments(&self) -> DeliveryResult<usize> {
        let mut created = 0;
        for tier in Tier::ALL {
            for category in &self.config.categories {
                let active = self.store.count_active_fallback(tier, category).await?;
                if active < self.config.min_pool_size {
                    created += self
                        .generate_entries(tier, category, self.config.min_pool_size - active)
                        .await?;
                }
            }
        }
        Ok(created)
    }

    /// Generate `count` entries, cycling through the configured risk levels.
    ///
    /// Generation failures are logged and skipped; the next refill retries.
    async fn generate_entries(
        &self,
        tier: Tier,
        category: &str,
        count: usize,
    ) -> DeliveryResult<usize> {
        let risk_levels: &[RiskLevel] = if self.config.risk_levels.is_empty() {
            &RiskLevel::ALL
        } else {
            &self.config.risk_levels
        };

        let now = self.clock.now();
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let risk_level = risk_levels[i % risk_levels.len()];
            match self
                .collaborators
                .generator
                .generate_fallback_content(category, tier, risk_level)
                .await
            {
                Ok(generated) => entries.push(FallbackContentEntry {
                    id: format!("fb-{tier}-{:016x}", rand::random::<u64>()),
                    category: category.to_string(),
                    market_focus: generated.market_focus,
                    risk_level,
                    tier,
                    text: generated.text,
                    language: self.default_language.clone(),
                    usage_count: 0,
                    last_used: None,
                    archived: false,
                    created_at: now,
                }),
                Err(e) => warn!(%tier, category, "fallback generation failed: {e}"),
            }
        }

        let created = entries.len();
        if created == 0 && count > 0 {
            return Err(DeliveryError::Transient(format!(
                "could not generate any {category} entries for {tier}"
            )));
        }
        self.store.insert_fallback_entries(entries).await?;
        Ok(created)
    }
}
