//! Shared fixtures for integration tests
//!
//! `Harness` wires the scheduler and fallback assigner to in-memory
//! collaborators and a clock that follows tokio's paused time, so a test can
//! jump straight to the delivery anchor with `tokio::time::advance`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use daily_dispatch::{
    Advisor, DeliveryJob, Preferences, RiskLevel, Tier,
    alerts::AlertPublisher,
    clock::{Clock, TokioClock},
    collaborators::{
        Collaborators, InMemoryDirectory, MessagingChannel, SendError, SentMessage,
        TemplateContentGenerator, channel::is_e164,
    },
    config::{Config, parse_config},
    fallback::FallbackAssigner,
    queue::{Backoff, QueueManager, QueueName, QueueSettings, RetryPolicy},
    scheduler::Scheduler,
    storage::{
        Alert, CandidateQuery, DeliveryRecord, DeliveryStore, FallbackContentEntry, FallbackUsage,
        HealthStatus, MemoryBackend, SlaMetricRecord, StorageError, StorageResult,
    },
};
use parking_lot::Mutex;

/// A message the recording channel accepted.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub recipient: String,
    pub template: String,
    pub language: String,
    pub body: String,
    pub message_id: String,
}

/// Channel that keeps every send in memory and can be told to fail.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<SentRecord>>,
    failure: Mutex<Option<SendError>>,
    stall: Mutex<Option<Duration>>,
    confirms: bool,
    next_id: AtomicU64,
}

impl RecordingChannel {
    pub fn confirming() -> Self {
        Self {
            confirms: true,
            ..Default::default()
        }
    }

    pub fn fail_with(&self, error: SendError) {
        *self.failure.lock() = Some(error);
    }

    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    /// Hold every send for `duration` before answering.
    pub fn stall_for(&self, duration: Duration) {
        *self.stall.lock() = Some(duration);
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<SentRecord> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.recipient == recipient)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessagingChannel for RecordingChannel {
    fn validate_recipient(&self, recipient: &str) -> bool {
        is_e164(recipient)
    }

    async fn send_template(
        &self,
        recipient: &str,
        template: &str,
        language: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<SentMessage, SendError> {
        let stall = *self.stall.lock();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let message_id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.sent.lock().push(SentRecord {
            recipient: recipient.to_string(),
            template: template.to_string(),
            language: language.to_string(),
            body: variables.get("body").cloned().unwrap_or_default(),
            message_id: message_id.clone(),
        });
        Ok(SentMessage { message_id })
    }

    fn confirms_delivery(&self) -> bool {
        self.confirms
    }
}

/// Memory store whose SLA count query can be switched to fail.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryBackend,
    fail_sla_counts: AtomicBool,
}

impl FaultyStore {
    pub fn fail_sla_counts(&self) {
        self.fail_sla_counts.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeliveryStore for FaultyStore {
    async fn claim_delivery(&self, record: DeliveryRecord) -> StorageResult<bool> {
        self.inner.claim_delivery(record).await
    }

    async fn remove_delivery(&self, advisor_id: &str, date: NaiveDate) -> StorageResult<bool> {
        self.inner.remove_delivery(advisor_id, date).await
    }

    async fn get_delivery(
        &self,
        advisor_id: &str,
        date: NaiveDate,
    ) -> StorageResult<Option<DeliveryRecord>> {
        self.inner.get_delivery(advisor_id, date).await
    }

    async fn update_delivery(&self, record: &DeliveryRecord) -> StorageResult<()> {
        self.inner.update_delivery(record).await
    }

    async fn find_delivery_by_message_id(
        &self,
        message_id: &str,
    ) -> StorageResult<Option<DeliveryRecord>> {
        self.inner.find_delivery_by_message_id(message_id).await
    }

    async fn deliveries_for_date(&self, date: NaiveDate) -> StorageResult<Vec<DeliveryRecord>> {
        self.inner.deliveries_for_date(date).await
    }

    async fn insert_sla_sample(&self, sample: SlaMetricRecord) -> StorageResult<()> {
        self.inner.insert_sla_sample(sample).await
    }

    async fn sla_samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<SlaMetricRecord>> {
        self.inner.sla_samples_between(start, end).await
    }

    async fn sla_counts_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<(usize, usize)> {
        if self.fail_sla_counts.load(Ordering::SeqCst) {
            return Err(StorageError::QueryFailed("database is locked".to_string()));
        }
        self.inner.sla_counts_between(start, end).await
    }

    async fn cleanup_sla_samples(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        self.inner.cleanup_sla_samples(before).await
    }

    async fn insert_fallback_entries(
        &self,
        entries: Vec<FallbackContentEntry>,
    ) -> StorageResult<()> {
        self.inner.insert_fallback_entries(entries).await
    }

    async fn fallback_candidates(
        &self,
        query: &CandidateQuery,
    ) -> StorageResult<Vec<FallbackContentEntry>> {
        self.inner.fallback_candidates(query).await
    }

    async fn count_active_fallback(&self, tier: Tier, category: &str) -> StorageResult<usize> {
        self.inner.count_active_fallback(tier, category).await
    }

    async fn increment_fallback_usage(
        &self,
        entry_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<u32> {
        self.inner.increment_fallback_usage(entry_id, at).await
    }

    async fn record_fallback_usage(&self, usage: FallbackUsage) -> StorageResult<()> {
        self.inner.record_fallback_usage(usage).await
    }

    async fn archive_fallback_entries(
        &self,
        max_usage: u32,
        created_before: DateTime<Utc>,
    ) -> StorageResult<usize> {
        self.inner
            .archive_fallback_entries(max_usage, created_before)
            .await
    }

    async fn insert_alert_if_cooled(&self, alert: &Alert) -> StorageResult<bool> {
        self.inner.insert_alert_if_cooled(alert).await
    }

    async fn recent_alerts(&self, since: DateTime<Utc>) -> StorageResult<Vec<Alert>> {
        self.inner.recent_alerts(since).await
    }

    async fn cleanup_alerts(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        self.inner.cleanup_alerts(before).await
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        self.inner.health_check().await
    }

    async fn get_stats(&self) -> StorageResult<String> {
        self.inner.get_stats().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}

/// Defaults with fast retries, no rate limit and a small fallback pool.
pub fn test_config() -> Config {
    let mut config = parse_config("{}").unwrap();
    let settings = QueueSettings {
        concurrency: 10,
        rate_limit: None,
        retry: RetryPolicy {
            attempts: 3,
            backoff: Backoff::Fixed {
                delay: Duration::from_millis(100),
            },
        },
        ..Default::default()
    };
    config.queue.delivery = settings.clone();
    config.queue.fallback = settings;
    config.fallback.min_pool_size = 3;
    config.fallback.categories = vec!["market_update".to_string()];
    config
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

pub fn advisor(id: &str, tier: Tier, phone: &str) -> Advisor {
    Advisor {
        id: id.to_string(),
        name: format!("Advisor {id}"),
        tier,
        phone_number: phone.to_string(),
        language: "en".to_string(),
        preferences: Preferences::default(),
    }
}

pub fn advisor_with_preferences(
    id: &str,
    tier: Tier,
    market_focus: &str,
    risk_level: RiskLevel,
) -> Advisor {
    Advisor {
        preferences: Preferences {
            market_focus: Some(market_focus.to_string()),
            risk_level: Some(risk_level),
        },
        ..advisor(id, tier, "+14155550100")
    }
}

pub fn english(text: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("en".to_string(), text.to_string())])
}

pub struct Harness {
    pub config: Config,
    pub clock: Arc<TokioClock>,
    pub store: Arc<dyn DeliveryStore>,
    pub directory: Arc<InMemoryDirectory>,
    pub channel: Arc<RecordingChannel>,
    pub queues: Arc<QueueManager<DeliveryJob>>,
    pub publisher: AlertPublisher,
    pub scheduler: Arc<Scheduler>,
    pub fallback: Arc<FallbackAssigner>,
}

impl Harness {
    /// Must be called from inside the test runtime.
    pub fn start(now: DateTime<Utc>) -> Self {
        Self::build(now, test_config(), RecordingChannel::default())
    }

    pub fn build(now: DateTime<Utc>, config: Config, channel: RecordingChannel) -> Self {
        Self::build_with_store(now, config, channel, Arc::new(MemoryBackend::new()))
    }

    pub fn build_with_store(
        now: DateTime<Utc>,
        config: Config,
        channel: RecordingChannel,
        store: Arc<dyn DeliveryStore>,
    ) -> Self {
        let clock = Arc::new(TokioClock::starting_at(now));
        let directory = Arc::new(InMemoryDirectory::new());
        let channel = Arc::new(channel);

        let collaborators = Collaborators {
            content: directory.clone(),
            advisors: directory.clone(),
            channel: channel.clone(),
            generator: Arc::new(TemplateContentGenerator::new("en")),
        };

        let queues = Arc::new(QueueManager::new());
        queues.create_queue(QueueName::Delivery, config.queue.delivery.clone());
        queues.create_queue(QueueName::FallbackDelivery, config.queue.fallback.clone());

        let publisher = AlertPublisher::new(
            store.clone(),
            clock.clone() as Arc<dyn Clock>,
            config.monitor.clone(),
        );
        let scheduler = Scheduler::new(
            &config,
            store.clone(),
            queues.clone(),
            collaborators.clone(),
            publisher.clone(),
            clock.clone(),
        );
        scheduler.register_workers().unwrap();
        let fallback = FallbackAssigner::new(
            &config,
            store.clone(),
            scheduler.clone(),
            collaborators,
            clock.clone(),
        );

        Self {
            config,
            clock,
            store,
            directory,
            channel,
            queues,
            publisher,
            scheduler,
            fallback,
        }
    }

    /// Let paused time run forward; due queue jobs run along the way.
    pub async fn run_for(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
