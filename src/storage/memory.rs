//! In-memory storage backend (no persistence)
//!
//! Useful for:
//! - Testing without database dependencies
//! - Dry runs (`"backend": "none"`)
//!
//! All state lives behind one `RwLock`, so every trait call is atomic with
//! respect to the others.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{DeliveryStore, HealthStatus};
use super::error::{StorageError, StorageResult};
use super::schema::{
    Alert, CandidateQuery, DeliveryRecord, FallbackContentEntry, FallbackUsage, SlaMetricRecord,
};
use crate::Tier;

#[derive(Default)]
struct Inner {
    deliveries: BTreeMap<(String, NaiveDate), DeliveryRecord>,
    sla_samples: Vec<SlaMetricRecord>,
    fallback: BTreeMap<String, FallbackContentEntry>,
    usage: Vec<FallbackUsage>,
    alerts: Vec<Alert>,
}

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryStore for MemoryBackend {
    async fn claim_delivery(&self, record: DeliveryRecord) -> StorageResult<bool> {
        let mut inner = self.inner.write().await;
        let key = (record.advisor_id.clone(), record.delivery_date);
        if inner.deliveries.contains_key(&key) {
            return Ok(false);
        }
        inner.deliveries.insert(key, record);
        Ok(true)
    }

    async fn remove_delivery(&self, advisor_id: &str, date: NaiveDate) -> StorageResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .deliveries
            .remove(&(advisor_id.to_string(), date))
            .is_some())
    }

    async fn get_delivery(
        &self,
        advisor_id: &str,
        date: NaiveDate,
    ) -> StorageResult<Option<DeliveryRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.deliveries.get(&(advisor_id.to_string(), date)).cloned())
    }

    async fn update_delivery(&self, record: &DeliveryRecord) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let key = (record.advisor_id.clone(), record.delivery_date);
        match inner.deliveries.get_mut(&key) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "delivery {} on {}",
                record.advisor_id, record.delivery_date
            ))),
        }
    }

    async fn find_delivery_by_message_id(
        &self,
        message_id: &str,
    ) -> StorageResult<Option<DeliveryRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .deliveries
            .values()
            .find(|r| r.message_id.as_deref() == Some(message_id))
            .cloned())
    }

    async fn deliveries_for_date(&self, date: NaiveDate) -> StorageResult<Vec<DeliveryRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .deliveries
            .values()
            .filter(|r| r.delivery_date == date)
            .cloned()
            .collect())
    }

    async fn insert_sla_sample(&self, sample: SlaMetricRecord) -> StorageResult<()> {
        self.inner.write().await.sla_samples.push(sample);
        Ok(())
    }

    async fn sla_samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<SlaMetricRecord>> {
        let inner = self.inner.read().await;
        let mut samples: Vec<SlaMetricRecord> = inner
            .sla_samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp < end)
            .cloned()
            .collect();
        samples.sort_by_key(|s| s.timestamp);
        Ok(samples)
    }

    async fn sla_counts_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<(usize, usize)> {
        let inner = self.inner.read().await;
        Ok(inner
            .sla_samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp < end)
            .fold((0, 0), |(within, total), s| {
                (within + usize::from(s.within_sla), total + 1)
            }))
    }

    async fn cleanup_sla_samples(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut inner = self.inner.write().await;
        let initial = inner.sla_samples.len();
        inner.sla_samples.retain(|s| s.timestamp >= before);
        let deleted = initial - inner.sla_samples.len();
        debug!("deleted {} old SLA samples", deleted);
        Ok(deleted)
    }

    async fn insert_fallback_entries(
        &self,
        entries: Vec<FallbackContentEntry>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        for entry in entries {
            inner.fallback.insert(entry.id.clone(), entry);
        }
        Ok(())
    }

    async fn fallback_candidates(
        &self,
        query: &CandidateQuery,
    ) -> StorageResult<Vec<FallbackContentEntry>> {
        let inner = self.inner.read().await;

        let recently_used: Vec<&str> = inner
            .usage
            .iter()
            .filter(|u| u.advisor_id == query.advisor_id && u.delivery_date >= query.exclude_used_since)
            .map(|u| u.entry_id.as_str())
            .collect();

        let mut candidates: Vec<FallbackContentEntry> = inner
            .fallback
            .values()
            .filter(|e| {
                e.tier == query.tier
                    && !e.archived
                    && e.usage_count <= query.max_usage
                    && !recently_used.contains(&e.id.as_str())
            })
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            a.usage_count
                .cmp(&b.usage_count)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        candidates.truncate(query.limit);
        Ok(candidates)
    }

    async fn count_active_fallback(&self, tier: Tier, category: &str) -> StorageResult<usize> {
        let inner = self.inner.read().await;
        Ok(inner
            .fallback
            .values()
            .filter(|e| e.tier == tier && e.category == category && !e.archived)
            .count())
    }

    async fn increment_fallback_usage(
        &self,
        entry_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<u32> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .fallback
            .get_mut(entry_id)
            .ok_or_else(|| StorageError::NotFound(format!("fallback entry {entry_id}")))?;
        entry.usage_count += 1;
        entry.last_used = Some(at);
        Ok(entry.usage_count)
    }

    async fn record_fallback_usage(&self, usage: FallbackUsage) -> StorageResult<()> {
        self.inner.write().await.usage.push(usage);
        Ok(())
    }

    async fn archive_fallback_entries(
        &self,
        max_usage: u32,
        created_before: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let mut inner = self.inner.write().await;
        let mut archived = 0;
        for entry in inner.fallback.values_mut() {
            if !entry.archived && (entry.usage_count >= max_usage || entry.created_at < created_before)
            {
                entry.archived = true;
                archived += 1;
            }
        }
        Ok(archived)
    }

    async fn insert_alert_if_cooled(&self, alert: &Alert) -> StorageResult<bool> {
        let mut inner = self.inner.write().await;
        let cooling = inner
            .alerts
            .iter()
            .any(|a| a.kind == alert.kind && a.cooldown_until > alert.timestamp);
        if cooling {
            return Ok(false);
        }
        inner.alerts.push(alert.clone());
        Ok(true)
    }

    async fn recent_alerts(&self, since: DateTime<Utc>) -> StorageResult<Vec<Alert>> {
        let inner = self.inner.read().await;
        let mut alerts: Vec<Alert> = inner
            .alerts
            .iter()
            .filter(|a| a.timestamp >= since)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(alerts)
    }

    async fn cleanup_alerts(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut inner = self.inner.write().await;
        let initial = inner.alerts.len();
        inner.alerts.retain(|a| a.timestamp >= before);
        Ok(initial - inner.alerts.len())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let mut metadata = HashMap::new();
        metadata.insert("backend".to_string(), "memory".to_string());

        Ok(HealthStatus {
            healthy: true,
            message: "in-memory backend operational".to_string(),
            metadata,
        })
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let inner = self.inner.read().await;
        Ok(format!(
            "In-memory: {} deliveries, {} SLA samples, {} fallback entries, {} alerts",
            inner.deliveries.len(),
            inner.sla_samples.len(),
            inner.fallback.len(),
            inner.alerts.len()
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend");
        Ok(())
    }
}
