//! Storage backend trait definition
//!
//! This module defines the `DeliveryStore` trait that all storage
//! implementations must implement.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::error::StorageResult;
use super::schema::{
    Alert, CandidateQuery, DeliveryRecord, FallbackContentEntry, FallbackUsage, SlaMetricRecord,
};
use crate::Tier;

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: std::collections::HashMap<String, String>,
}

/// Trait for delivery persistence backends
///
/// The scheduler, the fallback assigner and the monitor share one store and
/// coordinate only through it. Operations that must not race are single
/// trait calls:
///
/// - `claim_delivery` inserts the per-day record only if none exists
/// - `increment_fallback_usage` bumps a counter and returns the new value
/// - `insert_alert_if_cooled` checks the cooldown and records in one step
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync` as they are shared across tasks.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    // ========================================================================
    // Delivery records
    // ========================================================================

    /// Insert `record` unless one already exists for its advisor and date.
    ///
    /// Returns `true` when the record was inserted.
    async fn claim_delivery(&self, record: DeliveryRecord) -> StorageResult<bool>;

    /// Release a claim. Returns `true` when a record was removed.
    async fn remove_delivery(&self, advisor_id: &str, date: NaiveDate) -> StorageResult<bool>;

    async fn get_delivery(
        &self,
        advisor_id: &str,
        date: NaiveDate,
    ) -> StorageResult<Option<DeliveryRecord>>;

    /// Overwrite an existing record. Fails with `NotFound` if it was never claimed.
    async fn update_delivery(&self, record: &DeliveryRecord) -> StorageResult<()>;

    async fn find_delivery_by_message_id(
        &self,
        message_id: &str,
    ) -> StorageResult<Option<DeliveryRecord>>;

    async fn deliveries_for_date(&self, date: NaiveDate) -> StorageResult<Vec<DeliveryRecord>>;

    // ========================================================================
    // SLA samples
    // ========================================================================

    async fn insert_sla_sample(&self, sample: SlaMetricRecord) -> StorageResult<()>;

    /// Samples with `start <= timestamp < end`, oldest first.
    async fn sla_samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<SlaMetricRecord>>;

    /// `(within_sla, total)` over samples with `start <= timestamp < end`.
    async fn sla_counts_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<(usize, usize)>;

    /// Delete samples older than `before`. Returns the number deleted.
    async fn cleanup_sla_samples(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    // ========================================================================
    // Fallback pool
    // ========================================================================

    async fn insert_fallback_entries(&self, entries: Vec<FallbackContentEntry>)
    -> StorageResult<()>;

    /// Non-archived entries of the query's tier, least used first.
    async fn fallback_candidates(
        &self,
        query: &CandidateQuery,
    ) -> StorageResult<Vec<FallbackContentEntry>>;

    async fn count_active_fallback(&self, tier: Tier, category: &str) -> StorageResult<usize>;

    /// Atomically increment the usage counter, returning the new count.
    async fn increment_fallback_usage(
        &self,
        entry_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<u32>;

    async fn record_fallback_usage(&self, usage: FallbackUsage) -> StorageResult<()>;

    /// Archive entries used at least `max_usage` times or created before
    /// `created_before`. Returns the number archived.
    async fn archive_fallback_entries(
        &self,
        max_usage: u32,
        created_before: DateTime<Utc>,
    ) -> StorageResult<usize>;

    // ========================================================================
    // Alerts
    // ========================================================================

    /// Record `alert` unless an alert of the same kind is still cooling down
    /// at `alert.timestamp`. Returns `true` when recorded.
    async fn insert_alert_if_cooled(&self, alert: &Alert) -> StorageResult<bool>;

    /// Alerts raised at or after `since`, newest first.
    async fn recent_alerts(&self, since: DateTime<Utc>) -> StorageResult<Vec<Alert>>;

    async fn cleanup_alerts(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Check backend health
    ///
    /// Performs a lightweight operation to verify the backend
    /// is operational (e.g., ping database, check file access).
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Get backend-specific statistics
    ///
    /// Returns human-readable stats about the backend
    /// (e.g., "SQLite: 1200 deliveries, 4.5 MB on disk").
    async fn get_stats(&self) -> StorageResult<String>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
