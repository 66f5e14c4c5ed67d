//! SQLite storage backend implementation
//!
//! This module provides a SQLite-based implementation of the `DeliveryStore` trait.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Better concurrency for reads during writes
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! ## Atomic operations
//!
//! The race-sensitive operations are single statements:
//!
//! - claim: `INSERT ... ON CONFLICT DO NOTHING`
//! - usage increment: `UPDATE ... RETURNING usage_count`
//! - alert cooldown: `INSERT ... SELECT ... WHERE NOT EXISTS`

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{DeliveryStore, HealthStatus};
use super::error::{StorageError, StorageResult};
use super::schema::{
    Alert, CandidateQuery, DeliveryRecord, FallbackContentEntry, FallbackUsage, SlaMetricRecord,
};
use crate::Tier;

const DATE_FORMAT: &str = "%Y-%m-%d";

const DELIVERY_COLUMNS: &str = r#"
    advisor_id, delivery_date, content_id, tier, scheduled_time, status,
    is_fallback, fallback_reason, message_id, sent_at, delivered_at,
    delivery_time_ms, failure_reason, attempts, created_at
"#;

const FALLBACK_COLUMNS: &str = r#"
    id, category, market_focus, risk_level, tier, text, language,
    usage_count, last_used, archived, created_at
"#;

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Run migrations to create tables
    /// 3. Configure SQLite for optimal performance (WAL mode, etc.)
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }

    fn date_to_text(date: NaiveDate) -> String {
        date.format(DATE_FORMAT).to_string()
    }

    fn text_to_date(raw: &str) -> StorageResult<NaiveDate> {
        NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map_err(|e| StorageError::SerializationError(format!("bad date '{raw}': {e}")))
    }

    fn parse<T: FromStr<Err = String>>(raw: &str) -> StorageResult<T> {
        raw.parse().map_err(StorageError::SerializationError)
    }

    fn delivery_from_row(row: &SqliteRow) -> StorageResult<DeliveryRecord> {
        let fallback_reason: Option<String> = row.try_get("fallback_reason")?;
        Ok(DeliveryRecord {
            advisor_id: row.try_get("advisor_id")?,
            delivery_date: Self::text_to_date(row.try_get::<&str, _>("delivery_date")?)?,
            content_id: row.try_get("content_id")?,
            tier: Self::parse(row.try_get::<&str, _>("tier")?)?,
            scheduled_time: Self::millis_to_timestamp(row.try_get("scheduled_time")?),
            status: Self::parse(row.try_get::<&str, _>("status")?)?,
            is_fallback: row.try_get("is_fallback")?,
            fallback_reason: fallback_reason.as_deref().map(Self::parse).transpose()?,
            message_id: row.try_get("message_id")?,
            sent_at: row
                .try_get::<Option<i64>, _>("sent_at")?
                .map(Self::millis_to_timestamp),
            delivered_at: row
                .try_get::<Option<i64>, _>("delivered_at")?
                .map(Self::millis_to_timestamp),
            delivery_time_ms: row.try_get("delivery_time_ms")?,
            failure_reason: row.try_get("failure_reason")?,
            attempts: row.try_get::<i64, _>("attempts")? as u32,
            created_at: Self::millis_to_timestamp(row.try_get("created_at")?),
        })
    }

    fn fallback_from_row(row: &SqliteRow) -> StorageResult<FallbackContentEntry> {
        Ok(FallbackContentEntry {
            id: row.try_get("id")?,
            category: row.try_get("category")?,
            market_focus: row.try_get("market_focus")?,
            risk_level: Self::parse(row.try_get::<&str, _>("risk_level")?)?,
            tier: Self::parse(row.try_get::<&str, _>("tier")?)?,
            text: row.try_get("text")?,
            language: row.try_get("language")?,
            usage_count: row.try_get::<i64, _>("usage_count")? as u32,
            last_used: row
                .try_get::<Option<i64>, _>("last_used")?
                .map(Self::millis_to_timestamp),
            archived: row.try_get("archived")?,
            created_at: Self::millis_to_timestamp(row.try_get("created_at")?),
        })
    }

    fn sla_from_row(row: &SqliteRow) -> StorageResult<SlaMetricRecord> {
        Ok(SlaMetricRecord {
            job_id: row.try_get("job_id")?,
            advisor_id: row.try_get("advisor_id")?,
            tier: Self::parse(row.try_get::<&str, _>("tier")?)?,
            delivery_time_ms: row.try_get("delivery_time_ms")?,
            within_sla: row.try_get("within_sla")?,
            success: row.try_get("success")?,
            timestamp: Self::millis_to_timestamp(row.try_get("timestamp")?),
        })
    }

    fn alert_from_row(row: &SqliteRow) -> StorageResult<Alert> {
        Ok(Alert {
            kind: Self::parse(row.try_get::<&str, _>("kind")?)?,
            severity: Self::parse(row.try_get::<&str, _>("severity")?)?,
            message: row.try_get("message")?,
            timestamp: Self::millis_to_timestamp(row.try_get("timestamp")?),
            cooldown_until: Self::millis_to_timestamp(row.try_get("cooldown_until")?),
        })
    }
}

#[async_trait]
impl DeliveryStore for SqliteBackend {
    #[instrument(skip(self, record), fields(advisor_id = %record.advisor_id, date = %record.delivery_date))]
    async fn claim_delivery(&self, record: DeliveryRecord) -> StorageResult<bool> {
        let sql = format!(
            "INSERT INTO delivery_records ({DELIVERY_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (advisor_id, delivery_date) DO NOTHING"
        );

        let result = sqlx::query(&sql)
            .bind(&record.advisor_id)
            .bind(Self::date_to_text(record.delivery_date))
            .bind(&record.content_id)
            .bind(record.tier.as_str())
            .bind(Self::timestamp_to_millis(&record.scheduled_time))
            .bind(record.status.as_str())
            .bind(record.is_fallback)
            .bind(record.fallback_reason.map(|r| r.as_str()))
            .bind(&record.message_id)
            .bind(record.sent_at.as_ref().map(Self::timestamp_to_millis))
            .bind(record.delivered_at.as_ref().map(Self::timestamp_to_millis))
            .bind(record.delivery_time_ms)
            .bind(&record.failure_reason)
            .bind(record.attempts as i64)
            .bind(Self::timestamp_to_millis(&record.created_at))
            .execute(&self.pool)
            .await?;

        let claimed = result.rows_affected() == 1;
        debug!(claimed, "delivery claim");
        Ok(claimed)
    }

    async fn remove_delivery(&self, advisor_id: &str, date: NaiveDate) -> StorageResult<bool> {
        let result =
            sqlx::query("DELETE FROM delivery_records WHERE advisor_id = ? AND delivery_date = ?")
                .bind(advisor_id)
                .bind(Self::date_to_text(date))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_delivery(
        &self,
        advisor_id: &str,
        date: NaiveDate,
    ) -> StorageResult<Option<DeliveryRecord>> {
        let sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM delivery_records \
             WHERE advisor_id = ? AND delivery_date = ?"
        );
        let row = sqlx::query(&sql)
            .bind(advisor_id)
            .bind(Self::date_to_text(date))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::delivery_from_row).transpose()
    }

    #[instrument(skip(self, record), fields(advisor_id = %record.advisor_id, status = %record.status))]
    async fn update_delivery(&self, record: &DeliveryRecord) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records SET
                content_id = ?, tier = ?, scheduled_time = ?, status = ?,
                is_fallback = ?, fallback_reason = ?, message_id = ?, sent_at = ?,
                delivered_at = ?, delivery_time_ms = ?, failure_reason = ?, attempts = ?
            WHERE advisor_id = ? AND delivery_date = ?
            "#,
        )
        .bind(&record.content_id)
        .bind(record.tier.as_str())
        .bind(Self::timestamp_to_millis(&record.scheduled_time))
        .bind(record.status.as_str())
        .bind(record.is_fallback)
        .bind(record.fallback_reason.map(|r| r.as_str()))
        .bind(&record.message_id)
        .bind(record.sent_at.as_ref().map(Self::timestamp_to_millis))
        .bind(record.delivered_at.as_ref().map(Self::timestamp_to_millis))
        .bind(record.delivery_time_ms)
        .bind(&record.failure_reason)
        .bind(record.attempts as i64)
        .bind(&record.advisor_id)
        .bind(Self::date_to_text(record.delivery_date))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "delivery {} on {}",
                record.advisor_id, record.delivery_date
            )));
        }
        Ok(())
    }

    async fn find_delivery_by_message_id(
        &self,
        message_id: &str,
    ) -> StorageResult<Option<DeliveryRecord>> {
        let sql = format!("SELECT {DELIVERY_COLUMNS} FROM delivery_records WHERE message_id = ?");
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::delivery_from_row).transpose()
    }

    async fn deliveries_for_date(&self, date: NaiveDate) -> StorageResult<Vec<DeliveryRecord>> {
        let sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM delivery_records \
             WHERE delivery_date = ? ORDER BY scheduled_time ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(Self::date_to_text(date))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::delivery_from_row).collect()
    }

    async fn insert_sla_sample(&self, sample: SlaMetricRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sla_metrics (
                job_id, advisor_id, tier, delivery_time_ms, within_sla, success, timestamp
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sample.job_id)
        .bind(&sample.advisor_id)
        .bind(sample.tier.as_str())
        .bind(sample.delivery_time_ms)
        .bind(sample.within_sla)
        .bind(sample.success)
        .bind(Self::timestamp_to_millis(&sample.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sla_samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<SlaMetricRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, advisor_id, tier, delivery_time_ms, within_sla, success, timestamp
            FROM sla_metrics
            WHERE timestamp >= ? AND timestamp < ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(Self::timestamp_to_millis(&start))
        .bind(Self::timestamp_to_millis(&end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::sla_from_row).collect()
    }

    async fn sla_counts_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<(usize, usize)> {
        let (within, total): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(within_sla), 0), COUNT(*)
            FROM sla_metrics
            WHERE timestamp >= ? AND timestamp < ?
            "#,
        )
        .bind(Self::timestamp_to_millis(&start))
        .bind(Self::timestamp_to_millis(&end))
        .fetch_one(&self.pool)
        .await?;

        Ok((within as usize, total as usize))
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_sla_samples(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM sla_metrics WHERE timestamp < ?")
            .bind(Self::timestamp_to_millis(&before))
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        info!("deleted {} old SLA samples", deleted);
        Ok(deleted)
    }

    #[instrument(skip(self, entries), fields(count = entries.len()))]
    async fn insert_fallback_entries(
        &self,
        entries: Vec<FallbackContentEntry>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "INSERT INTO fallback_content ({FALLBACK_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO NOTHING"
        );

        for entry in &entries {
            sqlx::query(&sql)
                .bind(&entry.id)
                .bind(&entry.category)
                .bind(&entry.market_focus)
                .bind(entry.risk_level.as_str())
                .bind(entry.tier.as_str())
                .bind(&entry.text)
                .bind(&entry.language)
                .bind(entry.usage_count as i64)
                .bind(entry.last_used.as_ref().map(Self::timestamp_to_millis))
                .bind(entry.archived)
                .bind(Self::timestamp_to_millis(&entry.created_at))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fallback_candidates(
        &self,
        query: &CandidateQuery,
    ) -> StorageResult<Vec<FallbackContentEntry>> {
        let sql = format!(
            r#"
            SELECT {FALLBACK_COLUMNS} FROM fallback_content
            WHERE tier = ? AND archived = 0 AND usage_count <= ?
              AND id NOT IN (
                  SELECT entry_id FROM fallback_usage
                  WHERE advisor_id = ? AND delivery_date >= ?
              )
            ORDER BY usage_count ASC, created_at ASC
            LIMIT ?
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(query.tier.as_str())
            .bind(query.max_usage as i64)
            .bind(&query.advisor_id)
            .bind(Self::date_to_text(query.exclude_used_since))
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::fallback_from_row).collect()
    }

    async fn count_active_fallback(&self, tier: Tier, category: &str) -> StorageResult<usize> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM fallback_content WHERE tier = ? AND category = ? AND archived = 0",
        )
        .bind(tier.as_str())
        .bind(category)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as usize)
    }

    async fn increment_fallback_usage(
        &self,
        entry_id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<u32> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE fallback_content
            SET usage_count = usage_count + 1, last_used = ?
            WHERE id = ?
            RETURNING usage_count
            "#,
        )
        .bind(Self::timestamp_to_millis(&at))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(count,)| count as u32)
            .ok_or_else(|| StorageError::NotFound(format!("fallback entry {entry_id}")))
    }

    async fn record_fallback_usage(&self, usage: FallbackUsage) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fallback_usage (advisor_id, entry_id, delivery_date)
            VALUES (?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&usage.advisor_id)
        .bind(&usage.entry_id)
        .bind(Self::date_to_text(usage.delivery_date))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn archive_fallback_entries(
        &self,
        max_usage: u32,
        created_before: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let result = sqlx::query(
            r#"
            UPDATE fallback_content SET archived = 1
            WHERE archived = 0 AND (usage_count >= ? OR created_at < ?)
            "#,
        )
        .bind(max_usage as i64)
        .bind(Self::timestamp_to_millis(&created_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self, alert), fields(kind = %alert.kind))]
    async fn insert_alert_if_cooled(&self, alert: &Alert) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO alerts (kind, severity, message, timestamp, cooldown_until)
            SELECT ?, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM alerts WHERE kind = ? AND cooldown_until > ?
            )
            "#,
        )
        .bind(alert.kind.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.message)
        .bind(Self::timestamp_to_millis(&alert.timestamp))
        .bind(Self::timestamp_to_millis(&alert.cooldown_until))
        .bind(alert.kind.as_str())
        .bind(Self::timestamp_to_millis(&alert.timestamp))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn recent_alerts(&self, since: DateTime<Utc>) -> StorageResult<Vec<Alert>> {
        let rows = sqlx::query(
            r#"
            SELECT kind, severity, message, timestamp, cooldown_until
            FROM alerts WHERE timestamp >= ?
            ORDER BY timestamp DESC
            "#,
        )
        .bind(Self::timestamp_to_millis(&since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::alert_from_row).collect()
    }

    async fn cleanup_alerts(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM alerts WHERE timestamp < ?")
            .bind(Self::timestamp_to_millis(&before))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_stats(&self) -> StorageResult<String> {
        let deliveries: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM delivery_records")
            .fetch_one(&self.pool)
            .await?;
        let samples: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sla_metrics")
            .fetch_one(&self.pool)
            .await?;
        let pool: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM fallback_content WHERE archived = 0")
                .fetch_one(&self.pool)
                .await?;

        let file_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let file_size_mb = file_size as f64 / 1_000_000.0;

        Ok(format!(
            "SQLite: {} deliveries, {} SLA samples, {} active fallback entries, {:.2} MB on disk",
            deliveries.0, samples.0, pool.0, file_size_mb
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
