//! Integration tests for storage persistence
//!
//! These tests verify that:
//! - Delivery claims survive a restart, so a rerun does not double-send
//! - Alert cooldowns survive a restart
//! - Fallback usage history keeps excluding entries after a restart

use chrono::{Duration, TimeZone, Utc};
use daily_dispatch::config::StorageConfig;
use daily_dispatch::storage::{
    self, Alert, AlertKind, CandidateQuery, DeliveryRecord, FallbackContentEntry, FallbackUsage,
    Severity,
};
use daily_dispatch::{DeliveryJob, DeliveryStatus, RiskLevel, Tier};
use tempfile::tempdir;

fn job(advisor_id: &str) -> DeliveryJob {
    let date = chrono::NaiveDate::from_ymd_opt(2025, 3, 11).unwrap();
    DeliveryJob {
        advisor_id: advisor_id.to_string(),
        content_id: "content-1".to_string(),
        phone_number: "+14155550100".to_string(),
        tier: Tier::Standard,
        language: "en".to_string(),
        retry_count: 0,
        is_fallback: false,
        fallback_reason: None,
        delivery_date: date,
        scheduled_time: Utc.with_ymd_and_hms(2025, 3, 11, 6, 1, 0).unwrap(),
    }
}

#[tokio::test]
async fn test_claims_survive_restart() {
    let temp_dir = tempdir().unwrap();
    let config = StorageConfig::Sqlite {
        path: temp_dir.path().join("dispatch.db"),
    };
    let now = Utc.with_ymd_and_hms(2025, 3, 11, 5, 30, 0).unwrap();
    let job = job("adv-1");

    {
        let store = storage::open(&config).await.unwrap();
        assert!(store.claim_delivery(DeliveryRecord::pending(&job, now)).await.unwrap());

        let mut record = store
            .get_delivery("adv-1", job.delivery_date)
            .await
            .unwrap()
            .unwrap();
        record.status = DeliveryStatus::Active;
        record.attempts = 1;
        store.update_delivery(&record).await.unwrap();
        store.close().await.unwrap();
    }

    let store = storage::open(&config).await.unwrap();
    assert!(!store.claim_delivery(DeliveryRecord::pending(&job, now)).await.unwrap());

    let record = store
        .get_delivery("adv-1", job.delivery_date)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DeliveryStatus::Active);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.scheduled_time, job.scheduled_time);

    let day = store.deliveries_for_date(job.delivery_date).await.unwrap();
    assert_eq!(day.len(), 1);
}

#[tokio::test]
async fn test_alert_cooldown_survives_restart() {
    let temp_dir = tempdir().unwrap();
    let config = StorageConfig::Sqlite {
        path: temp_dir.path().join("dispatch.db"),
    };
    let raised = Utc.with_ymd_and_hms(2025, 3, 11, 6, 10, 0).unwrap();
    let alert = |at: chrono::DateTime<Utc>| Alert {
        kind: AlertKind::QueueBacklog,
        severity: Severity::Warning,
        message: "1500 jobs waiting".to_string(),
        timestamp: at,
        cooldown_until: at + Duration::minutes(5),
    };

    {
        let store = storage::open(&config).await.unwrap();
        assert!(store.insert_alert_if_cooled(&alert(raised)).await.unwrap());
        store.close().await.unwrap();
    }

    let store = storage::open(&config).await.unwrap();
    assert!(
        !store
            .insert_alert_if_cooled(&alert(raised + Duration::minutes(2)))
            .await
            .unwrap()
    );
    assert!(
        store
            .insert_alert_if_cooled(&alert(raised + Duration::minutes(6)))
            .await
            .unwrap()
    );

    let recent = store.recent_alerts(raised - Duration::hours(1)).await.unwrap();
    assert_eq!(recent.len(), 2);
}

#[tokio::test]
async fn test_usage_history_survives_restart() {
    let temp_dir = tempdir().unwrap();
    let config = StorageConfig::Sqlite {
        path: temp_dir.path().join("dispatch.db"),
    };
    let created = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
    let used_on = chrono::NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();

    {
        let store = storage::open(&config).await.unwrap();
        store
            .insert_fallback_entries(vec![FallbackContentEntry {
                id: "fb-pro-1".to_string(),
                category: "educational".to_string(),
                market_focus: "equity".to_string(),
                risk_level: RiskLevel::Moderate,
                tier: Tier::Pro,
                text: "Diversification reduces single-name risk.".to_string(),
                language: "en".to_string(),
                usage_count: 0,
                last_used: None,
                archived: false,
                created_at: created,
            }])
            .await
            .unwrap();
        store
            .increment_fallback_usage("fb-pro-1", created + Duration::days(9))
            .await
            .unwrap();
        store
            .record_fallback_usage(FallbackUsage {
                advisor_id: "adv-1".to_string(),
                entry_id: "fb-pro-1".to_string(),
                delivery_date: used_on,
            })
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let store = storage::open(&config).await.unwrap();
    let query = |advisor_id: &str| CandidateQuery {
        advisor_id: advisor_id.to_string(),
        tier: Tier::Pro,
        exclude_used_since: used_on - Duration::days(30),
        max_usage: 9,
        limit: 10,
    };

    assert!(store.fallback_candidates(&query("adv-1")).await.unwrap().is_empty());
    let others = store.fallback_candidates(&query("adv-2")).await.unwrap();
    assert_eq!(others.len(), 1);
    assert_eq!(others[0].usage_count, 1);
    assert_eq!(store.count_active_fallback(Tier::Pro, "educational").await.unwrap(), 1);
}
