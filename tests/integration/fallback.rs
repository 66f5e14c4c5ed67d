//! Integration tests for fallback assignment
//!
//! These tests verify that:
//! - Every uncovered advisor gets content after the cutoff
//! - Pool entries are matched to preferences and not repeated
//! - Emergency content is generated when the pool is empty
//! - Rotation and refill keep the pool at its minimum size
//! - An advisor refused by an open circuit is picked up by the next run

use std::time::Duration;

use chrono::{DateTime, Utc};
use daily_dispatch::collaborators::{ContentRepository, SendError};
use daily_dispatch::queue::{Backoff, QueueName, RetryPolicy};
use daily_dispatch::storage::{CandidateQuery, FallbackContentEntry};
use daily_dispatch::{ContentSource, DeliveryStatus, FallbackReason, RiskLevel, Tier};
use pretty_assertions::assert_eq;

use crate::helpers::*;

fn entry(
    id: &str,
    tier: Tier,
    focus: &str,
    risk_level: RiskLevel,
    created_at: DateTime<Utc>,
) -> FallbackContentEntry {
    FallbackContentEntry {
        id: id.to_string(),
        category: "market_update".to_string(),
        market_focus: focus.to_string(),
        risk_level,
        tier,
        text: format!("pool text {id}"),
        language: "en".to_string(),
        usage_count: 0,
        last_used: None,
        archived: false,
        created_at,
    }
}

async fn active_entries(h: &Harness, tier: Tier) -> Vec<FallbackContentEntry> {
    h.store
        .fallback_candidates(&CandidateQuery {
            advisor_id: "nobody".to_string(),
            tier,
            exclude_used_since: date(2000, 1, 1),
            max_usage: u32::MAX,
            limit: usize::MAX,
        })
        .await
        .unwrap()
}

async fn usage_of(h: &Harness, tier: Tier, id: &str) -> Option<u32> {
    active_entries(h, tier)
        .await
        .into_iter()
        .find(|e| e.id == id)
        .map(|e| e.usage_count)
}

async fn total_usage(h: &Harness, tier: Tier) -> u32 {
    active_entries(h, tier).await.iter().map(|e| e.usage_count).sum()
}

#[tokio::test(start_paused = true)]
async fn test_uncovered_advisors_get_pool_content() {
    let h = Harness::start(utc(2025, 3, 10, 21, 30));
    let tomorrow = date(2025, 3, 11);

    h.directory.add_advisor(advisor("covered", Tier::Pro, "+14155550101"));
    h.directory.add_advisor(advisor("idle-1", Tier::Standard, "+14155550102"));
    h.directory.add_advisor(advisor("idle-2", Tier::Free, "+14155550103"));
    h.directory.submit_content("covered", tomorrow, english("my own update"));

    assert_eq!(h.fallback.initialize_fallback_pool().await.unwrap(), 9);
    // Seeding is a no-op once segments have entries
    assert_eq!(h.fallback.initialize_fallback_pool().await.unwrap(), 0);

    let report = h.fallback.run_fallback_assignment().await.unwrap();
    assert_eq!(report.delivery_date, Some(tomorrow));
    assert_eq!(report.assigned, 2);
    assert_eq!(report.emergency, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);

    for id in ["idle-1", "idle-2"] {
        let record = h.store.get_delivery(id, tomorrow).await.unwrap().unwrap();
        assert!(record.is_fallback);
        assert_eq!(record.fallback_reason, Some(FallbackReason::NoContentSubmitted));
        assert_eq!(record.status, DeliveryStatus::Pending);

        let content = h.directory.get_content(&record.content_id).await.unwrap().unwrap();
        assert_eq!(content.source, ContentSource::FallbackPool);
        assert!(h.directory.advisor_has_content_for_date(id, tomorrow).await.unwrap());
    }
    assert!(h.store.get_delivery("covered", tomorrow).await.unwrap().is_none());

    let fallback_queue = h.queues.metrics(QueueName::FallbackDelivery).await.unwrap();
    assert_eq!(fallback_queue.delayed, 2);

    // A second run finds everyone covered
    let again = h.fallback.run_fallback_assignment().await.unwrap();
    assert_eq!(again.assigned, 0);
    assert_eq!(again.skipped, 3);

    h.queues.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_empty_pool_falls_back_to_emergency_content() {
    let h = Harness::start(utc(2025, 3, 10, 21, 30));
    let tomorrow = date(2025, 3, 11);

    h.directory.add_advisor(advisor("lonely", Tier::Pro, "+14155550101"));

    let report = h.fallback.run_fallback_assignment().await.unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(report.emergency, 1);
    // The empty segments are refilled after assignment
    assert_eq!(report.refilled, 9);

    let record = h.store.get_delivery("lonely", tomorrow).await.unwrap().unwrap();
    assert_eq!(record.fallback_reason, Some(FallbackReason::EmergencyGenerated));
    let content = h.directory.get_content(&record.content_id).await.unwrap().unwrap();
    assert_eq!(content.source, ContentSource::EmergencyGenerated);
    assert!(!content.variants["en"].is_empty());

    h.queues.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_preferences_pick_the_matching_entry() {
    let h = Harness::start(utc(2025, 3, 10, 21, 30));
    let tomorrow = date(2025, 3, 11);
    let created = utc(2025, 3, 9, 12, 0);

    h.store
        .insert_fallback_entries(vec![
            entry("pro-bonds", Tier::Pro, "fixed_income", RiskLevel::Conservative, created),
            entry("pro-growth", Tier::Pro, "equity", RiskLevel::Aggressive, created),
            entry("pro-mixed", Tier::Pro, "hybrid", RiskLevel::Moderate, created),
        ])
        .await
        .unwrap();
    h.directory.add_advisor(advisor_with_preferences(
        "picky",
        Tier::Pro,
        "equity",
        RiskLevel::Aggressive,
    ));

    let report = h.fallback.run_fallback_assignment().await.unwrap();
    assert_eq!(report.assigned, 1);

    let record = h.store.get_delivery("picky", tomorrow).await.unwrap().unwrap();
    let content = h.directory.get_content(&record.content_id).await.unwrap().unwrap();
    assert_eq!(content.variants["en"], "pool text pro-growth");
    assert_eq!(usage_of(&h, Tier::Pro, "pro-growth").await, Some(1));
    assert_eq!(usage_of(&h, Tier::Pro, "pro-bonds").await, Some(0));

    h.queues.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_entry_is_not_repeated_within_exclusion_window() {
    let h = Harness::start(utc(2025, 3, 10, 21, 30));
    let created = utc(2025, 3, 9, 12, 0);

    h.store
        .insert_fallback_entries(vec![
            entry("best", Tier::Standard, "equity", RiskLevel::Moderate, created),
            entry("other", Tier::Standard, "general", RiskLevel::Conservative, created),
        ])
        .await
        .unwrap();
    h.directory.add_advisor(advisor_with_preferences(
        "regular",
        Tier::Standard,
        "equity",
        RiskLevel::Moderate,
    ));

    h.fallback.run_fallback_assignment().await.unwrap();
    let first = h
        .store
        .get_delivery("regular", date(2025, 3, 11))
        .await
        .unwrap()
        .unwrap();

    // Next evening, after the morning delivery went out
    h.run_for(Duration::from_secs(24 * 60 * 60)).await;
    h.fallback.run_fallback_assignment().await.unwrap();
    let second = h
        .store
        .get_delivery("regular", date(2025, 3, 12))
        .await
        .unwrap()
        .unwrap();

    let first_text = h.directory.get_content(&first.content_id).await.unwrap().unwrap();
    let second_text = h.directory.get_content(&second.content_id).await.unwrap().unwrap();
    assert_eq!(first_text.variants["en"], "pool text best");
    assert_eq!(second_text.variants["en"], "pool text other");

    h.queues.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rotation_archives_worn_and_stale_entries() {
    let mut config = test_config();
    config.fallback.max_usage = 2;
    let h = Harness::build(utc(2025, 3, 10, 21, 30), config, RecordingChannel::default());

    let fresh = utc(2025, 3, 9, 12, 0);
    let stale = utc(2025, 1, 1, 12, 0);
    let mut worn = entry("worn", Tier::Free, "general", RiskLevel::Moderate, fresh);
    worn.usage_count = 2;
    h.store
        .insert_fallback_entries(vec![
            worn,
            entry("stale", Tier::Free, "general", RiskLevel::Moderate, stale),
            entry("fresh", Tier::Free, "general", RiskLevel::Moderate, fresh),
        ])
        .await
        .unwrap();

    assert_eq!(h.fallback.rotate_old_content().await.unwrap(), 2);
    assert_eq!(usage_of(&h, Tier::Free, "fresh").await, Some(0));
    assert_eq!(usage_of(&h, Tier::Free, "worn").await, None);
    assert_eq!(usage_of(&h, Tier::Free, "stale").await, None);

    // 1 of 3 left for free/market_update, plus two empty tiers
    assert_eq!(h.fallback.refill_pool_if_needed().await.unwrap(), 2 + 3 + 3);
    assert_eq!(h.fallback.refill_pool_if_needed().await.unwrap(), 0);

    h.queues.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_entry_one_use_short_of_the_cap_is_still_picked_once() {
    let mut config = test_config();
    config.fallback.max_usage = 3;
    let h = Harness::build(utc(2025, 3, 10, 21, 30), config, RecordingChannel::default());

    let mut nearly = entry("nearly", Tier::Pro, "equity", RiskLevel::Moderate, utc(2025, 3, 9, 0, 0));
    nearly.usage_count = 2;
    let mut capped = entry("capped", Tier::Pro, "equity", RiskLevel::Moderate, utc(2025, 3, 9, 0, 0));
    capped.usage_count = 3;
    h.store
        .insert_fallback_entries(vec![nearly, capped])
        .await
        .unwrap();
    h.directory.add_advisor(advisor("x", Tier::Pro, "+14155550101"));

    let report = h.fallback.run_fallback_assignment().await.unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(report.emergency, 0);

    // rotation ran first and archived the capped entry; the pick brought
    // the other one to the cap, which the next rotation archives
    assert_eq!(report.rotated, 1);
    assert_eq!(usage_of(&h, Tier::Pro, "nearly").await, Some(3));
    assert_eq!(h.fallback.rotate_old_content().await.unwrap(), 1);

    h.queues.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pool_initialization_tops_up_partial_segments() {
    let h = Harness::start(utc(2025, 3, 10, 12, 0));
    let created = utc(2025, 3, 9, 12, 0);

    h.store
        .insert_fallback_entries(vec![entry(
            "kept",
            Tier::Standard,
            "general",
            RiskLevel::Moderate,
            created,
        )])
        .await
        .unwrap();

    // 2 to top up the standard segment, 3 each for pro and free
    assert_eq!(h.fallback.initialize_fallback_pool().await.unwrap(), 2 + 3 + 3);
    for tier in Tier::ALL {
        let active = h
            .store
            .count_active_fallback(tier, "market_update")
            .await
            .unwrap();
        assert_eq!(active, 3, "{tier}");
    }
    assert_eq!(usage_of(&h, Tier::Standard, "kept").await, Some(0));
    assert_eq!(h.fallback.initialize_fallback_pool().await.unwrap(), 0);

    h.queues.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rerun_admits_advisor_refused_by_open_circuit() {
    let mut config = test_config();
    config.queue.fallback.retry = RetryPolicy {
        attempts: 1,
        backoff: Backoff::Fixed {
            delay: Duration::from_millis(100),
        },
    };
    config.queue.fallback.circuit.min_samples = 2;
    // Inside the catch-up window, so fallback jobs are due right away
    let h = Harness::build(utc(2025, 3, 10, 6, 5), config, RecordingChannel::default());
    let day = date(2025, 3, 10);

    h.store
        .insert_fallback_entries(vec![entry(
            "shared",
            Tier::Pro,
            "general",
            RiskLevel::Moderate,
            utc(2025, 3, 9, 12, 0),
        )])
        .await
        .unwrap();
    h.directory.add_advisor(advisor("a", Tier::Pro, "+14155550101"));
    h.directory.add_advisor(advisor("b", Tier::Pro, "+14155550102"));
    h.channel.fail_with(SendError::Unavailable("relay down".into()));

    let first = h.fallback.run_fallback_assignment().await.unwrap();
    assert_eq!(first.assigned, 2);
    h.run_for(Duration::from_secs(1)).await;
    assert!(h.queues.is_circuit_open(QueueName::FallbackDelivery).unwrap());
    let charged = total_usage(&h, Tier::Pro).await;

    h.directory.add_advisor(advisor("c", Tier::Pro, "+14155550103"));
    let refused = h.fallback.run_fallback_assignment().await.unwrap();
    assert_eq!(refused.assigned, 0);
    assert_eq!(refused.failed, 1);
    assert_eq!(refused.skipped, 2);
    assert_eq!(refused.errors[0].advisor_id, "c");
    assert_eq!(refused.errors[0].kind, "circuit_open");

    // Nothing of the refused attempt is left behind
    assert!(h.store.get_delivery("c", day).await.unwrap().is_none());
    assert!(!h.directory.advisor_has_content_for_date("c", day).await.unwrap());
    assert_eq!(total_usage(&h, Tier::Pro).await, charged);

    h.channel.recover();
    h.run_for(Duration::from_secs(31)).await;
    let rerun = h.fallback.run_fallback_assignment().await.unwrap();
    assert_eq!(rerun.assigned, 1);
    assert_eq!(rerun.skipped, 2);
    assert_eq!(rerun.failed, 0);

    let record = h.store.get_delivery("c", day).await.unwrap().unwrap();
    assert!(record.is_fallback);
    assert_eq!(record.fallback_reason, Some(FallbackReason::NoContentSubmitted));
    assert_eq!(total_usage(&h, Tier::Pro).await, charged + 1);

    h.run_for(Duration::from_secs(1)).await;
    assert_eq!(h.channel.sent_to("+14155550103").len(), 1);

    h.queues.shutdown().await;
}
