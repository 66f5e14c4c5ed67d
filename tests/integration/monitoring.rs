//! Integration tests for delivery monitoring and alerting
//!
//! These tests verify that:
//! - Dashboards reflect the day's deliveries and queue counters
//! - Failure bursts raise error-rate and system-failure alerts once
//! - The system-failure rule only looks at recent job outcomes
//! - SLA violations are raised from the delivery path
//! - Raised alerts reach webhook sinks

use std::time::Duration;

use daily_dispatch::actors::alert::AlertHandle;
use daily_dispatch::actors::monitor::{DeliveryMonitor, MonitorHandle};
use daily_dispatch::alerts::AlertManager;
use daily_dispatch::config::{Alert as AlertSink, Webhook};
use daily_dispatch::monitors::health::HealthState;
use daily_dispatch::storage::{AlertKind, Severity};
use daily_dispatch::Tier;
use tokio::sync::broadcast;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn spawn_monitor(h: &Harness) -> MonitorHandle {
    MonitorHandle::spawn(
        DeliveryMonitor::new(
            h.config.monitor.clone(),
            h.config.timezone,
            h.store.clone(),
            h.queues.clone(),
            h.clock.clone(),
        ),
        h.publisher.clone(),
    )
}

/// Pro advisors due right away; every `bad_every`-th one has an unusable number.
async fn schedule_pro_batch(h: &Harness, count: usize, bad_every: usize) {
    let day = date(2025, 3, 10);
    for i in 0..count {
        let id = format!("adv-{i:03}");
        let phone = if bad_every > 0 && i % bad_every == 0 {
            "not-a-number".to_string()
        } else {
            format!("+1415555{i:04}")
        };
        h.directory.add_advisor(advisor(&id, Tier::Pro, &phone));
        h.directory.submit_content(&id, day, english("today's note"));
    }
    h.scheduler.schedule_daily_delivery().await.unwrap();
}

fn drain(rx: &mut broadcast::Receiver<daily_dispatch::storage::Alert>) -> Vec<AlertKind> {
    let mut kinds = Vec::new();
    while let Ok(alert) = rx.try_recv() {
        kinds.push(alert.kind);
    }
    kinds
}

#[tokio::test(start_paused = true)]
async fn test_dashboard_for_a_clean_morning() {
    let h = Harness::start(utc(2025, 3, 10, 6, 1));
    schedule_pro_batch(&h, 5, 0).await;
    h.run_for(Duration::from_secs(2)).await;

    let monitor = spawn_monitor(&h);
    let dashboard = monitor.poll_now().await.unwrap();

    assert_eq!(dashboard.delivery.total, 5);
    assert_eq!(dashboard.delivery.delivered, 5);
    assert_eq!(dashboard.delivery.error_rate, 0.0);
    assert_eq!(dashboard.sla.samples, 5);
    assert_eq!(dashboard.sla.current, 100.0);
    assert_eq!(dashboard.queues.len(), 2);
    assert_eq!(dashboard.health.state, HealthState::Healthy);
    assert!(dashboard.recent_alerts.is_empty());

    let cached = monitor.dashboard().await.unwrap();
    assert_eq!(cached.delivery.delivered, 5);

    monitor.shutdown().await.unwrap();
    h.queues.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failure_burst_raises_alerts_once() {
    let h = Harness::start(utc(2025, 3, 10, 6, 1));
    let mut alerts = h.publisher.subscribe();

    schedule_pro_batch(&h, 4, 2).await;
    h.run_for(Duration::from_secs(2)).await;

    let monitor = spawn_monitor(&h);
    let dashboard = monitor.poll_now().await.unwrap();
    assert_eq!(dashboard.delivery.failed, 2);
    assert_eq!(dashboard.delivery.error_rate, 0.5);

    let mut raised = drain(&mut alerts);
    raised.sort();
    assert_eq!(raised, vec![AlertKind::HighErrorRate, AlertKind::SystemFailure]);

    let system = dashboard
        .recent_alerts
        .iter()
        .find(|a| a.kind == AlertKind::SystemFailure)
        .unwrap();
    assert_eq!(system.severity, Severity::Critical);
    assert_eq!(dashboard.health.state, HealthState::Critical);

    // Still inside both cooldowns
    monitor.poll_now().await.unwrap();
    assert!(drain(&mut alerts).is_empty());

    monitor.shutdown().await.unwrap();
    h.queues.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_system_failure_only_counts_recent_jobs() {
    let h = Harness::start(utc(2025, 3, 10, 6, 1));
    let mut alerts = h.publisher.subscribe();

    schedule_pro_batch(&h, 4, 2).await;
    h.run_for(Duration::from_secs(20 * 60)).await;

    let monitor = spawn_monitor(&h);
    let dashboard = monitor.poll_now().await.unwrap();
    // The day's error rate still counts the burst, the queue window no longer does
    assert_eq!(dashboard.delivery.error_rate, 0.5);
    assert_eq!(drain(&mut alerts), vec![AlertKind::HighErrorRate]);

    monitor.shutdown().await.unwrap();
    h.queues.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sla_violation_raised_from_delivery_path() {
    let h = Harness::start(utc(2025, 3, 10, 6, 1));
    let mut alerts = h.publisher.subscribe();

    // 60 deliveries, 4 of them fail: 93.3% once all samples are in
    schedule_pro_batch(&h, 60, 15).await;
    h.run_for(Duration::from_secs(5)).await;

    let sla: Vec<AlertKind> = drain(&mut alerts)
        .into_iter()
        .filter(|k| *k == AlertKind::SlaViolation)
        .collect();
    assert_eq!(sla.len(), 1);

    let monitor = spawn_monitor(&h);
    let metrics = monitor.sla_metrics().await.unwrap();
    assert_eq!(metrics.samples, 60);
    assert_eq!(metrics.failures, 4);
    assert!(metrics.current < 95.0);

    monitor.shutdown().await.unwrap();
    h.queues.shutdown().await;
}

#[tokio::test]
async fn test_alerts_reach_webhook_sink() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({ "type": "system_failure" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({ "type": "high_error_rate" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::start(utc(2025, 3, 10, 6, 1));
    let notifier = AlertHandle::spawn(
        AlertManager::new(vec![AlertSink::Webhook(Webhook { url: server.uri() })]),
        h.publisher.subscribe(),
    );

    schedule_pro_batch(&h, 2, 2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let monitor = spawn_monitor(&h);
    monitor.poll_now().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    monitor.shutdown().await.unwrap();
    notifier.shutdown().await;
    h.queues.shutdown().await;
    server.verify().await;
}
