//! Derived signals over stored data: health scores and A/B comparison.

use std::collections::BTreeMap;

use vigil::config::SignalsConfig;
use vigil::model::{MetricRow, MetricSample, MetricType, WireRecord};
use vigil::query::compare::{self, CompareRequest, Recommendation};
use vigil::query::health;
use vigil::storage::MetricStore;
use vigil::storage::sqlite::SqliteStore;

const BASE_TS: i64 = 1_700_000_040_000; // minute aligned
const MINUTE: i64 = 60_000;

async fn seed(
    store: &SqliteStore,
    partition: u32,
    offset: u64,
    service: &str,
    timestamp: i64,
    value: f64,
    status: u16,
) {
    let sample = MetricSample {
        timestamp,
        service_name: service.into(),
        metric_name: "http.duration".into(),
        metric_type: MetricType::Histogram,
        value,
        endpoint: Some("/checkout".into()),
        method: Some("POST".into()),
        status_code: Some(status),
        duration_ms: Some(value),
        tags: BTreeMap::new(),
        trace_id: None,
        span_id: None,
        environment: Some("prod".into()),
    };
    let row = MetricRow::from_wire(partition, offset, WireRecord::raw(sample, timestamp));
    store.insert_rows(&[row]).await.expect("seed");
}

#[tokio::test]
async fn health_scores_follow_stored_traffic() {
    let store = SqliteStore::in_memory().await.expect("store");
    // A clean, fast service: 200 requests at 50ms, no errors.
    for i in 0..200u64 {
        seed(&store, 0, i, "api", BASE_TS + i as i64 * 100, 50.0, 200).await;
    }
    // A broken one: every second request is a 5xx at 800ms.
    for i in 0..100u64 {
        let status = if i % 2 == 0 { 503 } else { 200 };
        seed(&store, 1, i, "billing", BASE_TS + i as i64 * 100, 800.0, status).await;
    }

    let tuning = SignalsConfig::default();
    let window = (BASE_TS, BASE_TS + 10 * MINUTE);

    let api_stats = store
        .service_health_stats("api", window.0, window.1)
        .await
        .expect("stats");
    assert_eq!(api_stats.request_count, 200);
    assert_eq!(api_stats.error_count, 0);
    let api = health::compute("api", &api_stats, &tuning);
    assert_eq!(api.status, health::HealthStatus::Healthy);
    assert_eq!(api.error_rate_score, 100.0);
    assert_eq!(api.latency_score, 100.0);

    let billing_stats = store
        .service_health_stats("billing", window.0, window.1)
        .await
        .expect("stats");
    assert_eq!(billing_stats.error_count, 50);
    let billing = health::compute("billing", &billing_stats, &tuning);
    assert_eq!(billing.status, health::HealthStatus::Critical);
    assert!(billing.overall_score < api.overall_score);

    // Same window, same score: the computation is pure.
    assert_eq!(
        health::compute("billing", &billing_stats, &tuning),
        billing
    );
}

#[tokio::test]
async fn comparison_detects_a_significant_latency_win() {
    let store = SqliteStore::in_memory().await.expect("store");
    // 40 one-minute buckets per side; v1 around 200ms, v2 around 150ms.
    for minute in 0..40i64 {
        let jitter = (minute % 5) as f64 * 0.5;
        seed(
            &store,
            0,
            minute as u64,
            "v1",
            BASE_TS + minute * MINUTE,
            200.0 + jitter,
            200,
        )
        .await;
        seed(
            &store,
            1,
            minute as u64,
            "v2",
            BASE_TS + minute * MINUTE,
            150.0 + jitter,
            200,
        )
        .await;
    }

    let request = CompareRequest {
        baseline_service: "v1".into(),
        candidate_service: "v2".into(),
        metric_name: "http.duration".into(),
        time_start: BASE_TS,
        time_end: BASE_TS + 40 * MINUTE,
    };
    let result = compare::run(&store, &request).await.expect("compare");

    assert_eq!(result.baseline.count, 40);
    assert_eq!(result.candidate.count, 40);
    assert!((result.improvement_pct - 25.0).abs() < 1.0);
    assert!(result.significant);
    assert_eq!(result.recommendation, Recommendation::Deploy);
    assert!(result.baseline.mean > result.candidate.mean);
    assert!(result.baseline.p95 >= result.baseline.p50);
}

#[tokio::test]
async fn short_windows_hold_instead_of_deciding() {
    let store = SqliteStore::in_memory().await.expect("store");
    for minute in 0..10i64 {
        seed(&store, 0, minute as u64, "v1", BASE_TS + minute * MINUTE, 200.0, 200).await;
        seed(&store, 1, minute as u64, "v2", BASE_TS + minute * MINUTE, 150.0, 200).await;
    }
    let request = CompareRequest {
        baseline_service: "v1".into(),
        candidate_service: "v2".into(),
        metric_name: "http.duration".into(),
        time_start: BASE_TS,
        time_end: BASE_TS + 10 * MINUTE,
    };
    let result = compare::run(&store, &request).await.expect("compare");
    assert!(!result.significant, "under 30 buckets is never significant");
    assert_eq!(result.recommendation, Recommendation::Hold);
}

#[tokio::test]
async fn comparison_requires_data_on_both_sides() {
    let store = SqliteStore::in_memory().await.expect("store");
    for minute in 0..40i64 {
        seed(&store, 0, minute as u64, "v1", BASE_TS + minute * MINUTE, 200.0, 200).await;
    }
    let request = CompareRequest {
        baseline_service: "v1".into(),
        candidate_service: "ghost".into(),
        metric_name: "http.duration".into(),
        time_start: BASE_TS,
        time_end: BASE_TS + 40 * MINUTE,
    };
    assert!(compare::run(&store, &request).await.is_err());
}
