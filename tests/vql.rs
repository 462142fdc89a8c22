//! VQL execution against a seeded store, plus the safety-contract laws.

use std::collections::BTreeMap;

use vigil::model::{MetricRow, MetricSample, MetricType, WireRecord};
use vigil::query::vql;
use vigil::storage::MetricStore;
use vigil::storage::sqlite::SqliteStore;

const BASE_TS: i64 = 1_700_000_040_000;

async fn seeded_store() -> SqliteStore {
    let store = SqliteStore::in_memory().await.expect("store");
    let mut rows = Vec::new();
    for i in 0..30u64 {
        let service = if i % 3 == 0 { "checkout" } else { "api" };
        let endpoint = if i % 2 == 0 { "/users" } else { "/orders" };
        let status = if i % 10 == 0 { 500 } else { 200 };
        let sample = MetricSample {
            timestamp: BASE_TS + i as i64 * 1000,
            service_name: service.into(),
            metric_name: "http.duration".into(),
            metric_type: MetricType::Histogram,
            value: 10.0 + i as f64,
            endpoint: Some(endpoint.into()),
            method: Some("GET".into()),
            status_code: Some(status),
            duration_ms: Some(10.0 + i as f64),
            tags: BTreeMap::new(),
            trace_id: None,
            span_id: None,
            environment: Some("prod".into()),
        };
        rows.push(MetricRow::from_wire(0, i, WireRecord::raw(sample, BASE_TS)));
    }
    store.insert_rows(&rows).await.expect("seed");
    store
}

#[tokio::test]
async fn plain_selection_pushes_predicates_down() {
    let store = seeded_store().await;
    let rows = vql::execute(
        &store,
        "SELECT service_name, value FROM metrics WHERE service_name = 'checkout' LIMIT 100",
    )
    .await
    .expect("execute");
    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(|row| row["service_name"] == "checkout"));
    assert!(rows.iter().all(|row| row.contains_key("value")));
}

#[tokio::test]
async fn aggregation_with_grouping_and_ordering() {
    let store = seeded_store().await;
    let rows = vql::execute(
        &store,
        "SELECT service_name, COUNT(id), AVG(value) FROM metrics \
         GROUP BY service_name ORDER BY service_name ASC LIMIT 10",
    )
    .await
    .expect("execute");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["service_name"], "api");
    assert_eq!(rows[0]["COUNT(id)"], 20);
    assert_eq!(rows[1]["service_name"], "checkout");
    assert_eq!(rows[1]["COUNT(id)"], 10);

    let api_avg = rows[0]["AVG(value)"].as_f64().expect("avg");
    assert!(api_avg > 10.0 && api_avg < 40.0);
}

#[tokio::test]
async fn percentile_functions_operate_on_the_window() {
    let store = seeded_store().await;
    let rows = vql::execute(
        &store,
        "SELECT P95(value), MIN(value), MAX(value) FROM metrics LIMIT 1",
    )
    .await
    .expect("execute");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["MIN(value)"], 10.0);
    assert_eq!(rows[0]["MAX(value)"], 39.0);
    let p95 = rows[0]["P95(value)"].as_f64().expect("p95");
    assert!(p95 >= 37.0 && p95 <= 39.0);
}

#[tokio::test]
async fn status_code_filter_counts_errors() {
    let store = seeded_store().await;
    let rows = vql::execute(
        &store,
        "SELECT COUNT(id) FROM metrics WHERE status_code >= 500 LIMIT 10",
    )
    .await
    .expect("execute");
    assert_eq!(rows[0]["COUNT(id)"], 3);
}

#[tokio::test]
async fn limit_truncates_results() {
    let store = seeded_store().await;
    let rows = vql::execute(&store, "SELECT timestamp FROM metrics ORDER BY timestamp ASC LIMIT 5")
        .await
        .expect("execute");
    assert_eq!(rows.len(), 5);
    let first = rows[0]["timestamp"].as_i64().expect("ts");
    assert_eq!(first, BASE_TS);
}

#[tokio::test]
async fn rejects_every_write_keyword_outside_literals() {
    let store = seeded_store().await;
    for keyword in [
        "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "ATTACH", "DETACH", "TRUNCATE", "GRANT",
        "REVOKE",
    ] {
        let query = format!("SELECT * FROM metrics {keyword} x");
        let err = vql::execute(&store, &query).await.expect_err("must reject");
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "invalid_query");
    }

    let err = vql::execute(&store, "SELECT * FROM metrics; DROP TABLE metrics")
        .await
        .expect_err("must reject stacking");
    assert_eq!(
        err.details.as_ref().and_then(|d| d["token"].as_str()),
        Some(";")
    );
}

#[tokio::test]
async fn keywords_inside_literals_are_data_not_statements() {
    let store = seeded_store().await;
    let rows = vql::execute(
        &store,
        "SELECT id FROM metrics WHERE endpoint = 'DROP TABLE; --' LIMIT 5",
    )
    .await
    .expect("literals are inert");
    assert!(rows.is_empty());
}
