//! Periodic rollup materialization.
//!
//! Hourly rollups are re-aggregated from raw and minute-resolution rows,
//! daily rollups from hourly ones. Deterministic row ids make re-running a
//! window replace rather than duplicate; deletion is left to the store's
//! native TTL.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use crate::metrics::AppMetrics;
use crate::model::{AggregateSummary, MetricRow, rollup_id};
use crate::storage::{MetricStore, RollupGroup};

pub const HOUR_MS: i64 = 3_600_000;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// How many trailing source buckets each pass re-materializes. Two, so a
/// bucket that was still filling during the previous pass gets finalized.
const LOOKBACK_BUCKETS: i64 = 2;

pub fn spawn(
    interval: Duration,
    store: Arc<dyn MetricStore>,
    metrics: AppMetrics,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval = ?interval, "starting rollup loop");
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let now_ms = Utc::now().timestamp_millis();
            match materialize_all(store.as_ref(), &metrics, now_ms).await {
                Ok((hourly, daily)) => {
                    if hourly + daily > 0 {
                        info!(hourly, daily, "rollup pass complete");
                    }
                }
                Err(err) => error!(error = ?err, "rollup pass failed"),
            }
        }
    })
}

/// Materialize hourly rollups from raw/minute rows and daily rollups from
/// hourly ones. Returns the written row counts.
pub async fn materialize_all(
    store: &dyn MetricStore,
    metrics: &AppMetrics,
    now_ms: i64,
) -> Result<(u64, u64)> {
    let hourly = materialize(store, now_ms, 0, 1, HOUR_MS, 60).await?;
    metrics.add_rollup_rows(60, hourly);

    let daily = materialize(store, now_ms, 60, 60, DAY_MS, 1440).await?;
    metrics.add_rollup_rows(1440, daily);

    Ok((hourly, daily))
}

async fn materialize(
    store: &dyn MetricStore,
    now_ms: i64,
    min_resolution: u32,
    max_resolution: u32,
    bucket_ms: i64,
    target_minutes: u32,
) -> Result<u64> {
    // Completed buckets only; the bucket in progress is left for later.
    let window_end = now_ms - now_ms.rem_euclid(bucket_ms);
    let window_start = window_end - LOOKBACK_BUCKETS * bucket_ms;

    let groups = store
        .rollup_source(min_resolution, max_resolution, window_start, window_end, bucket_ms)
        .await?;
    if groups.is_empty() {
        return Ok(0);
    }

    let rows: Vec<MetricRow> = groups
        .into_iter()
        .map(|group| rollup_row(group, target_minutes))
        .collect();
    let written = store.insert_rows(&rows).await?;
    Ok(written)
}

fn rollup_row(group: RollupGroup, target_minutes: u32) -> MetricRow {
    let RollupGroup {
        service_name,
        metric_name,
        metric_type,
        endpoint,
        method,
        status_code,
        environment,
        bucket_start,
        count,
        avg,
        min,
        max,
        p50,
        p95,
        p99,
        error_count,
    } = group;

    let id = rollup_id(
        &service_name,
        &metric_name,
        endpoint.as_deref().unwrap_or(""),
        method.as_deref().unwrap_or(""),
        status_code.unwrap_or(0),
        bucket_start,
        target_minutes,
    );

    MetricRow {
        id,
        timestamp: bucket_start,
        service_name,
        metric_name,
        metric_type,
        value: avg,
        endpoint,
        method,
        status_code,
        duration_ms: None,
        tags: BTreeMap::new(),
        trace_id: None,
        span_id: None,
        environment,
        aggregated: true,
        resolution_minutes: target_minutes,
        summary: Some(AggregateSummary {
            min_value: min,
            max_value: max,
            p50,
            p95,
            p99,
            sample_count: count,
            error_count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricSample, MetricType, WireRecord, row_id};
    use crate::storage::sqlite::SqliteStore;

    fn raw_row(offset: u64, timestamp: i64, value: f64, status: u16) -> MetricRow {
        let sample = MetricSample {
            timestamp,
            service_name: "api".into(),
            metric_name: "http.duration".into(),
            metric_type: MetricType::Histogram,
            value,
            endpoint: Some("/users".into()),
            method: Some("GET".into()),
            status_code: Some(status),
            duration_ms: Some(value),
            tags: BTreeMap::new(),
            trace_id: None,
            span_id: None,
            environment: Some("prod".into()),
        };
        MetricRow::from_wire(0, offset, WireRecord::raw(sample, timestamp))
    }

    #[tokio::test]
    async fn hourly_rollups_summarize_raw_rows() {
        let store = SqliteStore::in_memory().await.expect("store");
        let metrics = AppMetrics::new().expect("metrics");
        let hour_start = 3 * HOUR_MS;
        let rows: Vec<MetricRow> = (0..10)
            .map(|i| {
                let status = if i == 0 { 503 } else { 200 };
                raw_row(i, hour_start + (i as i64) * MINUTE, 10.0 + i as f64, status)
            })
            .collect();
        store.insert_rows(&rows).await.expect("seed");

        let now = hour_start + HOUR_MS + 1;
        let (hourly, daily) = materialize_all(&store, &metrics, now).await.expect("rollup");
        assert_eq!(hourly, 2, "one group per status code expected");
        assert_eq!(daily, 0, "no hourly source rows for daily yet");

        let groups = store
            .rollup_source(60, 60, 0, now + DAY_MS, HOUR_MS)
            .await
            .expect("groups");
        let total: u64 = groups.iter().map(|g| g.count).sum();
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn rerunning_a_window_does_not_duplicate() {
        let store = SqliteStore::in_memory().await.expect("store");
        let metrics = AppMetrics::new().expect("metrics");
        let hour_start = 3 * HOUR_MS;
        store
            .insert_rows(&[raw_row(0, hour_start + MINUTE, 42.0, 200)])
            .await
            .expect("seed");

        let now = hour_start + HOUR_MS + 1;
        let (first, _) = materialize_all(&store, &metrics, now).await.expect("first");
        assert_eq!(first, 1);
        let (second, _) = materialize_all(&store, &metrics, now).await.expect("second");
        assert_eq!(second, 0, "deterministic ids must dedupe the rerun");
    }

    #[tokio::test]
    async fn rollup_ids_are_deterministic_and_distinct_from_bus_ids() {
        let group_id = rollup_id("api", "http.duration", "/users", "GET", 200, 0, 60);
        assert_eq!(
            group_id,
            rollup_id("api", "http.duration", "/users", "GET", 200, 0, 60)
        );
        assert_ne!(group_id, row_id(0, 0));
    }

    const MINUTE: i64 = 60_000;
}
