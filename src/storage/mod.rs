pub mod clickhouse;
pub mod sqlite;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::config::{AppConfig, StorageBackend};
use crate::error::StoreError;
use crate::model::{Alert, MetricRow, MetricType, MINUTE_MS};

/// Columns a caller-supplied predicate may reference. Rendered from these
/// static names only; user text never reaches a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterColumn {
    Timestamp,
    ServiceName,
    MetricName,
    MetricType,
    Value,
    Endpoint,
    Method,
    StatusCode,
    DurationMs,
    Environment,
    Aggregated,
    ResolutionMinutes,
}

impl FilterColumn {
    pub fn as_sql(self) -> &'static str {
        match self {
            FilterColumn::Timestamp => "timestamp",
            FilterColumn::ServiceName => "service_name",
            FilterColumn::MetricName => "metric_name",
            FilterColumn::MetricType => "metric_type",
            FilterColumn::Value => "value",
            FilterColumn::Endpoint => "endpoint",
            FilterColumn::Method => "method",
            FilterColumn::StatusCode => "status_code",
            FilterColumn::DurationMs => "duration_ms",
            FilterColumn::Environment => "environment",
            FilterColumn::Aggregated => "aggregated",
            FilterColumn::ResolutionMinutes => "resolution_minutes",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    pub fn matches(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => ordering == Equal,
            CompareOp::Ne => ordering != Equal,
            CompareOp::Lt => ordering == Less,
            CompareOp::Le => ordering != Greater,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Ge => ordering != Less,
        }
    }
}

/// Literal bound as a parameter, never interpolated.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: FilterColumn,
    pub op: CompareOp,
    pub value: Literal,
}

/// Time/series selector for range queries.
#[derive(Debug, Clone, Default)]
pub struct SeriesFilter {
    pub service: Option<String>,
    pub metric: Option<String>,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// One bucket of a time-range aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BucketStats {
    pub bucket_start: i64,
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub error_count: u64,
}

/// Inputs for a health-score computation over one service window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceWindowStats {
    pub request_count: u64,
    pub error_count: u64,
    pub p95_latency_ms: Option<f64>,
}

/// One rollup group: the aggregation key at a coarser bucket.
#[derive(Debug, Clone)]
pub struct RollupGroup {
    pub service_name: String,
    pub metric_name: String,
    pub metric_type: MetricType,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub status_code: Option<u16>,
    pub environment: Option<String>,
    pub bucket_start: i64,
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub error_count: u64,
}

/// Adapter over the columnar time-series store.
///
/// Implementations must be idempotent under re-insertion of the same row
/// id (upsert semantics or dedupe-on-read) and must classify failures as
/// retryable or fatal via [`StoreError`].
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn init_schema(&self) -> Result<(), StoreError>;

    /// Insert a batch; returns the number of rows written.
    async fn insert_rows(&self, rows: &[MetricRow]) -> Result<u64, StoreError>;

    /// Bucketed aggregation over raw and minute-resolution rows.
    async fn timeseries(
        &self,
        filter: &SeriesFilter,
        bucket_ms: i64,
    ) -> Result<Vec<BucketStats>, StoreError>;

    /// Whole-window aggregation over raw and minute-resolution rows.
    async fn aggregate(&self, filter: &SeriesFilter) -> Result<BucketStats, StoreError>;

    /// Service names observed since `since_ms`.
    async fn service_names(&self, since_ms: i64) -> Result<Vec<String>, StoreError>;

    /// `(service, metric)` pairs observed since `since_ms`.
    async fn metric_pairs(&self, since_ms: i64) -> Result<Vec<(String, String)>, StoreError>;

    /// Rows at or after `since_ms`, ascending by timestamp. Live-tail cursor.
    async fn rows_since(
        &self,
        service: Option<&str>,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<MetricRow>, StoreError>;

    /// Per-minute mean of `value` for one series, ascending.
    async fn minute_series(
        &self,
        service: &str,
        metric: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<(i64, f64)>, StoreError>;

    /// Request/error counts and p95 latency for one service window.
    async fn service_health_stats(
        &self,
        service: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<ServiceWindowStats, StoreError>;

    /// Rows matching typed predicates, capped at `limit`. DSL pushdown.
    async fn fetch_rows(
        &self,
        predicates: &[Predicate],
        limit: u32,
    ) -> Result<Vec<MetricRow>, StoreError>;

    /// Re-aggregate rows whose resolution lies in
    /// `min_resolution..=max_resolution` minutes into `bucket_ms` groups
    /// keyed by the aggregation key.
    async fn rollup_source(
        &self,
        min_resolution: u32,
        max_resolution: u32,
        start_ms: i64,
        end_ms: i64,
        bucket_ms: i64,
    ) -> Result<Vec<RollupGroup>, StoreError>;

    async fn upsert_alert(&self, alert: &Alert) -> Result<(), StoreError>;

    /// Alerts, newest first.
    async fn list_alerts(&self, limit: u32) -> Result<Vec<Alert>, StoreError>;

    async fn active_alerts(&self) -> Result<Vec<Alert>, StoreError>;
}

/// Build the configured backend and initialize its schema.
pub async fn connect(config: &AppConfig) -> Result<Arc<dyn MetricStore>> {
    let store: Arc<dyn MetricStore> = match config.storage.backend {
        StorageBackend::Clickhouse => Arc::new(
            clickhouse::ClickHouseStore::connect(&config.storage.clickhouse, &config.retention),
        ),
        StorageBackend::Sqlite => {
            Arc::new(sqlite::SqliteStore::connect(&config.storage.sqlite).await?)
        }
    };
    store
        .init_schema()
        .await
        .context("failed to initialize storage schema")?;
    Ok(store)
}

// Shared aggregation folds. The SQLite backend pushes selection down and
// folds here; the ClickHouse backend aggregates server-side with the same
// weighting rules.

/// Weight a row contributes to counts: pre-aggregated rows stand for
/// `sample_count` original samples.
pub(crate) fn row_weight(row: &MetricRow) -> u64 {
    row.summary.map_or(1, |s| s.sample_count.max(1))
}

pub(crate) fn row_errors(row: &MetricRow) -> u64 {
    match row.summary {
        Some(summary) => summary.error_count,
        None => u64::from(row.is_error()),
    }
}

/// Representative value for percentile estimation: raw rows contribute
/// their value, aggregated rows their recorded p95.
fn p95_witness(row: &MetricRow) -> f64 {
    row.summary.map_or(row.value, |s| s.p95)
}

pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64) * q) as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Fold rows into fixed-width buckets, ascending by bucket start.
pub(crate) fn fold_buckets(rows: &[MetricRow], bucket_ms: i64) -> Vec<BucketStats> {
    use std::collections::BTreeMap;

    struct Acc {
        count: u64,
        weighted_sum: f64,
        min: f64,
        max: f64,
        errors: u64,
        witnesses: Vec<f64>,
    }

    let bucket_ms = bucket_ms.max(1);
    let mut buckets: BTreeMap<i64, Acc> = BTreeMap::new();
    for row in rows {
        let start = row.timestamp - row.timestamp.rem_euclid(bucket_ms);
        let weight = row_weight(row);
        let (low, high) = match row.summary {
            Some(summary) => (summary.min_value, summary.max_value),
            None => (row.value, row.value),
        };
        let acc = buckets.entry(start).or_insert_with(|| Acc {
            count: 0,
            weighted_sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            errors: 0,
            witnesses: Vec::new(),
        });
        acc.count += weight;
        acc.weighted_sum += row.value * weight as f64;
        acc.min = acc.min.min(low);
        acc.max = acc.max.max(high);
        acc.errors += row_errors(row);
        acc.witnesses.push(p95_witness(row));
    }

    buckets
        .into_iter()
        .map(|(bucket_start, mut acc)| {
            acc.witnesses.sort_by(|a, b| a.total_cmp(b));
            BucketStats {
                bucket_start,
                count: acc.count,
                avg: if acc.count > 0 {
                    acc.weighted_sum / acc.count as f64
                } else {
                    0.0
                },
                min: if acc.min.is_finite() { acc.min } else { 0.0 },
                max: if acc.max.is_finite() { acc.max } else { 0.0 },
                p95: percentile(&acc.witnesses, 0.95),
                error_count: acc.errors,
            }
        })
        .collect()
}

/// Fold rows into a single window-wide bucket.
pub(crate) fn fold_window(rows: &[MetricRow], window_start: i64) -> BucketStats {
    // One bucket wide enough to swallow every timestamp.
    let mut stats = fold_buckets(rows, i64::MAX)
        .into_iter()
        .next()
        .unwrap_or_default();
    stats.bucket_start = window_start;
    stats
}

/// Fold rows into rollup groups keyed by the aggregation key at `bucket_ms`.
pub(crate) fn fold_rollup_groups(rows: &[MetricRow], bucket_ms: i64) -> Vec<RollupGroup> {
    use std::collections::BTreeMap;

    type Key = (String, String, String, String, u16, i64);

    struct Acc {
        metric_type: crate::model::MetricType,
        endpoint: Option<String>,
        method: Option<String>,
        status_code: Option<u16>,
        environment: Option<String>,
        count: u64,
        weighted_sum: f64,
        min: f64,
        max: f64,
        errors: u64,
        values: Vec<f64>,
    }

    let bucket_ms = bucket_ms.max(MINUTE_MS);
    let mut groups: BTreeMap<Key, Acc> = BTreeMap::new();
    for row in rows {
        let bucket = row.timestamp - row.timestamp.rem_euclid(bucket_ms);
        let key = (
            row.service_name.clone(),
            row.metric_name.clone(),
            row.endpoint.clone().unwrap_or_default(),
            row.method.clone().unwrap_or_default(),
            row.status_code.unwrap_or(0),
            bucket,
        );
        let weight = row_weight(row);
        let (low, high) = match row.summary {
            Some(summary) => (summary.min_value, summary.max_value),
            None => (row.value, row.value),
        };
        let acc = groups.entry(key).or_insert_with(|| Acc {
            metric_type: row.metric_type,
            endpoint: row.endpoint.clone(),
            method: row.method.clone(),
            status_code: row.status_code,
            environment: row.environment.clone(),
            count: 0,
            weighted_sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            errors: 0,
            values: Vec::new(),
        });
        acc.count += weight;
        acc.weighted_sum += row.value * weight as f64;
        acc.min = acc.min.min(low);
        acc.max = acc.max.max(high);
        acc.errors += row_errors(row);
        acc.values.push(row.value);
    }

    groups
        .into_iter()
        .map(|((service_name, metric_name, _, _, _, bucket_start), mut acc)| {
            acc.values.sort_by(|a, b| a.total_cmp(b));
            RollupGroup {
                service_name,
                metric_name,
                metric_type: acc.metric_type,
                endpoint: acc.endpoint,
                method: acc.method,
                status_code: acc.status_code,
                environment: acc.environment,
                bucket_start,
                count: acc.count,
                avg: if acc.count > 0 {
                    acc.weighted_sum / acc.count as f64
                } else {
                    0.0
                },
                min: if acc.min.is_finite() { acc.min } else { 0.0 },
                max: if acc.max.is_finite() { acc.max } else { 0.0 },
                p50: percentile(&acc.values, 0.50),
                p95: percentile(&acc.values, 0.95),
                p99: percentile(&acc.values, 0.99),
                error_count: acc.errors,
            }
        })
        .collect()
}
