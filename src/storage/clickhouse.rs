//! ClickHouse backend: the authoritative columnar store.
//!
//! MergeTree partitioned by month, ordered by `(service_name, metric_name,
//! timestamp, id)`. The Replacing engine collapses redelivered row ids on
//! merge, which together with `ORDER BY ... id` gives the at-least-once
//! pipeline its at-most-one-row-per-id property. Retention is native TTL,
//! conditional on rollup resolution.

use async_trait::async_trait;
use clickhouse::{Client, Row as ChRow};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ClickHouseConfig, RetentionConfig};
use crate::error::StoreError;
use crate::model::{
    Alert, AlertSeverity, AlertStatus, AggregateSummary, MetricRow, MetricType, MINUTE_MS,
};

use super::{
    BucketStats, Literal, MetricStore, Predicate, RollupGroup, SeriesFilter, ServiceWindowStats,
};

/// SQL expression for a row's sample weight: pre-aggregated rows stand for
/// `sample_count` original samples.
const WEIGHT: &str = "coalesce(sample_count, toUInt64(1))";
/// SQL expression for a row's error contribution.
const ERRORS: &str =
    "if(aggregated = 1, coalesce(error_count, toUInt64(0)), if(status_code >= 500, toUInt64(1), toUInt64(0)))";

pub struct ClickHouseStore {
    client: Client,
    database: String,
    retention: RetentionConfig,
}

impl ClickHouseStore {
    pub fn connect(config: &ClickHouseConfig, retention: &RetentionConfig) -> Self {
        let client = Client::default()
            .with_url(&config.url)
            .with_user(&config.user)
            .with_password(&config.password)
            .with_database(&config.database);
        Self {
            client,
            database: config.database.clone(),
            retention: retention.clone(),
        }
    }
}

#[derive(Debug, ChRow, Serialize, Deserialize)]
struct StoredRow {
    id: u64,
    timestamp: i64,
    service_name: String,
    metric_name: String,
    metric_type: String,
    value: f64,
    endpoint: String,
    method: String,
    status_code: u16,
    duration_ms: Option<f64>,
    tags: String,
    trace_id: String,
    span_id: String,
    environment: String,
    aggregated: u8,
    resolution_minutes: u32,
    min_value: Option<f64>,
    max_value: Option<f64>,
    p50: Option<f64>,
    p95: Option<f64>,
    p99: Option<f64>,
    sample_count: Option<u64>,
    error_count: Option<u64>,
}

impl From<&MetricRow> for StoredRow {
    fn from(row: &MetricRow) -> Self {
        Self {
            id: row.id,
            timestamp: row.timestamp,
            service_name: row.service_name.clone(),
            metric_name: row.metric_name.clone(),
            metric_type: row.metric_type.as_str().to_string(),
            value: row.value,
            endpoint: row.endpoint.clone().unwrap_or_default(),
            method: row.method.clone().unwrap_or_default(),
            status_code: row.status_code.unwrap_or(0),
            duration_ms: row.duration_ms,
            tags: serde_json::to_string(&row.tags).unwrap_or_else(|_| "{}".into()),
            trace_id: row.trace_id.clone().unwrap_or_default(),
            span_id: row.span_id.clone().unwrap_or_default(),
            environment: row.environment.clone().unwrap_or_default(),
            aggregated: row.aggregated as u8,
            resolution_minutes: row.resolution_minutes,
            min_value: row.summary.map(|s| s.min_value),
            max_value: row.summary.map(|s| s.max_value),
            p50: row.summary.map(|s| s.p50),
            p95: row.summary.map(|s| s.p95),
            p99: row.summary.map(|s| s.p99),
            sample_count: row.summary.map(|s| s.sample_count),
            error_count: row.summary.map(|s| s.error_count),
        }
    }
}

impl TryFrom<StoredRow> for MetricRow {
    type Error = StoreError;

    fn try_from(row: StoredRow) -> Result<Self, StoreError> {
        let metric_type = row
            .metric_type
            .parse::<MetricType>()
            .map_err(StoreError::Fatal)?;
        let summary = row.sample_count.map(|sample_count| AggregateSummary {
            min_value: row.min_value.unwrap_or(row.value),
            max_value: row.max_value.unwrap_or(row.value),
            p50: row.p50.unwrap_or(row.value),
            p95: row.p95.unwrap_or(row.value),
            p99: row.p99.unwrap_or(row.value),
            sample_count,
            error_count: row.error_count.unwrap_or(0),
        });
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        Ok(MetricRow {
            id: row.id,
            timestamp: row.timestamp,
            service_name: row.service_name,
            metric_name: row.metric_name,
            metric_type,
            value: row.value,
            endpoint: non_empty(row.endpoint),
            method: non_empty(row.method),
            status_code: if row.status_code == 0 {
                None
            } else {
                Some(row.status_code)
            },
            duration_ms: row.duration_ms,
            tags: serde_json::from_str(&row.tags).unwrap_or_default(),
            trace_id: non_empty(row.trace_id),
            span_id: non_empty(row.span_id),
            environment: non_empty(row.environment),
            aggregated: row.aggregated != 0,
            resolution_minutes: row.resolution_minutes,
            summary,
        })
    }
}

#[derive(Debug, ChRow, Serialize, Deserialize)]
struct BucketRow {
    bucket_start: i64,
    count: u64,
    avg: f64,
    min: f64,
    max: f64,
    p95: f64,
    error_count: u64,
}

impl From<BucketRow> for BucketStats {
    fn from(row: BucketRow) -> Self {
        BucketStats {
            bucket_start: row.bucket_start,
            count: row.count,
            avg: if row.avg.is_finite() { row.avg } else { 0.0 },
            min: if row.min.is_finite() { row.min } else { 0.0 },
            max: if row.max.is_finite() { row.max } else { 0.0 },
            p95: if row.p95.is_finite() { row.p95 } else { 0.0 },
            error_count: row.error_count,
        }
    }
}

#[derive(Debug, ChRow, Serialize, Deserialize)]
struct NameRow {
    service_name: String,
}

#[derive(Debug, ChRow, Serialize, Deserialize)]
struct PairRow {
    service_name: String,
    metric_name: String,
}

#[derive(Debug, ChRow, Serialize, Deserialize)]
struct MinutePoint {
    bucket_start: i64,
    avg: f64,
}

#[derive(Debug, ChRow, Serialize, Deserialize)]
struct HealthRow {
    request_count: u64,
    error_count: u64,
    p95_latency_ms: Option<f64>,
}

#[derive(Debug, ChRow, Serialize, Deserialize)]
struct RollupRow {
    service_name: String,
    metric_name: String,
    metric_type: String,
    endpoint: String,
    method: String,
    status_code: u16,
    environment: String,
    bucket_start: i64,
    count: u64,
    avg: f64,
    min: f64,
    max: f64,
    p50: f64,
    p95: f64,
    p99: f64,
    error_count: u64,
}

#[derive(Debug, ChRow, Serialize, Deserialize)]
struct AlertRow {
    alert_id: String,
    service_name: String,
    metric_name: String,
    severity: String,
    status: String,
    message: String,
    current_value: f64,
    expected_min: f64,
    expected_max: f64,
    threshold_breach_count: u32,
    first_triggered: i64,
    last_triggered: i64,
    resolved_at: Option<i64>,
}

impl From<&Alert> for AlertRow {
    fn from(alert: &Alert) -> Self {
        Self {
            alert_id: alert.alert_id.clone(),
            service_name: alert.service_name.clone(),
            metric_name: alert.metric_name.clone(),
            severity: alert.severity.as_str().to_string(),
            status: alert.status.as_str().to_string(),
            message: alert.message.clone(),
            current_value: alert.current_value,
            expected_min: alert.expected_min,
            expected_max: alert.expected_max,
            threshold_breach_count: alert.threshold_breach_count,
            first_triggered: alert.first_triggered,
            last_triggered: alert.last_triggered,
            resolved_at: alert.resolved_at,
        }
    }
}

impl TryFrom<AlertRow> for Alert {
    type Error = StoreError;

    fn try_from(row: AlertRow) -> Result<Self, StoreError> {
        Ok(Alert {
            severity: row.severity.parse::<AlertSeverity>().map_err(StoreError::Fatal)?,
            status: row.status.parse::<AlertStatus>().map_err(StoreError::Fatal)?,
            alert_id: row.alert_id,
            service_name: row.service_name,
            metric_name: row.metric_name,
            message: row.message,
            current_value: row.current_value,
            expected_min: row.expected_min,
            expected_max: row.expected_max,
            threshold_breach_count: row.threshold_breach_count,
            first_triggered: row.first_triggered,
            last_triggered: row.last_triggered,
            resolved_at: row.resolved_at,
        })
    }
}

#[async_trait]
impl MetricStore for ClickHouseStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        let db = &self.database;
        self.client
            .query(&format!("CREATE DATABASE IF NOT EXISTS {db}"))
            .execute()
            .await
            .map_err(classify)?;

        let raw = self.retention.raw_days;
        let hourly = self.retention.hourly_days;
        let daily = self.retention.daily_days;
        self.client
            .query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {db}.metrics (
                    id UInt64,
                    timestamp Int64,
                    service_name String,
                    metric_name String,
                    metric_type String,
                    value Float64,
                    endpoint String,
                    method String,
                    status_code UInt16,
                    duration_ms Nullable(Float64),
                    tags String,
                    trace_id String,
                    span_id String,
                    environment String,
                    aggregated UInt8 DEFAULT 0,
                    resolution_minutes UInt32 DEFAULT 0,
                    min_value Nullable(Float64),
                    max_value Nullable(Float64),
                    p50 Nullable(Float64),
                    p95 Nullable(Float64),
                    p99 Nullable(Float64),
                    sample_count Nullable(UInt64),
                    error_count Nullable(UInt64),
                    created_at DateTime DEFAULT now()
                )
                ENGINE = ReplacingMergeTree
                PARTITION BY toYYYYMM(toDateTime(intDiv(timestamp, 1000)))
                ORDER BY (service_name, metric_name, timestamp, id)
                TTL toDateTime(intDiv(timestamp, 1000)) + INTERVAL {raw} DAY DELETE WHERE resolution_minutes <= 1,
                    toDateTime(intDiv(timestamp, 1000)) + INTERVAL {hourly} DAY DELETE WHERE resolution_minutes = 60,
                    toDateTime(intDiv(timestamp, 1000)) + INTERVAL {daily} DAY DELETE WHERE resolution_minutes = 1440
                SETTINGS index_granularity = 8192
                "#
            ))
            .execute()
            .await
            .map_err(classify)?;

        self.client
            .query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {db}.alerts (
                    alert_id String,
                    service_name String,
                    metric_name String,
                    severity String,
                    status String,
                    message String,
                    current_value Float64,
                    expected_min Float64,
                    expected_max Float64,
                    threshold_breach_count UInt32,
                    first_triggered Int64,
                    last_triggered Int64,
                    resolved_at Nullable(Int64)
                )
                ENGINE = ReplacingMergeTree(last_triggered)
                ORDER BY alert_id
                TTL toDateTime(intDiv(first_triggered, 1000)) + INTERVAL {daily} DAY
                "#
            ))
            .execute()
            .await
            .map_err(classify)?;

        info!(database = %db, "clickhouse schema initialized");
        Ok(())
    }

    async fn insert_rows(&self, rows: &[MetricRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut insert = self.client.insert("metrics").map_err(classify)?;
        for row in rows {
            insert.write(&StoredRow::from(row)).await.map_err(classify)?;
        }
        insert.end().await.map_err(classify)?;
        Ok(rows.len() as u64)
    }

    async fn timeseries(
        &self,
        filter: &SeriesFilter,
        bucket_ms: i64,
    ) -> Result<Vec<BucketStats>, StoreError> {
        let (clause, binds) = series_clause(filter);
        let sql = format!(
            "SELECT intDiv(timestamp, ?) * ? AS bucket_start,
                    toUInt64(sum({WEIGHT})) AS count,
                    sum(value * {WEIGHT}) / sum({WEIGHT}) AS avg,
                    min(coalesce(min_value, value)) AS min,
                    max(coalesce(max_value, value)) AS max,
                    quantile(0.95)(coalesce(p95, value)) AS p95,
                    toUInt64(sum({ERRORS})) AS error_count
             FROM metrics
             WHERE {clause}
             GROUP BY bucket_start
             ORDER BY bucket_start"
        );
        let bucket_ms = bucket_ms.max(1);
        let mut query = self.client.query(&sql).bind(bucket_ms).bind(bucket_ms);
        for bind in binds {
            query = match bind {
                SeriesBind::Int(v) => query.bind(v),
                SeriesBind::Str(v) => query.bind(v),
            };
        }
        let rows = query.fetch_all::<BucketRow>().await.map_err(classify)?;
        Ok(rows.into_iter().map(BucketStats::from).collect())
    }

    async fn aggregate(&self, filter: &SeriesFilter) -> Result<BucketStats, StoreError> {
        let (clause, binds) = series_clause(filter);
        let sql = format!(
            "SELECT toInt64(?) AS bucket_start,
                    toUInt64(sum({WEIGHT})) AS count,
                    sum(value * {WEIGHT}) / sum({WEIGHT}) AS avg,
                    min(coalesce(min_value, value)) AS min,
                    max(coalesce(max_value, value)) AS max,
                    quantile(0.95)(coalesce(p95, value)) AS p95,
                    toUInt64(sum({ERRORS})) AS error_count
             FROM metrics
             WHERE {clause}"
        );
        let mut query = self.client.query(&sql).bind(filter.start_ms);
        for bind in binds {
            query = match bind {
                SeriesBind::Int(v) => query.bind(v),
                SeriesBind::Str(v) => query.bind(v),
            };
        }
        let row = query.fetch_one::<BucketRow>().await.map_err(classify)?;
        if row.count == 0 {
            return Ok(BucketStats {
                bucket_start: filter.start_ms,
                ..BucketStats::default()
            });
        }
        Ok(row.into())
    }

    async fn service_names(&self, since_ms: i64) -> Result<Vec<String>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT service_name FROM metrics
                 WHERE timestamp >= ? ORDER BY service_name",
            )
            .bind(since_ms)
            .fetch_all::<NameRow>()
            .await
            .map_err(classify)?;
        Ok(rows.into_iter().map(|row| row.service_name).collect())
    }

    async fn metric_pairs(&self, since_ms: i64) -> Result<Vec<(String, String)>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT service_name, metric_name FROM metrics
                 WHERE timestamp >= ? ORDER BY service_name, metric_name",
            )
            .bind(since_ms)
            .fetch_all::<PairRow>()
            .await
            .map_err(classify)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.service_name, row.metric_name))
            .collect())
    }

    async fn rows_since(
        &self,
        service: Option<&str>,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<MetricRow>, StoreError> {
        let sql = if service.is_some() {
            "SELECT ?fields FROM metrics
             WHERE timestamp >= ? AND resolution_minutes <= 1 AND service_name = ?
             ORDER BY timestamp ASC, id ASC LIMIT ?"
        } else {
            "SELECT ?fields FROM metrics
             WHERE timestamp >= ? AND resolution_minutes <= 1
             ORDER BY timestamp ASC, id ASC LIMIT ?"
        };
        let mut query = self.client.query(sql).bind(since_ms);
        if let Some(service) = service {
            query = query.bind(service);
        }
        let rows = query
            .bind(limit as u64)
            .fetch_all::<StoredRow>()
            .await
            .map_err(classify)?;
        rows.into_iter().map(MetricRow::try_from).collect()
    }

    async fn minute_series(
        &self,
        service: &str,
        metric: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<(i64, f64)>, StoreError> {
        let sql = format!(
            "SELECT intDiv(timestamp, ?) * ? AS bucket_start,
                    sum(value * {WEIGHT}) / sum({WEIGHT}) AS avg
             FROM metrics
             WHERE service_name = ? AND metric_name = ?
               AND timestamp >= ? AND timestamp <= ? AND resolution_minutes <= 1
             GROUP BY bucket_start
             ORDER BY bucket_start"
        );
        let rows = self
            .client
            .query(&sql)
            .bind(MINUTE_MS)
            .bind(MINUTE_MS)
            .bind(service)
            .bind(metric)
            .bind(start_ms)
            .bind(end_ms)
            .fetch_all::<MinutePoint>()
            .await
            .map_err(classify)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.bucket_start, row.avg))
            .collect())
    }

    async fn service_health_stats(
        &self,
        service: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<ServiceWindowStats, StoreError> {
        let sql = format!(
            "SELECT toUInt64(sum({WEIGHT})) AS request_count,
                    toUInt64(sum({ERRORS})) AS error_count,
                    quantile(0.95)(if(aggregated = 1, p95, duration_ms)) AS p95_latency_ms
             FROM metrics
             WHERE service_name = ? AND timestamp >= ? AND timestamp <= ?
               AND resolution_minutes <= 1"
        );
        let row = self
            .client
            .query(&sql)
            .bind(service)
            .bind(start_ms)
            .bind(end_ms)
            .fetch_one::<HealthRow>()
            .await
            .map_err(classify)?;
        Ok(ServiceWindowStats {
            request_count: row.request_count,
            error_count: row.error_count,
            p95_latency_ms: row.p95_latency_ms.filter(|p95| p95.is_finite()),
        })
    }

    async fn fetch_rows(
        &self,
        predicates: &[Predicate],
        limit: u32,
    ) -> Result<Vec<MetricRow>, StoreError> {
        let mut sql = String::from("SELECT ?fields FROM metrics");
        for (index, predicate) in predicates.iter().enumerate() {
            sql.push_str(if index == 0 { " WHERE " } else { " AND " });
            // Column and operator names come from closed enums.
            sql.push_str(predicate.column.as_sql());
            sql.push(' ');
            sql.push_str(predicate.op.as_sql());
            sql.push_str(" ?");
        }
        sql.push_str(" ORDER BY timestamp ASC LIMIT ?");

        let mut query = self.client.query(&sql);
        for predicate in predicates {
            query = match &predicate.value {
                Literal::Int(value) => query.bind(*value),
                Literal::Float(value) => query.bind(*value),
                Literal::Str(value) => query.bind(value.as_str()),
            };
        }
        let rows = query
            .bind(limit as u64)
            .fetch_all::<StoredRow>()
            .await
            .map_err(classify)?;
        rows.into_iter().map(MetricRow::try_from).collect()
    }

    async fn rollup_source(
        &self,
        min_resolution: u32,
        max_resolution: u32,
        start_ms: i64,
        end_ms: i64,
        bucket_ms: i64,
    ) -> Result<Vec<RollupGroup>, StoreError> {
        let sql = format!(
            "SELECT service_name, metric_name, any(metric_type) AS metric_type,
                    endpoint, method, status_code, environment,
                    intDiv(timestamp, ?) * ? AS bucket_start,
                    toUInt64(sum({WEIGHT})) AS count,
                    sum(value * {WEIGHT}) / sum({WEIGHT}) AS avg,
                    min(coalesce(min_value, value)) AS min,
                    max(coalesce(max_value, value)) AS max,
                    quantile(0.50)(coalesce(p50, value)) AS p50,
                    quantile(0.95)(coalesce(p95, value)) AS p95,
                    quantile(0.99)(coalesce(p99, value)) AS p99,
                    toUInt64(sum({ERRORS})) AS error_count
             FROM metrics
             WHERE resolution_minutes >= ? AND resolution_minutes <= ?
               AND timestamp >= ? AND timestamp < ?
             GROUP BY service_name, metric_name, endpoint, method, status_code,
                      environment, bucket_start
             ORDER BY bucket_start"
        );
        let bucket_ms = bucket_ms.max(MINUTE_MS);
        let rows = self
            .client
            .query(&sql)
            .bind(bucket_ms)
            .bind(bucket_ms)
            .bind(min_resolution)
            .bind(max_resolution)
            .bind(start_ms)
            .bind(end_ms)
            .fetch_all::<RollupRow>()
            .await
            .map_err(classify)?;

        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        Ok(rows
            .into_iter()
            .map(|row| RollupGroup {
                service_name: row.service_name,
                metric_name: row.metric_name,
                metric_type: row
                    .metric_type
                    .parse::<MetricType>()
                    .unwrap_or(MetricType::Gauge),
                endpoint: non_empty(row.endpoint),
                method: non_empty(row.method),
                status_code: if row.status_code == 0 {
                    None
                } else {
                    Some(row.status_code)
                },
                environment: non_empty(row.environment),
                bucket_start: row.bucket_start,
                count: row.count,
                avg: row.avg,
                min: row.min,
                max: row.max,
                p50: row.p50,
                p95: row.p95,
                p99: row.p99,
                error_count: row.error_count,
            })
            .collect())
    }

    async fn upsert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        // State transitions are append-only; the Replacing engine keeps the
        // newest version per alert_id and reads collapse with FINAL.
        let mut insert = self.client.insert("alerts").map_err(classify)?;
        insert.write(&AlertRow::from(alert)).await.map_err(classify)?;
        insert.end().await.map_err(classify)?;
        Ok(())
    }

    async fn list_alerts(&self, limit: u32) -> Result<Vec<Alert>, StoreError> {
        let rows = self
            .client
            .query("SELECT ?fields FROM alerts FINAL ORDER BY last_triggered DESC LIMIT ?")
            .bind(limit as u64)
            .fetch_all::<AlertRow>()
            .await
            .map_err(classify)?;
        rows.into_iter().map(Alert::try_from).collect()
    }

    async fn active_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT ?fields FROM alerts FINAL
                 WHERE status = 'firing' ORDER BY last_triggered DESC",
            )
            .fetch_all::<AlertRow>()
            .await
            .map_err(classify)?;
        rows.into_iter().map(Alert::try_from).collect()
    }
}

enum SeriesBind {
    Int(i64),
    Str(String),
}

/// WHERE clause for range-query semantics: raw and minute-resolution rows
/// only, so coarser rollups never double-count.
fn series_clause(filter: &SeriesFilter) -> (String, Vec<SeriesBind>) {
    let mut clause = String::from("timestamp >= ? AND timestamp <= ? AND resolution_minutes <= 1");
    let mut binds = vec![SeriesBind::Int(filter.start_ms), SeriesBind::Int(filter.end_ms)];
    if let Some(service) = &filter.service {
        clause.push_str(" AND service_name = ?");
        binds.push(SeriesBind::Str(service.clone()));
    }
    if let Some(metric) = &filter.metric {
        clause.push_str(" AND metric_name = ?");
        binds.push(SeriesBind::Str(metric.clone()));
    }
    (clause, binds)
}

fn classify(err: clickhouse::error::Error) -> StoreError {
    use clickhouse::error::Error;
    match &err {
        Error::Network(_) | Error::TimedOut => StoreError::Retryable(err.to_string()),
        _ => StoreError::Fatal(err.to_string()),
    }
}
