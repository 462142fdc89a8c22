//! Embedded SQLite backend.
//!
//! Single-node fallback behind the same adapter trait as the columnar
//! store, and the backend the integration tests run against. Idempotence
//! under redelivery comes from `INSERT OR IGNORE` keyed by row id.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::info;

use crate::config::SqliteConfig;
use crate::error::StoreError;
use crate::model::{
    Alert, AlertSeverity, AlertStatus, AggregateSummary, MetricRow, MetricType, MINUTE_MS,
};

use super::{
    BucketStats, Literal, MetricStore, Predicate, RollupGroup, SeriesFilter, ServiceWindowStats,
    fold_buckets, fold_rollup_groups, fold_window, percentile, row_errors, row_weight,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database file with a bounded pool.
    pub async fn connect(config: &SqliteConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(classify)?;

        info!(path = %config.path.display(), "opened embedded metric store");
        Ok(Self { pool })
    }

    /// Private in-memory database, used by the test suite.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(classify)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(classify)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Fetch rows for range-query semantics: raw and minute-resolution only,
    /// so coarser rollups never double-count.
    async fn series_rows(&self, filter: &SeriesFilter) -> Result<Vec<MetricRow>, StoreError> {
        let mut sql = String::from(
            "SELECT * FROM metrics WHERE timestamp >= ? AND timestamp <= ? AND resolution_minutes <= 1",
        );
        if filter.service.is_some() {
            sql.push_str(" AND service_name = ?");
        }
        if filter.metric.is_some() {
            sql.push_str(" AND metric_name = ?");
        }
        sql.push_str(" ORDER BY timestamp ASC");

        let mut query = sqlx::query(&sql).bind(filter.start_ms).bind(filter.end_ms);
        if let Some(service) = &filter.service {
            query = query.bind(service);
        }
        if let Some(metric) = &filter.metric {
            query = query.bind(metric);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(classify)?;
        rows.iter().map(row_from_sqlite).collect()
    }
}

#[async_trait]
impl MetricStore for SqliteStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                service_name TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                metric_type TEXT NOT NULL,
                value REAL NOT NULL,
                endpoint TEXT,
                method TEXT,
                status_code INTEGER,
                duration_ms REAL,
                tags TEXT NOT NULL DEFAULT '{}',
                trace_id TEXT,
                span_id TEXT,
                environment TEXT,
                aggregated INTEGER NOT NULL DEFAULT 0,
                resolution_minutes INTEGER NOT NULL DEFAULT 0,
                min_value REAL,
                max_value REAL,
                p50 REAL,
                p95 REAL,
                p99 REAL,
                sample_count INTEGER,
                error_count INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_metrics_series
             ON metrics(service_name, metric_name, timestamp)",
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metrics_time ON metrics(timestamp)")
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                alert_id TEXT PRIMARY KEY,
                service_name TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                severity TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL,
                current_value REAL NOT NULL,
                expected_min REAL NOT NULL,
                expected_max REAL NOT NULL,
                threshold_breach_count INTEGER NOT NULL,
                first_triggered INTEGER NOT NULL,
                last_triggered INTEGER NOT NULL,
                resolved_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_alerts_status
             ON alerts(status, last_triggered)",
        )
        .execute(&self.pool)
        .await
        .map_err(classify)?;

        Ok(())
    }

    async fn insert_rows(&self, rows: &[MetricRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx: Transaction<'_, Sqlite> = self.pool.begin().await.map_err(classify)?;
        let mut written = 0;
        for row in rows {
            let tags =
                serde_json::to_string(&row.tags).map_err(|e| StoreError::Fatal(e.to_string()))?;
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO metrics (
                    id, timestamp, service_name, metric_name, metric_type, value,
                    endpoint, method, status_code, duration_ms, tags, trace_id,
                    span_id, environment, aggregated, resolution_minutes,
                    min_value, max_value, p50, p95, p99, sample_count, error_count
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.id as i64)
            .bind(row.timestamp)
            .bind(&row.service_name)
            .bind(&row.metric_name)
            .bind(row.metric_type.as_str())
            .bind(row.value)
            .bind(&row.endpoint)
            .bind(&row.method)
            .bind(row.status_code.map(i64::from))
            .bind(row.duration_ms)
            .bind(tags)
            .bind(&row.trace_id)
            .bind(&row.span_id)
            .bind(&row.environment)
            .bind(row.aggregated as i64)
            .bind(row.resolution_minutes as i64)
            .bind(row.summary.map(|s| s.min_value))
            .bind(row.summary.map(|s| s.max_value))
            .bind(row.summary.map(|s| s.p50))
            .bind(row.summary.map(|s| s.p95))
            .bind(row.summary.map(|s| s.p99))
            .bind(row.summary.map(|s| s.sample_count as i64))
            .bind(row.summary.map(|s| s.error_count as i64))
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
            written += result.rows_affected();
        }
        tx.commit().await.map_err(classify)?;
        Ok(written)
    }

    async fn timeseries(
        &self,
        filter: &SeriesFilter,
        bucket_ms: i64,
    ) -> Result<Vec<BucketStats>, StoreError> {
        let rows = self.series_rows(filter).await?;
        Ok(fold_buckets(&rows, bucket_ms))
    }

    async fn aggregate(&self, filter: &SeriesFilter) -> Result<BucketStats, StoreError> {
        let rows = self.series_rows(filter).await?;
        Ok(fold_window(&rows, filter.start_ms))
    }

    async fn service_names(&self, since_ms: i64) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT service_name FROM metrics WHERE timestamp >= ? ORDER BY service_name",
        )
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter()
            .map(|row| row.try_get("service_name").map_err(classify))
            .collect()
    }

    async fn metric_pairs(&self, since_ms: i64) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT service_name, metric_name FROM metrics
             WHERE timestamp >= ? ORDER BY service_name, metric_name",
        )
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get("service_name").map_err(classify)?,
                    row.try_get("metric_name").map_err(classify)?,
                ))
            })
            .collect()
    }

    async fn rows_since(
        &self,
        service: Option<&str>,
        since_ms: i64,
        limit: u32,
    ) -> Result<Vec<MetricRow>, StoreError> {
        let mut sql = String::from(
            "SELECT * FROM metrics WHERE timestamp >= ? AND resolution_minutes <= 1",
        );
        if service.is_some() {
            sql.push_str(" AND service_name = ?");
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(since_ms);
        if let Some(service) = service {
            query = query.bind(service);
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        rows.iter().map(row_from_sqlite).collect()
    }

    async fn minute_series(
        &self,
        service: &str,
        metric: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<(i64, f64)>, StoreError> {
        let filter = SeriesFilter {
            service: Some(service.to_string()),
            metric: Some(metric.to_string()),
            start_ms,
            end_ms,
        };
        let rows = self.series_rows(&filter).await?;
        Ok(fold_buckets(&rows, MINUTE_MS)
            .into_iter()
            .map(|bucket| (bucket.bucket_start, bucket.avg))
            .collect())
    }

    async fn service_health_stats(
        &self,
        service: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<ServiceWindowStats, StoreError> {
        let filter = SeriesFilter {
            service: Some(service.to_string()),
            metric: None,
            start_ms,
            end_ms,
        };
        let rows = self.series_rows(&filter).await?;

        let mut request_count = 0;
        let mut error_count = 0;
        let mut latencies = Vec::new();
        for row in &rows {
            request_count += row_weight(row);
            error_count += row_errors(row);
            match (row.summary, row.duration_ms) {
                (Some(summary), _) => latencies.push(summary.p95),
                (None, Some(duration)) => latencies.push(duration),
                _ => {}
            }
        }
        latencies.sort_by(|a, b| a.total_cmp(b));
        let p95_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(percentile(&latencies, 0.95))
        };

        Ok(ServiceWindowStats {
            request_count,
            error_count,
            p95_latency_ms,
        })
    }

    async fn fetch_rows(
        &self,
        predicates: &[Predicate],
        limit: u32,
    ) -> Result<Vec<MetricRow>, StoreError> {
        let mut sql = String::from("SELECT * FROM metrics");
        for (index, predicate) in predicates.iter().enumerate() {
            sql.push_str(if index == 0 { " WHERE " } else { " AND " });
            // Column and operator names come from closed enums.
            sql.push_str(predicate.column.as_sql());
            sql.push(' ');
            sql.push_str(predicate.op.as_sql());
            sql.push_str(" ?");
        }
        sql.push_str(" ORDER BY timestamp ASC LIMIT ?");

        let mut query = sqlx::query(&sql);
        for predicate in predicates {
            query = match &predicate.value {
                Literal::Int(value) => query.bind(*value),
                Literal::Float(value) => query.bind(*value),
                Literal::Str(value) => query.bind(value.clone()),
            };
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        rows.iter().map(row_from_sqlite).collect()
    }

    async fn rollup_source(
        &self,
        min_resolution: u32,
        max_resolution: u32,
        start_ms: i64,
        end_ms: i64,
        bucket_ms: i64,
    ) -> Result<Vec<RollupGroup>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM metrics
             WHERE resolution_minutes BETWEEN ? AND ?
               AND timestamp >= ? AND timestamp < ?
             ORDER BY timestamp ASC",
        )
        .bind(min_resolution as i64)
        .bind(max_resolution as i64)
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        let rows: Vec<MetricRow> = rows
            .iter()
            .map(row_from_sqlite)
            .collect::<Result<_, _>>()?;
        Ok(fold_rollup_groups(&rows, bucket_ms))
    }

    async fn upsert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO alerts (
                alert_id, service_name, metric_name, severity, status, message,
                current_value, expected_min, expected_max, threshold_breach_count,
                first_triggered, last_triggered, resolved_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(alert_id) DO UPDATE SET
                severity = excluded.severity,
                status = excluded.status,
                message = excluded.message,
                current_value = excluded.current_value,
                expected_min = excluded.expected_min,
                expected_max = excluded.expected_max,
                threshold_breach_count = excluded.threshold_breach_count,
                last_triggered = excluded.last_triggered,
                resolved_at = excluded.resolved_at
            "#,
        )
        .bind(&alert.alert_id)
        .bind(&alert.service_name)
        .bind(&alert.metric_name)
        .bind(alert.severity.as_str())
        .bind(alert.status.as_str())
        .bind(&alert.message)
        .bind(alert.current_value)
        .bind(alert.expected_min)
        .bind(alert.expected_max)
        .bind(alert.threshold_breach_count as i64)
        .bind(alert.first_triggered)
        .bind(alert.last_triggered)
        .bind(alert.resolved_at)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn list_alerts(&self, limit: u32) -> Result<Vec<Alert>, StoreError> {
        let rows = sqlx::query("SELECT * FROM alerts ORDER BY last_triggered DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        rows.iter().map(alert_from_sqlite).collect()
    }

    async fn active_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM alerts WHERE status = 'firing' ORDER BY last_triggered DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;
        rows.iter().map(alert_from_sqlite).collect()
    }
}

fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::Retryable(err.to_string()),
        _ => StoreError::Fatal(err.to_string()),
    }
}

fn row_from_sqlite(row: &SqliteRow) -> Result<MetricRow, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Fatal(e.to_string());

    let metric_type: String = row.try_get("metric_type").map_err(decode)?;
    let metric_type = MetricType::from_str(&metric_type).map_err(StoreError::Fatal)?;
    let tags_raw: String = row.try_get("tags").map_err(decode)?;
    let tags: BTreeMap<String, String> =
        serde_json::from_str(&tags_raw).unwrap_or_default();

    let sample_count: Option<i64> = row.try_get("sample_count").map_err(decode)?;
    let summary = match sample_count {
        Some(count) => Some(AggregateSummary {
            min_value: row.try_get("min_value").map_err(decode)?,
            max_value: row.try_get("max_value").map_err(decode)?,
            p50: row.try_get("p50").map_err(decode)?,
            p95: row.try_get("p95").map_err(decode)?,
            p99: row.try_get("p99").map_err(decode)?,
            sample_count: count.max(0) as u64,
            error_count: row
                .try_get::<Option<i64>, _>("error_count")
                .map_err(decode)?
                .unwrap_or(0)
                .max(0) as u64,
        }),
        None => None,
    };

    Ok(MetricRow {
        id: row.try_get::<i64, _>("id").map_err(decode)? as u64,
        timestamp: row.try_get("timestamp").map_err(decode)?,
        service_name: row.try_get("service_name").map_err(decode)?,
        metric_name: row.try_get("metric_name").map_err(decode)?,
        metric_type,
        value: row.try_get("value").map_err(decode)?,
        endpoint: row.try_get("endpoint").map_err(decode)?,
        method: row.try_get("method").map_err(decode)?,
        status_code: row
            .try_get::<Option<i64>, _>("status_code")
            .map_err(decode)?
            .map(|code| code as u16),
        duration_ms: row.try_get("duration_ms").map_err(decode)?,
        tags,
        trace_id: row.try_get("trace_id").map_err(decode)?,
        span_id: row.try_get("span_id").map_err(decode)?,
        environment: row.try_get("environment").map_err(decode)?,
        aggregated: row.try_get::<i64, _>("aggregated").map_err(decode)? != 0,
        resolution_minutes: row
            .try_get::<i64, _>("resolution_minutes")
            .map_err(decode)? as u32,
        summary,
    })
}

fn alert_from_sqlite(row: &SqliteRow) -> Result<Alert, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Fatal(e.to_string());

    let severity: String = row.try_get("severity").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    Ok(Alert {
        alert_id: row.try_get("alert_id").map_err(decode)?,
        service_name: row.try_get("service_name").map_err(decode)?,
        metric_name: row.try_get("metric_name").map_err(decode)?,
        severity: AlertSeverity::from_str(&severity).map_err(StoreError::Fatal)?,
        status: AlertStatus::from_str(&status).map_err(StoreError::Fatal)?,
        message: row.try_get("message").map_err(decode)?,
        current_value: row.try_get("current_value").map_err(decode)?,
        expected_min: row.try_get("expected_min").map_err(decode)?,
        expected_max: row.try_get("expected_max").map_err(decode)?,
        threshold_breach_count: row
            .try_get::<i64, _>("threshold_breach_count")
            .map_err(decode)? as u32,
        first_triggered: row.try_get("first_triggered").map_err(decode)?,
        last_triggered: row.try_get("last_triggered").map_err(decode)?,
        resolved_at: row.try_get("resolved_at").map_err(decode)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::row_id;

    fn row(id: u64, timestamp: i64, value: f64) -> MetricRow {
        MetricRow {
            id,
            timestamp,
            service_name: "api".into(),
            metric_name: "http.duration".into(),
            metric_type: MetricType::Gauge,
            value,
            endpoint: Some("/users".into()),
            method: Some("GET".into()),
            status_code: Some(200),
            duration_ms: Some(value),
            tags: BTreeMap::new(),
            trace_id: None,
            span_id: None,
            environment: Some("test".into()),
            aggregated: false,
            resolution_minutes: 0,
            summary: None,
        }
    }

    #[tokio::test]
    async fn insert_round_trips_all_fields() {
        let store = SqliteStore::in_memory().await.expect("store");
        let mut original = row(row_id(0, 0), 60_000, 42.0);
        original.tags.insert("region".into(), "us-east-1".into());

        let written = store.insert_rows(&[original.clone()]).await.expect("insert");
        assert_eq!(written, 1);

        let fetched = store.rows_since(None, 0, 10).await.expect("fetch");
        assert_eq!(fetched, vec![original]);
    }

    #[tokio::test]
    async fn reinserting_the_same_id_is_idempotent() {
        let store = SqliteStore::in_memory().await.expect("store");
        let row = row(row_id(1, 5), 60_000, 42.0);

        assert_eq!(store.insert_rows(&[row.clone()]).await.expect("first"), 1);
        assert_eq!(store.insert_rows(&[row]).await.expect("replay"), 0);
        assert_eq!(store.rows_since(None, 0, 10).await.expect("fetch").len(), 1);
    }

    #[tokio::test]
    async fn timeseries_excludes_coarse_rollups() {
        let store = SqliteStore::in_memory().await.expect("store");
        let raw = row(1, 60_000, 10.0);
        let mut hourly = row(2, 60_000, 10.0);
        hourly.aggregated = true;
        hourly.resolution_minutes = 60;
        hourly.summary = Some(AggregateSummary {
            min_value: 10.0,
            max_value: 10.0,
            p50: 10.0,
            p95: 10.0,
            p99: 10.0,
            sample_count: 100,
            error_count: 0,
        });
        store.insert_rows(&[raw, hourly]).await.expect("insert");

        let filter = SeriesFilter {
            service: Some("api".into()),
            metric: None,
            start_ms: 0,
            end_ms: 120_000,
        };
        let stats = store.aggregate(&filter).await.expect("aggregate");
        assert_eq!(stats.count, 1, "rollup rows must not double-count");
    }

    #[tokio::test]
    async fn alert_upsert_updates_in_place() {
        let store = SqliteStore::in_memory().await.expect("store");
        let mut alert = Alert {
            alert_id: "a-1".into(),
            service_name: "api".into(),
            metric_name: "http.duration".into(),
            severity: AlertSeverity::Warning,
            status: AlertStatus::Firing,
            message: "http.duration is abnormally high".into(),
            current_value: 900.0,
            expected_min: 10.0,
            expected_max: 500.0,
            threshold_breach_count: 2,
            first_triggered: 1_000,
            last_triggered: 1_000,
            resolved_at: None,
        };
        store.upsert_alert(&alert).await.expect("insert");

        alert.threshold_breach_count = 3;
        alert.last_triggered = 2_000;
        store.upsert_alert(&alert).await.expect("update");

        let listed = store.list_alerts(10).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].threshold_breach_count, 3);
        assert!(store.active_alerts().await.expect("active").len() == 1);

        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(3_000);
        store.upsert_alert(&alert).await.expect("resolve");
        assert!(store.active_alerts().await.expect("active").is_empty());
    }

    #[tokio::test]
    async fn fetch_rows_applies_typed_predicates() {
        let store = SqliteStore::in_memory().await.expect("store");
        let slow = row(1, 60_000, 900.0);
        let fast = row(2, 61_000, 20.0);
        store.insert_rows(&[slow, fast]).await.expect("insert");

        let predicates = vec![
            Predicate {
                column: super::super::FilterColumn::ServiceName,
                op: super::super::CompareOp::Eq,
                value: Literal::Str("api".into()),
            },
            Predicate {
                column: super::super::FilterColumn::Value,
                op: super::super::CompareOp::Gt,
                value: Literal::Float(100.0),
            },
        ];
        let rows = store.fetch_rows(&predicates, 100).await.expect("fetch");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 900.0);
    }
}
