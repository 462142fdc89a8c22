//! End-to-end pipeline: embedded bus -> stream worker -> SQLite store ->
//! query surfaces, without external services.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use vigil::bus::{BusConsumer, InProcessBus, MessageBus};
use vigil::config::{BusConfig, PreaggConfig, WorkerConfig};
use vigil::gateway::preagg::PreAggregator;
use vigil::metrics::AppMetrics;
use vigil::model::{MetricRow, MetricSample, MetricType, WireRecord};
use vigil::storage::sqlite::SqliteStore;
use vigil::storage::{MetricStore, SeriesFilter};
use vigil::worker::StreamWorker;

const BASE_TS: i64 = 1_700_000_040_000; // minute aligned

fn sample(service: &str, timestamp: i64, value: f64, status: u16) -> MetricSample {
    MetricSample {
        timestamp,
        service_name: service.into(),
        metric_name: "http.duration".into(),
        metric_type: MetricType::Gauge,
        value,
        endpoint: Some("/users".into()),
        method: Some("GET".into()),
        status_code: Some(status),
        duration_ms: Some(value),
        tags: BTreeMap::new(),
        trace_id: None,
        span_id: None,
        environment: Some("test".into()),
    }
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        target_batch_size: 8,
        batch_min: 2,
        batch_max: 64,
        max_flush_interval: Duration::from_millis(20),
        insert_retry_attempts: 2,
        insert_backoff: Duration::from_millis(1),
        breaker_fail_threshold: 5,
        breaker_cooldown: Duration::from_millis(100),
        rollup_interval: Duration::from_secs(3600),
    }
}

async fn publish(bus: &InProcessBus, sample: MetricSample) {
    let record = WireRecord::raw(sample, BASE_TS);
    let payload = serde_json::to_vec(&record).expect("encode");
    bus.publish(&record.sample.service_name, payload)
        .await
        .expect("publish");
}

#[tokio::test]
async fn accepted_samples_become_queryable_rows() {
    let bus = InProcessBus::new(&BusConfig {
        partitions: 4,
        partition_buffer: 1024,
    });
    let consumer: Arc<dyn BusConsumer> = Arc::new(bus.subscribe());
    let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
    let metrics = AppMetrics::new().expect("metrics");

    publish(&bus, sample("api", BASE_TS, 42.0, 200)).await;

    let worker = StreamWorker::new(worker_config(), consumer.clone(), store.clone(), metrics);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    // Within the flush interval the sample is durable and aggregable.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let filter = SeriesFilter {
        service: Some("api".into()),
        metric: None,
        start_ms: BASE_TS - 60_000,
        end_ms: BASE_TS + 60_000,
    };
    let stats = store.aggregate(&filter).await.expect("aggregate");
    assert_eq!(stats.count, 1);
    assert_eq!(stats.avg, 42.0);
    assert_eq!(stats.min, 42.0);
    assert_eq!(stats.max, 42.0);

    // Every committed record has a stored row with matching fields.
    let rows = store.rows_since(Some("api"), 0, 10).await.expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].timestamp, BASE_TS);
    assert_eq!(rows[0].value, 42.0);
    assert_eq!(consumer.lag().await, 0, "offsets must be committed");

    let _ = shutdown_tx.send(true);
    handle.await.expect("worker join");
}

#[tokio::test]
async fn per_service_ordering_survives_the_pipeline() {
    let bus = InProcessBus::new(&BusConfig {
        partitions: 4,
        partition_buffer: 1024,
    });
    let consumer: Arc<dyn BusConsumer> = Arc::new(bus.subscribe());
    let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
    let metrics = AppMetrics::new().expect("metrics");

    for i in 0..20 {
        publish(&bus, sample("api", BASE_TS + i * 1000, i as f64, 200)).await;
    }

    let worker = StreamWorker::new(worker_config(), consumer, store.clone(), metrics);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(300)).await;
    let _ = shutdown_tx.send(true);
    handle.await.expect("worker join");

    let rows = store.rows_since(Some("api"), 0, 100).await.expect("rows");
    assert_eq!(rows.len(), 20);
    let values: Vec<f64> = rows.iter().map(|row| row.value).collect();
    let mut sorted = values.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    assert_eq!(values, sorted, "same-service samples must stay ordered");
}

#[tokio::test]
async fn graceful_shutdown_flushes_the_open_batch() {
    let bus = InProcessBus::new(&BusConfig {
        partitions: 1,
        partition_buffer: 1024,
    });
    let consumer: Arc<dyn BusConsumer> = Arc::new(bus.subscribe());
    let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
    let metrics = AppMetrics::new().expect("metrics");

    let mut config = worker_config();
    // A flush interval far longer than the test: only shutdown can flush.
    config.max_flush_interval = Duration::from_secs(3600);
    config.target_batch_size = 1000;

    let worker = StreamWorker::new(config, consumer.clone(), store.clone(), metrics);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    for i in 0..5 {
        publish(&bus, sample("api", BASE_TS + i * 1000, i as f64, 200)).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    let _ = shutdown_tx.send(true);
    handle.await.expect("worker join");

    let rows = store.rows_since(Some("api"), 0, 100).await.expect("rows");
    assert_eq!(rows.len(), 5, "shutdown must flush and commit the batch");
    assert_eq!(consumer.lag().await, 0);
}

/// Aggregate-level queries see the same numbers whether samples went
/// through pre-aggregation or raw.
#[tokio::test]
async fn preaggregation_preserves_rollup_query_results() {
    let samples: Vec<MetricSample> = (0..50i64)
        .map(|i| {
            let status = if i % 10 == 0 { 503 } else { 200 };
            sample("api", BASE_TS + (i % 30) * 1000, i as f64, status)
        })
        .collect();

    // Raw path.
    let raw_store = SqliteStore::in_memory().await.expect("store");
    let raw_rows: Vec<MetricRow> = samples
        .iter()
        .enumerate()
        .map(|(i, s)| MetricRow::from_wire(0, i as u64, WireRecord::raw(s.clone(), BASE_TS)))
        .collect();
    raw_store.insert_rows(&raw_rows).await.expect("insert raw");

    // Pre-aggregated path.
    let preagg = PreAggregator::new(&PreaggConfig {
        enabled: true,
        window: Duration::from_secs(60),
        max_keys: 1000,
    });
    for s in &samples {
        assert!(preagg.record(s));
    }
    let agg_store = SqliteStore::in_memory().await.expect("store");
    let agg_rows: Vec<MetricRow> = preagg
        .drain(BASE_TS)
        .into_iter()
        .enumerate()
        .map(|(i, record)| MetricRow::from_wire(1, i as u64, record))
        .collect();
    assert!(agg_rows.len() < samples.len(), "pre-aggregation must reduce volume");
    agg_store.insert_rows(&agg_rows).await.expect("insert agg");

    let filter = SeriesFilter {
        service: Some("api".into()),
        metric: Some("http.duration".into()),
        start_ms: BASE_TS - 60_000,
        end_ms: BASE_TS + 120_000,
    };
    let raw_stats = raw_store.aggregate(&filter).await.expect("raw aggregate");
    let agg_stats = agg_store.aggregate(&filter).await.expect("agg aggregate");

    assert_eq!(raw_stats.count, agg_stats.count);
    assert_eq!(raw_stats.error_count, agg_stats.error_count);
    assert_eq!(raw_stats.min, agg_stats.min);
    assert_eq!(raw_stats.max, agg_stats.max);
    assert!((raw_stats.avg - agg_stats.avg).abs() < 1e-9);
}

#[tokio::test]
async fn bus_backlog_is_retained_while_worker_is_away() {
    let bus = InProcessBus::new(&BusConfig {
        partitions: 1,
        partition_buffer: 1024,
    });
    for i in 0..10 {
        publish(&bus, sample("api", BASE_TS + i, f64::from(i as u32), 200)).await;
    }

    // No consumer yet: everything waits on the bus.
    let consumer: Arc<dyn BusConsumer> = Arc::new(bus.subscribe());
    assert_eq!(consumer.lag().await, 10);

    let store = Arc::new(SqliteStore::in_memory().await.expect("store"));
    let metrics = AppMetrics::new().expect("metrics");
    let worker = StreamWorker::new(worker_config(), consumer.clone(), store.clone(), metrics);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = shutdown_tx.send(true);
    handle.await.expect("worker join");

    assert_eq!(consumer.lag().await, 0);
    assert_eq!(store.rows_since(None, 0, 100).await.expect("rows").len(), 10);
}
