use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::model::AlertSeverity;
use crate::worker::breaker::BreakerState;

/// Self-instrumentation registry exposed on GET /metrics.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Arc<Registry>,
    gateway: GatewayMetrics,
    worker: WorkerMetrics,
    query: QueryMetrics,
    signals: SignalMetrics,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("vigil".into()), None)?);

        let gateway = GatewayMetrics::register(&registry)?;
        let worker = WorkerMetrics::register(&registry)?;
        let query = QueryMetrics::register(&registry)?;
        let signals = SignalMetrics::register(&registry)?;

        Ok(Self {
            registry,
            gateway,
            worker,
            query,
            signals,
        })
    }

    // Gateway

    pub fn inc_requests(&self, outcome: &str) {
        self.gateway
            .requests_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn add_samples(&self, outcome: &str, count: u64) {
        self.gateway
            .samples_total
            .with_label_values(&[outcome])
            .inc_by(count);
    }

    pub fn observe_publish(&self, duration: Duration) {
        self.gateway.publish_latency.observe(duration.as_secs_f64());
    }

    pub fn inc_publish_errors(&self) {
        self.gateway.publish_errors_total.inc();
    }

    pub fn inc_rate_limited(&self) {
        self.gateway.rate_limited_total.inc();
    }

    pub fn inflight_guard(&self) -> InflightGuard {
        self.gateway.inflight.inc();
        InflightGuard {
            gauge: self.gateway.inflight.clone(),
        }
    }

    // Worker

    pub fn add_consumed(&self, count: u64) {
        self.worker.consumed_total.inc_by(count);
    }

    pub fn add_inserted(&self, count: u64) {
        self.worker.inserted_total.inc_by(count);
    }

    pub fn inc_insert_failures(&self) {
        self.worker.insert_failures_total.inc();
    }

    pub fn add_dead_letters(&self, count: u64) {
        self.worker.dead_letter_total.inc_by(count);
    }

    pub fn set_breaker_state(&self, state: BreakerState) {
        self.worker.breaker_state.set(match state {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        });
    }

    pub fn set_target_batch_size(&self, size: usize) {
        self.worker.target_batch_size.set(size as i64);
    }

    pub fn set_consumer_lag(&self, lag: u64) {
        self.worker.consumer_lag.set(lag as i64);
    }

    pub fn observe_flush(&self, duration: Duration) {
        self.worker.flush_duration.observe(duration.as_secs_f64());
    }

    pub fn add_rollup_rows(&self, resolution_minutes: u32, count: u64) {
        self.worker
            .rollup_rows_total
            .with_label_values(&[&resolution_minutes.to_string()])
            .inc_by(count);
    }

    // Query service

    pub fn inc_queries(&self, endpoint: &str) {
        self.query
            .requests_total
            .with_label_values(&[endpoint])
            .inc();
    }

    pub fn live_connection_guard(&self) -> InflightGuard {
        self.query.live_connections.inc();
        InflightGuard {
            gauge: self.query.live_connections.clone(),
        }
    }

    pub fn add_live_dropped(&self, count: u64) {
        self.query.live_dropped_total.inc_by(count);
    }

    // Signals

    pub fn inc_evaluations(&self) {
        self.signals.evaluations_total.inc();
    }

    pub fn inc_alerts_fired(&self, severity: AlertSeverity) {
        self.signals
            .alerts_fired_total
            .with_label_values(&[severity.as_str()])
            .inc();
    }

    pub fn inc_alerts_resolved(&self) {
        self.signals.alerts_resolved_total.inc();
    }

    /// Encode the registry in Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Decrements its gauge on drop; covers every handler exit path.
pub struct InflightGuard {
    gauge: IntGauge,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[derive(Clone)]
struct GatewayMetrics {
    requests_total: IntCounterVec,
    samples_total: IntCounterVec,
    publish_latency: Histogram,
    publish_errors_total: IntCounter,
    rate_limited_total: IntCounter,
    inflight: IntGauge,
}

impl GatewayMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "ingest_requests_total",
                "Ingest requests split by outcome (accepted, rejected, rate_limited, unavailable)",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let samples_total = IntCounterVec::new(
            Opts::new("ingest_samples_total", "Samples split by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(samples_total.clone()))?;

        let publish_latency = Histogram::with_opts(HistogramOpts::new(
            "publish_duration_seconds",
            "Bus publish latency per ingest request",
        ))?;
        registry.register(Box::new(publish_latency.clone()))?;

        let publish_errors_total = IntCounter::new(
            "publish_errors_total",
            "Bus publishes that exhausted the retry budget",
        )?;
        registry.register(Box::new(publish_errors_total.clone()))?;

        let rate_limited_total =
            IntCounter::new("rate_limited_total", "Requests rejected by the token bucket")?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        let inflight = IntGauge::new("ingest_inflight_requests", "Ingest requests in flight")?;
        registry.register(Box::new(inflight.clone()))?;

        Ok(Self {
            requests_total,
            samples_total,
            publish_latency,
            publish_errors_total,
            rate_limited_total,
            inflight,
        })
    }
}

#[derive(Clone)]
struct WorkerMetrics {
    consumed_total: IntCounter,
    inserted_total: IntCounter,
    insert_failures_total: IntCounter,
    dead_letter_total: IntCounter,
    breaker_state: IntGauge,
    target_batch_size: IntGauge,
    consumer_lag: IntGauge,
    flush_duration: Histogram,
    rollup_rows_total: IntCounterVec,
}

impl WorkerMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let consumed_total =
            IntCounter::new("worker_consumed_total", "Records consumed from the bus")?;
        registry.register(Box::new(consumed_total.clone()))?;

        let inserted_total =
            IntCounter::new("worker_inserted_total", "Rows acknowledged by the store")?;
        registry.register(Box::new(inserted_total.clone()))?;

        let insert_failures_total = IntCounter::new(
            "worker_insert_failures_total",
            "Insert attempts that exhausted in-place retries",
        )?;
        registry.register(Box::new(insert_failures_total.clone()))?;

        let dead_letter_total = IntCounter::new(
            "worker_dead_letter_total",
            "Records dropped to the dead-letter sink on fatal storage errors",
        )?;
        registry.register(Box::new(dead_letter_total.clone()))?;

        let breaker_state = IntGauge::new(
            "worker_breaker_state",
            "Circuit breaker state (0=closed, 1=open, 2=half-open)",
        )?;
        registry.register(Box::new(breaker_state.clone()))?;

        let target_batch_size = IntGauge::new(
            "worker_target_batch_size",
            "Backpressure-adjusted flush threshold",
        )?;
        registry.register(Box::new(target_batch_size.clone()))?;

        let consumer_lag = IntGauge::new(
            "worker_consumer_lag",
            "End offset minus committed offset across partitions",
        )?;
        registry.register(Box::new(consumer_lag.clone()))?;

        let flush_duration = Histogram::with_opts(HistogramOpts::new(
            "worker_flush_duration_seconds",
            "Storage insert latency per flushed batch",
        ))?;
        registry.register(Box::new(flush_duration.clone()))?;

        let rollup_rows_total = IntCounterVec::new(
            Opts::new(
                "worker_rollup_rows_total",
                "Rollup rows materialized, by target resolution in minutes",
            ),
            &["resolution"],
        )?;
        registry.register(Box::new(rollup_rows_total.clone()))?;

        Ok(Self {
            consumed_total,
            inserted_total,
            insert_failures_total,
            dead_letter_total,
            breaker_state,
            target_batch_size,
            consumer_lag,
            flush_duration,
            rollup_rows_total,
        })
    }
}

#[derive(Clone)]
struct QueryMetrics {
    requests_total: IntCounterVec,
    live_connections: IntGauge,
    live_dropped_total: IntCounter,
}

impl QueryMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("query_requests_total", "Query API requests by endpoint"),
            &["endpoint"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let live_connections =
            IntGauge::new("live_connections", "Open live-channel connections")?;
        registry.register(Box::new(live_connections.clone()))?;

        let live_dropped_total = IntCounter::new(
            "live_dropped_frames_total",
            "Frames dropped from live-channel send buffers",
        )?;
        registry.register(Box::new(live_dropped_total.clone()))?;

        Ok(Self {
            requests_total,
            live_connections,
            live_dropped_total,
        })
    }
}

#[derive(Clone)]
struct SignalMetrics {
    evaluations_total: IntCounter,
    alerts_fired_total: IntCounterVec,
    alerts_resolved_total: IntCounter,
}

impl SignalMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let evaluations_total = IntCounter::new(
            "alert_evaluations_total",
            "Adaptive threshold evaluation passes",
        )?;
        registry.register(Box::new(evaluations_total.clone()))?;

        let alerts_fired_total = IntCounterVec::new(
            Opts::new("alerts_fired_total", "Alerts created, by severity"),
            &["severity"],
        )?;
        registry.register(Box::new(alerts_fired_total.clone()))?;

        let alerts_resolved_total =
            IntCounter::new("alerts_resolved_total", "Alerts transitioned to resolved")?;
        registry.register(Box::new(alerts_resolved_total.clone()))?;

        Ok(Self {
            evaluations_total,
            alerts_fired_total,
            alerts_resolved_total,
        })
    }
}
