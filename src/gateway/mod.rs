pub mod preagg;
pub mod rate_limit;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth;
use crate::bus::MessageBus;
use crate::config::AppConfig;
use crate::error::{ApiError, BusError};
use crate::metrics::AppMetrics;
use crate::model::{MetricBatch, WireRecord, validate_batch};

use preagg::PreAggregator;
use rate_limit::RateLimiter;

const PUBLISH_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Ingestion counters snapshotted by GET /v1/stats.
pub struct IngestStats {
    started_at: Instant,
    batches_received: AtomicU64,
    samples_received: AtomicU64,
    samples_accepted: AtomicU64,
    samples_rejected: AtomicU64,
    publish_failures: AtomicU64,
}

impl IngestStats {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            batches_received: AtomicU64::new(0),
            samples_received: AtomicU64::new(0),
            samples_accepted: AtomicU64::new(0),
            samples_rejected: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_received: self.batches_received.load(Ordering::Relaxed),
            samples_received: self.samples_received.load(Ordering::Relaxed),
            samples_accepted: self.samples_accepted.load(Ordering::Relaxed),
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsSnapshot {
    batches_received: u64,
    samples_received: u64,
    samples_accepted: u64,
    samples_rejected: u64,
    publish_failures: u64,
    uptime_seconds: f64,
}

/// Shared state for the ingest surface.
#[derive(Clone)]
pub struct GatewayContext {
    pub config: Arc<AppConfig>,
    pub bus: Arc<dyn MessageBus>,
    pub metrics: AppMetrics,
    pub limiter: Arc<RateLimiter>,
    pub preagg: Option<Arc<PreAggregator>>,
    pub stats: Arc<IngestStats>,
}

impl GatewayContext {
    pub fn new(config: Arc<AppConfig>, bus: Arc<dyn MessageBus>, metrics: AppMetrics) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.ingest.rate_limit_rpm,
            config.ingest.rate_limit_burst,
        ));
        let preagg = config
            .ingest
            .preagg
            .enabled
            .then(|| Arc::new(PreAggregator::new(&config.ingest.preagg)));
        Self {
            config,
            bus,
            metrics,
            limiter,
            preagg,
            stats: Arc::new(IngestStats::new()),
        }
    }
}

pub fn create_router(ctx: GatewayContext) -> Router {
    let timeout = ctx.config.http.request_timeout;
    Router::new()
        .route("/v1/metrics", post(ingest_metrics))
        .route("/v1/stats", get(get_stats))
        .route("/healthz", get(get_healthz))
        .route("/readyz", get(get_readyz))
        .route("/live", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .with_state(ctx)
}

/// Background upkeep: pre-aggregation window flushes and idle-bucket
/// sweeps for the rate limiter.
pub fn spawn_maintenance(ctx: GatewayContext, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let preagg_window = ctx.config.ingest.preagg.window;
        let mut flush_ticker = time::interval(preagg_window);
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_ticker = time::interval(Duration::from_secs(3600));
        sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = flush_ticker.tick() => {
                    if ctx.preagg.is_some() {
                        flush_preagg(&ctx).await;
                    }
                }
                _ = sweep_ticker.tick() => {
                    ctx.limiter.sweep_idle(Duration::from_secs(2 * 3600));
                }
                _ = shutdown.changed() => break,
            }
        }
        // Final window flush so buffered aggregates are not lost on exit.
        if ctx.preagg.is_some() {
            flush_preagg(&ctx).await;
        }
    })
}

async fn flush_preagg(ctx: &GatewayContext) {
    let Some(preagg) = &ctx.preagg else {
        return;
    };
    let records = preagg.drain(Utc::now().timestamp_millis());
    if records.is_empty() {
        return;
    }
    info!(records = records.len(), "flushing pre-aggregation window");
    for record in records {
        if let Err(err) = publish_record(ctx, &record).await {
            ctx.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
            warn!(code = err.code, "dropping aggregated record after publish failure");
        }
    }
}

async fn ingest_metrics(
    State(ctx): State<GatewayContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<MetricBatch>, JsonRejection>,
) -> Response {
    let _inflight = ctx.metrics.inflight_guard();
    ctx.stats.batches_received.fetch_add(1, Ordering::Relaxed);

    // Authentication, then admission control, both before any parsing work
    // beyond body deserialization.
    let identity = match auth::verify(&headers, &ctx.config.auth) {
        Ok(Some(key)) => key,
        Ok(None) => addr.ip().to_string(),
        Err(err) => {
            ctx.metrics.inc_requests("unauthorized");
            return err.into_response();
        }
    };

    let info = match ctx.limiter.try_acquire(&identity) {
        Ok(info) => info,
        Err(exceeded) => {
            ctx.metrics.inc_requests("rate_limited");
            ctx.metrics.inc_rate_limited();
            return rate_limited_response(exceeded.retry_after_secs);
        }
    };

    let Json(batch) = match payload {
        Ok(batch) => batch,
        Err(rejection) => {
            ctx.metrics.inc_requests("rejected");
            return ApiError::bad_request(format!("malformed batch envelope: {rejection}"))
                .into_response();
        }
    };

    let received = batch.metrics.len();
    ctx.stats
        .samples_received
        .fetch_add(received as u64, Ordering::Relaxed);

    if received == 0 {
        ctx.metrics.inc_requests("rejected");
        return ApiError::bad_request("batch contains no samples").into_response();
    }
    if received > ctx.config.ingest.max_batch_size {
        ctx.metrics.inc_requests("rejected");
        ctx.stats
            .samples_rejected
            .fetch_add(received as u64, Ordering::Relaxed);
        return ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "validation",
            format!(
                "batch of {received} samples exceeds max_batch_size {}",
                ctx.config.ingest.max_batch_size
            ),
        )
        .into_response();
    }

    let now_ms = Utc::now().timestamp_millis();
    let errors = validate_batch(&batch, now_ms);
    if !errors.is_empty() {
        ctx.metrics.inc_requests("rejected");
        ctx.metrics.add_samples("rejected", received as u64);
        ctx.stats
            .samples_rejected
            .fetch_add(received as u64, Ordering::Relaxed);
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "code": "validation",
                "message": "batch rejected; no samples were published",
                "errors": errors,
            })),
        )
            .into_response();
    }

    match accept_batch(&ctx, batch, now_ms).await {
        Ok(accepted) => {
            ctx.metrics.inc_requests("accepted");
            ctx.metrics.add_samples("accepted", received as u64);
            ctx.stats
                .samples_accepted
                .fetch_add(received as u64, Ordering::Relaxed);
            let mut response = (
                StatusCode::ACCEPTED,
                Json(IngestResponse {
                    status: "accepted",
                    metrics_received: received,
                    metrics_accepted: accepted,
                    message: format!("accepted {received} samples"),
                }),
            )
                .into_response();
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", info.limit.into());
            headers.insert("X-RateLimit-Remaining", info.remaining.into());
            response
        }
        Err(err) => {
            ctx.metrics.inc_requests("unavailable");
            ctx.metrics.add_samples("failed", received as u64);
            ctx.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
            err.into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    status: &'static str,
    metrics_received: usize,
    metrics_accepted: usize,
    message: String,
}

/// Route every sample to the bus, through the pre-aggregation buffer when
/// one is configured. Returns the number of samples admitted.
async fn accept_batch(
    ctx: &GatewayContext,
    batch: MetricBatch,
    received_at: i64,
) -> Result<usize, ApiError> {
    let environment = batch.environment.clone();
    let accepted = batch.metrics.len();
    let started = Instant::now();

    for mut sample in batch.metrics {
        if sample.environment.is_none() {
            sample.environment = Some(environment.clone());
        }
        if let Some(preagg) = &ctx.preagg {
            if preagg.record(&sample) {
                continue;
            }
        }
        let record = WireRecord::raw(sample, received_at);
        publish_record(ctx, &record).await?;
    }
    ctx.bus
        .flush()
        .await
        .map_err(|err| ApiError::unavailable(format!("bus flush failed: {err}")))?;
    ctx.metrics.observe_publish(started.elapsed());

    if let Some(preagg) = &ctx.preagg {
        if preagg.over_capacity() {
            flush_preagg(ctx).await;
        }
    }
    Ok(accepted)
}

/// Publish one record keyed by service with the configured retry budget
/// and exponential backoff.
async fn publish_record(ctx: &GatewayContext, record: &WireRecord) -> Result<(), ApiError> {
    let payload = serde_json::to_vec(record)
        .map_err(|err| ApiError::internal(format!("record serialization failed: {err}")))?;
    let budget = ctx.config.ingest.publish_retry_budget.max(1);
    let mut backoff = ctx.config.ingest.publish_backoff;

    for attempt in 1..=budget {
        match ctx
            .bus
            .publish(&record.sample.service_name, payload.clone())
            .await
        {
            Ok(()) => return Ok(()),
            Err(BusError::Fatal(reason)) => {
                ctx.metrics.inc_publish_errors();
                return Err(ApiError::internal(format!("bus rejected record: {reason}")));
            }
            Err(BusError::Retryable { reason, backoff: hint }) => {
                if attempt == budget {
                    warn!(reason, attempts = budget, "publish retry budget exhausted");
                    break;
                }
                let wait = backoff.max(hint).min(PUBLISH_BACKOFF_CAP);
                tokio::time::sleep(wait).await;
                backoff = backoff.saturating_mul(2);
            }
        }
    }
    ctx.metrics.inc_publish_errors();
    Err(ApiError::unavailable("message bus unavailable"))
}

fn rate_limited_response(retry_after_secs: u64) -> Response {
    let mut response = ApiError::new(
        StatusCode::TOO_MANY_REQUESTS,
        "overload",
        format!("rate limit exceeded; retry after {retry_after_secs}s"),
    )
    .into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, retry_after_secs.into());
    headers.insert("X-RateLimit-Remaining", 0u32.into());
    response
}

async fn get_stats(State(ctx): State<GatewayContext>) -> Json<serde_json::Value> {
    Json(json!({
        "ingestion": ctx.stats.snapshot(),
        "service": "vigil-gateway",
    }))
}

async fn get_healthz() -> StatusCode {
    StatusCode::OK
}

async fn get_readyz(State(ctx): State<GatewayContext>) -> StatusCode {
    if ctx.bus.is_reachable() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn get_metrics(State(ctx): State<GatewayContext>) -> Response {
    match ctx.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}
