pub mod alerting;
pub mod compare;
pub mod health;
pub mod live;
pub mod vql;

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::config::AppConfig;
use crate::error::ApiError;
use crate::metrics::AppMetrics;
use crate::model::Alert;
use crate::storage::{BucketStats, MetricStore, SeriesFilter};

use compare::{CompareRequest, ComparisonResult};
use health::HealthScore;

const DEFAULT_RANGE_SECONDS: i64 = 3600;
const MAX_RANGE_SECONDS: i64 = 366 * 24 * 3600;
const BUCKET_MIN_SECONDS: i64 = 60;
const BUCKET_MAX_SECONDS: i64 = 24 * 3600;
const DEFAULT_ALERTS_LIMIT: u32 = 100;
const MAX_ALERTS_LIMIT: u32 = 1000;
const SERVICES_LOOKBACK_MS: i64 = 24 * 3600 * 1000;

/// Shared state for the query & signals surface.
#[derive(Clone)]
pub struct QueryContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn MetricStore>,
    pub metrics: AppMetrics,
}

pub fn create_router(ctx: QueryContext) -> Router {
    let timeout = ctx.config.http.request_timeout;
    Router::new()
        .route("/api/metrics/timeseries", get(get_timeseries))
        .route("/api/metrics/aggregated", get(get_aggregated))
        .route("/api/services", get(get_services))
        .route("/health/scores", get(get_health_scores))
        .route("/alerts", get(get_alerts))
        .route("/alerts/active", get(get_active_alerts))
        .route("/vql/execute", post(execute_vql))
        .route("/compare/services", post(compare_services))
        .route("/ws/metrics", get(live::ws_handler))
        .route("/healthz", get(get_healthz))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .with_state(ctx)
}

fn authorize(ctx: &QueryContext, headers: &HeaderMap) -> Result<(), ApiError> {
    auth::verify(headers, &ctx.config.auth).map(|_| ())
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    service: Option<String>,
    metric: Option<String>,
    /// Window length in seconds, counted back from now.
    range: Option<i64>,
}

impl RangeParams {
    fn filter(&self, now_ms: i64) -> (SeriesFilter, i64) {
        let range = self
            .range
            .unwrap_or(DEFAULT_RANGE_SECONDS)
            .clamp(1, MAX_RANGE_SECONDS);
        let filter = SeriesFilter {
            service: self.service.clone(),
            metric: self.metric.clone(),
            start_ms: now_ms - range * 1000,
            end_ms: now_ms,
        };
        (filter, range)
    }
}

/// Bucket width: a tenth of the range, clamped to [60 s, 1 day].
fn bucket_seconds(range_seconds: i64) -> i64 {
    (range_seconds / 10).clamp(BUCKET_MIN_SECONDS, BUCKET_MAX_SECONDS)
}

async fn get_timeseries(
    State(ctx): State<QueryContext>,
    headers: HeaderMap,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<BucketStats>>, ApiError> {
    authorize(&ctx, &headers)?;
    ctx.metrics.inc_queries("timeseries");
    let now_ms = Utc::now().timestamp_millis();
    let (filter, range) = params.filter(now_ms);
    let buckets = ctx
        .store
        .timeseries(&filter, bucket_seconds(range) * 1000)
        .await?;
    Ok(Json(buckets))
}

async fn get_aggregated(
    State(ctx): State<QueryContext>,
    headers: HeaderMap,
    Query(params): Query<RangeParams>,
) -> Result<Json<BucketStats>, ApiError> {
    authorize(&ctx, &headers)?;
    ctx.metrics.inc_queries("aggregated");
    let now_ms = Utc::now().timestamp_millis();
    let (filter, _) = params.filter(now_ms);
    Ok(Json(ctx.store.aggregate(&filter).await?))
}

async fn get_services(
    State(ctx): State<QueryContext>,
    headers: HeaderMap,
) -> Result<Json<Vec<String>>, ApiError> {
    authorize(&ctx, &headers)?;
    ctx.metrics.inc_queries("services");
    let now_ms = Utc::now().timestamp_millis();
    Ok(Json(
        ctx.store.service_names(now_ms - SERVICES_LOOKBACK_MS).await?,
    ))
}

async fn get_health_scores(
    State(ctx): State<QueryContext>,
    headers: HeaderMap,
) -> Result<Json<Vec<HealthScore>>, ApiError> {
    authorize(&ctx, &headers)?;
    ctx.metrics.inc_queries("health_scores");
    let now_ms = Utc::now().timestamp_millis();
    let window_ms = ctx.config.signals.health_window.as_millis() as i64;

    let services = ctx
        .store
        .service_names(now_ms - SERVICES_LOOKBACK_MS)
        .await?;
    let mut scores = Vec::with_capacity(services.len());
    for service in services {
        let stats = ctx
            .store
            .service_health_stats(&service, now_ms - window_ms, now_ms)
            .await?;
        scores.push(health::compute(&service, &stats, &ctx.config.signals));
    }
    Ok(Json(scores))
}

#[derive(Debug, Deserialize)]
struct AlertsParams {
    limit: Option<u32>,
}

async fn get_alerts(
    State(ctx): State<QueryContext>,
    headers: HeaderMap,
    Query(params): Query<AlertsParams>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    authorize(&ctx, &headers)?;
    ctx.metrics.inc_queries("alerts");
    let limit = params
        .limit
        .unwrap_or(DEFAULT_ALERTS_LIMIT)
        .clamp(1, MAX_ALERTS_LIMIT);
    Ok(Json(ctx.store.list_alerts(limit).await?))
}

async fn get_active_alerts(
    State(ctx): State<QueryContext>,
    headers: HeaderMap,
) -> Result<Json<Vec<Alert>>, ApiError> {
    authorize(&ctx, &headers)?;
    ctx.metrics.inc_queries("alerts_active");
    Ok(Json(ctx.store.active_alerts().await?))
}

#[derive(Debug, Deserialize)]
struct VqlRequest {
    query: String,
}

async fn execute_vql(
    State(ctx): State<QueryContext>,
    headers: HeaderMap,
    Json(request): Json<VqlRequest>,
) -> Result<Json<Vec<Map<String, Value>>>, ApiError> {
    authorize(&ctx, &headers)?;
    ctx.metrics.inc_queries("vql");
    let rows = vql::execute(ctx.store.as_ref(), &request.query).await?;
    Ok(Json(rows))
}

async fn compare_services(
    State(ctx): State<QueryContext>,
    headers: HeaderMap,
    Json(request): Json<CompareRequest>,
) -> Result<Json<ComparisonResult>, ApiError> {
    authorize(&ctx, &headers)?;
    ctx.metrics.inc_queries("compare");
    let result = compare::run(ctx.store.as_ref(), &request).await?;
    Ok(Json(result))
}

async fn get_healthz() -> StatusCode {
    StatusCode::OK
}
