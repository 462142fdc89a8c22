//! HTTP contract of the ingest gateway: status codes, error bodies, and
//! admission control headers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use vigil::bus::{InProcessBus, MessageBus};
use vigil::config::AppConfig;
use vigil::gateway::{self, GatewayContext};
use vigil::metrics::AppMetrics;

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.ingest.max_batch_size = 10;
    config.ingest.rate_limit_rpm = 60;
    config.ingest.rate_limit_burst = 3;
    config
}

fn build_router(config: AppConfig) -> (Router, Arc<InProcessBus>) {
    let config = Arc::new(config);
    let bus = Arc::new(InProcessBus::new(&config.bus));
    let metrics = AppMetrics::new().expect("metrics");
    let ctx = GatewayContext::new(config, bus.clone() as Arc<dyn MessageBus>, metrics);
    (gateway::create_router(ctx), bus)
}

fn post_metrics(body: Value) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri("/v1/metrics")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    let addr: SocketAddr = "10.1.2.3:5555".parse().expect("addr");
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

fn batch(samples: Vec<Value>) -> Value {
    json!({
        "metrics": samples,
        "service_name": "api",
        "environment": "test",
        "agent_version": "1.0.0",
    })
}

fn sample(value: Value) -> Value {
    json!({
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "service_name": "api",
        "metric_name": "http.duration",
        "metric_type": "gauge",
        "value": value,
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn valid_batch_is_accepted_with_202() {
    let (router, bus) = build_router(test_config());
    let response = router
        .oneshot(post_metrics(batch(vec![sample(json!(42.0))])))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = body_json(response).await;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["metrics_received"], 1);

    // The envelope is on the bus, not yet in any store.
    let consumer = bus.subscribe();
    use vigil::bus::BusConsumer;
    assert_eq!(consumer.lag().await, 1);
}

#[tokio::test]
async fn non_finite_value_yields_400_with_indexed_errors() {
    let (router, _) = build_router(test_config());
    let response = router
        .oneshot(post_metrics(batch(vec![
            sample(json!(1.0)),
            sample(Value::Null),
        ])))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn out_of_range_fields_list_index_field_and_code() {
    let (router, _) = build_router(test_config());
    let mut bad = sample(json!(7.0));
    bad["status_code"] = json!(42);
    let response = router
        .oneshot(post_metrics(batch(vec![sample(json!(1.0)), bad])))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["code"], "validation");
    let errors = body["errors"].as_array().expect("errors array");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["index"], 1);
    assert_eq!(errors[0]["field"], "status_code");
    assert_eq!(errors[0]["code"], "out_of_range");
}

#[tokio::test]
async fn oversized_batch_yields_413() {
    let (router, _) = build_router(test_config());
    let samples: Vec<Value> = (0..11).map(|_| sample(json!(1.0))).collect();
    let response = router
        .oneshot(post_metrics(batch(samples)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn empty_bucket_yields_429_with_retry_after() {
    let (router, _) = build_router(test_config());
    for _ in 0..3 {
        let response = router
            .clone()
            .oneshot(post_metrics(batch(vec![sample(json!(1.0))])))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = router
        .oneshot(post_metrics(batch(vec![sample(json!(1.0))])))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .expect("Retry-After header");
    assert_eq!(retry_after, "60");
}

#[tokio::test]
async fn missing_api_key_yields_401_when_auth_enabled() {
    let mut config = test_config();
    config.auth.enabled = true;
    config.auth.api_keys = vec!["sekret".into()];
    let (router, _) = build_router(config);

    let response = router
        .clone()
        .oneshot(post_metrics(batch(vec![sample(json!(1.0))])))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["code"], "auth");

    let mut authed = post_metrics(batch(vec![sample(json!(1.0))]));
    authed
        .headers_mut()
        .insert("x-api-key", "sekret".parse().expect("header"));
    let response = router.oneshot(authed).await.expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn health_probes_answer_without_auth() {
    let mut config = test_config();
    config.auth.enabled = true;
    config.auth.api_keys = vec!["sekret".into()];
    let (router, _) = build_router(config);

    for path in ["/healthz", "/readyz", "/live"] {
        let request = Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("request");
        let response = router.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK, "{path} must be open");
    }

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .expect("request");
    let response = router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}
