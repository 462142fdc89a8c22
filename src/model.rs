use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_ENDPOINT_LEN: usize = 500;
pub const MAX_METHOD_LEN: usize = 10;
pub const MAX_TAG_COUNT: usize = 32;
pub const MAX_TAG_LEN: usize = 128;

/// Samples more than an hour ahead of server time are rejected.
pub const MAX_FUTURE_SKEW_MS: i64 = 3_600_000;
/// Samples older than seven days are rejected.
pub const MAX_SAMPLE_AGE_MS: i64 = 7 * 24 * 3_600_000;

pub const MINUTE_MS: i64 = 60_000;

/// Kind of measurement carried by a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricType {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
        }
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "counter" => Ok(MetricType::Counter),
            "gauge" => Ok(MetricType::Gauge),
            "histogram" => Ok(MetricType::Histogram),
            "summary" => Ok(MetricType::Summary),
            other => Err(format!("unknown metric type: {other}")),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One measurement emitted by an instrumented process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub service_name: String,
    pub metric_name: String,
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// Batch envelope accepted by the ingest gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricBatch {
    pub metrics: Vec<MetricSample>,
    pub service_name: String,
    #[serde(default = "MetricBatch::default_environment")]
    pub environment: String,
    #[serde(default = "MetricBatch::default_agent_version")]
    pub agent_version: String,
}

impl MetricBatch {
    fn default_environment() -> String {
        "development".into()
    }

    fn default_agent_version() -> String {
        "unknown".into()
    }
}

/// Structured per-sample validation failure surfaced in 400 bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleError {
    pub index: usize,
    pub field: &'static str,
    pub code: &'static str,
}

fn valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_NAME_LEN
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
}

/// Validate every sample in a batch, returning one entry per violation.
///
/// Batches are never partially accepted: a non-empty result rejects the
/// whole envelope.
pub fn validate_batch(batch: &MetricBatch, now_ms: i64) -> Vec<SampleError> {
    let mut errors = Vec::new();
    for (index, sample) in batch.metrics.iter().enumerate() {
        validate_sample(index, sample, now_ms, &mut errors);
    }
    errors
}

fn validate_sample(index: usize, sample: &MetricSample, now_ms: i64, errors: &mut Vec<SampleError>) {
    let mut push = |field, code| errors.push(SampleError { index, field, code });

    if !valid_identifier(&sample.service_name) {
        push("service_name", "bad_identifier");
    }
    if !valid_identifier(&sample.metric_name) {
        push("metric_name", "bad_identifier");
    }
    if !sample.value.is_finite() {
        push("value", "non_finite");
    }
    if sample.timestamp > now_ms + MAX_FUTURE_SKEW_MS {
        push("timestamp", "too_far_in_future");
    }
    if sample.timestamp < now_ms - MAX_SAMPLE_AGE_MS {
        push("timestamp", "too_old");
    }
    if let Some(code) = sample.status_code {
        if !(100..=599).contains(&code) {
            push("status_code", "out_of_range");
        }
    }
    if let Some(duration) = sample.duration_ms {
        if !duration.is_finite() || duration < 0.0 {
            push("duration_ms", "negative");
        }
    }
    if let Some(endpoint) = &sample.endpoint {
        if endpoint.len() > MAX_ENDPOINT_LEN {
            push("endpoint", "too_long");
        }
    }
    if let Some(method) = &sample.method {
        if method.len() > MAX_METHOD_LEN {
            push("method", "too_long");
        }
    }
    if sample.tags.len() > MAX_TAG_COUNT {
        push("tags", "too_many");
    }
    for (key, value) in &sample.tags {
        if key.len() > MAX_TAG_LEN || value.len() > MAX_TAG_LEN {
            push("tags", "entry_too_long");
            break;
        }
    }
}

/// Summary columns carried by pre-aggregated samples and rollup rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub min_value: f64,
    pub max_value: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub sample_count: u64,
    pub error_count: u64,
}

/// Self-describing record published to the message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRecord {
    #[serde(flatten)]
    pub sample: MetricSample,
    /// Server-assigned ingest time in milliseconds.
    pub received_at: i64,
    #[serde(default)]
    pub aggregated: bool,
    #[serde(default)]
    pub resolution_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<AggregateSummary>,
}

impl WireRecord {
    pub fn raw(sample: MetricSample, received_at: i64) -> Self {
        Self {
            sample,
            received_at,
            aggregated: false,
            resolution_minutes: 0,
            summary: None,
        }
    }
}

/// Persisted shape of a sample in the columnar store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub id: u64,
    pub timestamp: i64,
    pub service_name: String,
    pub metric_name: String,
    pub metric_type: MetricType,
    pub value: f64,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub status_code: Option<u16>,
    pub duration_ms: Option<f64>,
    pub tags: BTreeMap<String, String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub environment: Option<String>,
    pub aggregated: bool,
    pub resolution_minutes: u32,
    pub summary: Option<AggregateSummary>,
}

impl MetricRow {
    /// Materialize a bus record into its stored form.
    ///
    /// The row id is derived from the bus coordinates, so a redelivered
    /// record reproduces the same id and deduplicates in the store.
    pub fn from_wire(partition: u32, offset: u64, record: WireRecord) -> Self {
        let WireRecord {
            sample,
            received_at: _,
            aggregated,
            resolution_minutes,
            summary,
        } = record;
        Self {
            id: row_id(partition, offset),
            timestamp: sample.timestamp,
            service_name: sample.service_name,
            metric_name: sample.metric_name,
            metric_type: sample.metric_type,
            value: sample.value,
            endpoint: sample.endpoint,
            method: sample.method,
            status_code: sample.status_code,
            duration_ms: sample.duration_ms,
            tags: sample.tags,
            trace_id: sample.trace_id,
            span_id: sample.span_id,
            environment: sample.environment,
            aggregated,
            resolution_minutes,
            summary,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status_code.is_some_and(|code| code >= 500)
    }
}

/// Row id from bus coordinates: monotonic per partition, stable across
/// redelivery. The high bit stays clear; it is reserved for derived rows.
pub fn row_id(partition: u32, offset: u64) -> u64 {
    (((partition as u64) & 0x7FFF) << 48) | (offset & 0xFFFF_FFFF_FFFF)
}

/// Deterministic id for a materialized rollup row, so re-running a rollup
/// window replaces rather than duplicates.
pub fn rollup_id(
    service_name: &str,
    metric_name: &str,
    endpoint: &str,
    method: &str,
    status_code: u16,
    bucket_start: i64,
    resolution_minutes: u32,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    service_name.hash(&mut hasher);
    metric_name.hash(&mut hasher);
    endpoint.hash(&mut hasher);
    method.hash(&mut hasher);
    status_code.hash(&mut hasher);
    bucket_start.hash(&mut hasher);
    resolution_minutes.hash(&mut hasher);
    // High bit marks derived rows so they can never collide with bus ids.
    hasher.finish() | (1 << 63)
}

/// Grouping key for pre-aggregation and rollups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregationKey {
    pub service_name: String,
    pub metric_name: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    /// Timestamp floored to the minute, in milliseconds.
    pub minute: i64,
}

impl AggregationKey {
    /// Samples without an endpoint cannot be aggregated and bypass the
    /// pre-aggregation buffer.
    pub fn from_sample(sample: &MetricSample) -> Option<Self> {
        let endpoint = sample.endpoint.clone()?;
        Some(Self {
            service_name: sample.service_name.clone(),
            metric_name: sample.metric_name.clone(),
            endpoint,
            method: sample.method.clone().unwrap_or_default(),
            status_code: sample.status_code.unwrap_or(0),
            minute: sample.timestamp - sample.timestamp.rem_euclid(MINUTE_MS),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl FromStr for AlertSeverity {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "info" => Ok(AlertSeverity::Info),
            "warning" => Ok(AlertSeverity::Warning),
            "critical" => Ok(AlertSeverity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Firing => "firing",
            AlertStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "firing" => Ok(AlertStatus::Firing),
            "resolved" => Ok(AlertStatus::Resolved),
            other => Err(format!("unknown alert status: {other}")),
        }
    }
}

/// Authoritative record of an adaptive-threshold breach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub service_name: String,
    pub metric_name: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    pub current_value: f64,
    pub expected_min: f64,
    pub expected_max: f64,
    pub threshold_breach_count: u32,
    pub first_triggered: i64,
    pub last_triggered: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(timestamp: i64) -> MetricSample {
        MetricSample {
            timestamp,
            service_name: "api".into(),
            metric_name: "http.duration".into(),
            metric_type: MetricType::Gauge,
            value: 42.0,
            endpoint: Some("/users".into()),
            method: Some("GET".into()),
            status_code: Some(200),
            duration_ms: Some(42.0),
            tags: BTreeMap::new(),
            trace_id: None,
            span_id: None,
            environment: None,
        }
    }

    fn batch(metrics: Vec<MetricSample>) -> MetricBatch {
        MetricBatch {
            metrics,
            service_name: "api".into(),
            environment: "test".into(),
            agent_version: "0.0.0".into(),
        }
    }

    #[test]
    fn valid_sample_passes() {
        let now = 1_700_000_000_000;
        assert!(validate_batch(&batch(vec![sample(now)]), now).is_empty());
    }

    #[test]
    fn non_finite_value_is_rejected_with_index() {
        let now = 1_700_000_000_000;
        let mut bad = sample(now);
        bad.value = f64::NAN;
        let errors = validate_batch(&batch(vec![sample(now), bad]), now);
        assert_eq!(
            errors,
            vec![SampleError {
                index: 1,
                field: "value",
                code: "non_finite"
            }]
        );
    }

    #[test]
    fn identifier_charset_is_enforced() {
        let now = 1_700_000_000_000;
        let mut bad = sample(now);
        bad.service_name = "api; DROP".into();
        let errors = validate_batch(&batch(vec![bad]), now);
        assert_eq!(errors[0].field, "service_name");
        assert_eq!(errors[0].code, "bad_identifier");
    }

    #[test]
    fn timestamp_bounds_are_enforced() {
        let now = 1_700_000_000_000;
        let future = sample(now + MAX_FUTURE_SKEW_MS + 1);
        let stale = sample(now - MAX_SAMPLE_AGE_MS - 1);
        assert_eq!(
            validate_batch(&batch(vec![future]), now)[0].code,
            "too_far_in_future"
        );
        assert_eq!(validate_batch(&batch(vec![stale]), now)[0].code, "too_old");
    }

    #[test]
    fn row_ids_are_stable_and_partition_scoped() {
        assert_eq!(row_id(0, 7), 7);
        assert_eq!(row_id(1, 7), (1 << 48) | 7);
        assert_ne!(row_id(1, 7), row_id(2, 7));
        // Redelivery reproduces the same id.
        assert_eq!(row_id(3, 99), row_id(3, 99));
    }

    #[test]
    fn rollup_ids_never_collide_with_bus_ids() {
        let id = rollup_id("api", "http.duration", "/users", "GET", 200, 0, 60);
        assert!(id >> 63 == 1);
        assert!(row_id(u32::MAX, u64::MAX) >> 63 == 0);
    }

    #[test]
    fn aggregation_key_floors_to_minute() {
        let s = sample(1_700_000_059_999);
        let key = AggregationKey::from_sample(&s).expect("key");
        assert_eq!(key.minute, 1_700_000_040_000 - 1_700_000_040_000 % MINUTE_MS);
        assert_eq!(key.minute % MINUTE_MS, 0);
    }

    #[test]
    fn samples_without_endpoint_have_no_key() {
        let mut s = sample(1_700_000_000_000);
        s.endpoint = None;
        assert!(AggregationKey::from_sample(&s).is_none());
    }

    #[test]
    fn wire_record_round_trips_through_json() {
        let record = WireRecord::raw(sample(1_700_000_000_000), 1_700_000_000_500);
        let raw = serde_json::to_vec(&record).expect("encode");
        let back: WireRecord = serde_json::from_slice(&raw).expect("decode");
        assert_eq!(back.sample, record.sample);
        assert!(!back.aggregated);
    }
}
