use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "/config/vigil.yaml";

/// Top-level configuration for the vigil backend.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub signals: SignalsConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// HTTP listener configuration for the two surfaces.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_ingest_bind")]
    pub ingest_bind: String,
    #[serde(default = "HttpConfig::default_query_bind")]
    pub query_bind: String,
    /// Per-request deadline; exceeding it aborts the handler.
    #[serde(
        default = "HttpConfig::default_request_timeout",
        with = "humantime_serde"
    )]
    pub request_timeout: Duration,
}

impl HttpConfig {
    fn default_ingest_bind() -> String {
        "0.0.0.0:8080".to_string()
    }

    fn default_query_bind() -> String {
        "0.0.0.0:8081".to_string()
    }

    const fn default_request_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            ingest_bind: Self::default_ingest_bind(),
            query_bind: Self::default_query_bind(),
            request_timeout: Self::default_request_timeout(),
        }
    }
}

/// Admission control and publish behavior of the ingest gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Upper bound on samples per ingest request.
    #[serde(default = "IngestConfig::default_max_batch_size")]
    pub max_batch_size: usize,
    /// Token-bucket refill per identity, tokens per minute.
    #[serde(default = "IngestConfig::default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
    /// Token-bucket burst capacity per identity.
    #[serde(default = "IngestConfig::default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    /// Publish attempts before the gateway answers 503.
    #[serde(default = "IngestConfig::default_publish_retry_budget")]
    pub publish_retry_budget: u32,
    /// First publish backoff; doubles per attempt, capped at 2 s.
    #[serde(
        default = "IngestConfig::default_publish_backoff",
        with = "humantime_serde"
    )]
    pub publish_backoff: Duration,
    #[serde(default)]
    pub preagg: PreaggConfig,
}

impl IngestConfig {
    const fn default_max_batch_size() -> usize {
        1000
    }

    const fn default_rate_limit_rpm() -> u32 {
        1000
    }

    const fn default_rate_limit_burst() -> u32 {
        1000
    }

    const fn default_publish_retry_budget() -> u32 {
        3
    }

    const fn default_publish_backoff() -> Duration {
        Duration::from_millis(100)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_batch_size: Self::default_max_batch_size(),
            rate_limit_rpm: Self::default_rate_limit_rpm(),
            rate_limit_burst: Self::default_rate_limit_burst(),
            publish_retry_budget: Self::default_publish_retry_budget(),
            publish_backoff: Self::default_publish_backoff(),
            preagg: PreaggConfig::default(),
        }
    }
}

/// Pre-aggregation buffer. A throughput optimization only: enabling it
/// changes row volume, not the results of rollup-level queries.
#[derive(Debug, Clone, Deserialize)]
pub struct PreaggConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "PreaggConfig::default_window", with = "humantime_serde")]
    pub window: Duration,
    #[serde(default = "PreaggConfig::default_max_keys")]
    pub max_keys: usize,
}

impl PreaggConfig {
    const fn default_window() -> Duration {
        Duration::from_secs(60)
    }

    const fn default_max_keys() -> usize {
        10_000
    }
}

impl Default for PreaggConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: Self::default_window(),
            max_keys: Self::default_max_keys(),
        }
    }
}

/// Embedded message bus sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "BusConfig::default_partitions")]
    pub partitions: u32,
    /// Uncommitted records held per partition before publishes are pushed
    /// back with a retryable error.
    #[serde(default = "BusConfig::default_partition_buffer")]
    pub partition_buffer: usize,
}

impl BusConfig {
    const fn default_partitions() -> u32 {
        4
    }

    const fn default_partition_buffer() -> usize {
        65_536
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            partitions: Self::default_partitions(),
            partition_buffer: Self::default_partition_buffer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Clickhouse,
    Sqlite,
}

/// Columnar store selection and connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_backend")]
    pub backend: StorageBackend,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

impl StorageConfig {
    const fn default_backend() -> StorageBackend {
        StorageBackend::Clickhouse
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Self::default_backend(),
            clickhouse: ClickHouseConfig::default(),
            sqlite: SqliteConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default = "ClickHouseConfig::default_url")]
    pub url: String,
    #[serde(default = "ClickHouseConfig::default_database")]
    pub database: String,
    #[serde(default = "ClickHouseConfig::default_user")]
    pub user: String,
    /// Set via VIGIL_CLICKHOUSE_PASSWORD only; refused in YAML.
    #[serde(default)]
    pub password: String,
}

impl ClickHouseConfig {
    fn default_url() -> String {
        "http://localhost:8123".to_string()
    }

    fn default_database() -> String {
        "vigil".to_string()
    }

    fn default_user() -> String {
        "default".to_string()
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            database: Self::default_database(),
            user: Self::default_user(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    #[serde(default = "SqliteConfig::default_path")]
    pub path: PathBuf,
    /// Bounded connection pool; acquisition failures surface as retryable.
    #[serde(default = "SqliteConfig::default_pool_size")]
    pub pool_size: u32,
    #[serde(
        default = "SqliteConfig::default_acquire_timeout",
        with = "humantime_serde"
    )]
    pub acquire_timeout: Duration,
}

impl SqliteConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("vigil.db")
    }

    const fn default_pool_size() -> u32 {
        10
    }

    const fn default_acquire_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            pool_size: Self::default_pool_size(),
            acquire_timeout: Self::default_acquire_timeout(),
        }
    }
}

/// Stream worker batching, retry and circuit breaker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Base batch size before backpressure scaling.
    #[serde(default = "WorkerConfig::default_target_batch_size")]
    pub target_batch_size: usize,
    #[serde(default = "WorkerConfig::default_batch_min")]
    pub batch_min: usize,
    #[serde(default = "WorkerConfig::default_batch_max")]
    pub batch_max: usize,
    /// A partially filled batch is flushed once it reaches this age.
    #[serde(
        default = "WorkerConfig::default_max_flush_interval",
        with = "humantime_serde"
    )]
    pub max_flush_interval: Duration,
    /// In-place insert retries before a failure counts toward the breaker.
    #[serde(default = "WorkerConfig::default_insert_retry_attempts")]
    pub insert_retry_attempts: u32,
    /// First insert retry backoff; doubles per attempt.
    #[serde(
        default = "WorkerConfig::default_insert_backoff",
        with = "humantime_serde"
    )]
    pub insert_backoff: Duration,
    #[serde(default = "WorkerConfig::default_breaker_fail_threshold")]
    pub breaker_fail_threshold: u32,
    #[serde(
        default = "WorkerConfig::default_breaker_cooldown",
        with = "humantime_serde"
    )]
    pub breaker_cooldown: Duration,
    #[serde(
        default = "WorkerConfig::default_rollup_interval",
        with = "humantime_serde"
    )]
    pub rollup_interval: Duration,
}

impl WorkerConfig {
    const fn default_target_batch_size() -> usize {
        100
    }

    const fn default_batch_min() -> usize {
        10
    }

    const fn default_batch_max() -> usize {
        10_000
    }

    const fn default_max_flush_interval() -> Duration {
        Duration::from_secs(1)
    }

    const fn default_insert_retry_attempts() -> u32 {
        3
    }

    const fn default_insert_backoff() -> Duration {
        Duration::from_secs(2)
    }

    const fn default_breaker_fail_threshold() -> u32 {
        5
    }

    const fn default_breaker_cooldown() -> Duration {
        Duration::from_secs(60)
    }

    const fn default_rollup_interval() -> Duration {
        Duration::from_secs(3600)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            target_batch_size: Self::default_target_batch_size(),
            batch_min: Self::default_batch_min(),
            batch_max: Self::default_batch_max(),
            max_flush_interval: Self::default_max_flush_interval(),
            insert_retry_attempts: Self::default_insert_retry_attempts(),
            insert_backoff: Self::default_insert_backoff(),
            breaker_fail_threshold: Self::default_breaker_fail_threshold(),
            breaker_cooldown: Self::default_breaker_cooldown(),
            rollup_interval: Self::default_rollup_interval(),
        }
    }
}

/// Data lifecycle; deletion is the store's native TTL.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "RetentionConfig::default_raw_days")]
    pub raw_days: u32,
    #[serde(default = "RetentionConfig::default_hourly_days")]
    pub hourly_days: u32,
    #[serde(default = "RetentionConfig::default_daily_days")]
    pub daily_days: u32,
}

impl RetentionConfig {
    const fn default_raw_days() -> u32 {
        90
    }

    const fn default_hourly_days() -> u32 {
        365
    }

    const fn default_daily_days() -> u32 {
        1095
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_days: Self::default_raw_days(),
            hourly_days: Self::default_hourly_days(),
            daily_days: Self::default_daily_days(),
        }
    }
}

/// Derived-signal tuning: health scores and adaptive alerting.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalsConfig {
    /// Rolling baseline for adaptive thresholds.
    #[serde(
        default = "SignalsConfig::default_baseline_window",
        with = "humantime_serde"
    )]
    pub baseline_window: Duration,
    #[serde(
        default = "SignalsConfig::default_eval_period",
        with = "humantime_serde"
    )]
    pub eval_period: Duration,
    #[serde(default = "SignalsConfig::default_sigma_k")]
    pub sigma_k: f64,
    /// Below this, bounds fall back to ±20% of the mean.
    #[serde(default = "SignalsConfig::default_sigma_floor")]
    pub sigma_floor: f64,
    #[serde(
        default = "SignalsConfig::default_health_window",
        with = "humantime_serde"
    )]
    pub health_window: Duration,
    #[serde(default = "SignalsConfig::default_err_ref")]
    pub err_ref: f64,
    #[serde(default = "SignalsConfig::default_lat_ref_lo_ms")]
    pub lat_ref_lo_ms: f64,
    #[serde(default = "SignalsConfig::default_lat_ref_hi_ms")]
    pub lat_ref_hi_ms: f64,
    #[serde(default = "SignalsConfig::default_traffic_ref")]
    pub traffic_ref: f64,
}

impl SignalsConfig {
    const fn default_baseline_window() -> Duration {
        Duration::from_secs(7 * 24 * 3600)
    }

    const fn default_eval_period() -> Duration {
        Duration::from_secs(60)
    }

    const fn default_sigma_k() -> f64 {
        3.0
    }

    const fn default_sigma_floor() -> f64 {
        1e-6
    }

    const fn default_health_window() -> Duration {
        Duration::from_secs(300)
    }

    const fn default_err_ref() -> f64 {
        0.05
    }

    const fn default_lat_ref_lo_ms() -> f64 {
        100.0
    }

    const fn default_lat_ref_hi_ms() -> f64 {
        1000.0
    }

    const fn default_traffic_ref() -> f64 {
        10_000.0
    }
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            baseline_window: Self::default_baseline_window(),
            eval_period: Self::default_eval_period(),
            sigma_k: Self::default_sigma_k(),
            sigma_floor: Self::default_sigma_floor(),
            health_window: Self::default_health_window(),
            err_ref: Self::default_err_ref(),
            lat_ref_lo_ms: Self::default_lat_ref_lo_ms(),
            lat_ref_hi_ms: Self::default_lat_ref_hi_ms(),
            traffic_ref: Self::default_traffic_ref(),
        }
    }
}

/// Live push channel behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "LiveConfig::default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Bounded per-connection send buffer; overflow drops the oldest frame.
    #[serde(default = "LiveConfig::default_buffer")]
    pub buffer: usize,
    #[serde(default = "LiveConfig::default_heartbeat", with = "humantime_serde")]
    pub heartbeat: Duration,
}

impl LiveConfig {
    const fn default_poll_interval() -> Duration {
        Duration::from_secs(1)
    }

    const fn default_buffer() -> usize {
        256
    }

    const fn default_heartbeat() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::default_poll_interval(),
            buffer: Self::default_buffer(),
            heartbeat: Self::default_heartbeat(),
        }
    }
}

/// Optional API key authentication. Keys come from the environment only.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

/// Load configuration from a YAML file, falling back to defaults, then
/// apply environment overrides and secret policy.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("VIGIL_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    enforce_yaml_policy(&config)?;
    apply_env_overrides(&mut config)?;
    validate(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let cfg = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse YAML config at {}", path.display()))?;
            Ok(Some(cfg))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

fn enforce_yaml_policy(config: &AppConfig) -> Result<()> {
    if !config.auth.api_keys.is_empty() {
        bail!(
            "Remove `auth.api_keys` from vigil YAML config; set keys via the VIGIL_API_KEYS environment variable (comma separated)."
        );
    }
    if !config.storage.clickhouse.password.is_empty() {
        bail!(
            "Remove `storage.clickhouse.password` from vigil YAML config; set it via the VIGIL_CLICKHOUSE_PASSWORD environment variable."
        );
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(url) = env::var("VIGIL_CLICKHOUSE_URL") {
        if !url.is_empty() {
            config.storage.clickhouse.url = url;
        }
    }
    if let Ok(password) = env::var("VIGIL_CLICKHOUSE_PASSWORD") {
        config.storage.clickhouse.password = password;
    }
    if let Ok(path) = env::var("VIGIL_SQLITE_PATH") {
        if !path.is_empty() {
            config.storage.sqlite.path = PathBuf::from(path);
        }
    }
    if let Ok(keys) = env::var("VIGIL_API_KEYS") {
        config.auth.api_keys = keys
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect();
    }
    Ok(())
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.auth.enabled && config.auth.api_keys.is_empty() {
        bail!(
            "Authentication is enabled but no API keys are configured. Populate VIGIL_API_KEYS or disable auth."
        );
    }
    if config.worker.batch_min == 0 || config.worker.batch_min > config.worker.batch_max {
        bail!("worker.batch_min must be in 1..=worker.batch_max");
    }
    if config.bus.partitions == 0 {
        bail!("bus.partitions must be at least 1");
    }
    if config.ingest.max_batch_size == 0 {
        bail!("ingest.max_batch_size must be at least 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.ingest.max_batch_size, 1000);
        assert_eq!(cfg.ingest.rate_limit_rpm, 1000);
        assert_eq!(cfg.worker.target_batch_size, 100);
        assert_eq!(cfg.worker.breaker_fail_threshold, 5);
        assert_eq!(cfg.worker.breaker_cooldown, Duration::from_secs(60));
        assert_eq!(cfg.retention.raw_days, 90);
        assert_eq!(cfg.signals.sigma_k, 3.0);
        assert_eq!(cfg.live.buffer, 256);
        assert!(!cfg.ingest.preagg.enabled);
    }

    #[test]
    fn yaml_sections_deserialize_with_humantime_durations() {
        let cfg: AppConfig = serde_yaml::from_str(
            r#"
worker:
  max_flush_interval: 250ms
  breaker_cooldown: 5s
signals:
  baseline_window: 2d
"#,
        )
        .expect("parse");
        assert_eq!(cfg.worker.max_flush_interval, Duration::from_millis(250));
        assert_eq!(cfg.worker.breaker_cooldown, Duration::from_secs(5));
        assert_eq!(
            cfg.signals.baseline_window,
            Duration::from_secs(2 * 24 * 3600)
        );
        // Untouched sections keep their defaults.
        assert_eq!(cfg.worker.batch_max, 10_000);
    }

    #[test]
    fn api_keys_in_yaml_are_refused() {
        let cfg: AppConfig = serde_yaml::from_str(
            r#"
auth:
  enabled: true
  api_keys: ["secret"]
"#,
        )
        .expect("parse");
        assert!(enforce_yaml_policy(&cfg).is_err());
    }

    #[test]
    fn auth_requires_keys() {
        let mut cfg = AppConfig::default();
        cfg.auth.enabled = true;
        assert!(validate(&cfg).is_err());
        cfg.auth.api_keys.push("k".into());
        assert!(validate(&cfg).is_ok());
    }
}
