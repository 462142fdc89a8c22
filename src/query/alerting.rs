//! Adaptive-threshold alerting.
//!
//! Each (service, metric) pair keeps a rolling baseline of per-minute
//! bucket means. Bounds are mean ± k·sigma, falling back to ±20% of the
//! mean when sigma is degenerate. Two consecutive breaching evaluations
//! fire an alert; three consecutive in-bound evaluations resolve it. A
//! resolved pair that breaches again gets a fresh alert id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SignalsConfig;
use crate::metrics::AppMetrics;
use crate::model::{Alert, AlertSeverity, AlertStatus, MINUTE_MS};
use crate::storage::MetricStore;

const MIN_BASELINE_POINTS: usize = 10;
const FIRE_AFTER_BREACHES: u32 = 2;
const RESOLVE_AFTER_OK: u32 = 3;

#[derive(Default)]
struct PairState {
    consec_breaches: u32,
    consec_ok: u32,
    breach_started_ms: Option<i64>,
    active: Option<Alert>,
}

pub struct AlertEngine {
    store: Arc<dyn MetricStore>,
    config: SignalsConfig,
    metrics: AppMetrics,
    pairs: HashMap<(String, String), PairState>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn MetricStore>, config: SignalsConfig, metrics: AppMetrics) -> Self {
        Self {
            store,
            config,
            metrics,
            pairs: HashMap::new(),
        }
    }

    /// Resume firing alerts after a restart so dedup survives.
    pub async fn load_active(&mut self) -> Result<()> {
        for alert in self.store.active_alerts().await? {
            let key = (alert.service_name.clone(), alert.metric_name.clone());
            let state = self.pairs.entry(key).or_default();
            state.consec_breaches = FIRE_AFTER_BREACHES;
            state.breach_started_ms = Some(alert.first_triggered);
            state.active = Some(alert);
        }
        if !self.pairs.is_empty() {
            info!(pairs = self.pairs.len(), "resumed firing alerts");
        }
        Ok(())
    }

    /// One evaluation tick over every pair seen in the last day.
    pub async fn evaluate_once(&mut self, now_ms: i64) -> Result<()> {
        self.metrics.inc_evaluations();
        let pairs = self
            .store
            .metric_pairs(now_ms - 24 * 3600 * 1000)
            .await?;
        for (service, metric) in pairs {
            if let Err(err) = self.evaluate_pair(&service, &metric, now_ms).await {
                warn!(service, metric, error = ?err, "pair evaluation failed");
            }
        }
        Ok(())
    }

    async fn evaluate_pair(&mut self, service: &str, metric: &str, now_ms: i64) -> Result<()> {
        let baseline_start = now_ms - self.config.baseline_window.as_millis() as i64;
        let baseline_end = now_ms - 2 * MINUTE_MS;
        let baseline = self
            .store
            .minute_series(service, metric, baseline_start, baseline_end)
            .await?;
        if baseline.len() < MIN_BASELINE_POINTS {
            return Ok(());
        }

        let recent = self
            .store
            .minute_series(service, metric, now_ms - 2 * MINUTE_MS, now_ms)
            .await?;
        let Some((_, current)) = recent.last().copied() else {
            return Ok(());
        };

        let values: Vec<f64> = baseline.iter().map(|(_, mean)| *mean).collect();
        let mu = values.iter().sum::<f64>() / values.len() as f64;
        let sigma =
            (values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64).sqrt();

        let k = self.config.sigma_k;
        let (expected_min, expected_max, z) = if sigma >= self.config.sigma_floor {
            (mu - k * sigma, mu + k * sigma, (current - mu).abs() / sigma)
        } else {
            // Degenerate baseline: fall back to ±20% of the mean and scale
            // z so the band edge still maps to k.
            let span = (0.2 * mu.abs()).max(self.config.sigma_floor);
            (mu - span, mu + span, (current - mu).abs() * k / span)
        };

        let key = (service.to_string(), metric.to_string());
        let state = self.pairs.entry(key).or_default();
        let breached = current < expected_min || current > expected_max;

        if breached {
            state.consec_ok = 0;
            state.consec_breaches += 1;
            state.breach_started_ms.get_or_insert(now_ms);

            if let Some(active) = &mut state.active {
                // Same pair still firing: update in place, never re-create.
                active.current_value = current;
                active.expected_min = expected_min;
                active.expected_max = expected_max;
                active.threshold_breach_count += 1;
                active.last_triggered = now_ms;
                active.severity = max_severity(active.severity, severity_for(z));
                active.message = breach_message(metric, current, expected_min, expected_max);
                self.store.upsert_alert(active).await?;
            } else if state.consec_breaches >= FIRE_AFTER_BREACHES {
                let severity = severity_for(z);
                let alert = Alert {
                    alert_id: Uuid::new_v4().to_string(),
                    service_name: service.to_string(),
                    metric_name: metric.to_string(),
                    severity,
                    status: AlertStatus::Firing,
                    message: breach_message(metric, current, expected_min, expected_max),
                    current_value: current,
                    expected_min,
                    expected_max,
                    threshold_breach_count: state.consec_breaches,
                    first_triggered: state.breach_started_ms.unwrap_or(now_ms),
                    last_triggered: now_ms,
                    resolved_at: None,
                };
                self.store.upsert_alert(&alert).await?;
                self.metrics.inc_alerts_fired(severity);
                warn!(
                    service,
                    metric,
                    current,
                    expected_min,
                    expected_max,
                    severity = severity.as_str(),
                    "alert firing"
                );
                state.active = Some(alert);
            } else {
                debug!(service, metric, current, "first breach; awaiting confirmation");
            }
        } else {
            state.consec_breaches = 0;
            state.breach_started_ms = None;
            if state.active.is_some() {
                state.consec_ok += 1;
                if state.consec_ok >= RESOLVE_AFTER_OK {
                    let mut resolved = state.active.take().expect("checked above");
                    resolved.status = AlertStatus::Resolved;
                    resolved.resolved_at = Some(now_ms);
                    self.store.upsert_alert(&resolved).await?;
                    self.metrics.inc_alerts_resolved();
                    info!(service, metric, "alert resolved");
                    state.consec_ok = 0;
                }
            } else {
                state.consec_ok = 0;
            }
        }
        Ok(())
    }
}

fn severity_for(z: f64) -> AlertSeverity {
    if z >= 5.0 {
        AlertSeverity::Critical
    } else if z >= 4.0 {
        AlertSeverity::Warning
    } else {
        AlertSeverity::Info
    }
}

fn max_severity(a: AlertSeverity, b: AlertSeverity) -> AlertSeverity {
    let rank = |s: AlertSeverity| match s {
        AlertSeverity::Info => 0,
        AlertSeverity::Warning => 1,
        AlertSeverity::Critical => 2,
    };
    if rank(b) > rank(a) { b } else { a }
}

fn breach_message(metric: &str, current: f64, expected_min: f64, expected_max: f64) -> String {
    if current > expected_max {
        format!("{metric} is abnormally high: {current:.2} (expected max {expected_max:.2})")
    } else {
        format!("{metric} is abnormally low: {current:.2} (expected min {expected_min:.2})")
    }
}

pub fn spawn(
    mut engine: AlertEngine,
    eval_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(eval_period = ?eval_period, "starting alert evaluation loop");
        if let Err(err) = engine.load_active().await {
            warn!(error = ?err, "failed to resume active alerts");
        }
        let mut ticker = time::interval(eval_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let now_ms = Utc::now().timestamp_millis();
            if let Err(err) = engine.evaluate_once(now_ms).await {
                error!(error = ?err, "alert evaluation pass failed");
            }
        }
    })
}
