//! Service health scores.
//!
//! A pure function of one service window: same inputs, same score. The
//! reference points are operator-tunable through `signals.*`.

use serde::Serialize;

use crate::config::SignalsConfig;
use crate::storage::ServiceWindowStats;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthScore {
    pub service_name: String,
    pub overall_score: f64,
    pub error_rate_score: f64,
    pub latency_score: f64,
    pub traffic_score: f64,
    pub status: HealthStatus,
    pub error_rate: f64,
    pub p95_latency_ms: Option<f64>,
    pub request_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

pub fn compute(
    service_name: &str,
    stats: &ServiceWindowStats,
    tuning: &SignalsConfig,
) -> HealthScore {
    let error_rate = stats.error_count as f64 / (stats.request_count.max(1)) as f64;
    let error_rate_score = 100.0 * (1.0 - clamp01(error_rate / tuning.err_ref));

    let latency_score = match stats.p95_latency_ms {
        Some(p95) => {
            let span = tuning.lat_ref_hi_ms - tuning.lat_ref_lo_ms;
            100.0 * (1.0 - clamp01((p95 - tuning.lat_ref_lo_ms) / span))
        }
        // No latency signal in the window: neutral rather than perfect.
        None => 50.0,
    };

    let traffic_score = 100.0
        * clamp01((1.0 + stats.request_count as f64).log10() / (1.0 + tuning.traffic_ref).log10());

    let overall_score =
        (0.5 * error_rate_score + 0.3 * latency_score + 0.2 * traffic_score).clamp(0.0, 100.0);

    let status = if overall_score >= 80.0 {
        HealthStatus::Healthy
    } else if overall_score >= 50.0 {
        HealthStatus::Warning
    } else {
        HealthStatus::Critical
    };

    HealthScore {
        service_name: service_name.to_string(),
        overall_score,
        error_rate_score,
        latency_score,
        traffic_score,
        status,
        error_rate,
        p95_latency_ms: stats.p95_latency_ms,
        request_count: stats.request_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> SignalsConfig {
        SignalsConfig::default()
    }

    fn stats(requests: u64, errors: u64, p95: Option<f64>) -> ServiceWindowStats {
        ServiceWindowStats {
            request_count: requests,
            error_count: errors,
            p95_latency_ms: p95,
        }
    }

    #[test]
    fn clean_fast_busy_service_scores_high() {
        let score = compute("api", &stats(10_000, 0, Some(50.0)), &tuning());
        assert_eq!(score.error_rate_score, 100.0);
        assert_eq!(score.latency_score, 100.0);
        assert!(score.traffic_score > 99.0);
        assert!(score.overall_score > 99.0);
        assert_eq!(score.status, HealthStatus::Healthy);
    }

    #[test]
    fn error_rate_at_reference_zeroes_the_error_score() {
        // 5% errors is err_ref, so the error component bottoms out.
        let score = compute("api", &stats(1_000, 50, Some(50.0)), &tuning());
        assert_eq!(score.error_rate_score, 0.0);
        assert!((score.error_rate - 0.05).abs() < 1e-9);
    }

    #[test]
    fn latency_interpolates_between_references() {
        // 550ms is halfway between 100ms and 1000ms.
        let score = compute("api", &stats(1_000, 0, Some(550.0)), &tuning());
        assert!((score.latency_score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn zero_traffic_does_not_divide_by_zero() {
        let score = compute("api", &stats(0, 0, None), &tuning());
        assert_eq!(score.error_rate, 0.0);
        assert_eq!(score.traffic_score, 0.0);
        assert_eq!(score.latency_score, 50.0);
    }

    #[test]
    fn status_bands_split_at_80_and_50() {
        // All errors, no traffic: deep critical.
        let critical = compute("api", &stats(100, 100, Some(2_000.0)), &tuning());
        assert_eq!(critical.status, HealthStatus::Critical);

        // Moderate errors keep the service in the warning band.
        let warning = compute("api", &stats(10_000, 300, Some(400.0)), &tuning());
        assert_eq!(warning.status, HealthStatus::Warning);
        assert!(warning.overall_score >= 50.0 && warning.overall_score < 80.0);
    }

    #[test]
    fn health_score_is_a_pure_function() {
        let input = stats(5_000, 12, Some(220.0));
        let first = compute("api", &input, &tuning());
        let second = compute("api", &input, &tuning());
        assert_eq!(first, second);
    }
}
