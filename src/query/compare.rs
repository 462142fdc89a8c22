//! Cohort comparison with significance testing.
//!
//! Both sides are reduced to per-minute bucket means, then compared with
//! Welch's two-sample t-test at the two-sided 5% level. Significance
//! additionally requires at least 30 buckets on each side.

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::storage::MetricStore;

pub const MIN_BUCKETS: usize = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct CompareRequest {
    pub baseline_service: String,
    pub candidate_service: String,
    pub metric_name: String,
    pub time_start: i64,
    pub time_end: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideStats {
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub metric_name: String,
    pub baseline: SideStats,
    pub candidate: SideStats,
    /// Positive when the candidate mean is lower than the baseline mean.
    pub improvement_pct: f64,
    pub significant: bool,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Deploy,
    Hold,
    Reject,
}

pub async fn run(
    store: &dyn MetricStore,
    request: &CompareRequest,
) -> Result<ComparisonResult, ApiError> {
    if request.time_end <= request.time_start {
        return Err(ApiError::bad_request("time_end must be after time_start"));
    }

    let baseline = bucket_means(store, &request.baseline_service, request).await?;
    let candidate = bucket_means(store, &request.candidate_service, request).await?;
    if baseline.is_empty() || candidate.is_empty() {
        return Err(ApiError::bad_request(
            "insufficient data for comparison on one or both sides",
        ));
    }

    analyze(&request.metric_name, &baseline, &candidate)
}

async fn bucket_means(
    store: &dyn MetricStore,
    service: &str,
    request: &CompareRequest,
) -> Result<Vec<f64>, ApiError> {
    let series = store
        .minute_series(
            service,
            &request.metric_name,
            request.time_start,
            request.time_end,
        )
        .await?;
    Ok(series.into_iter().map(|(_, mean)| mean).collect())
}

pub fn analyze(
    metric_name: &str,
    baseline: &[f64],
    candidate: &[f64],
) -> Result<ComparisonResult, ApiError> {
    let baseline_stats = side_stats(baseline);
    let candidate_stats = side_stats(candidate);
    if baseline_stats.mean == 0.0 {
        return Err(ApiError::bad_request(
            "baseline mean is zero; improvement is undefined",
        ));
    }

    let improvement_pct =
        (baseline_stats.mean - candidate_stats.mean) / baseline_stats.mean * 100.0;

    let enough_data = baseline.len() >= MIN_BUCKETS && candidate.len() >= MIN_BUCKETS;
    let significant = enough_data && welch_significant(baseline, candidate);

    let recommendation = if !significant {
        Recommendation::Hold
    } else if improvement_pct > 0.0 {
        Recommendation::Deploy
    } else {
        Recommendation::Reject
    };

    Ok(ComparisonResult {
        metric_name: metric_name.to_string(),
        baseline: baseline_stats,
        candidate: candidate_stats,
        improvement_pct,
        significant,
        recommendation,
    })
}

fn side_stats(values: &[f64]) -> SideStats {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let nearest = |q: f64| {
        if sorted.is_empty() {
            return 0.0;
        }
        let index = ((sorted.len() as f64) * q) as usize;
        sorted[index.min(sorted.len() - 1)]
    };
    SideStats {
        mean: mean(values),
        p50: nearest(0.50),
        p95: nearest(0.95),
        p99: nearest(0.99),
        count: values.len(),
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

/// Welch's t-test: true when the two-sided p-value is below 0.05.
fn welch_significant(a: &[f64], b: &[f64]) -> bool {
    let (mean_a, mean_b) = (mean(a), mean(b));
    let var_a = sample_variance(a, mean_a) / a.len() as f64;
    let var_b = sample_variance(b, mean_b) / b.len() as f64;
    let se = (var_a + var_b).sqrt();
    if se == 0.0 {
        // Degenerate distributions: any difference in means is exact.
        return mean_a != mean_b;
    }

    let t = (mean_a - mean_b).abs() / se;
    // Welch–Satterthwaite degrees of freedom.
    let df = (var_a + var_b).powi(2)
        / (var_a.powi(2) / (a.len() - 1) as f64 + var_b.powi(2) / (b.len() - 1) as f64);
    t > t_critical_975(df)
}

/// Two-sided 5% critical value of Student's t, interpolated by degrees of
/// freedom.
fn t_critical_975(df: f64) -> f64 {
    const TABLE: &[(f64, f64)] = &[
        (1.0, 12.706),
        (2.0, 4.303),
        (3.0, 3.182),
        (5.0, 2.571),
        (10.0, 2.228),
        (15.0, 2.131),
        (20.0, 2.086),
        (25.0, 2.060),
        (30.0, 2.042),
        (40.0, 2.021),
        (60.0, 2.000),
        (80.0, 1.990),
        (120.0, 1.980),
    ];
    if df <= TABLE[0].0 {
        return TABLE[0].1;
    }
    for window in TABLE.windows(2) {
        let (lo_df, lo_t) = window[0];
        let (hi_df, hi_t) = window[1];
        if df <= hi_df {
            let fraction = (df - lo_df) / (hi_df - lo_df);
            return lo_t + fraction * (hi_t - lo_t);
        }
    }
    1.96
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic jitter so the variance is small but nonzero.
    fn series(center: f64, buckets: usize) -> Vec<f64> {
        (0..buckets)
            .map(|i| center + f64::from(i as u32 % 5) * 0.5 - 1.0)
            .collect()
    }

    #[test]
    fn clear_latency_win_recommends_deploy() {
        let baseline = series(200.0, 40);
        let candidate = series(150.0, 40);
        let result = analyze("http.duration", &baseline, &candidate).expect("analyze");
        assert!(result.significant);
        assert!((result.improvement_pct - 25.0).abs() < 1.0);
        assert_eq!(result.recommendation, Recommendation::Deploy);
        assert_eq!(result.baseline.count, 40);
    }

    #[test]
    fn regression_recommends_reject() {
        let baseline = series(150.0, 40);
        let candidate = series(200.0, 40);
        let result = analyze("http.duration", &baseline, &candidate).expect("analyze");
        assert!(result.significant);
        assert!(result.improvement_pct < 0.0);
        assert_eq!(result.recommendation, Recommendation::Reject);
    }

    #[test]
    fn too_few_buckets_never_reaches_significance() {
        let baseline = series(200.0, 10);
        let candidate = series(150.0, 10);
        let result = analyze("http.duration", &baseline, &candidate).expect("analyze");
        assert!(!result.significant);
        assert_eq!(result.recommendation, Recommendation::Hold);
    }

    #[test]
    fn overlapping_distributions_hold() {
        let baseline = series(200.0, 40);
        let candidate = series(200.2, 40);
        let result = analyze("http.duration", &baseline, &candidate).expect("analyze");
        assert!(!result.significant);
        assert_eq!(result.recommendation, Recommendation::Hold);
    }

    #[test]
    fn zero_baseline_mean_is_a_client_error() {
        let baseline = vec![0.0; 40];
        let candidate = series(10.0, 40);
        assert!(analyze("x", &baseline, &candidate).is_err());
    }

    #[test]
    fn critical_value_interpolates_sensibly() {
        assert!((t_critical_975(30.0) - 2.042).abs() < 1e-9);
        assert!(t_critical_975(50.0) < t_critical_975(30.0));
        assert!((t_critical_975(10_000.0) - 1.96).abs() < 1e-9);
        // More freedom never raises the bar.
        assert!(t_critical_975(60.0) >= t_critical_975(120.0));
    }
}
