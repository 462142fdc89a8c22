/// Consumer lag below which the base batch size applies unchanged.
const LAG_KNEE: f64 = 1_000.0;

/// Backpressure-adjusted flush threshold.
///
/// The multiplier doubles per order of magnitude of lag above the knee:
/// small backlogs keep batches small for latency, deep backlogs grow them
/// for write throughput. Non-decreasing in `lag` by construction.
pub fn target_batch_size(base: usize, lag: u64, batch_min: usize, batch_max: usize) -> usize {
    let lag = lag as f64;
    let multiplier = if lag <= LAG_KNEE {
        1.0
    } else {
        2f64.powf((lag.log10() - LAG_KNEE.log10()).max(0.0))
    };
    let target = (base as f64 * multiplier).round() as usize;
    target.clamp(batch_min, batch_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_lag_keeps_the_base_size() {
        assert_eq!(target_batch_size(100, 0, 10, 10_000), 100);
        assert_eq!(target_batch_size(100, 500, 10, 10_000), 100);
        assert_eq!(target_batch_size(100, 1_000, 10, 10_000), 100);
    }

    #[test]
    fn doubles_per_decade_of_lag() {
        assert_eq!(target_batch_size(100, 10_000, 10, 100_000), 200);
        assert_eq!(target_batch_size(100, 100_000, 10, 100_000), 400);
        assert_eq!(target_batch_size(100, 1_000_000, 10, 100_000), 800);
    }

    #[test]
    fn clamped_to_configured_bounds() {
        assert_eq!(target_batch_size(100, 0, 150, 10_000), 150);
        assert_eq!(target_batch_size(100, u64::MAX, 10, 5_000), 5_000);
    }

    #[test]
    fn non_decreasing_in_lag() {
        let mut last = 0;
        for lag in (0..7).map(|exp| 10u64.pow(exp)) {
            let target = target_batch_size(100, lag, 10, 1_000_000);
            assert!(target >= last, "target shrank at lag {lag}");
            last = target;
        }
    }
}
