/// Simple moving average of the last `period` values.
///
/// `None` when `period` is zero or there are fewer than `period` values.
pub fn calculate_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Exponential moving average over the whole series, seeded with the SMA of
/// the first `period` values.
pub fn calculate_ema(values: &[f64], period: usize) -> Option<f64> {
    let seed = calculate_sma(values.get(..period)?, period)?;
    let alpha = 2.0 / (period as f64 + 1.0);

    Some(
        values[period..]
            .iter()
            .fold(seed, |ema, value| ema + alpha * (value - ema)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma_uses_trailing_window() {
        let values = vec![1.0, 100.0, 102.0, 104.0, 106.0, 108.0];
        assert_eq!(calculate_sma(&values, 5), Some(104.0));
        assert_eq!(calculate_sma(&values, 1), Some(108.0));
    }

    #[test]
    fn test_sma_insufficient_or_zero_period() {
        assert!(calculate_sma(&[100.0, 102.0], 5).is_none());
        assert!(calculate_sma(&[100.0], 0).is_none());
    }

    #[test]
    fn test_ema_equals_sma_when_no_extra_values() {
        let values = vec![2.0, 4.0, 6.0];
        assert_eq!(calculate_ema(&values, 3), Some(4.0));
    }

    #[test]
    fn test_ema_weights_recent_values() {
        // Seed 4.0, alpha 0.5: 4 -> 6 -> 8
        let values = vec![2.0, 4.0, 6.0, 8.0, 10.0];
        assert_eq!(calculate_ema(&values, 3), Some(8.0));

        assert!(calculate_ema(&values, 6).is_none());
        assert!(calculate_ema(&values, 0).is_none());
    }
}
