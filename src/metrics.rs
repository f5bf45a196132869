//! Small numeric helpers shared by the quality, QC and comparison code

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Population standard deviation (divides by n).
pub fn population_std(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// Mean and population standard deviation of the first `n` values.
pub fn baseline_stats(values: &[f64], n: usize) -> Option<(f64, f64)> {
    let baseline = &values[..n.min(values.len())];
    Some((mean(baseline)?, population_std(baseline)?))
}

/// Pearson correlation of paired samples.
///
/// `None` for fewer than two pairs, mismatched lengths or zero variance.
pub fn pearson_r(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let mx = mean(xs)?;
    let my = mean(ys)?;

    let mut num = 0.0;
    let mut den_x = 0.0;
    let mut den_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mx;
        let dy = y - my;
        num += dx * dy;
        den_x += dx * dx;
        den_y += dy * dy;
    }

    let denom = (den_x * den_y).sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return None;
    }
    Some(num / denom)
}

/// 0 points at or below `low`, `max_points` at or above `high`, linear between.
pub fn linear_score(value: f64, low: f64, high: f64, max_points: f64) -> f64 {
    if value <= low {
        0.0
    } else if value >= high {
        max_points
    } else {
        max_points * (value - low) / (high - low)
    }
}

/// Round to a fixed number of decimals for reporting.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_std() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
        let std = population_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((std - 2.0).abs() < 1e-12);
        assert_eq!(baseline_stats(&[1.0, 1.0, 9.0], 2), Some((1.0, 0.0)));
    }

    #[test]
    fn test_pearson() {
        let r = pearson_r(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]).unwrap();
        assert!((r - 1.0).abs() < 1e-12);
        let r = pearson_r(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]).unwrap();
        assert!((r + 1.0).abs() < 1e-12);
        assert_eq!(pearson_r(&[1.0], &[1.0]), None);
        assert_eq!(pearson_r(&[1.0, 1.0], &[1.0, 2.0]), None);
    }

    #[test]
    fn test_linear_score() {
        assert_eq!(linear_score(0.05, 0.1, 2.0, 40.0), 0.0);
        assert_eq!(linear_score(3.0, 0.1, 2.0, 40.0), 40.0);
        assert!((linear_score(1.05, 0.1, 2.0, 40.0) - 20.0).abs() < 1e-12);
        assert_eq!(round_to(80.04, 1), 80.0);
    }
}
