//! Threshold-cycle (Ct) calculation with an automatic threshold
//!
//! Threshold = baseline mean + 10 standard deviations, baseline being the
//! first five cycles (or half the series if shorter). Ct is the linearly
//! interpolated crossing of that threshold.

use crate::error::NormalizationError;
use crate::metrics::{baseline_stats, round_to};
use crate::model::Dataset;
use crate::normalize::{by_well, normalize_all, RoxMode};
use crate::well::WellId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const BASELINE_CYCLES: usize = 5;
const N_SIGMA: f64 = 10.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CtResult {
    /// Fractional cycle, `None` when the curve never crosses
    pub ct: Option<f64>,
    pub threshold: f64,
    pub baseline_mean: f64,
    pub baseline_std: f64,
}

impl CtResult {
    fn empty() -> Self {
        Self {
            ct: None,
            threshold: 0.0,
            baseline_mean: 0.0,
            baseline_std: 0.0,
        }
    }
}

/// Ct of one channel. `values[i]` is the reading at `cycles[i]`.
///
/// An explicit `threshold` overrides the automatic one.
pub fn calculate_ct(values: &[f64], cycles: &[u32], threshold: Option<f64>) -> CtResult {
    if values.len() < 3 || values.len() != cycles.len() {
        return CtResult::empty();
    }
    let baseline_n = BASELINE_CYCLES.min(values.len() / 2).max(1);
    let Some((mean, std)) = baseline_stats(values, baseline_n) else {
        return CtResult::empty();
    };
    let threshold = threshold.unwrap_or(mean + N_SIGMA * std);

    let mut ct = None;
    for i in 0..values.len() - 1 {
        let (lo, hi) = (values[i], values[i + 1]);
        if lo < threshold && threshold <= hi {
            let step = (cycles[i + 1] - cycles[i]) as f64;
            let denom = hi - lo;
            ct = Some(if denom > 0.0 {
                cycles[i] as f64 + (threshold - lo) / denom * step
            } else {
                cycles[i] as f64
            });
            break;
        }
    }

    CtResult {
        ct: ct.map(|c| round_to(c, 2)),
        threshold: round_to(threshold, 4),
        baseline_mean: round_to(mean, 4),
        baseline_std: round_to(std, 4),
    }
}

/// Ct of both allele channels of one well
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WellCt {
    pub well: WellId,
    pub fam: CtResult,
    pub allele2: CtResult,
}

/// Ct for every well. Non-finite readings are left out of the curve.
pub fn calculate_all_ct(dataset: &Dataset, mode: RoxMode) -> Result<BTreeMap<WellId, WellCt>, NormalizationError> {
    let grouped = by_well(&normalize_all(dataset, mode)?);
    Ok(grouped
        .into_iter()
        .map(|(well, series)| {
            let usable: Vec<_> = series.into_iter().filter(|p| p.is_finite()).collect();
            let cycles: Vec<u32> = usable.iter().map(|p| p.cycle).collect();
            let fam: Vec<f64> = usable.iter().map(|p| p.norm_fam).collect();
            let allele2: Vec<f64> = usable.iter().map(|p| p.norm_allele2).collect();
            let result = WellCt {
                well,
                fam: calculate_ct(&fam, &cycles, None),
                allele2: calculate_ct(&allele2, &cycles, None),
            };
            (well, result)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstrumentFamily;
    use crate::normalize::tests::{dataset_from, well};

    #[test]
    fn test_interpolated_crossing() {
        let values = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 2.0, 6.0, 20.0, 40.0];
        let cycles: Vec<u32> = (1..=10).collect();
        let result = calculate_ct(&values, &cycles, Some(4.0));
        // Between cycle 7 (2.0) and 8 (6.0): 7 + 2/4
        assert_eq!(result.ct, Some(7.5));
        assert_eq!(result.baseline_mean, 1.0);
    }

    #[test]
    fn test_auto_threshold_from_baseline_noise() {
        let values = [1.0, 1.1, 0.9, 1.0, 1.0, 1.0, 1.0, 3.0, 9.0, 12.0];
        let cycles: Vec<u32> = (1..=10).collect();
        let result = calculate_ct(&values, &cycles, None);
        // std of the first five = sqrt(0.004); threshold = 1 + 10 * 0.0632
        assert!((result.threshold - 1.6325).abs() < 1e-9);
        assert_eq!(result.ct, Some(7.32));
    }

    #[test]
    fn test_flat_baseline_never_crosses_itself() {
        let values = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let cycles: Vec<u32> = (1..=7).collect();
        let result = calculate_ct(&values, &cycles, None);
        assert_eq!(result.threshold, 1.0);
        assert_eq!(result.ct, None);
    }

    #[test]
    fn test_no_crossing_and_short_series() {
        let flat = [1.0, 1.2, 0.9, 1.1, 1.0, 1.05, 0.95, 1.0];
        let cycles: Vec<u32> = (1..=8).collect();
        assert_eq!(calculate_ct(&flat, &cycles, None).ct, None);
        assert_eq!(calculate_ct(&[1.0, 2.0], &[1, 2], None), CtResult::empty());
    }

    #[test]
    fn test_all_wells() {
        let mut readings = Vec::new();
        for (cycle, fam) in [(1, 10.0), (2, 11.0), (3, 9.0), (4, 10.0), (5, 400.0), (6, 900.0)] {
            readings.push(("A1", cycle, fam, 5.0, None));
        }
        let ds = dataset_from(InstrumentFamily::CfxOpus, &readings);
        let all = calculate_all_ct(&ds, RoxMode::Raw).unwrap();
        let a1 = all[&well("A1")];
        assert!(a1.fam.ct.is_some());
        assert_eq!(a1.allele2.ct, None);
    }
}
