//! Suggested display cycle from NTC amplification onset
//!
//! Late cycles in allele-discrimination runs are often polluted by
//! non-specific amplification in the no-template controls. The suggested
//! cycle is the one just before the earliest NTC onset, so the scatter plot
//! opens on clean clusters.
//!
//! NTC wells are found from the data itself (signal delta gap), so this
//! works for exports that carry no content types.

use crate::metrics::baseline_stats;
use crate::model::Dataset;
use crate::well::WellId;
use std::collections::BTreeMap;

/// Minimum cycles in the window for any analysis
const MIN_WINDOW_CYCLES: usize = 5;
/// Minimum complete curves on the plate
const MIN_WELLS: usize = 3;
/// At most this many wells are treated as NTC candidates
const MAX_NTC_CANDIDATES: usize = 4;
/// Jump factor between consecutive sorted deltas that marks the gap
const GAP_FACTOR: f64 = 3.0;
/// Gap must sit below this fraction of the largest delta
const GAP_CEILING: f64 = 0.15;
/// Fallback: deltas under this fraction of the median are NTC candidates
const MEDIAN_FRACTION: f64 = 0.05;

const D2_BASELINE: usize = 5;
const D2_SIGMA: f64 = 5.0;
const MIN_CONSECUTIVE_RISES: usize = 3;

/// Raw FAM + allele 2 per well over `cycles`; wells missing a cycle are dropped.
fn window_curves(dataset: &Dataset, cycles: &[u32]) -> BTreeMap<WellId, Vec<f64>> {
    let mut per_well: BTreeMap<WellId, BTreeMap<u32, f64>> = BTreeMap::new();
    let (first, last) = match (cycles.first(), cycles.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => return BTreeMap::new(),
    };
    for s in &dataset.samples {
        if s.cycle >= first && s.cycle <= last {
            per_well.entry(s.well).or_default().insert(s.cycle, s.fam + s.allele2);
        }
    }
    per_well
        .into_iter()
        .filter_map(|(well, by_cycle)| {
            let curve: Option<Vec<f64>> = cycles.iter().map(|c| by_cycle.get(c).copied()).collect();
            curve.map(|c| (well, c))
        })
        .collect()
}

/// Wells whose total rise sits below a clear gap in the sorted deltas.
pub fn detect_ntc_wells(curves: &BTreeMap<WellId, Vec<f64>>) -> Vec<WellId> {
    let mut deltas: Vec<(WellId, f64)> = curves
        .iter()
        .filter_map(|(well, c)| Some((*well, c.last()? - c.first()?)))
        .collect();
    deltas.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let max_delta = match deltas.last() {
        Some(&(_, d)) if d > 0.0 => d,
        _ => return Vec::new(),
    };

    let gap = deltas.windows(2).position(|pair| {
        let current = pair[0].1.abs();
        let next = pair[1].1.abs();
        next > GAP_FACTOR * current.max(1.0) && current < max_delta * GAP_CEILING
    });

    let candidates: Vec<WellId> = match gap {
        Some(index) => deltas[..=index].iter().map(|(w, _)| *w).collect(),
        None => {
            let mut magnitudes: Vec<f64> = deltas.iter().map(|(_, d)| d.abs()).collect();
            magnitudes.sort_by(f64::total_cmp);
            let median = magnitudes[magnitudes.len() / 2];
            if median <= 0.0 {
                return Vec::new();
            }
            deltas
                .iter()
                .filter(|(_, d)| d.abs() < median * MEDIAN_FRACTION)
                .map(|(w, _)| *w)
                .collect()
        }
    };
    candidates.into_iter().take(MAX_NTC_CANDIDATES).collect()
}

/// First cycle whose second derivative leaves the baseline noise and is
/// followed by at least three consecutive rises.
pub fn second_derivative_onset(curve: &[f64], cycles: &[u32]) -> Option<u32> {
    let n = curve.len();
    if n < MIN_WINDOW_CYCLES || cycles.len() != n {
        return None;
    }
    // d2[j] belongs to curve index j + 1
    let d2: Vec<f64> = (1..n - 1).map(|j| curve[j + 1] - 2.0 * curve[j] + curve[j - 1]).collect();
    if d2.len() < D2_BASELINE + 2 {
        return None;
    }

    let baseline_n = D2_BASELINE.min(d2.len() / 2);
    let (mean, std) = baseline_stats(&d2, baseline_n)?;
    let threshold = mean + D2_SIGMA * std.max(1e-6);

    let onset_d2 = (2..d2.len()).find(|&i| d2[i] > threshold)?;
    let onset = onset_d2 + 1;

    let rises = (onset..n - 1).take_while(|&i| curve[i + 1] > curve[i]).count();
    if rises < MIN_CONSECUTIVE_RISES {
        return None;
    }
    Some(cycles[onset])
}

/// Cycle just before the earliest NTC onset, clamped to the
/// amplification window. The window end when no NTC amplifies;
/// `None` without an amplification window.
pub fn suggested_cycle(dataset: &Dataset) -> Option<u32> {
    let window = dataset.amplification_window()?;
    let cycles: Vec<u32> = dataset
        .cycles
        .iter()
        .copied()
        .filter(|c| *c >= window.start_cycle && *c <= window.end_cycle)
        .collect();
    if cycles.len() < MIN_WINDOW_CYCLES {
        return Some(window.end_cycle);
    }

    let curves = window_curves(dataset, &cycles);
    if curves.len() < MIN_WELLS {
        return Some(window.end_cycle);
    }

    let ntc = detect_ntc_wells(&curves);
    log::debug!("NTC candidates from signal gap: {:?}", ntc);
    let earliest = ntc
        .iter()
        .filter_map(|w| curves.get(w))
        .filter_map(|curve| second_derivative_onset(curve, &cycles))
        .min();

    match earliest {
        Some(onset) => {
            let suggested = onset.saturating_sub(1).clamp(window.start_cycle, window.end_cycle);
            log::info!("NTC amplification starts at cycle {}; suggesting cycle {}", onset, suggested);
            Some(suggested)
        }
        None => Some(window.end_cycle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataWindow, InstrumentFamily};
    use crate::normalize::tests::{dataset_from, well};

    /// Flat at `base` with small alternating noise, then doubling from `start`.
    fn curve(base: f64, start: usize, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let noise = if i % 2 == 0 { 0.5 } else { -0.5 };
                if i + 1 >= start {
                    base + 10.0 * 2f64.powi((i + 2 - start) as i32)
                } else {
                    base + noise
                }
            })
            .collect()
    }

    fn plate(ntc_start: usize) -> Dataset {
        let n = 30;
        let mut readings = Vec::new();
        let curves = [
            ("A1", curve(100.0, 15, n)),
            ("A2", curve(100.0, 16, n)),
            ("A3", curve(100.0, 15, n)),
            ("A4", curve(100.0, ntc_start, n)),
        ];
        for (w, values) in &curves {
            for (i, v) in values.iter().enumerate() {
                readings.push((*w, i as u32 + 1, *v, 0.0, None));
            }
        }
        let mut ds = dataset_from(InstrumentFamily::CfxOpus, &readings);
        ds.data_windows.push(DataWindow {
            name: "Amplification".to_string(),
            start_cycle: 1,
            end_cycle: n as u32,
        });
        ds
    }

    #[test]
    fn test_late_ntc_onset_sets_suggested_cycle() {
        // A4 only starts rising at cycle 27, so its delta is far below the others
        let ds = plate(27);
        let cycles: Vec<u32> = (1..=30).collect();
        let curves = window_curves(&ds, &cycles);
        assert_eq!(detect_ntc_wells(&curves), vec![well("A4")]);
        let onset = second_derivative_onset(&curves[&well("A4")], &cycles).unwrap();
        assert!((26..=28).contains(&onset));
        assert_eq!(suggested_cycle(&ds), Some(onset - 1));
    }

    #[test]
    fn test_no_window_or_short_window() {
        let mut ds = plate(27);
        ds.data_windows.clear();
        assert_eq!(suggested_cycle(&ds), None);

        let short = dataset_from(
            InstrumentFamily::CfxOpus,
            &[("A1", 1, 1.0, 1.0, None), ("A1", 2, 2.0, 1.0, None)],
        );
        let mut short = short;
        short.data_windows.push(DataWindow {
            name: "Amplification".to_string(),
            start_cycle: 1,
            end_cycle: 2,
        });
        assert_eq!(suggested_cycle(&short), Some(2));
    }

    #[test]
    fn test_flat_curves_have_no_onset() {
        let flat = vec![100.0; 12];
        let cycles: Vec<u32> = (1..=12).collect();
        assert_eq!(second_derivative_onset(&flat, &cycles), None);
    }
}
