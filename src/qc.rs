//! Plate-level quality control: call rate, NTC check, cluster separation
//! and the reference cross-talk advisory.

use crate::cluster::{effective_label, LayerVisibility};
use crate::error::NormalizationError;
use crate::metrics::{mean, pearson_r, round_to};
use crate::model::{ClusterAssignment, Dataset, GenotypeLabel, ManualOverrides, ThresholdConfig};
use crate::normalize::{normalize, NormalizedPoint, RoxMode};
use crate::well::WellId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative reference-dye growth that counts as rising
const CROSS_TALK_RISE: f64 = 0.2;
/// Correlation with the allele channels that counts as tracking them
const CROSS_TALK_CORRELATION: f64 = 0.9;

/// One control well checked for contamination
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NtcWell {
    pub well: WellId,
    pub norm_fam: f64,
    pub norm_allele2: f64,
    /// Signal reaches the NTC threshold on at least one axis
    pub contaminated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NtcCheck {
    /// No checked control well is contaminated
    pub ok: bool,
    /// Controls came from the export's content types rather than labels
    pub declared: bool,
    pub wells: Vec<NtcWell>,
}

/// Reference channel growing with the allele channels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrossTalkAdvisory {
    /// (last - first) / first of the mean reference reading
    pub rox_rise: f64,
    /// Pearson r between mean reference and mean FAM + allele 2 per cycle
    pub correlation: f64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QcResult {
    pub cycle: u32,
    /// Definite genotype calls / wells
    pub call_rate: f64,
    pub n_called: usize,
    pub n_total: usize,
    pub ntc_check: NtcCheck,
    /// Min inter-centroid distance / max intra-cluster spread
    pub cluster_separation: Option<f64>,
    #[serde(default)]
    pub cross_talk: Option<CrossTalkAdvisory>,
}

fn check_ntc(
    dataset: &Dataset,
    points: &[NormalizedPoint],
    labels: &BTreeMap<WellId, GenotypeLabel>,
    config: &ThresholdConfig,
) -> NtcCheck {
    let declared = dataset.has_ntc_identification();
    let wells: Vec<NtcWell> = points
        .iter()
        .filter(|p| {
            if declared {
                dataset.is_ntc(p.well)
            } else {
                labels.get(&p.well) == Some(&GenotypeLabel::Ntc)
            }
        })
        .map(|p| NtcWell {
            well: p.well,
            norm_fam: p.norm_fam,
            norm_allele2: p.norm_allele2,
            contaminated: !p.is_finite() || !config.is_ntc_signal(p.norm_fam, p.norm_allele2),
        })
        .collect();

    let contaminated = wells.iter().filter(|w| w.contaminated).count();
    if contaminated > 0 {
        log::warn!("{} of {} NTC wells show signal above the NTC threshold", contaminated, wells.len());
    }
    NtcCheck {
        ok: contaminated == 0,
        declared,
        wells,
    }
}

/// Separation of the automatic clusters; `None` with fewer than two.
pub fn cluster_separation(points: &[NormalizedPoint], assignment: &ClusterAssignment) -> Option<f64> {
    let mut clusters: BTreeMap<GenotypeLabel, Vec<(f64, f64)>> = BTreeMap::new();
    for p in points.iter().filter(|p| p.is_finite()) {
        if let Some(label) = assignment.get(&p.well) {
            clusters.entry(*label).or_default().push((p.norm_fam, p.norm_allele2));
        }
    }
    if clusters.len() < 2 {
        return None;
    }

    let centroids: Vec<(f64, f64)> = clusters
        .values()
        .map(|pts| {
            let n = pts.len() as f64;
            (
                pts.iter().map(|p| p.0).sum::<f64>() / n,
                pts.iter().map(|p| p.1).sum::<f64>() / n,
            )
        })
        .collect();
    let distance = |a: (f64, f64), b: (f64, f64)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();

    let mut min_inter = f64::INFINITY;
    for (i, &a) in centroids.iter().enumerate() {
        for &b in &centroids[i + 1..] {
            min_inter = min_inter.min(distance(a, b));
        }
    }

    let max_spread = clusters
        .values()
        .zip(&centroids)
        .flat_map(|(pts, &c)| pts.iter().map(move |&p| distance(p, c)))
        .fold(0.0, f64::max);

    let separation = if max_spread == 0.0 { min_inter } else { min_inter / max_spread };
    Some(round_to(separation, 6))
}

/// Advisory raised when the reference channel rises with the allele
/// channels. Never changes the normalization mode.
pub fn detect_cross_talk(dataset: &Dataset) -> Option<CrossTalkAdvisory> {
    if !dataset.has_rox || dataset.cycles.len() < 3 {
        return None;
    }
    let mut rox_means = Vec::new();
    let mut signal_means = Vec::new();
    for &cycle in &dataset.cycles {
        let at: Vec<_> = dataset.samples_at(cycle).into_iter().filter(|s| s.rox.is_some()).collect();
        let rox: Vec<f64> = at.iter().filter_map(|s| s.rox).collect();
        let signal: Vec<f64> = at.iter().map(|s| s.fam + s.allele2).collect();
        if let (Some(r), Some(s)) = (mean(&rox), mean(&signal)) {
            rox_means.push(r);
            signal_means.push(s);
        }
    }

    let first = *rox_means.first()?;
    let last = *rox_means.last()?;
    if first <= 0.0 {
        return None;
    }
    let rise = (last - first) / first;
    let correlation = pearson_r(&rox_means, &signal_means)?;
    if rise > CROSS_TALK_RISE && correlation >= CROSS_TALK_CORRELATION {
        log::warn!(
            "Reference channel rises {:.0}% and tracks the allele signal (r={:.3})",
            rise * 100.0,
            correlation
        );
        return Some(CrossTalkAdvisory {
            rox_rise: round_to(rise, 4),
            correlation: round_to(correlation, 4),
            message: "ROX signal grows with FAM/allele 2; it is likely spectral cross-talk. \
                      Ratio normalization may distort calls, prefer raw mode."
                .to_string(),
        });
    }
    None
}

/// Plate QC at one cycle (`0` = last).
pub fn plate_qc(
    dataset: &Dataset,
    cycle: u32,
    mode: RoxMode,
    config: &ThresholdConfig,
    assignment: &ClusterAssignment,
    overrides: &ManualOverrides,
) -> Result<QcResult, NormalizationError> {
    let points = normalize(dataset, cycle, mode)?;
    let cycle = points.first().map(|p| p.cycle).unwrap_or(cycle);

    let labels: BTreeMap<WellId, GenotypeLabel> = points
        .iter()
        .filter_map(|p| {
            effective_label(p.well, assignment, overrides, LayerVisibility::default()).map(|l| (p.well, l))
        })
        .collect();

    let n_total = points.len();
    let n_called = labels.values().filter(|l| l.is_definite_call()).count();
    let call_rate = if n_total > 0 { n_called as f64 / n_total as f64 } else { 0.0 };

    Ok(QcResult {
        cycle,
        call_rate: round_to(call_rate, 4),
        n_called,
        n_total,
        ntc_check: check_ntc(dataset, &points, &labels, config),
        cluster_separation: cluster_separation(&points, assignment),
        cross_talk: detect_cross_talk(dataset),
    })
}
