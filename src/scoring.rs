//! Per-well signal quality scoring
//!
//! Score (0-100) = magnitude (0-40) + baseline noise (0-30) +
//! amplification rise (0-30), computed on the dominant allele channel,
//! less a sign penalty (up to 30, by the share of negative readings after
//! the baseline) and an ambiguity penalty (up to 20, rising as the endpoint
//! ratio nears a genotype boundary).

use crate::error::NormalizationError;
use crate::metrics::{baseline_stats, linear_score, mean, round_to};
use crate::model::{Dataset, InstrumentFamily, ThresholdConfig};
use crate::normalize::{by_well, normalize_all, NormalizedPoint, RoxMode};
use crate::well::WellId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Early cycles used for the noise estimate
const BASELINE_CYCLES: usize = 5;
/// Scores below this count as low quality in the summary
const LOW_QUALITY_SCORE: u8 = 50;
/// Half-width of the band around each ratio threshold
const AMBIGUOUS_MARGIN: f64 = 0.05;
/// Penalty when every post-baseline reading is negative
const MAX_SIGN_PENALTY: f64 = 30.0;
/// Penalty for an endpoint ratio sitting on a boundary
const MAX_AMBIGUITY_PENALTY: f64 = 20.0;

/// Flags explaining a quality score
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    /// Fewer than three usable cycles
    InsufficientData,
    /// Peak signal below the low-signal limit
    LowSignal,
    /// Baseline coefficient of variation above 0.3
    NoisyBaseline,
    /// Last/first ratio below 2
    WeakAmplification,
    /// Dominant channel goes negative after the baseline
    NegativeSignal,
    /// Endpoint ratio close to a genotype boundary
    AmbiguousRatio,
    /// Non-NTC well whose endpoint looks like an empty well
    NtcLikeSignal,
}

impl std::fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityFlag::InsufficientData => write!(f, "insufficient_data"),
            QualityFlag::LowSignal => write!(f, "low_signal"),
            QualityFlag::NoisyBaseline => write!(f, "noisy_baseline"),
            QualityFlag::WeakAmplification => write!(f, "weak_amplification"),
            QualityFlag::NegativeSignal => write!(f, "negative_signal"),
            QualityFlag::AmbiguousRatio => write!(f, "ambiguous_ratio"),
            QualityFlag::NtcLikeSignal => write!(f, "ntc_like_signal"),
        }
    }
}

/// Magnitude scale the score is measured against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalScale {
    /// Peak at or below this scores 0 magnitude points
    pub magnitude_low: f64,
    /// Peak at or above this scores full magnitude points
    pub magnitude_high: f64,
    /// Peak below this raises `low_signal`
    pub low_signal: f64,
}

impl SignalScale {
    /// Reference-normalized (or pre-normalized Rn) values
    pub const NORMALIZED: SignalScale = SignalScale {
        magnitude_low: 0.1,
        magnitude_high: 2.0,
        low_signal: 0.2,
    };

    /// Instrument RFU
    pub const RFU: SignalScale = SignalScale {
        magnitude_low: 100.0,
        magnitude_high: 2000.0,
        low_signal: 200.0,
    };

    /// QuantStudio amplification exports carry Rn, which is already
    /// normalized even though there is no ROX column to divide by.
    pub fn for_dataset(dataset: &Dataset, mode: RoxMode) -> Self {
        match (mode, dataset.family, dataset.has_rox) {
            (RoxMode::Ratio, _, _) => Self::NORMALIZED,
            (RoxMode::Raw, InstrumentFamily::QuantStudio, false) => Self::NORMALIZED,
            _ => Self::RFU,
        }
    }
}

/// Quality of one well
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityResult {
    pub well: WellId,
    /// 0-100
    pub score: u8,
    pub magnitude_score: f64,
    pub noise_score: f64,
    pub rise_score: f64,
    /// Subtracted for negative readings after the baseline
    #[serde(default)]
    pub sign_penalty: f64,
    /// Subtracted for an endpoint ratio near a genotype boundary
    #[serde(default)]
    pub ambiguity_penalty: f64,
    pub flags: Vec<QualityFlag>,
}

impl QualityResult {
    fn insufficient(well: WellId) -> Self {
        Self {
            well,
            score: 0,
            magnitude_score: 0.0,
            noise_score: 0.0,
            rise_score: 0.0,
            sign_penalty: 0.0,
            ambiguity_penalty: 0.0,
            flags: vec![QualityFlag::InsufficientData],
        }
    }

    pub fn has_flag(&self, flag: QualityFlag) -> bool {
        self.flags.contains(&flag)
    }
}

fn max_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// Score one well from its cycle-ordered normalized series.
pub fn score_well(
    well: WellId,
    series: &[NormalizedPoint],
    scale: SignalScale,
    config: &ThresholdConfig,
    declared_ntc: bool,
) -> QualityResult {
    let usable: Vec<&NormalizedPoint> = series.iter().filter(|p| p.is_finite()).collect();
    if usable.len() < 3 {
        return QualityResult::insufficient(well);
    }

    let fam: Vec<f64> = usable.iter().map(|p| p.norm_fam).collect();
    let allele2: Vec<f64> = usable.iter().map(|p| p.norm_allele2).collect();
    let dominant = if max_of(&fam) >= max_of(&allele2) { &fam } else { &allele2 };
    let max_signal = max_of(dominant);

    let magnitude_score = linear_score(max_signal, scale.magnitude_low, scale.magnitude_high, 40.0);

    let baseline_n = BASELINE_CYCLES.min(dominant.len() / 2).max(1);
    let (bl_mean, bl_std) = baseline_stats(dominant, baseline_n).unwrap_or((0.0, 0.0));
    let cv = if bl_mean > 0.0 { bl_std / bl_mean } else { 1.0 };
    let noise_score = 30.0 - linear_score(cv, 0.05, 0.5, 30.0);

    let first = if dominant[0] > 0.0 { dominant[0] } else { 0.001 };
    let last = dominant[dominant.len() - 1];
    let rise = last / first;
    let rise_score = linear_score(rise, 1.5, 5.0, 30.0);

    let post_baseline = &dominant[baseline_n..];
    let negatives = post_baseline.iter().filter(|v| **v < 0.0).count();
    let sign_penalty = if post_baseline.is_empty() {
        0.0
    } else {
        MAX_SIGN_PENALTY * negatives as f64 / post_baseline.len() as f64
    };

    let endpoint = usable[usable.len() - 1];
    let endpoint_is_ntc = config.is_ntc_signal(endpoint.norm_fam, endpoint.norm_allele2);
    // Distance from the nearest ratio threshold, NTC endpoints excluded
    let boundary_distance = if endpoint_is_ntc {
        None
    } else {
        endpoint.ratio().map(|ratio| {
            (ratio - config.allele1_ratio_max)
                .abs()
                .min((ratio - config.allele2_ratio_min).abs())
        })
    };
    let ambiguity_penalty = match boundary_distance {
        Some(d) if d < AMBIGUOUS_MARGIN => MAX_AMBIGUITY_PENALTY * (1.0 - d / AMBIGUOUS_MARGIN),
        _ => 0.0,
    };

    let score = (magnitude_score + noise_score + rise_score - sign_penalty - ambiguity_penalty)
        .round()
        .clamp(0.0, 100.0) as u8;

    let mut flags = Vec::new();
    if max_signal < scale.low_signal {
        flags.push(QualityFlag::LowSignal);
    }
    if cv > 0.3 {
        flags.push(QualityFlag::NoisyBaseline);
    }
    if rise < 2.0 {
        flags.push(QualityFlag::WeakAmplification);
    }
    if negatives > 0 {
        flags.push(QualityFlag::NegativeSignal);
    }
    if boundary_distance.is_some_and(|d| d <= AMBIGUOUS_MARGIN) {
        flags.push(QualityFlag::AmbiguousRatio);
    }
    if endpoint_is_ntc && !declared_ntc {
        flags.push(QualityFlag::NtcLikeSignal);
    }

    QualityResult {
        well,
        score,
        magnitude_score: round_to(magnitude_score, 1),
        noise_score: round_to(noise_score, 1),
        rise_score: round_to(rise_score, 1),
        sign_penalty: round_to(sign_penalty, 1),
        ambiguity_penalty: round_to(ambiguity_penalty, 1),
        flags,
    }
}

/// Score every well in the dataset.
pub fn assess_quality(
    dataset: &Dataset,
    mode: RoxMode,
    config: &ThresholdConfig,
) -> Result<BTreeMap<WellId, QualityResult>, NormalizationError> {
    let scale = SignalScale::for_dataset(dataset, mode);
    let grouped = by_well(&normalize_all(dataset, mode)?);
    let results: BTreeMap<WellId, QualityResult> = grouped
        .iter()
        .map(|(&well, series)| (well, score_well(well, series, scale, config, dataset.is_ntc(well))))
        .collect();
    log::debug!("Scored {} wells ({} mode)", results.len(), mode);
    Ok(results)
}

/// Plate-level quality roll-up
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualitySummary {
    pub mean_score: f64,
    /// Wells scoring below 50
    pub low_quality_count: usize,
    pub total_wells: usize,
}

pub fn summarize(results: &BTreeMap<WellId, QualityResult>) -> QualitySummary {
    let scores: Vec<f64> = results.values().map(|r| r.score as f64).collect();
    QualitySummary {
        mean_score: mean(&scores).map(|m| round_to(m, 1)).unwrap_or(0.0),
        low_quality_count: results.values().filter(|r| r.score < LOW_QUALITY_SCORE).count(),
        total_wells: results.len(),
    }
}
