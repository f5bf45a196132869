//! Reference-dye normalization and per-cycle views
//!
//! Every computation downstream of parsing reads normalized values from
//! here. The mode is passed explicitly on each call; nothing in this module
//! remembers a choice between calls.

use crate::error::NormalizationError;
use crate::model::{ClusterAssignment, CycleSample, Dataset, GenotypeLabel, InstrumentFamily, ManualOverrides};
use crate::well::WellId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How the two allele channels are scaled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RoxMode {
    /// Divide each allele channel by the reference dye
    Ratio,
    /// Use the allele channels unchanged
    Raw,
}

impl RoxMode {
    /// Mode a freshly loaded dataset starts in.
    ///
    /// QuantStudio multicomponent data carries a true passive reference and
    /// starts in ratio mode. CFX exports are baseline-subtracted per dye, so
    /// their reference series is not a usable denominator and they start raw.
    pub fn default_for(dataset: &Dataset) -> Self {
        match (dataset.family, dataset.has_rox) {
            (InstrumentFamily::QuantStudio, true) => RoxMode::Ratio,
            _ => RoxMode::Raw,
        }
    }
}

impl fmt::Display for RoxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoxMode::Ratio => write!(f, "ratio"),
            RoxMode::Raw => write!(f, "raw"),
        }
    }
}

impl std::str::FromStr for RoxMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ratio" | "rox" => Ok(RoxMode::Ratio),
            "raw" | "none" => Ok(RoxMode::Raw),
            other => Err(format!("unknown ROX mode '{other}' (expected ratio or raw)")),
        }
    }
}

/// One well at one cycle after normalization
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NormalizedPoint {
    pub well: WellId,
    pub cycle: u32,
    /// NaN when the reference reading was zero or missing in ratio mode
    pub norm_fam: f64,
    pub norm_allele2: f64,
    pub raw_fam: f64,
    pub raw_allele2: f64,
    pub raw_rox: Option<f64>,
}

impl NormalizedPoint {
    /// FAM fraction of the total normalized signal.
    ///
    /// `None` when the total is not a positive finite number.
    pub fn ratio(&self) -> Option<f64> {
        let total = self.norm_fam + self.norm_allele2;
        if total.is_finite() && total > 0.0 {
            Some(self.norm_fam / total)
        } else {
            None
        }
    }

    pub fn is_finite(&self) -> bool {
        self.norm_fam.is_finite() && self.norm_allele2.is_finite()
    }

    /// Combined normalized signal
    pub fn total(&self) -> f64 {
        self.norm_fam + self.norm_allele2
    }
}

/// Refuse ratio mode on a dataset without a reference channel.
pub fn check_mode(dataset: &Dataset, mode: RoxMode) -> Result<(), NormalizationError> {
    if mode == RoxMode::Ratio && !dataset.has_rox {
        log::warn!("Ratio normalization requested but {} has no ROX channel", dataset.instrument);
        return Err(NormalizationError::Unavailable {
            instrument: dataset.instrument.clone(),
        });
    }
    Ok(())
}

/// Map a requested cycle to one the dataset has. `0` means the last cycle.
pub fn resolve_cycle(dataset: &Dataset, cycle: u32) -> Result<u32, NormalizationError> {
    let (first, last) = match (dataset.first_cycle(), dataset.last_cycle()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(NormalizationError::EmptyDataset),
    };
    if cycle == 0 {
        return Ok(last);
    }
    if dataset.cycles.binary_search(&cycle).is_err() {
        return Err(NormalizationError::CycleUnavailable {
            requested: cycle,
            first,
            last,
        });
    }
    Ok(cycle)
}

fn normalize_sample(sample: &CycleSample, mode: RoxMode) -> NormalizedPoint {
    let (norm_fam, norm_allele2) = match mode {
        RoxMode::Raw => (sample.fam, sample.allele2),
        RoxMode::Ratio => match sample.rox {
            Some(rox) if rox != 0.0 => (sample.fam / rox, sample.allele2 / rox),
            _ => (f64::NAN, f64::NAN),
        },
    };
    NormalizedPoint {
        well: sample.well,
        cycle: sample.cycle,
        norm_fam,
        norm_allele2,
        raw_fam: sample.fam,
        raw_allele2: sample.allele2,
        raw_rox: sample.rox,
    }
}

/// Normalized values of every well at one cycle, in well order.
pub fn normalize(dataset: &Dataset, cycle: u32, mode: RoxMode) -> Result<Vec<NormalizedPoint>, NormalizationError> {
    check_mode(dataset, mode)?;
    let cycle = resolve_cycle(dataset, cycle)?;
    Ok(dataset
        .samples_at(cycle)
        .into_iter()
        .map(|s| normalize_sample(s, mode))
        .collect())
}

/// Normalized values of every reading, ordered by well then cycle.
pub fn normalize_all(dataset: &Dataset, mode: RoxMode) -> Result<Vec<NormalizedPoint>, NormalizationError> {
    check_mode(dataset, mode)?;
    let mut points: Vec<NormalizedPoint> = dataset.samples.iter().map(|s| normalize_sample(s, mode)).collect();
    points.sort_by_key(|p| (p.well, p.cycle));
    Ok(points)
}

/// Group normalized points by well, each series in cycle order.
pub fn by_well(points: &[NormalizedPoint]) -> BTreeMap<WellId, Vec<NormalizedPoint>> {
    let mut grouped: BTreeMap<WellId, Vec<NormalizedPoint>> = BTreeMap::new();
    for point in points {
        grouped.entry(point.well).or_default().push(*point);
    }
    for series in grouped.values_mut() {
        series.sort_by_key(|p| p.cycle);
    }
    grouped
}

/// Normalized amplification curve of one well
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AmplificationCurve {
    pub well: WellId,
    pub cycles: Vec<u32>,
    pub norm_fam: Vec<f64>,
    pub norm_allele2: Vec<f64>,
}

/// Curves for the requested wells. Wells without data are skipped.
pub fn amplification_curves(
    dataset: &Dataset,
    wells: &[WellId],
    mode: RoxMode,
) -> Result<Vec<AmplificationCurve>, NormalizationError> {
    check_mode(dataset, mode)?;
    Ok(wells
        .iter()
        .filter_map(|&well| {
            let series = dataset.series(well);
            if series.is_empty() {
                return None;
            }
            let points: Vec<NormalizedPoint> = series.into_iter().map(|s| normalize_sample(s, mode)).collect();
            Some(AmplificationCurve {
                well,
                cycles: points.iter().map(|p| p.cycle).collect(),
                norm_fam: points.iter().map(|p| p.norm_fam).collect(),
                norm_allele2: points.iter().map(|p| p.norm_allele2).collect(),
            })
        })
        .collect())
}

/// Per-well summary record for plate and scatter displays
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlateWell {
    pub well: WellId,
    /// Row letter
    pub row: char,
    /// 1-based column
    pub column: u8,
    pub norm_fam: f64,
    pub norm_allele2: f64,
    pub raw_fam: f64,
    pub raw_allele2: f64,
    pub raw_rox: Option<f64>,
    /// FAM fraction, absent when undeterminable
    pub ratio: Option<f64>,
    pub sample_name: Option<String>,
    pub auto_cluster: Option<GenotypeLabel>,
    pub manual_type: Option<GenotypeLabel>,
}

/// Plate-summary records at one cycle (`0` = last).
pub fn plate_view(
    dataset: &Dataset,
    cycle: u32,
    mode: RoxMode,
    sample_names: &BTreeMap<WellId, String>,
    assignment: &ClusterAssignment,
    overrides: &ManualOverrides,
) -> Result<Vec<PlateWell>, NormalizationError> {
    let points = normalize(dataset, cycle, mode)?;
    Ok(points
        .into_iter()
        .map(|p| PlateWell {
            well: p.well,
            row: p.well.row_letter(),
            column: p.well.column(),
            norm_fam: p.norm_fam,
            norm_allele2: p.norm_allele2,
            raw_fam: p.raw_fam,
            raw_allele2: p.raw_allele2,
            raw_rox: p.raw_rox,
            ratio: p.ratio(),
            sample_name: sample_names.get(&p.well).cloned(),
            auto_cluster: assignment.get(&p.well).copied(),
            manual_type: overrides.get(&p.well).copied(),
        })
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::ExportShape;

    pub(crate) fn well(s: &str) -> WellId {
        s.parse().unwrap()
    }

    /// Dataset from `(well, cycle, fam, allele2, rox)` readings.
    pub(crate) fn dataset_from(
        family: InstrumentFamily,
        readings: &[(&str, u32, f64, f64, Option<f64>)],
    ) -> Dataset {
        let samples: Vec<CycleSample> = readings
            .iter()
            .map(|&(w, cycle, fam, allele2, rox)| CycleSample {
                well: well(w),
                cycle,
                fam,
                allele2,
                rox,
            })
            .collect();
        let mut wells: Vec<WellId> = samples.iter().map(|s| s.well).collect();
        wells.sort();
        wells.dedup();
        let mut cycles: Vec<u32> = samples.iter().map(|s| s.cycle).collect();
        cycles.sort_unstable();
        cycles.dedup();
        Dataset {
            instrument: family.to_string(),
            family,
            shape: match family {
                InstrumentFamily::CfxOpus => ExportShape::XmlBundle,
                InstrumentFamily::QuantStudio => ExportShape::QuantStudioWorkbook,
            },
            tier: None,
            allele2_dye: "HEX".to_string(),
            has_rox: samples.iter().any(|s| s.rox.is_some()),
            wells,
            cycles,
            samples,
            sample_names: BTreeMap::new(),
            instrument_calls: BTreeMap::new(),
            content_types: BTreeMap::new(),
            protocol_steps: Vec::new(),
            data_windows: Vec::new(),
        }
    }

    fn two_cycles() -> Dataset {
        dataset_from(
            InstrumentFamily::QuantStudio,
            &[
                ("A1", 1, 100.0, 50.0, Some(1000.0)),
                ("A1", 2, 800.0, 60.0, Some(1000.0)),
                ("B1", 1, 90.0, 40.0, Some(0.0)),
                ("B1", 2, 95.0, 900.0, Some(0.0)),
            ],
        )
    }

    #[test]
    fn test_default_mode_by_instrument() {
        assert_eq!(RoxMode::default_for(&two_cycles()), RoxMode::Ratio);
        let cfx = dataset_from(InstrumentFamily::CfxOpus, &[("A1", 1, 1.0, 1.0, Some(5.0))]);
        assert_eq!(RoxMode::default_for(&cfx), RoxMode::Raw);
        let no_rox = dataset_from(InstrumentFamily::QuantStudio, &[("A1", 1, 1.0, 1.0, None)]);
        assert_eq!(RoxMode::default_for(&no_rox), RoxMode::Raw);
    }

    #[test]
    fn test_ratio_mode_divides_and_zero_rox_is_sentinel() {
        let points = normalize(&two_cycles(), 0, RoxMode::Ratio).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].cycle, 2);
        assert!((points[0].norm_fam - 0.8).abs() < 1e-12);
        assert!((points[0].norm_allele2 - 0.06).abs() < 1e-12);
        assert!(points[1].norm_fam.is_nan());
        assert!(!points[1].is_finite());
        assert_eq!(points[1].ratio(), None);
        assert_eq!(points[1].raw_allele2, 900.0);
    }

    #[test]
    fn test_ratio_mode_refused_without_rox() {
        let ds = dataset_from(InstrumentFamily::CfxOpus, &[("A1", 1, -80.06, 5.0, None)]);
        assert!(matches!(
            normalize(&ds, 0, RoxMode::Ratio),
            Err(NormalizationError::Unavailable { .. })
        ));
        let raw = normalize(&ds, 0, RoxMode::Raw).unwrap();
        assert_eq!(raw[0].norm_fam, -80.06);
    }

    #[test]
    fn test_resolve_cycle() {
        let ds = two_cycles();
        assert_eq!(resolve_cycle(&ds, 0).unwrap(), 2);
        assert_eq!(resolve_cycle(&ds, 1).unwrap(), 1);
        let err = resolve_cycle(&ds, 7).unwrap_err();
        assert_eq!(err.to_string(), "Cycle 7 not available. Range: 1-2");
    }

    #[test]
    fn test_curves_and_plate_view() {
        let ds = two_cycles();
        let curves = amplification_curves(&ds, &[well("A1"), well("H12")], RoxMode::Raw).unwrap();
        assert_eq!(curves.len(), 1);
        assert_eq!(curves[0].cycles, vec![1, 2]);
        assert_eq!(curves[0].norm_fam, vec![100.0, 800.0]);

        let names = BTreeMap::from([(well("A1"), "Donor-1".to_string())]);
        let auto = BTreeMap::from([(well("A1"), GenotypeLabel::Allele2Homo)]);
        let manual = BTreeMap::from([(well("B1"), GenotypeLabel::Ntc)]);
        let plate = plate_view(&ds, 2, RoxMode::Raw, &names, &auto, &manual).unwrap();
        assert_eq!(plate[0].row, 'A');
        assert_eq!(plate[0].column, 1);
        assert_eq!(plate[0].sample_name.as_deref(), Some("Donor-1"));
        assert_eq!(plate[0].auto_cluster, Some(GenotypeLabel::Allele2Homo));
        assert_eq!(plate[1].manual_type, Some(GenotypeLabel::Ntc));
        assert!((plate[1].ratio.unwrap() - 95.0 / 995.0).abs() < 1e-12);
    }
}
