//! Side-by-side comparison of two runs
//!
//! Summarizes each run's normalized endpoint values and correlates the
//! wells the two runs share.

use crate::error::NormalizationError;
use crate::metrics::{mean, pearson_r, population_std, round_to};
use crate::model::Dataset;
use crate::normalize::{normalize, NormalizedPoint, RoxMode};
use crate::well::WellId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary of one run at one cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunStats {
    /// Upload name
    pub source: String,
    pub instrument: String,
    pub allele2_dye: String,
    pub cycle: u32,
    pub rox_mode: RoxMode,
    pub mean_fam: f64,
    pub mean_allele2: f64,
    /// Population standard deviation over the run's wells
    pub std_fam: f64,
    pub std_allele2: f64,
    pub n_wells: usize,
}

/// Comparison of two runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunComparison {
    pub run1: RunStats,
    pub run2: RunStats,
    /// Wells present in both runs with finite values
    pub matched_wells: usize,
    /// Pearson r of FAM over matched wells
    pub fam_r: Option<f64>,
    /// Pearson r of the second allele over matched wells
    pub allele2_r: Option<f64>,
    pub generated_at: String,
}

/// One run to compare
#[derive(Debug, Clone, Copy)]
pub struct RunInput<'a> {
    pub dataset: &'a Dataset,
    pub source: &'a str,
    /// 0 = last cycle
    pub cycle: u32,
}

fn run_stats(input: &RunInput<'_>, mode: RoxMode, points: &[NormalizedPoint]) -> RunStats {
    let fam: Vec<f64> = points.iter().map(|p| p.norm_fam).collect();
    let allele2: Vec<f64> = points.iter().map(|p| p.norm_allele2).collect();
    let rounded = |v: Option<f64>| v.map(|x| round_to(x, 6)).unwrap_or(0.0);
    RunStats {
        source: input.source.to_string(),
        instrument: input.dataset.instrument.clone(),
        allele2_dye: input.dataset.allele2_dye.clone(),
        cycle: points.first().map(|p| p.cycle).unwrap_or(input.cycle),
        rox_mode: mode,
        mean_fam: rounded(mean(&fam)),
        mean_allele2: rounded(mean(&allele2)),
        std_fam: rounded(population_std(&fam)),
        std_allele2: rounded(population_std(&allele2)),
        n_wells: points.len(),
    }
}

/// Compare two runs. With `mode == None` each run uses its own default.
pub fn compare_runs(
    run1: RunInput<'_>,
    run2: RunInput<'_>,
    mode: Option<RoxMode>,
) -> Result<RunComparison, NormalizationError> {
    let mode1 = mode.unwrap_or_else(|| RoxMode::default_for(run1.dataset));
    let mode2 = mode.unwrap_or_else(|| RoxMode::default_for(run2.dataset));

    let finite = |points: Vec<NormalizedPoint>| -> Vec<NormalizedPoint> {
        points.into_iter().filter(|p| p.is_finite()).collect()
    };
    let points1 = finite(normalize(run1.dataset, run1.cycle, mode1)?);
    let points2 = finite(normalize(run2.dataset, run2.cycle, mode2)?);

    let by_well2: BTreeMap<WellId, &NormalizedPoint> = points2.iter().map(|p| (p.well, p)).collect();
    let matched: Vec<(&NormalizedPoint, &NormalizedPoint)> = points1
        .iter()
        .filter_map(|p| by_well2.get(&p.well).map(|q| (p, *q)))
        .collect();

    let fam_x: Vec<f64> = matched.iter().map(|(a, _)| a.norm_fam).collect();
    let fam_y: Vec<f64> = matched.iter().map(|(_, b)| b.norm_fam).collect();
    let a2_x: Vec<f64> = matched.iter().map(|(a, _)| a.norm_allele2).collect();
    let a2_y: Vec<f64> = matched.iter().map(|(_, b)| b.norm_allele2).collect();

    log::info!(
        "Comparing {} ({} wells) with {} ({} wells): {} matched",
        run1.source,
        points1.len(),
        run2.source,
        points2.len(),
        matched.len()
    );

    Ok(RunComparison {
        run1: run_stats(&run1, mode1, &points1),
        run2: run_stats(&run2, mode2, &points2),
        matched_wells: matched.len(),
        fam_r: pearson_r(&fam_x, &fam_y).map(|r| round_to(r, 6)),
        allele2_r: pearson_r(&a2_x, &a2_y).map(|r| round_to(r, 6)),
        generated_at: chrono::Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstrumentFamily;
    use crate::normalize::tests::dataset_from;

    #[test]
    fn test_compare_matched_wells() {
        let a = dataset_from(
            InstrumentFamily::CfxOpus,
            &[("A1", 1, 1.0, 4.0, None), ("A2", 1, 2.0, 3.0, None), ("A3", 1, 3.0, 2.0, None)],
        );
        let b = dataset_from(
            InstrumentFamily::QuantStudio,
            &[
                ("A1", 1, 20.0, 80.0, Some(10.0)),
                ("A2", 1, 40.0, 60.0, Some(10.0)),
                ("A3", 1, 60.0, 40.0, Some(10.0)),
                ("B1", 1, 1.0, 1.0, Some(10.0)),
            ],
        );
        let cmp = compare_runs(
            RunInput { dataset: &a, source: "cfx.zip", cycle: 0 },
            RunInput { dataset: &b, source: "qs.xls", cycle: 0 },
            None,
        )
        .unwrap();
        assert_eq!(cmp.run1.rox_mode, RoxMode::Raw);
        assert_eq!(cmp.run2.rox_mode, RoxMode::Ratio);
        assert_eq!(cmp.run1.mean_fam, 2.0);
        assert_eq!(cmp.run2.n_wells, 4);
        assert_eq!(cmp.matched_wells, 3);
        assert_eq!(cmp.fam_r, Some(1.0));
        assert_eq!(cmp.allele2_r, Some(1.0));
    }

    #[test]
    fn test_single_match_has_no_correlation() {
        let a = dataset_from(InstrumentFamily::CfxOpus, &[("A1", 1, 1.0, 4.0, None)]);
        let cmp = compare_runs(
            RunInput { dataset: &a, source: "a", cycle: 0 },
            RunInput { dataset: &a, source: "b", cycle: 0 },
            Some(RoxMode::Raw),
        )
        .unwrap();
        assert_eq!(cmp.matched_wells, 1);
        assert_eq!(cmp.fam_r, None);
        assert_eq!(cmp.run1.std_fam, 0.0);
    }

    #[test]
    fn test_forced_ratio_without_rox_fails() {
        let a = dataset_from(InstrumentFamily::CfxOpus, &[("A1", 1, 1.0, 4.0, None)]);
        let input = RunInput { dataset: &a, source: "a", cycle: 0 };
        assert!(compare_runs(input, input, Some(RoxMode::Ratio)).is_err());
    }
}
