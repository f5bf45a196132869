//! Population statistics over effective genotype labels
//!
//! Allele 1 homozygotes count as AA, allele 2 homozygotes as BB. Only
//! definite calls enter the allele counts; NTC, Undetermined, Unknown and
//! positive controls are excluded.

use crate::metrics::round_to;
use crate::model::GenotypeLabel;
use crate::well::WellId;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::{BTreeMap, BTreeSet};

/// Significance level for the Hardy-Weinberg test
pub const HWE_ALPHA: f64 = 0.05;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GenotypeCounts {
    /// Allele 1 homozygotes
    pub aa: usize,
    pub ab: usize,
    /// Allele 2 homozygotes
    pub bb: usize,
    /// Wells without a definite call
    pub excluded: usize,
}

impl GenotypeCounts {
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a GenotypeLabel>) -> Self {
        let mut counts = Self::default();
        for label in labels {
            match label {
                GenotypeLabel::Allele1Homo => counts.aa += 1,
                GenotypeLabel::Heterozygous => counts.ab += 1,
                GenotypeLabel::Allele2Homo => counts.bb += 1,
                _ => counts.excluded += 1,
            }
        }
        counts
    }

    pub fn genotyped(&self) -> usize {
        self.aa + self.ab + self.bb
    }
}

/// Allele frequencies, p for allele 1 and q for allele 2
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AlleleFrequencies {
    pub p: f64,
    pub q: f64,
    pub total_genotyped: usize,
}

pub fn allele_frequencies(counts: &GenotypeCounts) -> AlleleFrequencies {
    let total = counts.genotyped();
    if total == 0 {
        return AlleleFrequencies {
            p: 0.0,
            q: 0.0,
            total_genotyped: 0,
        };
    }
    let p = (2 * counts.aa + counts.ab) as f64 / (2 * total) as f64;
    AlleleFrequencies {
        p: round_to(p, 4),
        q: round_to(1.0 - p, 4),
        total_genotyped: total,
    }
}

/// Hardy-Weinberg chi-square test, 1 degree of freedom
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HweResult {
    pub chi2: f64,
    pub p_value: f64,
    pub expected_aa: f64,
    pub expected_ab: f64,
    pub expected_bb: f64,
    /// p-value above 0.05
    pub in_hwe: bool,
}

fn chi2_sf_1df(chi2: f64) -> f64 {
    if chi2 <= 0.0 {
        return 1.0;
    }
    match ChiSquared::new(1.0) {
        Ok(dist) => (1.0 - dist.cdf(chi2)).max(0.0),
        Err(e) => {
            log::error!("Failed to build chi-square distribution: {}", e);
            1.0
        }
    }
}

/// `None` with fewer than two genotyped wells.
pub fn hwe_test(counts: &GenotypeCounts) -> Option<HweResult> {
    let total = counts.genotyped();
    if total < 2 {
        return None;
    }
    let freq = allele_frequencies(counts);
    let n = total as f64;
    let (p, q) = (freq.p, freq.q);

    let expected = [p * p * n, 2.0 * p * q * n, q * q * n];
    let observed = [counts.aa as f64, counts.ab as f64, counts.bb as f64];
    let chi2: f64 = observed
        .iter()
        .zip(&expected)
        .filter(|(_, e)| **e > 0.0)
        .map(|(&o, &e)| (o - e).powi(2) / e)
        .sum();
    let p_value = chi2_sf_1df(chi2);

    Some(HweResult {
        chi2: round_to(chi2, 4),
        p_value,
        expected_aa: round_to(expected[0], 2),
        expected_ab: round_to(expected[1], 2),
        expected_bb: round_to(expected[2], 2),
        in_hwe: p_value > HWE_ALPHA,
    })
}

/// Count of every label present.
pub fn genotype_distribution(labels: &BTreeMap<WellId, GenotypeLabel>) -> BTreeMap<GenotypeLabel, usize> {
    let mut distribution = BTreeMap::new();
    for label in labels.values() {
        *distribution.entry(*label).or_insert(0) += 1;
    }
    distribution
}

/// Frequencies, HWE and distribution of one plate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatisticsReport {
    pub counts: GenotypeCounts,
    pub frequencies: AlleleFrequencies,
    pub hwe: Option<HweResult>,
    pub distribution: BTreeMap<GenotypeLabel, usize>,
}

pub fn statistics(labels: &BTreeMap<WellId, GenotypeLabel>) -> StatisticsReport {
    let counts = GenotypeCounts::from_labels(labels.values());
    StatisticsReport {
        counts,
        frequencies: allele_frequencies(&counts),
        hwe: hwe_test(&counts),
        distribution: genotype_distribution(labels),
    }
}

/// Agreement of effective labels across plates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Concordance {
    pub concordant_wells: usize,
    /// Wells present on at least two plates
    pub total_compared: usize,
    /// `None` when no well is shared
    pub percentage: Option<f64>,
}

/// Wells present on a single plate are left out of the denominator.
pub fn concordance(plates: &[BTreeMap<WellId, GenotypeLabel>]) -> Concordance {
    let wells: BTreeSet<WellId> = plates.iter().flat_map(|p| p.keys().copied()).collect();
    let mut concordant = 0;
    let mut compared = 0;
    for well in wells {
        let labels: Vec<GenotypeLabel> = plates.iter().filter_map(|p| p.get(&well).copied()).collect();
        if labels.len() < 2 {
            continue;
        }
        compared += 1;
        if labels.iter().all(|l| *l == labels[0]) {
            concordant += 1;
        }
    }
    Concordance {
        concordant_wells: concordant,
        total_compared: compared,
        percentage: (compared > 0).then(|| round_to(concordant as f64 / compared as f64 * 100.0, 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::well::PLATE_COLUMNS;

    fn counts(aa: usize, ab: usize, bb: usize) -> GenotypeCounts {
        GenotypeCounts { aa, ab, bb, excluded: 0 }
    }

    #[test]
    fn test_allele_frequencies() {
        let freq = allele_frequencies(&counts(63, 9, 12));
        assert_eq!(freq.total_genotyped, 84);
        assert_eq!(freq.p, 0.8036);
        assert_eq!(freq.q, 0.1964);
        assert_eq!(allele_frequencies(&counts(0, 0, 0)).p, 0.0);
    }

    #[test]
    fn test_hwe_reference_counts() {
        let result = hwe_test(&counts(63, 9, 12)).unwrap();
        assert_eq!(result.expected_aa, 54.24);
        assert_eq!(result.expected_ab, 26.51);
        assert_eq!(result.expected_bb, 3.24);
        assert!(result.chi2 > 30.0);
        assert!(result.p_value < 1e-6);
        assert!(!result.in_hwe);
        // Same inputs, same answer
        assert_eq!(hwe_test(&counts(63, 9, 12)), Some(result));
    }

    #[test]
    fn test_hwe_equilibrium_and_small_samples() {
        let result = hwe_test(&counts(25, 50, 25)).unwrap();
        assert_eq!(result.chi2, 0.0);
        assert_eq!(result.p_value, 1.0);
        assert!(result.in_hwe);
        assert_eq!(hwe_test(&counts(1, 0, 0)), None);
    }

    #[test]
    fn test_counts_exclude_non_calls() {
        let labels = [
            GenotypeLabel::Allele1Homo,
            GenotypeLabel::Ntc,
            GenotypeLabel::Undetermined,
            GenotypeLabel::PositiveControl,
            GenotypeLabel::Heterozygous,
        ];
        let c = GenotypeCounts::from_labels(labels.iter());
        assert_eq!(c, GenotypeCounts { aa: 1, ab: 1, bb: 0, excluded: 3 });
    }

    #[test]
    fn test_concordance_over_overlap_only() {
        let wells: Vec<WellId> = (0..12).map(|i| WellId::from_index(i).unwrap()).collect();
        assert_eq!(wells.len(), PLATE_COLUMNS as usize);
        // Plate 1: A1..A12; plate 2: A1..A10 plus B1
        let plate1: BTreeMap<WellId, GenotypeLabel> =
            wells.iter().map(|w| (*w, GenotypeLabel::Allele1Homo)).collect();
        let mut plate2: BTreeMap<WellId, GenotypeLabel> =
            wells[..10].iter().map(|w| (*w, GenotypeLabel::Allele1Homo)).collect();
        plate2.insert(wells[0], GenotypeLabel::Heterozygous);
        plate2.insert(wells[1], GenotypeLabel::Ntc);
        plate2.insert(WellId::from_index(12).unwrap(), GenotypeLabel::Allele2Homo);

        let result = concordance(&[plate1, plate2]);
        assert_eq!(result.total_compared, 10);
        assert_eq!(result.concordant_wells, 8);
        assert_eq!(result.percentage, Some(80.0));

        assert_eq!(concordance(&[BTreeMap::new()]).percentage, None);
    }

    #[test]
    fn test_distribution() {
        let labels = BTreeMap::from([
            (WellId::from_index(0).unwrap(), GenotypeLabel::Ntc),
            (WellId::from_index(1).unwrap(), GenotypeLabel::Ntc),
            (WellId::from_index(2).unwrap(), GenotypeLabel::Heterozygous),
        ]);
        let report = statistics(&labels);
        assert_eq!(report.distribution[&GenotypeLabel::Ntc], 2);
        assert_eq!(report.counts.excluded, 2);
        assert!(report.hwe.is_none());
    }
}
