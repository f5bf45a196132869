//! Genotype clustering over normalized endpoint values
//!
//! Two algorithms share one labelling rule ([`classify`]):
//! - threshold: each well is labelled directly from its own values
//! - k-means: wells are partitioned first, then each cluster is labelled
//!   from its centroid
//!
//! Both are pure functions of their inputs; repeated calls with the same
//! points and parameters return the same assignment.

use crate::error::NormalizationError;
use crate::model::{ClusterAssignment, Dataset, GenotypeLabel, ManualOverrides, ThresholdConfig};
use crate::normalize::{normalize, NormalizedPoint, RoxMode};
use crate::well::WellId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Iteration cap for k-means reassignment
const MAX_ITERATIONS: usize = 100;

/// Default number of partitions (NTC + three genotypes)
pub const DEFAULT_CLUSTERS: usize = 4;

/// Clustering algorithm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusteringAlgorithm {
    #[default]
    Threshold,
    Kmeans,
}

impl fmt::Display for ClusteringAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusteringAlgorithm::Threshold => write!(f, "threshold"),
            ClusteringAlgorithm::Kmeans => write!(f, "kmeans"),
        }
    }
}

/// Label one point with the threshold rule.
pub fn classify(config: &ThresholdConfig, norm_fam: f64, norm_allele2: f64) -> GenotypeLabel {
    if !norm_fam.is_finite() || !norm_allele2.is_finite() {
        return GenotypeLabel::Undetermined;
    }
    if config.is_ntc_signal(norm_fam, norm_allele2) {
        return GenotypeLabel::Ntc;
    }
    let total = norm_fam + norm_allele2;
    if total <= 0.0 {
        return GenotypeLabel::Undetermined;
    }
    let ratio = norm_fam / total;
    if ratio < config.allele1_ratio_max {
        GenotypeLabel::Allele1Homo
    } else if ratio > config.allele2_ratio_min {
        GenotypeLabel::Allele2Homo
    } else {
        GenotypeLabel::Heterozygous
    }
}

/// Threshold algorithm: one label per point.
pub fn cluster_threshold(points: &[NormalizedPoint], config: &ThresholdConfig) -> ClusterAssignment {
    points
        .iter()
        .map(|p| (p.well, classify(config, p.norm_fam, p.norm_allele2)))
        .collect()
}

/// One k-means partition after convergence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterCentroid {
    pub norm_fam: f64,
    pub norm_allele2: f64,
    pub label: GenotypeLabel,
    /// Number of wells assigned
    pub size: usize,
}

/// k-means assignment plus the centroids it was labelled from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KmeansOutcome {
    pub assignments: ClusterAssignment,
    /// Sorted by `norm_fam`, then `norm_allele2`
    pub centroids: Vec<ClusterCentroid>,
    /// k actually used after clamping
    pub k: usize,
    pub iterations: usize,
}

fn squared_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)
}

fn distinct_count(coords: &[(f64, f64)]) -> usize {
    // `+ 0.0` folds -0.0 into 0.0 before comparing bit patterns
    let mut keys: Vec<(u64, u64)> = coords
        .iter()
        .map(|&(x, y)| ((x + 0.0).to_bits(), (y + 0.0).to_bits()))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys.len()
}

/// Farthest-point seeding starting from the lowest-signal point.
fn initial_centroids(coords: &[(f64, f64)], k: usize) -> Vec<(f64, f64)> {
    let mut first = 0;
    for (i, &(x, y)) in coords.iter().enumerate() {
        let (fx, fy) = coords[first];
        if x + y < fx + fy {
            first = i;
        }
    }
    let mut centroids = vec![coords[first]];
    while centroids.len() < k {
        let mut best = 0;
        let mut best_distance = f64::NEG_INFINITY;
        for (i, &point) in coords.iter().enumerate() {
            let nearest = centroids
                .iter()
                .map(|&c| squared_distance(point, c))
                .fold(f64::INFINITY, f64::min);
            if nearest > best_distance {
                best = i;
                best_distance = nearest;
            }
        }
        centroids.push(coords[best]);
    }
    centroids
}

fn nearest_centroid(point: (f64, f64), centroids: &[(f64, f64)]) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (i, &c) in centroids.iter().enumerate() {
        let d = squared_distance(point, c);
        if d < best_distance {
            best = i;
            best_distance = d;
        }
    }
    best
}

/// Deterministic k-means over the finite points.
///
/// Non-finite points are labelled `Undetermined`. With fewer than two
/// distinct finite points every finite well is `Unknown`.
pub fn cluster_kmeans(points: &[NormalizedPoint], k: usize, config: &ThresholdConfig) -> KmeansOutcome {
    let mut assignments = ClusterAssignment::new();
    let mut wells: Vec<WellId> = Vec::new();
    let mut coords: Vec<(f64, f64)> = Vec::new();
    for p in points {
        if p.is_finite() {
            wells.push(p.well);
            coords.push((p.norm_fam, p.norm_allele2));
        } else {
            assignments.insert(p.well, GenotypeLabel::Undetermined);
        }
    }

    let distinct = distinct_count(&coords);
    let k_used = k.min(distinct);
    if k_used < k {
        log::info!("Reducing k from {} to {} ({} distinct points)", k, k_used, distinct);
    }
    if k_used < 2 {
        for well in wells {
            assignments.insert(well, GenotypeLabel::Unknown);
        }
        return KmeansOutcome {
            assignments,
            centroids: Vec::new(),
            k: k_used,
            iterations: 0,
        };
    }

    let mut centroids = initial_centroids(&coords, k_used);
    let mut membership: Vec<usize> = coords.iter().map(|&p| nearest_centroid(p, &centroids)).collect();
    let mut iterations = 1;

    while iterations < MAX_ITERATIONS {
        let mut sums = vec![(0.0, 0.0, 0usize); k_used];
        for (&(x, y), &c) in coords.iter().zip(&membership) {
            sums[c].0 += x;
            sums[c].1 += y;
            sums[c].2 += 1;
        }
        for (centroid, &(sx, sy, n)) in centroids.iter_mut().zip(&sums) {
            if n > 0 {
                *centroid = (sx / n as f64, sy / n as f64);
            }
        }

        let next: Vec<usize> = coords.iter().map(|&p| nearest_centroid(p, &centroids)).collect();
        iterations += 1;
        if next == membership {
            break;
        }
        membership = next;
    }
    log::debug!("k-means converged after {} iterations (k={})", iterations, k_used);

    let mut order: Vec<usize> = (0..k_used).collect();
    order.sort_by(|&a, &b| {
        centroids[a]
            .0
            .total_cmp(&centroids[b].0)
            .then(centroids[a].1.total_cmp(&centroids[b].1))
            .then(a.cmp(&b))
    });

    let labels: Vec<GenotypeLabel> = centroids.iter().map(|&(x, y)| classify(config, x, y)).collect();
    for (well, &c) in wells.iter().zip(&membership) {
        assignments.insert(*well, labels[c]);
    }

    let centroids = order
        .into_iter()
        .map(|c| ClusterCentroid {
            norm_fam: centroids[c].0,
            norm_allele2: centroids[c].1,
            label: labels[c],
            size: membership.iter().filter(|&&m| m == c).count(),
        })
        .collect();

    KmeansOutcome {
        assignments,
        centroids,
        k: k_used,
        iterations,
    }
}

/// Parameters for one clustering run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ClusteringParams {
    #[serde(default)]
    pub algorithm: ClusteringAlgorithm,
    /// Cycle to cluster at, 0 = last
    #[serde(default)]
    pub cycle: u32,
    #[serde(default = "default_clusters")]
    pub n_clusters: usize,
    #[serde(default)]
    pub threshold: ThresholdConfig,
}

fn default_clusters() -> usize {
    DEFAULT_CLUSTERS
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self {
            algorithm: ClusteringAlgorithm::default(),
            cycle: 0,
            n_clusters: DEFAULT_CLUSTERS,
            threshold: ThresholdConfig::default(),
        }
    }
}

/// Result of clustering a dataset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusteringResult {
    pub algorithm: ClusteringAlgorithm,
    /// Resolved cycle
    pub cycle: u32,
    pub rox_mode: RoxMode,
    pub assignments: ClusterAssignment,
    /// k-means partitions, empty for the threshold algorithm
    #[serde(default)]
    pub centroids: Vec<ClusterCentroid>,
}

/// Normalize at the requested cycle and cluster.
pub fn cluster(
    dataset: &Dataset,
    mode: RoxMode,
    params: &ClusteringParams,
) -> Result<ClusteringResult, NormalizationError> {
    let points = normalize(dataset, params.cycle, mode)?;
    let cycle = points
        .first()
        .map(|p| p.cycle)
        .unwrap_or(params.cycle);

    let (assignments, centroids) = match params.algorithm {
        ClusteringAlgorithm::Threshold => (cluster_threshold(&points, &params.threshold), Vec::new()),
        ClusteringAlgorithm::Kmeans => {
            let outcome = cluster_kmeans(&points, params.n_clusters, &params.threshold);
            (outcome.assignments, outcome.centroids)
        }
    };
    log::info!(
        "Clustered {} wells at cycle {} with {} ({} mode)",
        assignments.len(),
        cycle,
        params.algorithm,
        mode
    );

    Ok(ClusteringResult {
        algorithm: params.algorithm,
        cycle,
        rox_mode: mode,
        assignments,
        centroids,
    })
}

/// Which label layers take part in the merge
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayerVisibility {
    pub auto: bool,
    pub manual: bool,
}

impl Default for LayerVisibility {
    fn default() -> Self {
        Self {
            auto: true,
            manual: true,
        }
    }
}

/// Manual label if present and visible, else automatic label if present
/// and visible, else `None` (unassigned).
pub fn effective_label(
    well: WellId,
    assignment: &ClusterAssignment,
    overrides: &ManualOverrides,
    visibility: LayerVisibility,
) -> Option<GenotypeLabel> {
    let manual = overrides.get(&well).filter(|_| visibility.manual);
    let auto = assignment.get(&well).filter(|_| visibility.auto);
    manual.or(auto).copied()
}

/// Effective labels for a set of wells with both layers visible.
/// Unassigned wells are left out of the map; see [`unassigned_wells`].
pub fn effective_labels(
    wells: &[WellId],
    assignment: &ClusterAssignment,
    overrides: &ManualOverrides,
) -> BTreeMap<WellId, GenotypeLabel> {
    wells
        .iter()
        .filter_map(|&well| {
            effective_label(well, assignment, overrides, LayerVisibility::default()).map(|label| (well, label))
        })
        .collect()
}

/// Wells with neither a manual nor an automatic label.
pub fn unassigned_wells(wells: &[WellId], assignment: &ClusterAssignment, overrides: &ManualOverrides) -> Vec<WellId> {
    wells
        .iter()
        .copied()
        .filter(|well| effective_label(*well, assignment, overrides, LayerVisibility::default()).is_none())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstrumentFamily;
    use crate::normalize::tests::{dataset_from, well};

    fn point(w: &str, fam: f64, allele2: f64) -> NormalizedPoint {
        NormalizedPoint {
            well: well(w),
            cycle: 40,
            norm_fam: fam,
            norm_allele2: allele2,
            raw_fam: fam,
            raw_allele2: allele2,
            raw_rox: None,
        }
    }

    #[test]
    fn test_threshold_rule() {
        let config = ThresholdConfig::default();
        assert_eq!(classify(&config, 0.02, 0.03), GenotypeLabel::Ntc);
        assert_eq!(classify(&config, 0.1, 0.9), GenotypeLabel::Allele1Homo);
        assert_eq!(classify(&config, 0.5, 0.5), GenotypeLabel::Heterozygous);
        assert_eq!(classify(&config, 0.9, 0.1), GenotypeLabel::Allele2Homo);
        assert_eq!(classify(&config, 0.4, 0.6), GenotypeLabel::Heterozygous);
    }

    #[test]
    fn test_zero_or_invalid_denominator_is_undetermined() {
        let config = ThresholdConfig {
            ntc_threshold: 0.0,
            ..ThresholdConfig::default()
        };
        assert_eq!(classify(&config, 0.0, 0.0), GenotypeLabel::Undetermined);
        assert_eq!(classify(&config, 5.0, -5.0), GenotypeLabel::Undetermined);
        assert_eq!(
            classify(&ThresholdConfig::default(), f64::NAN, f64::NAN),
            GenotypeLabel::Undetermined
        );
    }

    fn plate_points() -> Vec<NormalizedPoint> {
        vec![
            point("A1", 0.02, 0.03),
            point("A2", 0.03, 0.02),
            point("A3", 0.2, 2.0),
            point("A4", 0.25, 2.1),
            point("A5", 1.0, 1.1),
            point("A6", 1.1, 1.0),
            point("A7", 2.0, 0.2),
            point("A8", 2.1, 0.25),
            point("A9", f64::NAN, f64::NAN),
        ]
    }

    #[test]
    fn test_kmeans_labels_clusters_consistently_with_threshold() {
        let config = ThresholdConfig::default();
        let outcome = cluster_kmeans(&plate_points(), 4, &config);
        assert_eq!(outcome.k, 4);
        let a = &outcome.assignments;
        assert_eq!(a[&well("A1")], GenotypeLabel::Ntc);
        assert_eq!(a[&well("A2")], GenotypeLabel::Ntc);
        assert_eq!(a[&well("A3")], GenotypeLabel::Allele1Homo);
        assert_eq!(a[&well("A5")], GenotypeLabel::Heterozygous);
        assert_eq!(a[&well("A8")], GenotypeLabel::Allele2Homo);
        assert_eq!(a[&well("A9")], GenotypeLabel::Undetermined);

        let fams: Vec<f64> = outcome.centroids.iter().map(|c| c.norm_fam).collect();
        let mut sorted = fams.clone();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(fams, sorted);
        assert_eq!(outcome.centroids.iter().map(|c| c.size).sum::<usize>(), 8);
    }

    #[test]
    fn test_kmeans_is_deterministic() {
        let config = ThresholdConfig::default();
        let first = cluster_kmeans(&plate_points(), 3, &config);
        for _ in 0..5 {
            assert_eq!(cluster_kmeans(&plate_points(), 3, &config), first);
        }
    }

    #[test]
    fn test_kmeans_degenerate_inputs() {
        let config = ThresholdConfig::default();
        let same = vec![point("A1", 1.0, 1.0), point("A2", 1.0, 1.0)];
        let outcome = cluster_kmeans(&same, 4, &config);
        assert_eq!(outcome.k, 1);
        assert!(outcome.assignments.values().all(|l| *l == GenotypeLabel::Unknown));

        let two = vec![point("A1", 0.0, 2.0), point("A2", 2.0, 0.0), point("A3", 2.0, 0.0)];
        let outcome = cluster_kmeans(&two, 4, &config);
        assert_eq!(outcome.k, 2);
        assert_eq!(outcome.assignments[&well("A1")], GenotypeLabel::Allele1Homo);
        assert_eq!(outcome.assignments[&well("A3")], GenotypeLabel::Allele2Homo);
    }

    #[test]
    fn test_manual_override_wins() {
        let assignment = BTreeMap::from([
            (well("A1"), GenotypeLabel::Heterozygous),
            (well("A2"), GenotypeLabel::Allele1Homo),
        ]);
        let overrides = BTreeMap::from([(well("A1"), GenotypeLabel::Ntc), (well("A3"), GenotypeLabel::Unknown)]);
        let visible = LayerVisibility::default();
        assert_eq!(effective_label(well("A1"), &assignment, &overrides, visible), Some(GenotypeLabel::Ntc));
        assert_eq!(
            effective_label(well("A2"), &assignment, &overrides, visible),
            Some(GenotypeLabel::Allele1Homo)
        );
        assert_eq!(effective_label(well("A4"), &assignment, &overrides, visible), None);

        let auto_only = LayerVisibility {
            auto: true,
            manual: false,
        };
        assert_eq!(
            effective_label(well("A1"), &assignment, &overrides, auto_only),
            Some(GenotypeLabel::Heterozygous)
        );

        let wells = [well("A1"), well("A3"), well("A4")];
        let labels = effective_labels(&wells, &assignment, &overrides);
        assert_eq!(labels[&well("A1")], GenotypeLabel::Ntc);
        // A manual Unknown stays a label, an unassigned well does not
        assert_eq!(labels[&well("A3")], GenotypeLabel::Unknown);
        assert!(!labels.contains_key(&well("A4")));
        assert_eq!(unassigned_wells(&wells, &assignment, &overrides), vec![well("A4")]);
    }

    #[test]
    fn test_cluster_dataset_at_last_cycle() {
        let ds = dataset_from(
            InstrumentFamily::CfxOpus,
            &[
                ("A1", 1, 0.01, 0.01, None),
                ("A1", 2, 0.05, 0.02, None),
                ("B1", 1, 0.01, 0.01, None),
                ("B1", 2, 0.2, 3.0, None),
            ],
        );
        let result = cluster(&ds, RoxMode::Raw, &ClusteringParams::default()).unwrap();
        assert_eq!(result.cycle, 2);
        assert_eq!(result.assignments[&well("A1")], GenotypeLabel::Ntc);
        assert_eq!(result.assignments[&well("B1")], GenotypeLabel::Allele1Homo);
        assert!(cluster(&ds, RoxMode::Ratio, &ClusteringParams::default()).is_err());
    }
}
