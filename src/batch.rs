//! Multi-plate summary
//!
//! Rolls several sessions up into per-plate genotype counts and a
//! cross-plate concordance figure.

use crate::model::GenotypeLabel;
use crate::scoring::{assess_quality, summarize};
use crate::session::AnalysisSession;
use crate::stats::{concordance, Concordance, GenotypeCounts};
use serde::{Deserialize, Serialize};

/// One plate of a batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlateSummary {
    /// Upload name
    pub source: String,
    pub instrument: String,
    pub allele2_dye: String,
    pub num_wells: usize,
    pub genotypes: GenotypeCounts,
    pub ntc_count: usize,
    /// Wells labelled Unknown or Undetermined
    pub unknown_count: usize,
    /// Wells with no label at all
    #[serde(default)]
    pub unassigned_count: usize,
    /// Mean quality score, 0 when scoring failed
    pub mean_quality: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSummary {
    pub plates: Vec<PlateSummary>,
    pub concordance: Concordance,
    pub generated_at: String,
}

/// Summary of one session's current effective labels.
pub fn summarize_plate(session: &AnalysisSession) -> PlateSummary {
    let dataset = session.dataset();
    let labels = session.effective_labels();
    let count = |pred: fn(&GenotypeLabel) -> bool| labels.values().filter(|l| pred(l)).count();

    let mean_quality = match assess_quality(dataset, session.rox_mode(), &session.params().threshold) {
        Ok(results) => summarize(&results).mean_score,
        Err(e) => {
            log::warn!("Quality scoring failed for {}: {}", session.source(), e);
            0.0
        }
    };

    PlateSummary {
        source: session.source().to_string(),
        instrument: dataset.instrument.clone(),
        allele2_dye: dataset.allele2_dye.clone(),
        num_wells: dataset.wells.len(),
        genotypes: GenotypeCounts::from_labels(labels.values()),
        ntc_count: count(|l| *l == GenotypeLabel::Ntc),
        unknown_count: count(|l| matches!(l, GenotypeLabel::Unknown | GenotypeLabel::Undetermined)),
        unassigned_count: session.unassigned_wells().len(),
        mean_quality,
    }
}

/// Per-plate summaries plus concordance over wells shared by two or more
/// plates.
pub fn batch_summary(sessions: &[AnalysisSession]) -> BatchSummary {
    let plates: Vec<PlateSummary> = sessions.iter().map(summarize_plate).collect();
    let labels: Vec<_> = sessions.iter().map(|s| s.effective_labels()).collect();
    let concordance = concordance(&labels);
    log::info!(
        "Batch of {} plates: {}/{} shared wells concordant",
        plates.len(),
        concordance.concordant_wells,
        concordance.total_compared
    );
    BatchSummary {
        plates,
        concordance,
        generated_at: chrono::Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstrumentFamily;
    use crate::normalize::tests::{dataset_from, well};

    fn session(a3: (f64, f64)) -> AnalysisSession {
        let ds = dataset_from(
            InstrumentFamily::CfxOpus,
            &[
                ("A1", 1, 0.02, 0.03, None),
                ("A2", 1, 1.0, 9.0, None),
                ("A3", 1, a3.0, a3.1, None),
                ("A4", 1, 9.0, 1.0, None),
            ],
        );
        let mut session = AnalysisSession::new(ds, "plate.zip");
        session.run_clustering().unwrap();
        session
    }

    #[test]
    fn test_plate_summary_counts() {
        let mut s = session((5.0, 5.0));
        s.set_override(well("A4"), GenotypeLabel::Unknown);
        let plate = summarize_plate(&s);
        assert_eq!(plate.num_wells, 4);
        assert_eq!(plate.genotypes, GenotypeCounts { aa: 1, ab: 1, bb: 0, excluded: 2 });
        assert_eq!(plate.ntc_count, 1);
        assert_eq!(plate.unknown_count, 1);
        assert_eq!(plate.unassigned_count, 0);
        // Single-cycle data scores zero
        assert_eq!(plate.mean_quality, 0.0);
    }

    #[test]
    fn test_unclustered_plate_counts_unassigned() {
        let ds = dataset_from(InstrumentFamily::CfxOpus, &[("A1", 1, 1.0, 9.0, None), ("A2", 1, 9.0, 1.0, None)]);
        let mut s = AnalysisSession::new(ds, "plate.zip");
        s.set_override(well("A1"), GenotypeLabel::Unknown);
        let plate = summarize_plate(&s);
        assert_eq!(plate.unknown_count, 1);
        assert_eq!(plate.unassigned_count, 1);
    }

    #[test]
    fn test_batch_concordance() {
        // A3 flips from heterozygous to allele 2 on the second plate
        let batch = batch_summary(&[session((5.0, 5.0)), session((9.0, 1.0))]);
        assert_eq!(batch.plates.len(), 2);
        assert_eq!(batch.concordance.total_compared, 4);
        assert_eq!(batch.concordance.concordant_wells, 3);
        assert_eq!(batch.concordance.percentage, Some(75.0));
    }
}
