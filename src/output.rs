//! Report generation and output

use crate::cluster::{cluster, ClusteringResult};
use crate::ct::{calculate_all_ct, WellCt};
use crate::error::NormalizationError;
use crate::model::{DataWindow, Dataset, ExportShape, GenotypeLabel, ProtocolStep, Tier};
use crate::normalize::{normalize, plate_view, resolve_cycle, NormalizedPoint, PlateWell, RoxMode};
use crate::onset::suggested_cycle;
use crate::qc::{plate_qc, QcResult};
use crate::scoring::{assess_quality, summarize, QualityResult, QualitySummary};
use crate::session::AnalysisSession;
use crate::stats::{statistics, StatisticsReport};
use crate::well::WellId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Shape of an upload as seen by `inspect`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetSummary {
    pub instrument: String,
    pub shape: ExportShape,
    #[serde(default)]
    pub tier: Option<Tier>,
    pub allele2_dye: String,
    pub n_wells: usize,
    pub n_cycles: usize,
    pub first_cycle: Option<u32>,
    pub last_cycle: Option<u32>,
    pub has_rox: bool,
    /// Instrument default normalization
    pub default_rox_mode: RoxMode,
    pub has_ntc_identification: bool,
    pub ntc_wells: Vec<WellId>,
    pub n_sample_names: usize,
    pub n_instrument_calls: usize,
    #[serde(default)]
    pub data_windows: Vec<DataWindow>,
    #[serde(default)]
    pub protocol_steps: Vec<ProtocolStep>,
}

impl DatasetSummary {
    pub fn from_dataset(dataset: &Dataset) -> Self {
        Self {
            instrument: dataset.instrument.clone(),
            shape: dataset.shape,
            tier: dataset.tier,
            allele2_dye: dataset.allele2_dye.clone(),
            n_wells: dataset.wells.len(),
            n_cycles: dataset.cycles.len(),
            first_cycle: dataset.first_cycle(),
            last_cycle: dataset.last_cycle(),
            has_rox: dataset.has_rox,
            default_rox_mode: RoxMode::default_for(dataset),
            has_ntc_identification: dataset.has_ntc_identification(),
            ntc_wells: dataset.ntc_wells().into_iter().collect(),
            n_sample_names: dataset.sample_names.len(),
            n_instrument_calls: dataset.instrument_calls.len(),
            data_windows: dataset.data_windows.clone(),
            protocol_steps: dataset.protocol_steps.clone(),
        }
    }
}

/// Full analysis of one upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Tool version
    pub version: String,
    /// RFC 3339 generation time
    pub generated_at: String,
    /// Upload name
    pub source: String,
    pub dataset: DatasetSummary,
    pub rox_mode: RoxMode,
    /// Cycle every endpoint view below refers to
    pub cycle: u32,
    /// Cycle just before NTC amplification, when a window is known
    #[serde(default)]
    pub suggested_cycle: Option<u32>,
    pub scatter: Vec<NormalizedPoint>,
    pub plate: Vec<PlateWell>,
    pub clustering: ClusteringResult,
    pub effective_labels: BTreeMap<WellId, GenotypeLabel>,
    /// Wells with no manual or automatic label
    #[serde(default)]
    pub unassigned: Vec<WellId>,
    pub quality: BTreeMap<WellId, QualityResult>,
    pub quality_summary: QualitySummary,
    pub qc: QcResult,
    pub statistics: StatisticsReport,
    pub ct: BTreeMap<WellId, WellCt>,
}

impl AnalysisReport {
    /// Build from a session. Uses the session's clustering when present,
    /// otherwise clusters with the session's parameters.
    pub fn build(session: &AnalysisSession) -> Result<Self, NormalizationError> {
        let dataset = session.dataset();
        let mode = session.rox_mode();
        let params = session.params();

        let clustering = match session.clustering() {
            Some(existing) => existing.clone(),
            None => cluster(dataset, mode, params)?,
        };
        let cycle = resolve_cycle(dataset, clustering.cycle)?;
        let overrides = session.overrides();

        let quality = assess_quality(dataset, mode, &params.threshold)?;
        let quality_summary = summarize(&quality);
        let effective_labels = crate::cluster::effective_labels(&dataset.wells, &clustering.assignments, overrides);
        let unassigned = crate::cluster::unassigned_wells(&dataset.wells, &clustering.assignments, overrides);

        Ok(AnalysisReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            source: session.source().to_string(),
            dataset: DatasetSummary::from_dataset(dataset),
            rox_mode: mode,
            cycle,
            suggested_cycle: suggested_cycle(dataset),
            scatter: normalize(dataset, cycle, mode)?,
            plate: plate_view(
                dataset,
                cycle,
                mode,
                &session.sample_names(),
                &clustering.assignments,
                overrides,
            )?,
            qc: plate_qc(dataset, cycle, mode, &params.threshold, &clustering.assignments, overrides)?,
            statistics: statistics(&effective_labels),
            ct: calculate_all_ct(dataset, mode)?,
            effective_labels,
            unassigned,
            quality,
            quality_summary,
            clustering,
        })
    }
}

/// Save any serializable result as JSON, plain or gzipped.
pub trait JsonReport: Serialize {
    /// Save report to pretty-printed JSON file
    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Save report to compact JSON (no pretty print, smaller file)
    fn save_compact<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Save report to gzipped JSON file
    fn save_gzip<P: AsRef<Path>>(&self, path: P, compact: bool) -> Result<()> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let file = std::fs::File::create(path.as_ref())
            .with_context(|| format!("Failed to create {}", path.as_ref().display()))?;
        let mut encoder = GzEncoder::new(file, Compression::default());

        let json = if compact {
            serde_json::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };

        encoder.write_all(json.as_bytes())?;
        encoder.finish()?;
        Ok(())
    }
}

impl JsonReport for AnalysisReport {}
impl JsonReport for DatasetSummary {}
impl JsonReport for crate::batch::BatchSummary {}
impl JsonReport for crate::compare::RunComparison {}
