//! One loaded upload and the user's edits on top of it
//!
//! The dataset itself never changes after parsing. The ROX mode is fixed
//! when the session is created (instrument default or configured value)
//! and only changes through [`AnalysisSession::set_rox_mode`]. Manual
//! labels and sample names live in side maps.

use crate::cluster::{cluster, effective_labels, unassigned_wells, ClusteringParams, ClusteringResult};
use crate::config::AnalysisConfig;
use crate::error::NormalizationError;
use crate::model::{ClusterAssignment, Dataset, GenotypeLabel, ManualOverrides};
use crate::normalize::{check_mode, RoxMode};
use crate::well::WellId;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AnalysisSession {
    dataset: Arc<Dataset>,
    source: String,
    rox_mode: RoxMode,
    params: ClusteringParams,
    overrides: ManualOverrides,
    sample_name_edits: BTreeMap<WellId, String>,
    clustering: Option<ClusteringResult>,
}

impl AnalysisSession {
    /// Session in the instrument's default ROX mode.
    pub fn new(dataset: Dataset, source: impl Into<String>) -> Self {
        let rox_mode = RoxMode::default_for(&dataset);
        log::debug!("Session starts in {} mode for {}", rox_mode, dataset.instrument);
        Self {
            dataset: Arc::new(dataset),
            source: source.into(),
            rox_mode,
            params: ClusteringParams::default(),
            overrides: ManualOverrides::new(),
            sample_name_edits: BTreeMap::new(),
            clustering: None,
        }
    }

    /// Session with the configured mode, parameters and edits applied.
    ///
    /// Fails when the configuration forces ratio mode on a dataset without
    /// a reference channel.
    pub fn from_config(dataset: Dataset, source: impl Into<String>, config: &AnalysisConfig) -> anyhow::Result<Self> {
        let mut session = Self::new(dataset, source);
        let mode = config.normalization.rox.resolve(&session.dataset);
        session.set_rox_mode(mode)?;
        session.params = config.clustering;
        session.overrides = config.manual_overrides()?;
        session.sample_name_edits = config.sample_name_edits()?;
        Ok(session)
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Shared handle for callers that outlive the session borrow
    pub fn dataset_arc(&self) -> Arc<Dataset> {
        Arc::clone(&self.dataset)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn rox_mode(&self) -> RoxMode {
        self.rox_mode
    }

    pub fn params(&self) -> &ClusteringParams {
        &self.params
    }

    pub fn set_params(&mut self, params: ClusteringParams) {
        self.params = params;
    }

    /// Switch normalization. Ratio mode without a reference channel is
    /// refused and the current mode is kept. A change drops the previous
    /// clustering, which was computed on the old values.
    pub fn set_rox_mode(&mut self, mode: RoxMode) -> Result<(), NormalizationError> {
        if let Err(e) = check_mode(&self.dataset, mode) {
            log::warn!("{}; staying in {} mode", e, self.rox_mode);
            return Err(e);
        }
        if mode != self.rox_mode {
            self.rox_mode = mode;
            self.clustering = None;
        }
        Ok(())
    }

    pub fn overrides(&self) -> &ManualOverrides {
        &self.overrides
    }

    pub fn set_override(&mut self, well: WellId, label: GenotypeLabel) {
        self.overrides.insert(well, label);
    }

    /// Returns the removed label, if any.
    pub fn clear_override(&mut self, well: WellId) -> Option<GenotypeLabel> {
        self.overrides.remove(&well)
    }

    pub fn clear_overrides(&mut self) {
        self.overrides.clear();
    }

    /// An empty name removes the edit and restores the exported one.
    pub fn set_sample_name(&mut self, well: WellId, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            self.sample_name_edits.remove(&well);
        } else {
            self.sample_name_edits.insert(well, name.to_string());
        }
    }

    /// Exported sample names with the user's edits on top
    pub fn sample_names(&self) -> BTreeMap<WellId, String> {
        let mut names = self.dataset.sample_names.clone();
        names.extend(self.sample_name_edits.iter().map(|(w, n)| (*w, n.clone())));
        names
    }

    /// Cluster with the session's parameters and mode; the result replaces
    /// any previous one. Manual labels are left untouched.
    pub fn run_clustering(&mut self) -> Result<&ClusteringResult, NormalizationError> {
        let result = cluster(&self.dataset, self.rox_mode, &self.params)?;
        Ok(&*self.clustering.insert(result))
    }

    pub fn clustering(&self) -> Option<&ClusteringResult> {
        self.clustering.as_ref()
    }

    /// Automatic labels of the latest run, empty before the first one
    pub fn assignment(&self) -> ClusterAssignment {
        self.clustering
            .as_ref()
            .map(|c| c.assignments.clone())
            .unwrap_or_default()
    }

    /// Manual over automatic for every labelled well of the dataset
    pub fn effective_labels(&self) -> BTreeMap<WellId, GenotypeLabel> {
        effective_labels(&self.dataset.wells, &self.assignment(), &self.overrides)
    }

    /// Dataset wells carrying no label yet
    pub fn unassigned_wells(&self) -> Vec<WellId> {
        unassigned_wells(&self.dataset.wells, &self.assignment(), &self.overrides)
    }
}
