//! Analysis configuration
//!
//! Parses YAML files that pin clustering parameters, the ROX mode and any
//! manual edits for a run. Every field is optional.

use crate::cluster::ClusteringParams;
use crate::model::{Dataset, GenotypeLabel, ManualOverrides};
use crate::normalize::RoxMode;
use crate::well::WellId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    /// Clustering algorithm and its parameters
    #[serde(default)]
    pub clustering: ClusteringParams,

    /// Reference-dye handling
    #[serde(default)]
    pub normalization: NormalizationConfig,

    /// Manual genotype labels, well -> label
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,

    /// Sample-name edits, well -> name
    #[serde(default)]
    pub sample_names: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct NormalizationConfig {
    #[serde(default)]
    pub rox: RoxSetting,
}

/// Requested ROX mode; `auto` keeps the instrument default
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoxSetting {
    #[default]
    Auto,
    Ratio,
    Raw,
}

impl RoxSetting {
    /// Mode to use for `dataset`.
    pub fn resolve(&self, dataset: &Dataset) -> RoxMode {
        match self {
            RoxSetting::Auto => RoxMode::default_for(dataset),
            RoxSetting::Ratio => RoxMode::Ratio,
            RoxSetting::Raw => RoxMode::Raw,
        }
    }
}

impl fmt::Display for RoxSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoxSetting::Auto => write!(f, "auto"),
            RoxSetting::Ratio => write!(f, "ratio"),
            RoxSetting::Raw => write!(f, "raw"),
        }
    }
}

impl AnalysisConfig {
    /// Load configuration from YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AnalysisConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.clustering
            .threshold
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid clustering.threshold: {}", e))?;

        if self.clustering.n_clusters < 1 {
            anyhow::bail!("clustering.n_clusters must be at least 1");
        }

        self.manual_overrides()?;
        self.sample_name_edits()?;
        Ok(())
    }

    /// Overrides keyed by canonical well
    pub fn manual_overrides(&self) -> Result<ManualOverrides> {
        self.overrides
            .iter()
            .map(|(well, label)| {
                let well: WellId = well
                    .parse()
                    .with_context(|| format!("Invalid well in overrides: '{}'", well))?;
                let label: GenotypeLabel = label
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!("Invalid override for {}: {}", well, e))?;
                Ok((well, label))
            })
            .collect()
    }

    /// Sample-name edits keyed by canonical well
    pub fn sample_name_edits(&self) -> Result<BTreeMap<WellId, String>> {
        self.sample_names
            .iter()
            .map(|(well, name)| {
                let well: WellId = well
                    .parse()
                    .with_context(|| format!("Invalid well in sample_names: '{}'", well))?;
                Ok((well, name.trim().to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusteringAlgorithm;
    use std::io::Write;

    const YAML: &str = r#"
clustering:
  algorithm: kmeans
  cycle: 35
  threshold:
    ntc_threshold: 0.05
normalization:
  rox: raw
overrides:
  A01: Heterozygous
  h12: ntc
sample_names:
  B3: " Donor-12 "
"#;

    #[test]
    fn test_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();
        let config = AnalysisConfig::from_yaml(file.path()).unwrap();

        assert_eq!(config.clustering.algorithm, ClusteringAlgorithm::Kmeans);
        assert_eq!(config.clustering.cycle, 35);
        assert_eq!(config.clustering.n_clusters, 4);
        assert_eq!(config.clustering.threshold.ntc_threshold, 0.05);
        assert_eq!(config.clustering.threshold.allele2_ratio_min, 0.6);
        assert_eq!(config.normalization.rox, RoxSetting::Raw);

        let overrides = config.manual_overrides().unwrap();
        assert_eq!(overrides[&"A1".parse::<WellId>().unwrap()], GenotypeLabel::Heterozygous);
        assert_eq!(overrides[&"H12".parse::<WellId>().unwrap()], GenotypeLabel::Ntc);
        let names = config.sample_name_edits().unwrap();
        assert_eq!(names[&"B3".parse::<WellId>().unwrap()], "Donor-12");
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: AnalysisConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, AnalysisConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.normalization.rox, RoxSetting::Auto);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AnalysisConfig::default();
        config.clustering.threshold.allele1_ratio_max = 0.7;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.clustering.threshold.ntc_threshold = -1.0;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.clustering.n_clusters = 0;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.overrides.insert("Z99".to_string(), "NTC".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Z99"));

        let mut config = AnalysisConfig::default();
        config.overrides.insert("A1".to_string(), "mystery".to_string());
        assert!(config.validate().is_err());
    }
}
