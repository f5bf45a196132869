//! Canonical dataset and genotype label types

use crate::well::WellId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Instrument family that produced an upload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InstrumentFamily {
    /// Bio-Rad CFX Opus / CFX Maestro
    CfxOpus,
    /// Thermo Fisher QuantStudio
    QuantStudio,
}

impl fmt::Display for InstrumentFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentFamily::CfxOpus => write!(f, "CFX Opus"),
            InstrumentFamily::QuantStudio => write!(f, "QuantStudio 3"),
        }
    }
}

/// Container/encoding shape of an upload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExportShape {
    /// ZIP of flat per-dye XML tables
    XmlBundle,
    /// CFX workbook (.xlsx) with broken packaging
    CfxWorkbook,
    /// QuantStudio legacy workbook (.xls)
    QuantStudioWorkbook,
    /// QuantStudio raw run archive (.eds)
    EdsArchive,
}

impl fmt::Display for ExportShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportShape::XmlBundle => write!(f, "CFX XML bundle"),
            ExportShape::CfxWorkbook => write!(f, "CFX workbook"),
            ExportShape::QuantStudioWorkbook => write!(f, "QuantStudio workbook"),
            ExportShape::EdsArchive => write!(f, "QuantStudio .eds archive"),
        }
    }
}

/// Completeness level of an XML bundle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// Per-dye cycle series + allele-discrimination summary
    Tier1,
    /// Allele-discrimination summary + at least one endpoint table
    Tier2,
    /// Allele-discrimination summary only
    Tier3,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Tier1 => write!(f, "tier 1"),
            Tier::Tier2 => write!(f, "tier 2"),
            Tier::Tier3 => write!(f, "tier 3"),
        }
    }
}

/// One fluorescence reading
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CycleSample {
    pub well: WellId,
    pub cycle: u32,
    pub fam: f64,
    /// Second allele channel (VIC or HEX)
    pub allele2: f64,
    /// Reference dye, when the run recorded one
    pub rox: Option<f64>,
}

/// Named cycle range (amplification, end point, ...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataWindow {
    pub name: String,
    /// Inclusive
    pub start_cycle: u32,
    /// Inclusive
    pub end_cycle: u32,
}

/// Thermal protocol step recovered from a raw run archive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolStep {
    pub step: u32,
    pub temperature: f64,
    pub duration_sec: u32,
    pub cycles: u32,
    pub label: String,
}

/// Canonical assembled run. Built once per successful parse and never
/// mutated afterwards; edits live in [`crate::session::AnalysisSession`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    /// Display name of the instrument
    pub instrument: String,
    pub family: InstrumentFamily,
    pub shape: ExportShape,
    /// Bundle tier, for XML bundles
    #[serde(default)]
    pub tier: Option<Tier>,
    /// Channel identifier of the second allele (e.g. "HEX", "VIC")
    pub allele2_dye: String,
    /// Sorted, deduplicated
    pub wells: Vec<WellId>,
    /// Sorted, deduplicated
    pub cycles: Vec<u32>,
    pub samples: Vec<CycleSample>,
    /// True only when a reference series was present in the input
    pub has_rox: bool,
    /// Empty when every well carries the same placeholder label
    #[serde(default)]
    pub sample_names: BTreeMap<WellId, String>,
    /// Calls made by the instrument software
    #[serde(default)]
    pub instrument_calls: BTreeMap<WellId, String>,
    /// Content type per well ("Unkn", "NTC", ...), when the export has it
    #[serde(default)]
    pub content_types: BTreeMap<WellId, String>,
    #[serde(default)]
    pub protocol_steps: Vec<ProtocolStep>,
    #[serde(default)]
    pub data_windows: Vec<DataWindow>,
}

impl Dataset {
    pub fn first_cycle(&self) -> Option<u32> {
        self.cycles.first().copied()
    }

    pub fn last_cycle(&self) -> Option<u32> {
        self.cycles.last().copied()
    }

    /// Readings at one cycle, in well order.
    pub fn samples_at(&self, cycle: u32) -> Vec<&CycleSample> {
        let mut at: Vec<&CycleSample> = self.samples.iter().filter(|s| s.cycle == cycle).collect();
        at.sort_by_key(|s| s.well);
        at
    }

    /// All readings of one well, in cycle order.
    pub fn series(&self, well: WellId) -> Vec<&CycleSample> {
        let mut series: Vec<&CycleSample> = self.samples.iter().filter(|s| s.well == well).collect();
        series.sort_by_key(|s| s.cycle);
        series
    }

    /// Whether the export carried content types, i.e. NTC wells can be told apart.
    pub fn has_ntc_identification(&self) -> bool {
        !self.content_types.is_empty()
    }

    /// Wells declared as no-template controls by the instrument export.
    pub fn ntc_wells(&self) -> BTreeSet<WellId> {
        self.content_types
            .iter()
            .filter(|(_, content)| is_ntc_content(content))
            .map(|(well, _)| *well)
            .collect()
    }

    pub fn is_ntc(&self, well: WellId) -> bool {
        self.content_types
            .get(&well)
            .map(|c| is_ntc_content(c))
            .unwrap_or(false)
    }

    pub fn amplification_window(&self) -> Option<&DataWindow> {
        self.data_windows
            .iter()
            .find(|w| w.name == "Amplification")
            .or_else(|| {
                self.data_windows
                    .iter()
                    .max_by_key(|w| w.end_cycle.saturating_sub(w.start_cycle))
            })
    }
}

fn is_ntc_content(content: &str) -> bool {
    content.trim().eq_ignore_ascii_case("NTC")
}

/// Genotype label, automatic or manual
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GenotypeLabel {
    #[serde(rename = "Allele 1 Homo")]
    Allele1Homo,
    #[serde(rename = "Allele 2 Homo")]
    Allele2Homo,
    #[serde(rename = "Heterozygous")]
    Heterozygous,
    #[serde(rename = "NTC")]
    Ntc,
    #[serde(rename = "Undetermined")]
    Undetermined,
    /// Manual only
    #[serde(rename = "Unknown")]
    Unknown,
    /// Manual only
    #[serde(rename = "Positive Control")]
    PositiveControl,
}

impl GenotypeLabel {
    /// Homozygote or heterozygote call, usable for allele counting.
    pub fn is_definite_call(&self) -> bool {
        matches!(
            self,
            GenotypeLabel::Allele1Homo | GenotypeLabel::Allele2Homo | GenotypeLabel::Heterozygous
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GenotypeLabel::Allele1Homo => "Allele 1 Homo",
            GenotypeLabel::Allele2Homo => "Allele 2 Homo",
            GenotypeLabel::Heterozygous => "Heterozygous",
            GenotypeLabel::Ntc => "NTC",
            GenotypeLabel::Undetermined => "Undetermined",
            GenotypeLabel::Unknown => "Unknown",
            GenotypeLabel::PositiveControl => "Positive Control",
        }
    }
}

impl fmt::Display for GenotypeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GenotypeLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "allele1homo" | "allele1" | "aa" => Ok(GenotypeLabel::Allele1Homo),
            "allele2homo" | "allele2" | "bb" => Ok(GenotypeLabel::Allele2Homo),
            "heterozygous" | "het" | "ab" | "both" => Ok(GenotypeLabel::Heterozygous),
            "ntc" | "notemplatecontrol" => Ok(GenotypeLabel::Ntc),
            "undetermined" => Ok(GenotypeLabel::Undetermined),
            "unknown" => Ok(GenotypeLabel::Unknown),
            "positivecontrol" | "pc" => Ok(GenotypeLabel::PositiveControl),
            _ => Err(format!("unknown genotype label '{s}'")),
        }
    }
}

/// Clustering parameters for the threshold algorithm
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ThresholdConfig {
    /// Both normalized axes below this value => NTC
    #[serde(default = "default_ntc_threshold")]
    pub ntc_threshold: f64,
    /// FAM fraction below this value => allele 1 homozygote
    #[serde(default = "default_allele1_ratio_max")]
    pub allele1_ratio_max: f64,
    /// FAM fraction above this value => allele 2 homozygote
    #[serde(default = "default_allele2_ratio_min")]
    pub allele2_ratio_min: f64,
}

fn default_ntc_threshold() -> f64 {
    0.1
}

fn default_allele1_ratio_max() -> f64 {
    0.4
}

fn default_allele2_ratio_min() -> f64 {
    0.6
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            ntc_threshold: default_ntc_threshold(),
            allele1_ratio_max: default_allele1_ratio_max(),
            allele2_ratio_min: default_allele2_ratio_min(),
        }
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.allele1_ratio_max < self.allele2_ratio_min) {
            return Err(format!(
                "allele1_ratio_max ({}) must be below allele2_ratio_min ({})",
                self.allele1_ratio_max, self.allele2_ratio_min
            ));
        }
        if !self.ntc_threshold.is_finite() || self.ntc_threshold < 0.0 {
            return Err(format!("ntc_threshold must be a non-negative number, got {}", self.ntc_threshold));
        }
        Ok(())
    }

    /// NTC rule shared by clustering and QC.
    pub fn is_ntc_signal(&self, norm_fam: f64, norm_allele2: f64) -> bool {
        norm_fam < self.ntc_threshold && norm_allele2 < self.ntc_threshold
    }
}

/// Automatic labels from one clustering run. Wells without data are absent.
pub type ClusterAssignment = BTreeMap<WellId, GenotypeLabel>;

/// User-entered labels, kept apart from automatic ones.
pub type ManualOverrides = BTreeMap<WellId, GenotypeLabel>;
