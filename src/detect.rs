//! Upload format detection and XML-bundle tier selection

use crate::error::{ParseError, RecognizedFile};
use crate::model::Tier;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Parsing strategy chosen for an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Strategy {
    /// ZIP of CFX per-dye XML tables
    XmlBundle,
    /// CFX .xlsx (packaging repaired before reading)
    CfxWorkbook,
    /// QuantStudio .xls
    QuantStudioWorkbook,
    /// QuantStudio raw .eds archive
    EdsArchive,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::XmlBundle => write!(f, "CFX XML bundle"),
            Strategy::CfxWorkbook => write!(f, "CFX workbook (.xlsx)"),
            Strategy::QuantStudioWorkbook => write!(f, "QuantStudio workbook (.xls)"),
            Strategy::EdsArchive => write!(f, "QuantStudio raw archive (.eds)"),
        }
    }
}

/// Logical file types of a CFX XML bundle, matched by filename suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum MemberKind {
    AmplificationFam,
    AmplificationHex,
    AmplificationVic,
    AmplificationRox,
    AdSheet,
    EndpointFam,
    EndpointHex,
    EndpointVic,
    EndpointRox,
}

impl MemberKind {
    pub const ALL: [MemberKind; 9] = [
        MemberKind::AmplificationFam,
        MemberKind::AmplificationHex,
        MemberKind::AmplificationVic,
        MemberKind::AmplificationRox,
        MemberKind::AdSheet,
        MemberKind::EndpointFam,
        MemberKind::EndpointHex,
        MemberKind::EndpointVic,
        MemberKind::EndpointRox,
    ];

    /// Filename suffix written by CFX Maestro. Prefixes (operator,
    /// timestamp, instrument serial) vary and are ignored.
    pub fn suffix(&self) -> &'static str {
        match self {
            MemberKind::AmplificationFam => "Quantification Amplification Results_FAM.xml",
            MemberKind::AmplificationHex => "Quantification Amplification Results_HEX.xml",
            MemberKind::AmplificationVic => "Quantification Amplification Results_VIC.xml",
            MemberKind::AmplificationRox => "Quantification Amplification Results_ROX.xml",
            MemberKind::AdSheet => "Allelic Discrimination Results_ADSheet.xml",
            MemberKind::EndpointFam => "End Point Results_FAM.xml",
            MemberKind::EndpointHex => "End Point Results_HEX.xml",
            MemberKind::EndpointVic => "End Point Results_VIC.xml",
            MemberKind::EndpointRox => "End Point Results_ROX.xml",
        }
    }

    pub fn is_amplification(&self) -> bool {
        matches!(
            self,
            MemberKind::AmplificationFam
                | MemberKind::AmplificationHex
                | MemberKind::AmplificationVic
                | MemberKind::AmplificationRox
        )
    }

    pub fn is_endpoint(&self) -> bool {
        matches!(
            self,
            MemberKind::EndpointFam
                | MemberKind::EndpointHex
                | MemberKind::EndpointVic
                | MemberKind::EndpointRox
        )
    }

    fn export_name(&self) -> &'static str {
        match self {
            k if k.is_amplification() => "Quantification Amplification Results",
            k if k.is_endpoint() => "End Point Results",
            _ => "Allelic Discrimination Results",
        }
    }

    fn incomplete_hint(&self) -> &'static str {
        if self.is_amplification() {
            "per-cycle curves for one dye; usable together with the FAM + HEX/VIC set and the ADSheet"
        } else if self.is_endpoint() {
            "end-point fluorescence and NTC layout; usable together with the ADSheet"
        } else {
            "allele calls and RFU values"
        }
    }
}

/// Classified members of a zip upload
#[derive(Debug, Clone, Default, Serialize)]
pub struct Manifest {
    /// Logical file type -> member path
    pub members: BTreeMap<MemberKind, String>,
    /// Known exports that carry no usable fluorescence data
    pub unusable: Vec<RecognizedFile>,
}

impl Manifest {
    pub fn has(&self, kind: MemberKind) -> bool {
        self.members.contains_key(&kind)
    }

    pub fn path(&self, kind: MemberKind) -> Option<&str> {
        self.members.get(&kind).map(String::as_str)
    }

    /// Every recognised file, usable or not, for error messages.
    pub fn recognized(&self) -> Vec<RecognizedFile> {
        let mut found: Vec<RecognizedFile> = self
            .members
            .iter()
            .map(|(kind, path)| RecognizedFile {
                path: path.clone(),
                export: kind.export_name().to_string(),
                hint: kind.incomplete_hint().to_string(),
            })
            .collect();
        found.extend(self.unusable.iter().cloned());
        found
    }
}

/// Outcome of format detection
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub strategy: Strategy,
    /// Present for XML bundles
    pub manifest: Option<Manifest>,
    /// Present for XML bundles
    pub tier: Option<Tier>,
}

fn tier1_available(m: &Manifest) -> bool {
    m.has(MemberKind::AdSheet)
        && m.has(MemberKind::AmplificationFam)
        && (m.has(MemberKind::AmplificationHex) || m.has(MemberKind::AmplificationVic))
}

fn tier2_available(m: &Manifest) -> bool {
    m.has(MemberKind::AdSheet) && m.members.keys().any(MemberKind::is_endpoint)
}

fn tier3_available(m: &Manifest) -> bool {
    m.has(MemberKind::AdSheet)
}

/// Tier priority, best first. Evaluated in order; the first satisfied
/// predicate wins.
const TIER_RULES: [(Tier, fn(&Manifest) -> bool); 3] = [
    (Tier::Tier1, tier1_available),
    (Tier::Tier2, tier2_available),
    (Tier::Tier3, tier3_available),
];

/// Highest tier the manifest supports.
pub fn select_tier(manifest: &Manifest) -> Result<Tier, ParseError> {
    TIER_RULES
        .iter()
        .find(|(_, available)| available(manifest))
        .map(|(tier, _)| *tier)
        .ok_or_else(|| ParseError::IncompleteTier {
            found: manifest.recognized(),
        })
}

/// Exports CFX Maestro can write that hold no per-well fluorescence.
const CFX_UNUSABLE_EXPORTS: &[(&str, &str)] = &[
    ("Quantification Cq Results", "Cq (cycle threshold) values only, not fluorescence curves"),
    ("Quantification Summary", "a summary of Cq values, not fluorescence data"),
    ("Quantification Plate View Results", "a plate-view summary of Cq values"),
    ("Melt Curve", "melt curve analysis data, not amplification fluorescence"),
    ("Gene Expression Results", "gene expression analysis results"),
    ("ANOVA Results", "ANOVA statistical results"),
    ("Standard Curve Results", "standard curve calibration data"),
    ("Run Information", "run metadata only"),
];

/// Look up a known but unusable CFX export by (file or sheet) name.
pub fn identify_cfx_export(name: &str) -> Option<(&'static str, &'static str)> {
    let lower = name.to_ascii_lowercase();
    CFX_UNUSABLE_EXPORTS
        .iter()
        .find(|(export, _)| lower.contains(&export.to_ascii_lowercase()))
        .copied()
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn is_junk_member(path: &str) -> bool {
    path.ends_with('/') || path.contains("__MACOSX") || basename(path).starts_with("._")
}

/// Classify zip member names against the CFX suffix table.
pub fn build_manifest<'a>(names: impl IntoIterator<Item = &'a str>) -> Manifest {
    let mut names: Vec<&str> = names.into_iter().filter(|n| !is_junk_member(n)).collect();
    names.sort_unstable();

    let mut manifest = Manifest::default();
    for name in names {
        let base = basename(name);
        if let Some(kind) = MemberKind::ALL.iter().find(|k| base.ends_with(k.suffix())) {
            if let Some(existing) = manifest.members.get(kind) {
                log::warn!(
                    "Ignoring duplicate {:?} member '{}' (using '{}')",
                    kind,
                    name,
                    existing
                );
                continue;
            }
            manifest.members.insert(*kind, name.to_string());
        } else if base.to_ascii_lowercase().ends_with(".xml") {
            if let Some((export, hint)) = identify_cfx_export(base) {
                manifest.unusable.push(RecognizedFile {
                    path: name.to_string(),
                    export: export.to_string(),
                    hint: format!("This file contains {hint}."),
                });
            }
        }
    }
    manifest
}

fn extension(filename: &str) -> String {
    let base = basename(filename);
    match base.rfind('.') {
        Some(dot) => base[dot + 1..].to_ascii_lowercase(),
        None => String::new(),
    }
}

fn zip_member_names(bytes: &[u8]) -> Result<Vec<String>, ParseError> {
    let archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    Ok(archive.file_names().map(str::to_string).collect())
}

fn is_workbook_member(name: &str) -> bool {
    name.replace('\\', "/").eq_ignore_ascii_case("xl/workbook.xml")
}

fn is_eds_member(name: &str) -> bool {
    basename(name).eq_ignore_ascii_case("multicomponentdata.xml")
}

fn bundle_detection(names: &[String]) -> Result<Detection, ParseError> {
    let manifest = build_manifest(names.iter().map(String::as_str));
    if manifest.members.is_empty() && manifest.unusable.is_empty() {
        return Err(ParseError::UnsupportedFormat(
            "This ZIP file does not contain recognized CFX Opus XML exports.\n\n\
             Expected files like:\n  - Allelic Discrimination Results_ADSheet.xml\n  \
             - Quantification Amplification Results_FAM.xml\n\n\
             Please ZIP the CFX Maestro XML export folder and upload."
                .to_string(),
        ));
    }
    let tier = select_tier(&manifest)?;
    log::info!(
        "Detected CFX XML bundle at {} ({} recognised members)",
        tier,
        manifest.members.len()
    );
    Ok(Detection {
        strategy: Strategy::XmlBundle,
        manifest: Some(manifest),
        tier: Some(tier),
    })
}

fn simple(strategy: Strategy) -> Detection {
    Detection {
        strategy,
        manifest: None,
        tier: None,
    }
}

/// Sniff a zip container whose extension did not settle the question.
fn detect_zip(bytes: &[u8]) -> Result<Detection, ParseError> {
    let names = zip_member_names(bytes)?;
    if names.iter().any(|n| is_workbook_member(n)) {
        return Ok(simple(Strategy::CfxWorkbook));
    }
    if names.iter().any(|n| is_eds_member(n)) {
        return Ok(simple(Strategy::EdsArchive));
    }
    bundle_detection(&names)
}

/// Choose a parsing strategy from the declared filename and the content.
pub fn detect(bytes: &[u8], filename: &str) -> Result<Detection, ParseError> {
    let ext = extension(filename);
    let is_zip = bytes.starts_with(ZIP_MAGIC);
    let is_ole = bytes.starts_with(OLE_MAGIC);

    let detection = match ext.as_str() {
        "pcrd" => {
            return Err(ParseError::UnsupportedFormat(
                "Bio-Rad .pcrd files are password-encrypted and cannot be read directly.\n\n\
                 Please export from CFX Maestro instead:\n  \
                 File > Export > 'Quantification Amplification Results' (.xlsx), \
                 or the XML export folder as a ZIP."
                    .to_string(),
            ))
        }
        "zip" => {
            if !is_zip {
                return Err(ParseError::MalformedArchive(
                    "This .zip file is not a valid ZIP archive".to_string(),
                ));
            }
            detect_zip(bytes)?
        }
        "eds" => {
            if !is_zip {
                return Err(ParseError::MalformedArchive(
                    "This .eds file appears to be corrupted (not a valid ZIP archive). \
                     Try re-exporting from QuantStudio."
                        .to_string(),
                ));
            }
            simple(Strategy::EdsArchive)
        }
        "xlsx" => {
            if !is_zip {
                return Err(ParseError::MalformedArchive(
                    "This .xlsx file is not a valid spreadsheet package".to_string(),
                ));
            }
            simple(Strategy::CfxWorkbook)
        }
        "xls" => {
            if is_zip {
                // Some tools save xlsx content under an .xls name.
                detect_zip(bytes)?
            } else {
                simple(Strategy::QuantStudioWorkbook)
            }
        }
        _ if is_zip => detect_zip(bytes)?,
        _ if is_ole => simple(Strategy::QuantStudioWorkbook),
        _ => {
            return Err(ParseError::UnsupportedFormat(format!(
                "Unsupported file '{}'.\nUpload .eds (QuantStudio raw), .xls (QuantStudio export), \
                 .xlsx (CFX Opus export), or .zip (CFX XML export) files.",
                basename(filename)
            )))
        }
    };

    log::info!("Detected format: {} ({})", detection.strategy, basename(filename));
    Ok(detection)
}
