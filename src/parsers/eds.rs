//! Parser for QuantStudio `.eds` raw run archives.
//!
//! An `.eds` file is a zip. The spectrally decomposed per-dye signal lives in
//! `multicomponentdata.xml`:
//!
//! ```text
//! <TCStageFlags>[1, 5, 5, ..., 5, 6]</TCStageFlags>   1 pre-read, 5 cycling, 6 post-read
//! <DyeData WellIndex="N"><DyeList>[VIC, FAM, ROX]</DyeList></DyeData>
//! <SignalData WellIndex="N">
//!   <CycleData>[f, f, ...]</CycleData>                 one per dye, DyeList order
//! </SignalData>
//! ```
//!
//! `WellIndex` is 0-based row-major. `plate_setup.xml` (sample names) and
//! `tcprotocol.xml` (thermal protocol) are read when present.

use std::collections::BTreeMap;
use std::path::Path;

use super::extract::ExtractedArchive;
use super::{parse_value, ExportParser, Upload};
use crate::assemble::{ChannelTable, ParsedExport};
use crate::detect::{Detection, Strategy};
use crate::error::ParseError;
use crate::model::{DataWindow, ExportShape, InstrumentFamily, ProtocolStep};
use crate::well::WellId;
use crate::xml::{bracket_items, parse_document, XmlNode};

const INSTRUMENT: &str = "QuantStudio 3 (raw)";
const MULTICOMPONENT: &str = "multicomponentdata.xml";
const PLATE_SETUP: &str = "plate_setup.xml";
const PROTOCOL: &str = "tcprotocol.xml";

/// `TCStageFlags` value of an amplification read
const STAGE_CYCLING: i64 = 5;

pub struct EdsArchiveParser;

impl ExportParser for EdsArchiveParser {
    fn format_name(&self) -> &str {
        "QuantStudio .eds"
    }

    fn can_parse(&self, detection: &Detection) -> bool {
        detection.strategy == Strategy::EdsArchive
    }

    fn parse(&self, upload: &Upload<'_>, _detection: &Detection) -> Result<ParsedExport, ParseError> {
        parse_eds_in(upload, None)
    }
}

/// Extract and parse. The extraction directory is released when this
/// returns, whatever the outcome.
pub(crate) fn parse_eds_in(upload: &Upload<'_>, parent: Option<&Path>) -> Result<ParsedExport, ParseError> {
    let archive = ExtractedArchive::extract_in(upload.bytes, "eds_", parent)?;

    let mc_path = archive.find(MULTICOMPONENT).ok_or_else(|| {
        ParseError::UnsupportedFormat(format!(
            "This .eds file does not contain {MULTICOMPONENT}.\n\
             It may be corrupted or from an unsupported instrument."
        ))
    })?;
    let mc = document(&archive, mc_path)?;

    let mut parsed = ParsedExport::new(
        INSTRUMENT,
        InstrumentFamily::QuantStudio,
        ExportShape::EdsArchive,
        upload.filename,
    );
    read_multicomponent(&mc, MULTICOMPONENT, &mut parsed)?;

    if let Some(path) = archive.find(PLATE_SETUP) {
        let names = sample_names(&document(&archive, path)?, PLATE_SETUP)?;
        log::debug!("{}: {} sample names", PLATE_SETUP, names.len());
        for (well, name) in names {
            parsed.record_mut(well).sample = Some(name);
        }
    }

    if let Some(path) = archive.find(PROTOCOL) {
        parsed.protocol_steps = protocol_steps(&document(&archive, path)?, PROTOCOL)?;
        log::debug!("{}: {} protocol steps", PROTOCOL, parsed.protocol_steps.len());
    }

    Ok(parsed)
}

fn document(archive: &ExtractedArchive, path: &Path) -> Result<XmlNode, ParseError> {
    let bytes = archive.read(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parse_document(&bytes).map_err(|reason| ParseError::malformed(name, reason))
}

fn well_index(node: &XmlNode, file: &str) -> Result<WellId, ParseError> {
    let raw = node
        .attr("WellIndex")
        .ok_or_else(|| ParseError::malformed(file, format!("<{}> without WellIndex", node.tag)))?;
    raw.trim()
        .parse::<usize>()
        .ok()
        .and_then(|i| WellId::from_index(i).ok())
        .ok_or_else(|| ParseError::malformed(file, format!("invalid WellIndex '{raw}'")))
}

#[derive(Debug, Clone, Copy)]
struct DyeRoles {
    fam: usize,
    allele2: usize,
    rox: Option<usize>,
}

fn dye_roles(dyes: &[String], file: &str) -> Result<(DyeRoles, String), ParseError> {
    let find = |names: &[&str]| dyes.iter().position(|d| names.contains(&d.to_ascii_uppercase().as_str()));
    match (find(&["FAM"]), find(&["VIC", "HEX"])) {
        (Some(fam), Some(allele2)) => Ok((
            DyeRoles {
                fam,
                allele2,
                rox: find(&["ROX"]),
            },
            dyes[allele2].to_ascii_uppercase(),
        )),
        _ => Err(ParseError::malformed(
            file,
            format!(
                "expected FAM and VIC/HEX dyes but found [{}]; \
                 this run may not be an SNP genotyping experiment",
                dyes.join(", ")
            ),
        )),
    }
}

fn read_multicomponent(root: &XmlNode, file: &str, parsed: &mut ParsedExport) -> Result<(), ParseError> {
    let flags: Vec<i64> = root
        .descendants_named("TCStageFlags")
        .first()
        .copied()
        .map(|n| bracket_items(&n.text))
        .unwrap_or_default()
        .into_iter()
        .map(|v| {
            v.parse::<i64>()
                .map_err(|_| ParseError::malformed(file, format!("invalid stage flag '{v}'")))
        })
        .collect::<Result<_, _>>()?;

    let mut dye_lists: BTreeMap<WellId, Vec<String>> = BTreeMap::new();
    for node in root.descendants_named("DyeData") {
        let dyes: Vec<String> = node
            .child_text("DyeList")
            .map(bracket_items)
            .unwrap_or_default()
            .into_iter()
            .map(str::to_string)
            .collect();
        if !dyes.is_empty() {
            dye_lists.insert(well_index(node, file)?, dyes);
        }
    }

    let (first_well, first_dyes) = dye_lists.iter().next().ok_or_else(|| {
        ParseError::malformed(file, "no assigned wells found")
    })?;
    // Signal rows are indexed by dye position, so every well must share one order
    if let Some((well, dyes)) = dye_lists.iter().find(|(_, dyes)| *dyes != first_dyes) {
        return Err(ParseError::malformed(
            file,
            format!(
                "well {} lists dyes [{}], expected [{}] as in well {}",
                well,
                dyes.join(", "),
                first_dyes.join(", "),
                first_well
            ),
        ));
    }
    let (roles, allele2_dye) = dye_roles(first_dyes, file)?;
    log::debug!("Dye roles from well {}: {:?} ({})", first_well, roles, allele2_dye);

    let mut fam = ChannelTable::new("FAM", file);
    let mut allele2 = ChannelTable::new(allele2_dye, file);
    let mut rox = roles.rox.map(|_| ChannelTable::new("ROX", file));

    for node in root.descendants_named("SignalData") {
        let well = well_index(node, file)?;
        if !dye_lists.contains_key(&well) {
            continue;
        }
        let series: Vec<Vec<f64>> = node
            .children_named("CycleData")
            .map(|cd| {
                bracket_items(&cd.text)
                    .into_iter()
                    .map(|v| parse_value(v, file, "CycleData"))
                    .collect::<Result<Vec<f64>, _>>()
            })
            .collect::<Result<_, _>>()?;

        let reads = series.get(roles.fam).map(Vec::len).unwrap_or(0);
        let cycling: Vec<usize> = if flags.is_empty() {
            (0..reads).collect()
        } else {
            flags
                .iter()
                .enumerate()
                .filter(|(_, f)| **f == STAGE_CYCLING)
                .map(|(i, _)| i)
                .collect()
        };

        for (n, &read) in cycling.iter().enumerate() {
            let cycle = n as u32 + 1;
            let (Some(f), Some(a)) = (
                series.get(roles.fam).and_then(|s| s.get(read)),
                series.get(roles.allele2).and_then(|s| s.get(read)),
            ) else {
                continue;
            };
            fam.insert(well, cycle, *f)?;
            allele2.insert(well, cycle, *a)?;
            if let (Some(table), Some(index)) = (rox.as_mut(), roles.rox) {
                if let Some(r) = series.get(index).and_then(|s| s.get(read)) {
                    table.insert(well, cycle, *r)?;
                }
            }
        }
    }

    if flags.is_empty() {
        log::warn!("{} has no TCStageFlags; treating every read as a cycle", file);
    }
    let cycles = fam.values.values().flat_map(|c| c.keys()).max().copied().unwrap_or(0);
    if cycles > 0 {
        parsed.data_windows.push(DataWindow {
            name: "Amplification".to_string(),
            start_cycle: 1,
            end_cycle: cycles,
        });
    }

    parsed.fam = Some(fam);
    parsed.allele2 = Some(allele2);
    parsed.rox = rox.filter(|t| !t.is_empty());
    Ok(())
}

/// Well -> sample name from the `sample` feature map.
fn sample_names(root: &XmlNode, file: &str) -> Result<BTreeMap<WellId, String>, ParseError> {
    let mut names = BTreeMap::new();
    for map in root.descendants_named("FeatureMap") {
        if map.path_text("Feature/Id") != Some("sample") {
            continue;
        }
        for value in map.children_named("FeatureValue") {
            let Some(index) = value.child_text("Index") else {
                continue;
            };
            let well = index
                .parse::<usize>()
                .ok()
                .and_then(|i| WellId::from_index(i).ok())
                .ok_or_else(|| ParseError::malformed(file, format!("invalid well index '{index}'")))?;
            let name = value
                .descendants_named("Sample")
                .into_iter()
                .find_map(|s| s.child_text("Name"));
            if let Some(name) = name {
                names.insert(well, name.to_string());
            }
        }
    }
    Ok(names)
}

fn number_or<T: std::str::FromStr>(node: &XmlNode, tag: &str, default: T) -> T {
    node.child_text(tag)
        .and_then(|t| t.trim().parse().ok())
        .unwrap_or(default)
}

fn step_label(stage_flag: &str, steps_in_stage: usize, index: usize, step: &XmlNode, touchdown: bool) -> String {
    match stage_flag {
        "PRE_READ" => "Pre-Read".to_string(),
        "POST_READ" => "Post-Read".to_string(),
        "PRE_CYCLING" => "Initial Denaturation".to_string(),
        "CYCLING" if steps_in_stage == 1 => "Cycling".to_string(),
        other if steps_in_stage == 1 => other.to_string(),
        _ if index == 0 => {
            if touchdown {
                "Denaturation (Touchdown)".to_string()
            } else {
                "Denaturation".to_string()
            }
        }
        _ if step.child_text("CollectionFlag") == Some("1") => "Data Collection".to_string(),
        _ => {
            let ext: f64 = number_or(step, "ExtTemperature", 0.0);
            if touchdown && ext != 0.0 {
                format!("Annealing (TD {ext:+.1}/cyc)")
            } else {
                "Annealing".to_string()
            }
        }
    }
}

fn protocol_steps(root: &XmlNode, file: &str) -> Result<Vec<ProtocolStep>, ParseError> {
    let mut steps = Vec::new();
    for stage in root.descendants_named("TCStage") {
        let flag = stage.child_text("StageFlag").unwrap_or_default();
        let repetitions: u32 = number_or(stage, "NumOfRepetitions", 1);
        let touchdown = stage.child_text("AutoDeltaEnabled") == Some("true");

        let stage_steps: Vec<&XmlNode> = stage.children_named("TCStep").collect();
        for (index, step) in stage_steps.iter().enumerate() {
            let temperature = match step.child_text("Temperature") {
                Some(t) => parse_value(t, file, "Temperature")?,
                None => 0.0,
            };
            steps.push(ProtocolStep {
                step: steps.len() as u32 + 1,
                temperature,
                duration_sec: number_or(step, "HoldTime", 0),
                cycles: repetitions,
                label: step_label(flag, stage_steps.len(), index, step, touchdown),
            });
        }
    }
    Ok(steps)
}
