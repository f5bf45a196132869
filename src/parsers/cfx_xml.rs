//! Parser for CFX Maestro XML export bundles (ZIP of per-dye tables).
//!
//! Every table is a root element named after the dye or data type with
//! flat `<Row>` children:
//! - Amplification: `<Cycle>` plus one tag per well (`<A01>`, ...)
//! - ADSheet: `<Well>`, `<Sample>`, `<Call>`, `<Type>`, `<RFU1>`, `<RFU2>`
//! - End point: `<Well>`, `<Content>`, `<Sample_Type>`, `<End_RFU>`, ...

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use super::{parse_cycle, parse_value, parse_well, ExportParser, Upload};
use crate::assemble::{ChannelTable, ParsedExport};
use crate::detect::{Detection, Manifest, MemberKind, Strategy};
use crate::error::ParseError;
use crate::model::{ExportShape, InstrumentFamily, Tier};
use crate::well::WellId;
use crate::xml::{parse_document, XmlNode};

pub struct CfxXmlBundleParser;

impl ExportParser for CfxXmlBundleParser {
    fn format_name(&self) -> &str {
        "CFX XML bundle"
    }

    fn can_parse(&self, detection: &Detection) -> bool {
        detection.strategy == Strategy::XmlBundle
    }

    fn parse(&self, upload: &Upload<'_>, detection: &Detection) -> Result<ParsedExport, ParseError> {
        let manifest = detection.manifest.as_ref().ok_or_else(|| {
            ParseError::UnsupportedFormat("XML bundle detected without a manifest".to_string())
        })?;
        let tier = match detection.tier {
            Some(tier) => tier,
            None => crate::detect::select_tier(manifest)?,
        };
        let mut bundle = Bundle::open(upload.bytes, manifest)?;

        let mut parsed = ParsedExport::new(
            "CFX Opus",
            InstrumentFamily::CfxOpus,
            ExportShape::XmlBundle,
            upload.filename,
        );
        parsed.tier = Some(tier);

        read_adsheet(&mut bundle, &mut parsed)?;
        if tier != Tier::Tier3 {
            read_endpoints(&mut bundle, &mut parsed)?;
        }
        if tier == Tier::Tier1 {
            read_amplification(&mut bundle, &mut parsed)?;
        }
        Ok(parsed)
    }
}

/// Zip archive plus the classified member paths.
struct Bundle<'a> {
    archive: zip::ZipArchive<Cursor<&'a [u8]>>,
    manifest: &'a Manifest,
}

impl<'a> Bundle<'a> {
    fn open(bytes: &'a [u8], manifest: &'a Manifest) -> Result<Self, ParseError> {
        Ok(Self {
            archive: zip::ZipArchive::new(Cursor::new(bytes))?,
            manifest,
        })
    }

    fn has(&self, kind: MemberKind) -> bool {
        self.manifest.has(kind)
    }

    /// Parse one member into an element tree. Returns the member path too.
    fn document(&mut self, kind: MemberKind) -> Result<Option<(String, XmlNode)>, ParseError> {
        let manifest = self.manifest;
        let Some(path) = manifest.path(kind) else {
            return Ok(None);
        };
        let mut data = Vec::new();
        self.archive.by_name(path)?.read_to_end(&mut data)?;
        let root = parse_document(&data).map_err(|reason| ParseError::malformed(path, reason))?;
        log::debug!("Read {} ({} bytes)", path, data.len());
        Ok(Some((path.to_string(), root)))
    }
}

fn required_text<'n>(row: &'n XmlNode, tag: &str, file: &str) -> Result<&'n str, ParseError> {
    row.child_text(tag)
        .ok_or_else(|| ParseError::malformed(file, format!("row without <{tag}>")))
}

fn optional_text(row: &XmlNode, tag: &str) -> Option<String> {
    row.child_text(tag).map(str::to_string)
}

/// Per-cycle table for one dye. The first row fixes the well order; every
/// row is keyed by its own `<Cycle>` value.
pub(crate) fn parse_amplification(root: &XmlNode, file: &str) -> Result<ChannelTable, ParseError> {
    let channel = root.tag.to_ascii_uppercase();
    let mut table = ChannelTable::new(channel.clone(), file);
    let mut well_tags: Vec<(String, WellId)> = Vec::new();

    for (index, row) in root.children_named("Row").enumerate() {
        let cycle = parse_cycle(required_text(row, "Cycle", file)?, file)?;

        if index == 0 {
            for child in row.children.iter().filter(|c| c.tag != "Cycle") {
                well_tags.push((child.tag.clone(), parse_well(&child.tag, file)?));
            }
            if well_tags.is_empty() {
                return Err(ParseError::malformed(file, "first row has no well columns"));
            }
        }

        for (tag, well) in &well_tags {
            let text = required_text(row, tag, file)?;
            table.insert(*well, cycle, parse_value(text, file, &channel)?)?;
        }
    }

    if table.is_empty() {
        return Err(ParseError::malformed(file, "no cycle rows"));
    }
    log::debug!(
        "{}: {} wells from {}",
        table.channel,
        table.values.len(),
        file
    );
    Ok(table)
}

fn read_amplification(bundle: &mut Bundle<'_>, parsed: &mut ParsedExport) -> Result<(), ParseError> {
    let allele2_kind = if bundle.has(MemberKind::AmplificationHex) {
        MemberKind::AmplificationHex
    } else {
        MemberKind::AmplificationVic
    };

    for kind in [MemberKind::AmplificationFam, allele2_kind, MemberKind::AmplificationRox] {
        let Some((path, root)) = bundle.document(kind)? else {
            continue;
        };
        let table = parse_amplification(&root, &path)?;
        match kind {
            MemberKind::AmplificationFam => parsed.fam = Some(table),
            MemberKind::AmplificationRox => parsed.rox = Some(table),
            _ => parsed.allele2 = Some(table),
        }
    }
    Ok(())
}

/// ADSheet rows: sample name, instrument call, and end-point RFU1/RFU2.
fn read_adsheet(bundle: &mut Bundle<'_>, parsed: &mut ParsedExport) -> Result<(), ParseError> {
    let (path, root) = bundle
        .document(MemberKind::AdSheet)?
        .ok_or_else(|| ParseError::IncompleteTier {
            found: bundle.manifest.recognized(),
        })?;

    let mut rows = 0usize;
    for row in root.children_named("Row") {
        let well = parse_well(required_text(row, "Well", &path)?, &path)?;
        let rfu1 = parse_value(required_text(row, "RFU1", &path)?, &path, "RFU1")?;
        let rfu2 = parse_value(required_text(row, "RFU2", &path)?, &path, "RFU2")?;

        let record = parsed.record_mut(well);
        record.sample = optional_text(row, "Sample");
        record.call = optional_text(row, "Call");
        record.fam = Some(rfu1);
        record.allele2 = Some(rfu2);
        rows += 1;
    }
    log::debug!("ADSheet: {} wells", rows);
    Ok(())
}

/// End-point tables identify NTC wells and name the second-allele dye.
fn read_endpoints(bundle: &mut Bundle<'_>, parsed: &mut ParsedExport) -> Result<(), ParseError> {
    let mut content_types: BTreeMap<WellId, String> = BTreeMap::new();

    for kind in MemberKind::ALL.into_iter().filter(MemberKind::is_endpoint) {
        let Some((path, root)) = bundle.document(kind)? else {
            continue;
        };
        let dye = root.tag.to_ascii_uppercase();
        if matches!(dye.as_str(), "VIC" | "HEX") && parsed.allele2_dye.is_none() {
            parsed.allele2_dye = Some(dye);
        }

        for row in root.children_named("Row") {
            let well = parse_well(required_text(row, "Well", &path)?, &path)?;
            let content = row.child_text("Content").unwrap_or_default();
            let sample_type = row.child_text("Sample_Type").unwrap_or_default();
            let label = if content == "NTC" || sample_type == "NTC" {
                "NTC"
            } else if !content.is_empty() {
                content
            } else if !sample_type.is_empty() {
                sample_type
            } else {
                "Unkn"
            };
            // An NTC marking in any dye's table wins.
            let entry = content_types.entry(well).or_insert_with(|| label.to_string());
            if label == "NTC" {
                *entry = label.to_string();
            }
        }
    }

    for (well, content) in content_types {
        parsed.record_mut(well).content_type = Some(content);
    }
    Ok(())
}
