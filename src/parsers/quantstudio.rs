//! Parser for QuantStudio 3 `.xls` exports.
//!
//! The first sheet carries key/value run metadata, a blank separator, then
//! a table whose header row starts with `Well`. Two exports are usable:
//! - Multicomponent Data: Well (1-96), Cycle, FAM, VIC or HEX, ROX
//! - Amplification Data: Well, Cycle, Target Name, Rn (two rows per well
//!   and cycle, one per allele target; Rn is already ROX-normalized)

use std::collections::BTreeSet;
use std::io::Cursor;

use calamine::{Data, Reader, Xls};

use super::sheet::{cell, cell_number, cell_text, column_of, header_upper};
use super::{cycle_from_f64, ExportParser, Upload};
use crate::assemble::{ChannelTable, ParsedExport};
use crate::detect::{Detection, Strategy};
use crate::error::ParseError;
use crate::model::{ExportShape, InstrumentFamily};
use crate::well::WellId;

const INSTRUMENT: &str = "QuantStudio 3";
/// Metadata block never runs longer than this
const HEADER_SEARCH_ROWS: usize = 60;

pub struct QuantStudioWorkbookParser;

impl ExportParser for QuantStudioWorkbookParser {
    fn format_name(&self) -> &str {
        "QuantStudio workbook"
    }

    fn can_parse(&self, detection: &Detection) -> bool {
        detection.strategy == Strategy::QuantStudioWorkbook
    }

    fn parse(&self, upload: &Upload<'_>, _detection: &Detection) -> Result<ParsedExport, ParseError> {
        let mut workbook = Xls::new(Cursor::new(upload.bytes)).map_err(|e| {
            ParseError::MalformedArchive(format!("Could not read this .xls file: {e}"))
        })?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| ParseError::malformed(upload.filename, "workbook has no sheets"))?
            .map_err(|e| ParseError::malformed(upload.filename, e.to_string()))?;
        let rows: Vec<&[Data]> = range.rows().collect();
        parse_rows(&rows, upload.filename)
    }
}

/// Column layout of the data table
#[derive(Debug, PartialEq)]
enum Layout {
    Multicomponent {
        well: usize,
        cycle: usize,
        fam: usize,
        allele2: (usize, &'static str),
        rox: Option<usize>,
    },
    Amplification {
        well: usize,
        cycle: usize,
        target: usize,
        rn: usize,
    },
}

fn find_header_row(rows: &[&[Data]]) -> Option<usize> {
    rows.iter().take(HEADER_SEARCH_ROWS).position(|row| {
        row.first()
            .and_then(cell_text)
            .is_some_and(|t| t.eq_ignore_ascii_case("well"))
    })
}

fn classify(headers: &[String]) -> Option<Layout> {
    let well = column_of(headers, "WELL")?;
    let cycle = column_of(headers, "CYCLE")?;

    if let Some(fam) = column_of(headers, "FAM") {
        let allele2 = ["VIC", "HEX"]
            .into_iter()
            .find_map(|dye| column_of(headers, dye).map(|c| (c, dye)));
        if let Some(allele2) = allele2 {
            return Some(Layout::Multicomponent {
                well,
                cycle,
                fam,
                allele2,
                rox: column_of(headers, "ROX"),
            });
        }
    }

    let target = column_of(headers, "TARGET NAME")?;
    let rn = column_of(headers, "RN")?;
    Some(Layout::Amplification {
        well,
        cycle,
        target,
        rn,
    })
}

/// Name a known QuantStudio export that cannot be used, by header first.
fn identify_export(headers: &[String], filename: &str) -> Option<&'static str> {
    let has = |h: &str| headers.iter().any(|x| x == h);
    if has("X1-M1") || has("X2-M2") {
        return Some("Raw Data");
    }
    if has("CALL") && (has("ALLELE1 DELTA RN") || has("QUALITY(%)")) {
        return Some("Results");
    }
    if has("ALLELE1 REPORTER") || (has("SNP ASSAY NAME") && !has("CALL")) {
        return Some("Sample Setup");
    }
    let lower = filename.to_ascii_lowercase();
    [
        ("multicomponent data", "Multicomponent Data"),
        ("amplification data", "Amplification Data"),
        ("raw data", "Raw Data"),
        ("results", "Results"),
        ("sample setup", "Sample Setup"),
    ]
    .into_iter()
    .find(|(key, _)| lower.contains(key))
    .map(|(_, name)| name)
}

fn unusable(headers: &[String], filename: &str) -> ParseError {
    let export = identify_export(headers, filename);
    let hint = match export {
        Some("Raw Data") => "This is a 'Raw Data' file with pre-deconvolution detector signals \
                             (x-m channels). These values haven't been separated into dye channels yet."
            .to_string(),
        Some("Results") => "This is a 'Results' file with endpoint genotyping calls only. \
                            It doesn't contain the per-cycle fluorescence needed for scatter plots."
            .to_string(),
        Some("Sample Setup") => "This is a 'Sample Setup' file with well assignments and sample \
                                 names. It doesn't contain fluorescence data."
            .to_string(),
        Some(other) => format!("This is a '{other}' file, but its columns are not in the expected layout."),
        None => {
            let mut columns: Vec<&str> = headers.iter().map(String::as_str).filter(|h| !h.is_empty()).collect();
            columns.sort_unstable();
            format!("This file has columns: {}", columns.join(", "))
        }
    };
    ParseError::UnsupportedFormat(format!(
        "{hint}\n\nPlease upload the 'Multicomponent Data' file instead.\n\
         In QuantStudio, export: File > Export > Multicomponent Data (.xls)"
    ))
}

/// Well column holds the 1-based well number; some exports write `A1`.
fn well_of(cell: &Data) -> Option<WellId> {
    match cell_number(cell) {
        Some(n) if n.fract() == 0.0 && n >= 1.0 => WellId::from_number(n as usize).ok(),
        Some(_) => None,
        None => cell_text(cell)?.parse().ok(),
    }
}

fn parse_rows(rows: &[&[Data]], filename: &str) -> Result<ParsedExport, ParseError> {
    let header_row = find_header_row(rows).ok_or_else(|| {
        ParseError::UnsupportedFormat(
            "This doesn't appear to be a QuantStudio data file.\n\
             Upload the 'Multicomponent Data' export file (.xls) from QuantStudio."
                .to_string(),
        )
    })?;
    let headers = header_upper(rows[header_row]);
    let data = &rows[header_row + 1..];

    let mut parsed = ParsedExport::new(
        INSTRUMENT,
        InstrumentFamily::QuantStudio,
        ExportShape::QuantStudioWorkbook,
        filename,
    );

    match classify(&headers) {
        Some(Layout::Multicomponent {
            well,
            cycle,
            fam,
            allele2,
            rox,
        }) => {
            log::info!("Reading QuantStudio Multicomponent Data ({} rows)", data.len());
            read_multicomponent(data, &mut parsed, (well, cycle, fam, allele2, rox))?;
        }
        Some(Layout::Amplification {
            well,
            cycle,
            target,
            rn,
        }) => {
            log::info!("Reading QuantStudio Amplification Data ({} rows)", data.len());
            read_amplification(data, &mut parsed, (well, cycle, target, rn))?;
        }
        None => return Err(unusable(&headers, filename)),
    }
    Ok(parsed)
}

type MulticomponentColumns = (usize, usize, usize, (usize, &'static str), Option<usize>);

fn read_multicomponent(
    data: &[&[Data]],
    parsed: &mut ParsedExport,
    (well_col, cycle_col, fam_col, (allele2_col, allele2_dye), rox_col): MulticomponentColumns,
) -> Result<(), ParseError> {
    let source = parsed.source.clone();
    let mut fam = ChannelTable::new("FAM", source.clone());
    let mut allele2 = ChannelTable::new(allele2_dye, source.clone());
    let mut rox = rox_col.map(|_| ChannelTable::new("ROX", source));

    for row in data {
        let (Some(well), Some(cycle)) = (
            well_of(cell(row, well_col)),
            cell_number(cell(row, cycle_col)).and_then(cycle_from_f64),
        ) else {
            continue;
        };
        // Unused wells have an empty FAM cell. A blank second-allele cell
        // in a used well reads as zero signal.
        let Some(fam_value) = cell_number(cell(row, fam_col)) else {
            continue;
        };
        let allele2_value = cell_number(cell(row, allele2_col)).unwrap_or(0.0);
        fam.insert(well, cycle, fam_value)?;
        allele2.insert(well, cycle, allele2_value)?;
        if let (Some(table), Some(col)) = (rox.as_mut(), rox_col) {
            if let Some(value) = cell_number(cell(row, col)) {
                table.insert(well, cycle, value)?;
            }
        }
    }

    parsed.fam = Some(fam);
    parsed.allele2 = Some(allele2);
    parsed.rox = rox.filter(|t| !t.is_empty());
    Ok(())
}

/// Which target names carry FAM and the second allele.
///
/// QuantStudio labels "Allele 1" as VIC/HEX and "Allele 2" as FAM. With two
/// unnamed targets the sorted first is the second allele.
fn allele_targets(targets: &BTreeSet<String>) -> Option<(String, String, &'static str)> {
    let mut fam_target = None;
    let mut allele2_target = None;
    let mut dye = "VIC";
    for target in targets {
        let lower = target.to_ascii_lowercase();
        if lower.contains("allele 2") || lower.contains("fam") {
            fam_target = Some(target.clone());
        } else if lower.contains("allele 1") || lower.contains("vic") || lower.contains("hex") {
            allele2_target = Some(target.clone());
            if lower.contains("hex") {
                dye = "HEX";
            }
        }
    }
    if fam_target.is_none() && allele2_target.is_none() && targets.len() == 2 {
        let mut sorted = targets.iter();
        allele2_target = sorted.next().cloned();
        fam_target = sorted.next().cloned();
    }
    Some((fam_target?, allele2_target?, dye))
}

fn read_amplification(
    data: &[&[Data]],
    parsed: &mut ParsedExport,
    (well_col, cycle_col, target_col, rn_col): (usize, usize, usize, usize),
) -> Result<(), ParseError> {
    let targets: BTreeSet<String> = data
        .iter()
        .filter_map(|row| cell_text(cell(row, target_col)))
        .collect();
    let (fam_target, allele2_target, dye) = allele_targets(&targets).ok_or_else(|| {
        ParseError::malformed(
            &parsed.source,
            format!(
                "could not identify allele targets; found: {}",
                targets.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
        )
    })?;
    log::debug!("FAM target '{}', {} target '{}'", fam_target, dye, allele2_target);

    let mut fam = ChannelTable::new("FAM", parsed.source.clone());
    let mut allele2 = ChannelTable::new(dye, parsed.source.clone());
    for row in data {
        let (Some(well), Some(cycle), Some(target), Some(rn)) = (
            well_of(cell(row, well_col)),
            cell_number(cell(row, cycle_col)).and_then(cycle_from_f64),
            cell_text(cell(row, target_col)),
            cell_number(cell(row, rn_col)),
        ) else {
            continue;
        };
        if target == fam_target {
            fam.insert(well, cycle, rn)?;
        } else if target == allele2_target {
            allele2.insert(well, cycle, rn)?;
        }
    }

    parsed.fam = Some(fam);
    parsed.allele2 = Some(allele2);
    parsed.rox = None;
    Ok(())
}
