//! Parser for CFX Opus / CFX Maestro `.xlsx` exports.
//!
//! Three exports are usable:
//! - Quantification Amplification Results: FAM, HEX or VIC, and optional
//!   ROX sheets in wide layout (`Cycle` column, then one column per well)
//! - End Point Results: the same dye sheets in long layout with `Well`
//!   and `End RFU` columns, one row per well
//! - Allelic Discrimination Results: an `ADSheet` sheet with Well,
//!   Sample, Call, RFU1 and RFU2
//!
//! Everything else CFX writes is recognised and rejected with guidance.

use std::io::Cursor;

use calamine::{Data, Range, Reader, Xlsx};

use super::sheet::{cell, cell_number, cell_text, column_of, first_row, header_upper};
use super::xlsx_repair::repair;
use super::{cycle_from_f64, ExportParser, Upload};
use crate::assemble::{ChannelTable, ParsedExport};
use crate::detect::{identify_cfx_export, Detection, Strategy};
use crate::error::ParseError;
use crate::model::{ExportShape, InstrumentFamily};
use crate::well::WellId;

type Workbook<'a> = Xlsx<Cursor<&'a [u8]>>;

pub struct CfxWorkbookParser;

impl ExportParser for CfxWorkbookParser {
    fn format_name(&self) -> &str {
        "CFX workbook"
    }

    fn can_parse(&self, detection: &Detection) -> bool {
        detection.strategy == Strategy::CfxWorkbook
    }

    fn parse(&self, upload: &Upload<'_>, _detection: &Detection) -> Result<ParsedExport, ParseError> {
        let repaired = repair(upload.bytes)?;
        let mut workbook: Workbook<'_> = Xlsx::new(Cursor::new(repaired.as_ref())).map_err(|e| {
            ParseError::MalformedArchive(format!(
                "Could not read this .xlsx file ({e}). If this is from CFX Opus/Maestro, \
                 the file may be corrupted."
            ))
        })?;
        let sheet_names = workbook.sheet_names();
        log::debug!("Workbook sheets: {}", sheet_names.join(", "));

        let has = |name: &str| sheet_names.iter().any(|s| s == name);
        let mut parsed = ParsedExport::new(
            "CFX Opus",
            InstrumentFamily::CfxOpus,
            ExportShape::CfxWorkbook,
            upload.filename,
        );

        if has("FAM") && (has("HEX") || has("VIC")) {
            let allele2 = if has("HEX") { "HEX" } else { "VIC" };
            let fam_range = sheet(&mut workbook, "FAM")?;
            match classify_dye_sheet(&fam_range) {
                DyeLayout::Wide => {
                    log::info!("Reading Quantification Amplification Results");
                    parsed.fam = Some(read_wide(&fam_range, "FAM")?);
                    parsed.allele2 = Some(read_wide(&sheet(&mut workbook, allele2)?, allele2)?);
                    if has("ROX") {
                        parsed.rox = Some(read_wide(&sheet(&mut workbook, "ROX")?, "ROX")?);
                    }
                }
                DyeLayout::EndPoint => {
                    log::info!("Reading End Point Results");
                    let fam = read_endpoint(&fam_range, "FAM", Some(&mut parsed))?;
                    parsed.fam = Some(fam);
                    let range = sheet(&mut workbook, allele2)?;
                    parsed.allele2 = Some(read_endpoint(&range, allele2, None)?);
                    if has("ROX") {
                        let range = sheet(&mut workbook, "ROX")?;
                        parsed.rox = Some(read_endpoint(&range, "ROX", None)?);
                    }
                }
                DyeLayout::PlateView => {
                    return Err(unusable(upload.filename, &sheet_names, Some("Plate View")))
                }
                DyeLayout::Unknown => return Err(unusable(upload.filename, &sheet_names, None)),
            }
            return Ok(parsed);
        }

        if has("ADSheet") {
            log::info!("Reading Allelic Discrimination Results");
            read_adsheet(&sheet(&mut workbook, "ADSheet")?, &mut parsed)?;
            return Ok(parsed);
        }

        Err(unusable(upload.filename, &sheet_names, None))
    }
}

fn sheet(workbook: &mut Workbook<'_>, name: &str) -> Result<Range<Data>, ParseError> {
    workbook
        .worksheet_range(name)
        .map_err(|e| ParseError::malformed(format!("sheet '{name}'"), e.to_string()))
}

#[derive(Debug, PartialEq)]
enum DyeLayout {
    Wide,
    EndPoint,
    PlateView,
    Unknown,
}

fn classify_dye_sheet(range: &Range<Data>) -> DyeLayout {
    let header = first_row(range);
    let upper = header_upper(header);
    if let Some(cycle_col) = column_of(&upper, "CYCLE") {
        if upper.len() > cycle_col + 1 {
            return DyeLayout::Wide;
        }
    }
    if column_of(&upper, "WELL").is_some() && column_of(&upper, "END RFU").is_some() {
        return DyeLayout::EndPoint;
    }
    let plate_columns = header
        .iter()
        .filter_map(cell_number)
        .any(|n| n.fract() == 0.0 && (1.0..=12.0).contains(&n));
    if plate_columns {
        return DyeLayout::PlateView;
    }
    DyeLayout::Unknown
}

/// Wide layout: header `[_, Cycle, A1, A2, ...]`, one row per cycle.
fn read_wide(range: &Range<Data>, dye: &str) -> Result<ChannelTable, ParseError> {
    let source = format!("{dye} sheet");
    let mut rows = range.rows();
    let header = rows.next().unwrap_or(&[]);
    let upper = header_upper(header);
    let cycle_col = column_of(&upper, "CYCLE")
        .ok_or_else(|| ParseError::malformed(&source, "no Cycle column"))?;

    let wells: Vec<(usize, WellId)> = header
        .iter()
        .enumerate()
        .skip(cycle_col + 1)
        .filter_map(|(col, c)| Some((col, cell_text(c)?.parse::<WellId>().ok()?)))
        .collect();
    if wells.is_empty() {
        return Err(ParseError::malformed(&source, "no well columns after Cycle"));
    }

    let mut table = ChannelTable::new(dye, source);
    for row in rows {
        let Some(cycle) = cell_number(cell(row, cycle_col)).and_then(cycle_from_f64) else {
            continue;
        };
        for &(col, well) in &wells {
            if let Some(value) = cell_number(cell(row, col)) {
                table.insert(well, cycle, value)?;
            }
        }
    }
    log::debug!("{}: {} wells", dye, table.values.len());
    Ok(table)
}

/// Long layout, one row per well. The FAM sheet also fills sample names
/// and content types when `records` is given.
fn read_endpoint(
    range: &Range<Data>,
    dye: &str,
    mut records: Option<&mut ParsedExport>,
) -> Result<ChannelTable, ParseError> {
    let source = format!("{dye} sheet");
    let mut rows = range.rows();
    let upper = header_upper(rows.next().unwrap_or(&[]));
    let well_col = column_of(&upper, "WELL")
        .ok_or_else(|| ParseError::malformed(&source, "no Well column"))?;
    let rfu_col = column_of(&upper, "END RFU")
        .ok_or_else(|| ParseError::malformed(&source, "no End RFU column"))?;
    let content_col = column_of(&upper, "CONTENT");
    let sample_col = column_of(&upper, "SAMPLE");
    let call_col = column_of(&upper, "CALL");

    let mut table = ChannelTable::new(dye, source);
    for row in rows {
        let Some(well) = cell_text(cell(row, well_col)).and_then(|t| t.parse::<WellId>().ok()) else {
            continue;
        };
        let Some(value) = cell_number(cell(row, rfu_col)) else {
            continue;
        };
        table.insert(well, 1, value)?;

        if let Some(parsed) = records.as_deref_mut() {
            let record = parsed.record_mut(well);
            record.content_type = content_col.and_then(|c| cell_text(cell(row, c)));
            record.sample = sample_col.and_then(|c| cell_text(cell(row, c)));
            record.call = call_col.and_then(|c| cell_text(cell(row, c)));
        }
    }
    Ok(table)
}

fn read_adsheet(range: &Range<Data>, parsed: &mut ParsedExport) -> Result<(), ParseError> {
    let source = "ADSheet";
    let mut rows = range.rows();
    let upper = header_upper(rows.next().unwrap_or(&[]));
    let (Some(well_col), Some(rfu1_col), Some(rfu2_col)) = (
        column_of(&upper, "WELL"),
        column_of(&upper, "RFU1"),
        column_of(&upper, "RFU2"),
    ) else {
        return Err(ParseError::malformed(
            source,
            "missing required columns (Well, RFU1, RFU2)",
        ));
    };
    let sample_col = column_of(&upper, "SAMPLE");
    let call_col = column_of(&upper, "CALL");

    for row in rows {
        let Some(well) = cell_text(cell(row, well_col)).and_then(|t| t.parse::<WellId>().ok()) else {
            continue;
        };
        let (Some(rfu1), Some(rfu2)) = (
            cell_number(cell(row, rfu1_col)),
            cell_number(cell(row, rfu2_col)),
        ) else {
            continue;
        };
        let record = parsed.record_mut(well);
        record.fam = Some(rfu1);
        record.allele2 = Some(rfu2);
        record.sample = sample_col.and_then(|c| cell_text(cell(row, c)));
        record.call = call_col.and_then(|c| cell_text(cell(row, c)));
    }
    Ok(())
}

fn unusable(filename: &str, sheet_names: &[String], layout: Option<&str>) -> ParseError {
    let identified = identify_cfx_export(filename).or_else(|| {
        sheet_names
            .iter()
            .find_map(|s| identify_cfx_export(s))
    });
    let (what, hint) = match (identified, layout) {
        (Some((export, hint)), _) => (Some(export), format!("This file contains {hint}.")),
        (None, Some(layout)) => (
            Some(layout),
            "This file contains a plate-view summary, not per-cycle fluorescence data.".to_string(),
        ),
        (None, None) => (None, format!("Sheets found: {}", sheet_names.join(", "))),
    };
    let lead = what.map(|w| format!("This is a '{w}' file. ")).unwrap_or_default();
    ParseError::UnsupportedFormat(format!(
        "{lead}{hint}\n\nPlease upload one of these CFX Opus export files:\n  \
         - 'Quantification Amplification Results' (best - has per-cycle data)\n  \
         - 'End Point Results' (endpoint fluorescence)\n  \
         - 'Allelic Discrimination Results' (allele calls + RFU)"
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detect::tests::zip_bytes;
    use crate::parsers::parse;

    #[derive(Clone)]
    pub(crate) enum Cell {
        Text(&'static str),
        Owned(String),
        Num(f64),
        Blank,
    }

    fn column_name(mut index: usize) -> String {
        let mut name = Vec::new();
        loop {
            name.push(b'A' + (index % 26) as u8);
            if index < 26 {
                break;
            }
            index = index / 26 - 1;
        }
        name.reverse();
        String::from_utf8(name).unwrap()
    }

    fn sheet_xml(rows: &[Vec<Cell>]) -> String {
        let mut xml = String::from(
            "<worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\"><sheetData>",
        );
        for (r, row) in rows.iter().enumerate() {
            xml.push_str(&format!("<row r=\"{}\">", r + 1));
            for (c, value) in row.iter().enumerate() {
                let at = format!("{}{}", column_name(c), r + 1);
                match value {
                    Cell::Text(t) => xml.push_str(&format!(
                        "<c r=\"{at}\" t=\"inlineStr\"><is><t>{t}</t></is></c>"
                    )),
                    Cell::Owned(t) => xml.push_str(&format!(
                        "<c r=\"{at}\" t=\"inlineStr\"><is><t>{t}</t></is></c>"
                    )),
                    Cell::Num(n) => xml.push_str(&format!("<c r=\"{at}\"><v>{n}</v></c>")),
                    Cell::Blank => {}
                }
            }
            xml.push_str("</row>");
        }
        xml.push_str("</sheetData></worksheet>");
        xml
    }

    /// Minimal workbook; `broken` reproduces the CFX packaging defects.
    pub(crate) fn xlsx(sheets: &[(&str, Vec<Vec<Cell>>)], broken: bool) -> Vec<u8> {
        let sep = if broken { "\\" } else { "/" };
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();

        let content_types = if broken { "[content_types].xml" } else { "[Content_Types].xml" };
        files.push((
            content_types.to_string(),
            b"<Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\"/>".to_vec(),
        ));
        files.push((
            format!("_rels{sep}.rels"),
            b"<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
              <Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument\" Target=\"xl/workbook.xml\"/>\
              </Relationships>"
                .to_vec(),
        ));

        let mut workbook = String::from(
            "<workbook xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" \
             xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\"><sheets>",
        );
        let mut rels = String::from(
            "<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">",
        );
        for (i, (name, rows)) in sheets.iter().enumerate() {
            let id = i + 1;
            workbook.push_str(&format!("<sheet name=\"{name}\" sheetId=\"{id}\" r:id=\"rId{id}\"/>"));
            rels.push_str(&format!(
                "<Relationship Id=\"rId{id}\" \
                 Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" \
                 Target=\"worksheets/sheet{id}.xml\"/>"
            ));
            files.push((
                format!("xl{sep}worksheets{sep}sheet{id}.xml"),
                sheet_xml(rows).into_bytes(),
            ));
        }
        workbook.push_str("</sheets></workbook>");
        rels.push_str("</Relationships>");
        files.push((format!("xl{sep}workbook.xml"), workbook.into_bytes()));
        files.push((format!("xl{sep}_rels{sep}workbook.xml.rels"), rels.into_bytes()));

        let refs: Vec<(&str, &[u8])> = files.iter().map(|(n, d)| (n.as_str(), d.as_slice())).collect();
        zip_bytes(&refs)
    }

    fn wide_sheet(wells: &[&'static str], cycles: &[(f64, f64)]) -> Vec<Vec<Cell>> {
        let mut header = vec![Cell::Blank, Cell::Text("Cycle")];
        header.extend(wells.iter().map(|w| Cell::Text(*w)));
        let mut rows = vec![header];
        for (cycle, base) in cycles {
            let mut row = vec![Cell::Blank, Cell::Num(*cycle)];
            row.extend((0..wells.len()).map(|i| Cell::Num(base + i as f64)));
            rows.push(row);
        }
        rows
    }

    #[test]
    fn test_amplification_workbook_with_broken_packaging() {
        let wells = ["A1", "A2", "B1"];
        let cycles = [(1.0, -80.06), (2.0, 100.0)];
        let bytes = xlsx(
            &[
                ("FAM", wide_sheet(&wells, &cycles)),
                ("HEX", wide_sheet(&wells, &cycles)),
                ("Run Information", vec![vec![Cell::Text("Run")]]),
            ],
            true,
        );
        let ds = parse(&bytes, "CT019 -  Quantification Amplification Results.xlsx").unwrap();
        assert_eq!(ds.allele2_dye, "HEX");
        assert_eq!(ds.cycles, vec![1, 2]);
        assert_eq!(ds.wells.len(), 3);
        assert!(!ds.has_rox);
        assert_eq!(ds.series("A1".parse().unwrap())[0].fam, -80.06);
    }

    #[test]
    fn test_endpoint_workbook_identifies_ntc() {
        let header = vec![
            Cell::Blank,
            Cell::Text("Well"),
            Cell::Text("Fluor"),
            Cell::Text("Content"),
            Cell::Text("Sample"),
            Cell::Text("End RFU"),
        ];
        let rows = |dye: &'static str| {
            let mut rows = vec![header.clone()];
            for (well, content, rfu) in [("A01", "Unkn", 1500.0), ("A02", "NTC", 20.0)] {
                rows.push(vec![
                    Cell::Blank,
                    Cell::Text(well),
                    Cell::Text(dye),
                    Cell::Text(content),
                    Cell::Owned(format!("S-{well}")),
                    Cell::Num(rfu),
                ]);
            }
            rows
        };
        let bytes = xlsx(&[("FAM", rows("FAM")), ("VIC", rows("VIC"))], false);
        let ds = parse(&bytes, "End Point Results.xlsx").unwrap();
        assert_eq!(ds.allele2_dye, "VIC");
        assert_eq!(ds.cycles, vec![1]);
        assert!(ds.is_ntc("A2".parse().unwrap()));
        assert_eq!(ds.sample_names.get(&"A1".parse().unwrap()).unwrap(), "S-A01");
    }

    #[test]
    fn test_adsheet_workbook() {
        let bytes = xlsx(
            &[(
                "ADSheet",
                vec![
                    vec![
                        Cell::Blank,
                        Cell::Text("Well"),
                        Cell::Text("Sample"),
                        Cell::Text("Call"),
                        Cell::Text("RFU1"),
                        Cell::Text("RFU2"),
                    ],
                    vec![
                        Cell::Blank,
                        Cell::Text("A01"),
                        Cell::Text("P1"),
                        Cell::Text("Allele 2"),
                        Cell::Num(2200.5),
                        Cell::Num(140.0),
                    ],
                    vec![
                        Cell::Blank,
                        Cell::Text("A02"),
                        Cell::Text("P2"),
                        Cell::Text("Heterozygote"),
                        Cell::Num(1200.0),
                        Cell::Num(1100.0),
                    ],
                ],
            )],
            false,
        );
        let ds = parse(&bytes, "Allelic Discrimination Results.xlsx").unwrap();
        assert_eq!(ds.allele2_dye, "HEX");
        assert_eq!(ds.wells.len(), 2);
        assert_eq!(ds.series("A1".parse().unwrap())[0].fam, 2200.5);
        assert!(!ds.has_ntc_identification());
    }

    #[test]
    fn test_cq_results_rejected_with_guidance() {
        let bytes = xlsx(&[("0", vec![vec![Cell::Text("Well"), Cell::Text("Cq")]])], false);
        let err = parse(&bytes, "run -  Quantification Cq Results.xlsx").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Quantification Cq Results"));
        assert!(msg.contains("Cq (cycle threshold)"));
    }

    #[test]
    fn test_plate_view_rejected() {
        let mut header = vec![Cell::Blank];
        header.extend((1..=12).map(|c| Cell::Num(c as f64)));
        let sheet = vec![header, vec![Cell::Text("A")]];
        let bytes = xlsx(&[("FAM", sheet.clone()), ("HEX", sheet)], false);
        let err = parse(&bytes, "export.xlsx").unwrap_err();
        assert!(err.to_string().contains("Plate View"));
    }
}
