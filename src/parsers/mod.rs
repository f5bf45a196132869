//! Instrument export parsers
//!
//! Each parser turns one concrete upload shape into a [`ParsedExport`],
//! which [`crate::assemble`] merges into the canonical dataset. The parser
//! is chosen via [`parse()`] from the [`Detection`] result.
//!
//! # Example
//! ```ignore
//! pub struct MyExportParser;
//!
//! impl ExportParser for MyExportParser {
//!     fn format_name(&self) -> &str { "my export" }
//!     fn can_parse(&self, detection: &Detection) -> bool { /* check strategy */ }
//!     fn parse(&self, upload: &Upload<'_>, detection: &Detection)
//!         -> Result<ParsedExport, ParseError> { /* ... */ }
//! }
//! ```

mod cfx_workbook;
mod cfx_xml;
mod eds;
mod extract;
mod quantstudio;
mod sheet;
pub mod xlsx_repair;

use crate::assemble::{assemble, ParsedExport};
use crate::detect::{detect, Detection};
use crate::error::ParseError;
use crate::model::Dataset;
use crate::well::WellId;

pub use cfx_workbook::CfxWorkbookParser;
pub use cfx_xml::CfxXmlBundleParser;
pub use eds::EdsArchiveParser;
pub use extract::ExtractedArchive;
pub use quantstudio::QuantStudioWorkbookParser;

/// Raw upload as received.
#[derive(Debug, Clone, Copy)]
pub struct Upload<'a> {
    /// Declared filename, used for the extension and in messages
    pub filename: &'a str,
    pub bytes: &'a [u8],
}

/// Trait for parsing one instrument export shape.
pub trait ExportParser {
    /// Human-readable name of the shape
    fn format_name(&self) -> &str;

    /// Whether this parser handles the detected shape.
    fn can_parse(&self, detection: &Detection) -> bool;

    /// Parse the upload into the common intermediate.
    fn parse(&self, upload: &Upload<'_>, detection: &Detection) -> Result<ParsedExport, ParseError>;
}

fn all_parsers() -> Vec<Box<dyn ExportParser>> {
    vec![
        Box::new(CfxXmlBundleParser),
        Box::new(CfxWorkbookParser),
        Box::new(QuantStudioWorkbookParser),
        Box::new(EdsArchiveParser),
    ]
}

/// Detect, parse, and assemble an upload into a [`Dataset`].
pub fn parse(bytes: &[u8], filename: &str) -> Result<Dataset, ParseError> {
    let detection = detect(bytes, filename)?;
    let upload = Upload { filename, bytes };
    for parser in all_parsers() {
        if parser.can_parse(&detection) {
            log::info!("Parsing with {} parser", parser.format_name());
            let parsed = parser.parse(&upload, &detection)?;
            return assemble(parsed);
        }
    }
    Err(ParseError::UnsupportedFormat(format!(
        "No parser available for {}",
        detection.strategy
    )))
}

/// Read a file from disk and parse it.
pub fn parse_path(path: &std::path::Path) -> Result<Dataset, ParseError> {
    let bytes = std::fs::read(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parse(&bytes, &filename)
}

/// Parse a signed fluorescence value. No clamping.
pub(crate) fn parse_value(text: &str, file: &str, what: &str) -> Result<f64, ParseError> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| ParseError::malformed(file, format!("invalid {what} value '{text}'")))
}

/// Parse a cycle number, accepting spreadsheet floats such as `12.0`.
pub(crate) fn parse_cycle(text: &str, file: &str) -> Result<u32, ParseError> {
    cycle_from_f64(text.trim().parse::<f64>().unwrap_or(f64::NAN))
        .ok_or_else(|| ParseError::malformed(file, format!("invalid cycle number '{text}'")))
}

pub(crate) fn cycle_from_f64(value: f64) -> Option<u32> {
    if value.is_finite() && value >= 1.0 && value.fract() == 0.0 && value <= u32::MAX as f64 {
        Some(value as u32)
    } else {
        None
    }
}

pub(crate) fn parse_well(text: &str, file: &str) -> Result<WellId, ParseError> {
    text.parse::<WellId>()
        .map_err(|e| ParseError::malformed(file, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::tests::zip_bytes;
    use crate::model::Tier;

    const ADSHEET: &str = "x -  Allelic Discrimination Results_ADSheet.xml";
    const EP_FAM: &str = "x -  End Point Results_FAM.xml";

    fn adsheet_xml() -> Vec<u8> {
        let mut xml = String::from("<ADSheet>");
        for (well, sample, rfu1, rfu2) in [
            ("A01", "S1", "1520.4", "310.2"),
            ("A02", "S2", "-80.06", "1410.9"),
            ("A03", "NTC", "12.0", "9.5"),
        ] {
            xml.push_str(&format!(
                "<Row><Well>{well}</Well><Sample>{sample}</Sample><Call>Allele 1</Call>\
                 <Type>Unkn</Type><RFU1>{rfu1}</RFU1><RFU2>{rfu2}</RFU2></Row>"
            ));
        }
        xml.push_str("</ADSheet>");
        xml.into_bytes()
    }

    fn endpoint_xml() -> Vec<u8> {
        let mut xml = String::from("<FAM>");
        for (well, content) in [("A01", "Unkn"), ("A02", "Unkn"), ("A03", "NTC")] {
            xml.push_str(&format!(
                "<Row><Well>{well}</Well><Fluor>FAM</Fluor><Target>SNP</Target>\
                 <Content>{content}</Content><Sample>x</Sample><End_RFU>100</End_RFU></Row>"
            ));
        }
        xml.push_str("</FAM>");
        xml.into_bytes()
    }

    #[test]
    fn test_tier3_then_tier2_upgrade() {
        let ad = adsheet_xml();
        let tier3 = zip_bytes(&[(ADSHEET, ad.as_slice())]);
        let ds = parse(&tier3, "bundle.zip").unwrap();
        assert_eq!(ds.tier, Some(Tier::Tier3));
        assert!(!ds.has_ntc_identification());
        assert_eq!(ds.wells.len(), 3);

        let ep = endpoint_xml();
        let tier2 = zip_bytes(&[(ADSHEET, ad.as_slice()), (EP_FAM, ep.as_slice())]);
        let ds = parse(&tier2, "bundle.zip").unwrap();
        assert_eq!(ds.tier, Some(Tier::Tier2));
        assert!(ds.has_ntc_identification());
        assert!(ds.is_ntc("A3".parse().unwrap()));
    }

    #[test]
    fn test_negative_value_round_trips() {
        let ad = adsheet_xml();
        let bytes = zip_bytes(&[(ADSHEET, ad.as_slice())]);
        let ds = parse(&bytes, "bundle.zip").unwrap();
        let a2 = ds.series("A2".parse().unwrap());
        assert_eq!(a2[0].fam, -80.06);
    }

    #[test]
    fn test_cycle_parsing() {
        assert_eq!(parse_cycle("12", "f").unwrap(), 12);
        assert_eq!(parse_cycle("12.0", "f").unwrap(), 12);
        assert!(parse_cycle("0", "f").is_err());
        assert!(parse_cycle("1.5", "f").is_err());
        assert!(parse_cycle("x", "f").is_err());
    }

    #[test]
    fn test_value_parsing_keeps_sign() {
        assert_eq!(parse_value(" -80.06 ", "f", "FAM").unwrap(), -80.06);
        assert!(parse_value("", "f", "FAM").is_err());
    }
}
