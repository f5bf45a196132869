//! Error types for parsing and normalization

use crate::well::{format_wells, WellId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An export file that was recognised but cannot feed a dataset on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizedFile {
    /// Path of the member inside the upload
    pub path: String,
    /// Export type the file was identified as
    pub export: String,
    /// What the file contains and what to upload instead
    pub hint: String,
}

/// Parse-time failures. All are terminal for the upload.
#[derive(Error, Debug)]
pub enum ParseError {
    /// No recognised shape at all
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Archive recognised, but not even the minimum tier is present
    #[error("{}", incomplete_tier_message(.found))]
    IncompleteTier { found: Vec<RecognizedFile> },

    /// Container could not be opened or read
    #[error("Malformed archive: {0}")]
    MalformedArchive(String),

    /// A recognised file whose content is damaged
    #[error("Malformed file '{file}': {reason}")]
    MalformedFile { file: String, reason: String },

    /// Per-dye tables disagree on which wells they cover
    #[error(
        "Well sets differ between the {reference} and {channel} tables \
         (missing from {channel}: [{}]; only in {channel}: [{}])",
        format_wells(.missing),
        format_wells(.unexpected)
    )]
    WellMismatch {
        reference: String,
        channel: String,
        missing: Vec<WellId>,
        unexpected: Vec<WellId>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    pub fn malformed(file: impl Into<String>, reason: impl Into<String>) -> Self {
        ParseError::MalformedFile {
            file: file.into(),
            reason: reason.into(),
        }
    }
}

impl From<zip::result::ZipError> for ParseError {
    fn from(err: zip::result::ZipError) -> Self {
        ParseError::MalformedArchive(err.to_string())
    }
}

fn incomplete_tier_message(found: &[RecognizedFile]) -> String {
    let mut msg = String::from(
        "Incomplete export: 'Allelic Discrimination Results_ADSheet.xml' is required for every tier.\n",
    );
    if found.is_empty() {
        msg.push_str("No usable export files were found.\n");
    } else {
        msg.push_str("Found:\n");
        for file in found {
            msg.push_str(&format!("  - {} ({}): {}\n", file.path, file.export, file.hint));
        }
    }
    msg.push_str(
        "\nExport from CFX Maestro with File > Export > select all data types, \
         then ZIP the exported folder.",
    );
    msg
}

/// Failures of the normalization layer. Recoverable by the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizationError {
    /// Ratio mode requested but the dataset carries no reference channel
    #[error("ROX normalization unavailable: {instrument} dataset has no reference dye channel; use raw mode")]
    Unavailable { instrument: String },

    #[error("Cycle {requested} not available. Range: {first}-{last}")]
    CycleUnavailable { requested: u32, first: u32, last: u32 },

    #[error("Dataset contains no cycles")]
    EmptyDataset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_tier_lists_found_files() {
        let err = ParseError::IncompleteTier {
            found: vec![RecognizedFile {
                path: "run/Quantification Cq Results.xml".to_string(),
                export: "Quantification Cq Results".to_string(),
                hint: "Cq values only".to_string(),
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("Quantification Cq Results.xml"));
        assert!(msg.contains("Cq values only"));
        assert!(msg.contains("ADSheet"));
    }

    #[test]
    fn test_well_mismatch_names_wells() {
        let err = ParseError::WellMismatch {
            reference: "FAM".to_string(),
            channel: "HEX".to_string(),
            missing: vec!["B2".parse().unwrap()],
            unexpected: vec![],
        };
        let msg = err.to_string();
        assert!(msg.contains("FAM"));
        assert!(msg.contains("B2"));
    }
}
