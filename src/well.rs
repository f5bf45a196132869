//! 96-well plate coordinates
//!
//! Instruments disagree on how wells are written: `A01`, `a1`, the 1-based
//! well number `1`, or the 0-based row-major index `0`. Everything is
//! funnelled through [`WellId`], whose canonical text form is the row letter
//! followed by the unpadded column number (`A1` .. `H12`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Rows on a standard plate (A..H)
pub const PLATE_ROWS: u8 = 8;
/// Columns on a standard plate (1..12)
pub const PLATE_COLUMNS: u8 = 12;
/// Wells on a standard plate
pub const PLATE_WELLS: usize = PLATE_ROWS as usize * PLATE_COLUMNS as usize;

const ROW_LETTERS: &[u8; 8] = b"ABCDEFGH";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WellIdError {
    #[error("invalid well identifier '{0}'")]
    Invalid(String),

    #[error("well '{0}' is outside the 8x12 plate")]
    OutOfRange(String),
}

/// One of the 96 plate positions.
///
/// Ordering is row-major (`A1 < A2 < .. < A12 < B1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WellId {
    /// 0-based row (A = 0)
    row: u8,
    /// 1-based column
    column: u8,
}

impl WellId {
    /// Build from a 0-based row and a 1-based column.
    pub fn new(row: u8, column: u8) -> Result<Self, WellIdError> {
        if row >= PLATE_ROWS || column == 0 || column > PLATE_COLUMNS {
            return Err(WellIdError::OutOfRange(format!("row {row}, column {column}")));
        }
        Ok(Self { row, column })
    }

    /// Build from a 0-based row-major index (0 = A1, 95 = H12).
    pub fn from_index(index: usize) -> Result<Self, WellIdError> {
        if index >= PLATE_WELLS {
            return Err(WellIdError::OutOfRange(format!("index {index}")));
        }
        let row = (index / PLATE_COLUMNS as usize) as u8;
        let column = (index % PLATE_COLUMNS as usize) as u8 + 1;
        Ok(Self { row, column })
    }

    /// Build from a 1-based well number as written by QuantStudio (1 = A1).
    pub fn from_number(number: usize) -> Result<Self, WellIdError> {
        if number == 0 {
            return Err(WellIdError::OutOfRange("well number 0".to_string()));
        }
        Self::from_index(number - 1)
    }

    /// 0-based row-major index.
    pub fn index(&self) -> usize {
        self.row as usize * PLATE_COLUMNS as usize + (self.column as usize - 1)
    }

    /// 0-based row (A = 0).
    pub fn row(&self) -> u8 {
        self.row
    }

    /// 1-based column.
    pub fn column(&self) -> u8 {
        self.column
    }

    pub fn row_letter(&self) -> char {
        ROW_LETTERS[self.row as usize] as char
    }

    /// Every plate position in row-major order.
    pub fn all() -> impl Iterator<Item = WellId> {
        (0..PLATE_WELLS).map(|i| WellId {
            row: (i / PLATE_COLUMNS as usize) as u8,
            column: (i % PLATE_COLUMNS as usize) as u8 + 1,
        })
    }
}

impl FromStr for WellId {
    type Err = WellIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut chars = trimmed.chars();
        let letter = chars
            .next()
            .ok_or_else(|| WellIdError::Invalid(s.to_string()))?
            .to_ascii_uppercase();
        let digits = chars.as_str();

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(WellIdError::Invalid(s.to_string()));
        }

        let row = ROW_LETTERS
            .iter()
            .position(|&b| b as char == letter)
            .ok_or_else(|| WellIdError::OutOfRange(s.to_string()))?;
        let column: u32 = digits
            .parse()
            .map_err(|_| WellIdError::Invalid(s.to_string()))?;
        if column == 0 || column > PLATE_COLUMNS as u32 {
            return Err(WellIdError::OutOfRange(s.to_string()));
        }

        Ok(Self {
            row: row as u8,
            column: column as u8,
        })
    }
}

impl fmt::Display for WellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.row_letter(), self.column)
    }
}

impl From<WellId> for String {
    fn from(well: WellId) -> Self {
        well.to_string()
    }
}

impl TryFrom<String> for WellId {
    type Error = WellIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Canonical text form of a well identifier (`A01` -> `A1`).
pub fn canonicalize(raw: &str) -> Result<String, WellIdError> {
    raw.parse::<WellId>().map(|w| w.to_string())
}

/// Join wells for log and error messages.
pub fn format_wells(wells: &[WellId]) -> String {
    const SHOWN: usize = 12;
    let mut listed: Vec<String> = wells.iter().take(SHOWN).map(|w| w.to_string()).collect();
    if wells.len() > SHOWN {
        listed.push(format!("... (+{} more)", wells.len() - SHOWN));
    }
    listed.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_strips_padding() {
        assert_eq!(canonicalize("A01").unwrap(), "A1");
        assert_eq!(canonicalize("H12").unwrap(), "H12");
        assert_eq!(canonicalize(" c007 ").unwrap(), "C7");
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        for raw in ["A01", "b3", "H12", "D010"] {
            let once = canonicalize(raw).unwrap();
            assert_eq!(canonicalize(&once).unwrap(), once);
        }
    }

    #[test]
    fn test_rejects_out_of_plate() {
        assert!(matches!(canonicalize("I1"), Err(WellIdError::OutOfRange(_))));
        assert!(matches!(canonicalize("A13"), Err(WellIdError::OutOfRange(_))));
        assert!(matches!(canonicalize("A0"), Err(WellIdError::OutOfRange(_))));
        assert!(matches!(canonicalize("A"), Err(WellIdError::Invalid(_))));
        assert!(matches!(canonicalize("A1x"), Err(WellIdError::Invalid(_))));
        assert!(canonicalize("").is_err());
    }

    #[test]
    fn test_index_round_trip_and_order() {
        let wells: Vec<WellId> = WellId::all().collect();
        assert_eq!(wells.len(), PLATE_WELLS);
        assert_eq!(wells[0].to_string(), "A1");
        assert_eq!(wells[12].to_string(), "B1");
        assert_eq!(wells[95].to_string(), "H12");
        for (i, w) in wells.iter().enumerate() {
            assert_eq!(w.index(), i);
            assert_eq!(WellId::from_index(i).unwrap(), *w);
        }
        let mut shuffled = vec![wells[40], wells[3], wells[95], wells[0]];
        shuffled.sort();
        assert_eq!(shuffled, vec![wells[0], wells[3], wells[40], wells[95]]);
    }

    #[test]
    fn test_well_number_is_one_based() {
        assert_eq!(WellId::from_number(1).unwrap().to_string(), "A1");
        assert_eq!(WellId::from_number(13).unwrap().to_string(), "B1");
        assert_eq!(WellId::from_number(96).unwrap().to_string(), "H12");
        assert!(WellId::from_number(0).is_err());
        assert!(WellId::from_number(97).is_err());
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let well: WellId = "A05".parse().unwrap();
        assert_eq!(serde_json::to_string(&well).unwrap(), "\"A5\"");
        let back: WellId = serde_json::from_str("\"a05\"").unwrap();
        assert_eq!(back, well);
    }
}
