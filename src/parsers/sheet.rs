//! Cell helpers shared by the workbook parsers

use calamine::{Data, Range};

/// Trimmed text of a cell; numbers are rendered without a trailing `.0`.
pub(crate) fn cell_text(cell: &Data) -> Option<String> {
    let text = match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Numeric value of a cell. Text cells are not coerced.
pub(crate) fn cell_number(cell: &Data) -> Option<f64> {
    match cell {
        Data::Float(f) => Some(*f),
        Data::Int(i) => Some(*i as f64),
        _ => None,
    }
}

/// Header row as upper-cased text, one entry per column.
pub(crate) fn header_upper(row: &[Data]) -> Vec<String> {
    row.iter()
        .map(|c| cell_text(c).unwrap_or_default().to_ascii_uppercase())
        .collect()
}

pub(crate) fn column_of(headers: &[String], name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}

/// First row of a range, or an empty slice.
pub(crate) fn first_row(range: &Range<Data>) -> &[Data] {
    range.rows().next().unwrap_or(&[])
}

pub(crate) fn cell(row: &[Data], column: usize) -> &Data {
    static EMPTY: Data = Data::Empty;
    row.get(column).unwrap_or(&EMPTY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_conversions() {
        assert_eq!(cell_text(&Data::String(" Well ".to_string())), Some("Well".to_string()));
        assert_eq!(cell_text(&Data::Float(12.0)), Some("12".to_string()));
        assert_eq!(cell_text(&Data::Empty), None);
        assert_eq!(cell_number(&Data::Float(-80.06)), Some(-80.06));
        assert_eq!(cell_number(&Data::Int(3)), Some(3.0));
        assert_eq!(cell_number(&Data::String("3".to_string())), None);
    }

    #[test]
    fn test_header_lookup() {
        let row = vec![Data::Empty, Data::String("End RFU".to_string())];
        let headers = header_upper(&row);
        assert_eq!(column_of(&headers, "END RFU"), Some(1));
        assert_eq!(column_of(&headers, "WELL"), None);
        assert!(matches!(cell(&row, 9), Data::Empty));
    }
}
