//! Repair of the broken packaging in CFX Maestro `.xlsx` exports.
//!
//! The workbook zip is written with three defects that stop spreadsheet
//! readers from opening it:
//! 1. Backslash path separators (`xl\workbook.xml`)
//! 2. Lowercase `[content_types].xml`
//! 3. Lowercase `xl/sharedstrings.xml`
//!
//! Repair rewrites member names only; member contents are copied as-is.

use std::borrow::Cow;
use std::io::{Cursor, Read, Write};

use zip::write::SimpleFileOptions;

use crate::error::ParseError;

const CONTENT_TYPES: &str = "[Content_Types].xml";
const SHARED_STRINGS: &str = "xl/sharedStrings.xml";

/// Corrected name for one archive member.
pub fn repaired_name(name: &str) -> String {
    let fixed = name.replace('\\', "/");
    if fixed.eq_ignore_ascii_case(CONTENT_TYPES) {
        CONTENT_TYPES.to_string()
    } else if fixed == "xl/sharedstrings.xml" {
        SHARED_STRINGS.to_string()
    } else {
        fixed
    }
}

/// Whether any member name needs rewriting. False for anything that is
/// not a readable zip.
pub fn needs_repair(bytes: &[u8]) -> bool {
    let Ok(archive) = zip::ZipArchive::new(Cursor::new(bytes)) else {
        return false;
    };
    let needs = archive.file_names().any(|name| repaired_name(name) != name);
    needs
}

/// Return the workbook with corrected member names. A valid workbook is
/// returned untouched.
pub fn repair(bytes: &[u8]) -> Result<Cow<'_, [u8]>, ParseError> {
    if !needs_repair(bytes) {
        return Ok(Cow::Borrowed(bytes));
    }

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::with_capacity(bytes.len())));
    let options = SimpleFileOptions::default();
    let mut renamed = 0usize;

    for index in 0..archive.len() {
        let mut member = archive.by_index(index)?;
        if member.is_dir() {
            continue;
        }
        let original = member.name().to_string();
        let name = repaired_name(&original);
        if name != original {
            renamed += 1;
        }
        let mut data = Vec::with_capacity(member.size() as usize);
        member.read_to_end(&mut data)?;
        writer.start_file(name, options)?;
        writer.write_all(&data)?;
    }

    let repaired = writer.finish()?.into_inner();
    log::info!("Repaired workbook packaging ({} member names rewritten)", renamed);
    Ok(Cow::Owned(repaired))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::tests::zip_bytes;

    fn names(bytes: &[u8]) -> Vec<String> {
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    #[test]
    fn test_repaired_name() {
        assert_eq!(repaired_name("xl\\worksheets\\sheet1.xml"), "xl/worksheets/sheet1.xml");
        assert_eq!(repaired_name("[content_types].xml"), "[Content_Types].xml");
        assert_eq!(repaired_name("xl\\sharedstrings.xml"), "xl/sharedStrings.xml");
        assert_eq!(repaired_name("xl/workbook.xml"), "xl/workbook.xml");
    }

    #[test]
    fn test_repair_broken_workbook() {
        let broken = zip_bytes(&[
            ("[content_types].xml", b"<Types/>"),
            ("xl\\workbook.xml", b"<workbook/>"),
            ("xl\\sharedstrings.xml", b"<sst/>"),
        ]);
        assert!(needs_repair(&broken));

        let fixed = repair(&broken).unwrap();
        assert!(matches!(fixed, Cow::Owned(_)));
        assert_eq!(
            names(&fixed),
            vec!["[Content_Types].xml", "xl/sharedStrings.xml", "xl/workbook.xml"]
        );
        assert!(!needs_repair(&fixed));
    }

    #[test]
    fn test_repair_is_idempotent() {
        let broken = zip_bytes(&[("xl\\workbook.xml", b"<workbook/>")]);
        let once = repair(&broken).unwrap().into_owned();
        let twice = repair(&once).unwrap();
        assert!(matches!(twice, Cow::Borrowed(_)));
        assert_eq!(twice.as_ref(), once.as_slice());
    }

    #[test]
    fn test_valid_and_non_zip_inputs_untouched() {
        let valid = zip_bytes(&[("[Content_Types].xml", b"<Types/>")]);
        assert!(!needs_repair(&valid));
        assert!(matches!(repair(&valid).unwrap(), Cow::Borrowed(_)));
        assert!(!needs_repair(b"not a zip"));
    }
}
