//! Scoped extraction of zip-shaped uploads.
//!
//! The extraction directory lives exactly as long as the
//! [`ExtractedArchive`] value: dropping it (normal return, `?`, or panic
//! unwinding) removes the directory and everything in it.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::ParseError;

pub struct ExtractedArchive {
    dir: TempDir,
    files: Vec<PathBuf>,
}

impl ExtractedArchive {
    /// Unpack into a fresh directory under the system temp location.
    pub fn extract(bytes: &[u8], prefix: &str) -> Result<Self, ParseError> {
        Self::extract_in(bytes, prefix, None)
    }

    /// Unpack into a fresh directory under `parent` (system temp if `None`).
    pub fn extract_in(bytes: &[u8], prefix: &str, parent: Option<&Path>) -> Result<Self, ParseError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        archive.extract(dir.path())?;

        let mut files = Vec::new();
        collect_files(dir.path(), &mut files)?;
        files.sort();
        log::debug!("Extracted {} files into {}", files.len(), dir.path().display());
        Ok(Self { dir, files })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// First extracted file with this basename, anywhere in the tree
    /// (case-insensitive).
    pub fn find(&self, basename: &str) -> Option<&Path> {
        self.files
            .iter()
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.eq_ignore_ascii_case(basename))
            })
            .map(PathBuf::as_path)
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>, ParseError> {
        Ok(std::fs::read(path)?)
    }
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), ParseError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}
