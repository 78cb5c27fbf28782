// THEORY:
// The manifest: the ordered list of item identifiers for one run.
//
// One identifier per line. Reading stops at the first empty line or at end
// of file. Every identifier must fit in `path_size - 1` bytes; the first
// offender aborts the read.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::debug;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<String>,
}

impl Manifest {
    pub fn from_entries(entries: Vec<String>) -> Self {
        Self { entries }
    }

    pub fn read(reader: impl BufRead, path_size: usize) -> Result<Self> {
        let limit = path_size.saturating_sub(1);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let entry = line.strip_suffix('\r').unwrap_or(&line);
            if entry.is_empty() {
                break;
            }
            if entry.len() > limit {
                return Err(PipelineError::PathTooLong {
                    limit: path_size,
                    entry: entry.to_string(),
                });
            }
            entries.push(entry.to_string());
        }
        Ok(Self { entries })
    }

    pub fn open(path: impl AsRef<Path>, path_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| PipelineError::ManifestIo {
            path: path.display().to_string(),
            source,
        })?;
        let manifest = Self::read(BufReader::new(file), path_size)?;
        debug!(path = %path.display(), entries = manifest.len(), "manifest read");
        Ok(manifest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_until_empty_line() {
        let manifest = Manifest::read(Cursor::new("a.jpg\r\nb.jpg\n\nc.jpg\n"), 256).unwrap();
        assert_eq!(manifest.iter().collect::<Vec<_>>(), vec!["a.jpg", "b.jpg"]);
        assert_eq!(manifest.get(2), None);
    }

    #[test]
    fn empty_input_is_an_empty_manifest() {
        assert!(Manifest::read(Cursor::new(""), 256).unwrap().is_empty());
    }

    #[test]
    fn an_entry_must_leave_room_for_the_terminator() {
        let exact = "x".repeat(7);
        assert_eq!(Manifest::read(Cursor::new(exact.as_str()), 8).unwrap().len(), 1);

        let long = "y".repeat(8);
        let err = Manifest::read(Cursor::new(format!("ok\n{long}\n")), 8).unwrap_err();
        match err {
            PipelineError::PathTooLong { limit, entry } => {
                assert_eq!(limit, 8);
                assert_eq!(entry, long);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = Manifest::open("/definitely/not/here.txt", 256).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.txt"));
    }
}
