//! CSV source reader
//!
//! Yields one [`SourceRow`] per data line. Lines the CSV reader itself cannot
//! decode (bad UTF-8, broken quoting) come out as [`SourceItem::Unreadable`]
//! so the run loop can count and skip them without aborting.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{IngestError, Result};
use crate::parser::RawRow;

/// A data line with its 1-based position in the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub line: u64,
    pub row: RawRow,
}

#[derive(Debug)]
pub enum SourceItem {
    Row(SourceRow),
    Unreadable { line: u64, error: csv::Error },
}

/// Header-driven CSV reader over a game data file
pub struct CsvSource {
    path: PathBuf,
    reader: csv::Reader<File>,
    headers: csv::StringRecord,
}

impl CsvSource {
    /// Open `path` and read its header line
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.is_file() {
            return Err(IngestError::SourceMissing(path));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)
            .map_err(|source| IngestError::SourceRead {
                path: path.clone(),
                source,
            })?;

        let headers = reader
            .headers()
            .map_err(|source| IngestError::SourceRead {
                path: path.clone(),
                source,
            })?
            .clone();

        info!(path = %path.display(), columns = headers.len(), "Reading NFL data");

        Ok(Self {
            path,
            reader,
            headers,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn headers(&self) -> &csv::StringRecord {
        &self.headers
    }

    pub fn rows(self) -> SourceRows {
        SourceRows {
            records: self.reader.into_records(),
            headers: self.headers,
            last_line: 1,
        }
    }
}

/// Iterator over the data lines of a [`CsvSource`]
pub struct SourceRows {
    records: csv::StringRecordsIntoIter<File>,
    headers: csv::StringRecord,
    last_line: u64,
}

impl Iterator for SourceRows {
    type Item = SourceItem;

    fn next(&mut self) -> Option<Self::Item> {
        let item = match self.records.next()? {
            Ok(record) => {
                let line = record
                    .position()
                    .map(|p| p.line())
                    .unwrap_or(self.last_line + 1);
                self.last_line = line;
                SourceItem::Row(SourceRow {
                    line,
                    row: RawRow::from_record(&self.headers, &record),
                })
            },
            Err(error) => {
                let line = error
                    .position()
                    .map(|p| p.line())
                    .unwrap_or(self.last_line + 1);
                self.last_line = line;
                SourceItem::Unreadable { line, error }
            },
        };

        Some(item)
    }
}
