//! Lazy CSV argument rows for parameterized queries.

use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArgSourceError {
    #[error("opening query args file: {0}")]
    Open(#[source] std::io::Error),

    #[error("reading query args: {0}")]
    Read(#[from] csv::Error),
}

/// Streaming reader over a query-args CSV file.
///
/// Each query execution consumes exactly one row; rows are never replayed.
#[derive(Debug)]
pub struct ArgSource {
    reader: csv::Reader<File>,
    rows_read: u64,
}

impl ArgSource {
    /// Open `path` with an optional field delimiter (`,` by default).
    pub fn open(path: &Path, delimiter: Option<u8>) -> Result<Self, ArgSourceError> {
        let file = File::open(path).map_err(ArgSourceError::Open)?;
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter.unwrap_or(b','))
            .from_reader(file);
        Ok(Self {
            reader,
            rows_read: 0,
        })
    }

    /// Next argument row, or `None` at end of file.
    pub fn next_row(&mut self) -> Result<Option<Vec<String>>, ArgSourceError> {
        let mut record = csv::StringRecord::new();
        if self.reader.read_record(&mut record)? {
            self.rows_read += 1;
            Ok(Some(record.iter().map(str::to_string).collect()))
        } else {
            Ok(None)
        }
    }

    /// Number of rows consumed so far.
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }
}
