//! Serialized CSV sink for per-query result rows.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResultsWriteError {
    #[error("creating query results file: {0}")]
    Create(#[source] std::io::Error),

    #[error("writing query results: {0}")]
    Write(String),

    #[error("query results writer already closed")]
    Closed,
}

struct Inner {
    writer: Option<csv::Writer<File>>,
    // First write failure, latched; later writes and close() re-surface it.
    error: Option<String>,
}

/// Append-only CSV writer shared by the parallel executions of one job.
///
/// The backing file is truncated on open. Writes are serialized; the first
/// I/O failure is latched and returned from every subsequent call.
pub struct SafeCsvWriter {
    inner: Mutex<Inner>,
}

impl SafeCsvWriter {
    /// Create (or truncate) the file at `path`.
    pub fn create(path: &Path) -> Result<Self, ResultsWriteError> {
        let file = File::create(path).map_err(ResultsWriteError::Create)?;
        let writer = csv::WriterBuilder::new().flexible(true).from_writer(file);
        Ok(Self {
            inner: Mutex::new(Inner {
                writer: Some(writer),
                error: None,
            }),
        })
    }

    /// Buffer one row. Safe to call from any task.
    pub fn write_row(&self, fields: &[String]) -> Result<(), ResultsWriteError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = &inner.error {
            return Err(ResultsWriteError::Write(message.clone()));
        }
        let Some(writer) = inner.writer.as_mut() else {
            return Err(ResultsWriteError::Closed);
        };
        if let Err(e) = writer.write_record(fields) {
            let message = e.to_string();
            inner.error = Some(message.clone());
            return Err(ResultsWriteError::Write(message));
        }
        Ok(())
    }

    /// Flush buffered rows and release the file. Surfaces any latched
    /// write error.
    pub fn close(&self) -> Result<(), ResultsWriteError> {
        let mut inner = self.inner.lock().unwrap();
        let error = inner.error.take();
        let writer = inner.writer.take();
        match (error, writer) {
            (Some(message), _) => Err(ResultsWriteError::Write(message)),
            (None, Some(mut writer)) => writer
                .flush()
                .map_err(|e| ResultsWriteError::Write(e.to_string())),
            (None, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_write_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");

        let writer = SafeCsvWriter::create(&path).unwrap();
        writer
            .write_row(&["1".to_string(), "alice".to_string()])
            .unwrap();
        writer.write_row(&["2".to_string()]).unwrap();
        writer.close().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "1,alice\n2\n");
    }

    #[test]
    fn test_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        std::fs::write(&path, "stale contents\n").unwrap();

        let writer = SafeCsvWriter::create(&path).unwrap();
        writer.write_row(&["fresh".to_string()]).unwrap();
        writer.close().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh\n");
    }

    #[test]
    fn test_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let writer = Arc::new(SafeCsvWriter::create(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        writer.write_row(&[format!("{i}-{j}")]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        writer.close().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 400);
    }

    #[test]
    fn test_write_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SafeCsvWriter::create(&dir.path().join("r.csv")).unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.write_row(&["x".to_string()]),
            Err(ResultsWriteError::Closed)
        ));
    }
}
