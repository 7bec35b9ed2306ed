//! Append-only, timestamped log of skipped input.
//!
//! Batch passes record every line or file they skip here in addition to the
//! tracing output, so a run can be audited after the fact. Entries are
//! written and flushed one at a time; the log is shared between worker
//! threads behind a mutex.

use crate::error::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default file name for the error log inside an output directory.
pub const ERROR_LOG_FILE: &str = "error_log.txt";

/// Append-only error log file.
pub struct ErrorLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ErrorLog {
    /// Open (or create) the log at `path` for appending.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Open the default log file inside `dir`.
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open(dir.as_ref().join(ERROR_LOG_FILE))
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped entry.
    ///
    /// Failure to write the log is reported through tracing and otherwise
    /// ignored: losing an audit line must never abort a batch pass.
    pub fn record(&self, message: &str) {
        let line = format!(
            "{} {}\n",
            Utc::now().format("%Y/%m/%d %H:%M:%S"),
            message.trim_end()
        );

        let mut file = self.file.lock();
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
            tracing::warn!("Failed to write error log {}: {}", self.path.display(), e);
        }
    }
}
