//! Input file discovery and line readers for the batch passes.

use crate::error::{Error, Result};
use flate2::read::MultiGzDecoder;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// List the regular files in `dir` accepted by `filter`, sorted by path.
pub fn collect_files<F>(dir: &Path, filter: F) -> Result<Vec<PathBuf>>
where
    F: Fn(&Path) -> bool,
{
    if !dir.is_dir() {
        return Err(Error::Config(format!(
            "input directory does not exist: {}",
            dir.display()
        )));
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| path.is_file() && filter(path))
        .collect();

    // Sort for deterministic processing order
    files.sort();
    Ok(files)
}

/// Whether `path` looks like a rotated record file (`.csv` or `.csv.gz`).
pub fn is_record_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.ends_with(".csv") || name.ends_with(".csv.gz"))
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Open a file for line reading, decompressing `.gz` files on the fly.
pub fn open_lines(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if is_gzip(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// One input line with its terminator removed.
#[derive(Debug, PartialEq, Eq)]
pub enum Line<'a> {
    Text(&'a str),
    /// Not valid UTF-8; carries a lossy copy for the error log.
    Invalid(String),
}

/// Line reader that reports invalid UTF-8 per line instead of failing the
/// whole stream. Only I/O and decompression errors are returned as `Err`.
pub struct LineReader {
    inner: Box<dyn BufRead + Send>,
    buf: Vec<u8>,
}

impl LineReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_lines(path)?))
    }

    pub fn new(inner: Box<dyn BufRead + Send>) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(256),
        }
    }

    /// Read the next line, or `None` at end of input.
    pub fn next_line(&mut self) -> Result<Option<Line<'_>>> {
        self.buf.clear();
        if self.inner.read_until(b'\n', &mut self.buf)? == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        match std::str::from_utf8(&self.buf) {
            Ok(text) => Ok(Some(Line::Text(text))),
            Err(_) => Ok(Some(Line::Invalid(
                String::from_utf8_lossy(&self.buf).into_owned(),
            ))),
        }
    }
}
