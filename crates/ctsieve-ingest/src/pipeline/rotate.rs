//! Rotating line writer and the record-consuming output rotator.
//!
//! [`RotatingWriter`] writes newline-terminated lines to numbered files and
//! seals (flushes, closes and fsyncs) the current file every
//! `max_records_per_file` lines. [`OutputRotator`] is the single consumer of
//! the extractor's record channel and owns one writer.
//!
//! # File Naming
//!
//! ```text
//! <output_dir>/<file_prefix><n>.csv      (plain)
//! <output_dir>/<file_prefix><n>.csv.gz   (compressed)
//! ```
//!
//! # Sealing
//!
//! A file is sealed as soon as it holds `max_records_per_file` lines, so every
//! file but the last holds exactly that many. The next file is opened lazily
//! on the next write; a run that writes nothing creates no files.

use crate::error::{Error, Result};
use crossbeam_channel::Receiver;
use ctsieve_core::ExtractedRecord;
use flate2::Compression;
use flate2::write::GzEncoder;
use metrics::counter;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Configuration for a rotating writer.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Directory to write files to.
    pub output_dir: PathBuf,

    /// Prefix for file names, including any separator.
    /// Default: "output_"
    pub file_prefix: String,

    /// Lines per file before sealing.
    /// Default: 10 000 000
    pub max_records_per_file: u64,

    /// Gzip the files while writing.
    /// Default: false
    pub compress: bool,

    /// Continue numbering after the highest existing file with this prefix
    /// instead of starting at 0.
    /// Default: false
    pub continue_numbering: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            file_prefix: "output_".to_string(),
            max_records_per_file: ctsieve_core::DEFAULT_MAX_RECORDS_PER_FILE,
            compress: false,
            continue_numbering: false,
        }
    }
}

impl RotationConfig {
    fn extension(&self) -> &'static str {
        if self.compress { ".csv.gz" } else { ".csv" }
    }
}

/// Statistics about a rotating writer.
#[derive(Debug, Clone, Default)]
pub struct RotationStats {
    /// Files sealed so far.
    pub files_sealed: u64,

    /// Lines written across all files.
    pub total_records: u64,

    /// Uncompressed bytes written across all files.
    pub total_bytes: u64,

    /// Bytes on disk across sealed files.
    pub total_disk_bytes: u64,

    /// Lines in the currently open file.
    pub current_file_records: u64,

    /// Paths of sealed files, in order.
    pub sealed_paths: Vec<PathBuf>,
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Sink {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Plain(w) => w.write_all(bytes),
            Sink::Gzip(w) => w.write_all(bytes),
        }
    }

    /// Flush every layer and fsync the file.
    fn finish(self) -> std::io::Result<()> {
        let mut writer = match self {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w.finish()?,
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

/// The file being written.
struct CurrentFile {
    sink: Sink,
    path: PathBuf,
    record_count: u64,
    size_bytes: u64,
}

/// Writer that rotates to a new numbered file every N lines.
///
/// Not shared: exactly one owner writes through it.
pub struct RotatingWriter {
    config: RotationConfig,
    current: Option<CurrentFile>,
    file_number: u64,
    stats: RotationStats,
}

impl RotatingWriter {
    /// Create a new writer, creating the output directory if needed.
    pub fn new(config: RotationConfig) -> Result<Self> {
        if config.max_records_per_file == 0 {
            return Err(Error::Config(
                "max records per file must be at least 1".to_string(),
            ));
        }

        fs::create_dir_all(&config.output_dir)?;

        let file_number = if config.continue_numbering {
            Self::find_next_file_number(&config)?
        } else {
            0
        };

        info!(
            "RotatingWriter initialized: output_dir={}, prefix={}, max_records={}, compress={}, starting at file {}",
            config.output_dir.display(),
            config.file_prefix,
            config.max_records_per_file,
            config.compress,
            file_number
        );

        Ok(Self {
            config,
            current: None,
            file_number,
            stats: RotationStats::default(),
        })
    }

    /// Find the next file number by scanning existing files.
    fn find_next_file_number(config: &RotationConfig) -> Result<u64> {
        let mut next = 0u64;

        for entry in fs::read_dir(&config.output_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name_str = name.to_string_lossy();

            if let Some(rest) = name_str.strip_prefix(&config.file_prefix) {
                let num_str = rest
                    .strip_suffix(".csv.gz")
                    .or_else(|| rest.strip_suffix(".csv"));

                if let Some(num_str) = num_str
                    && let Ok(num) = num_str.parse::<u64>()
                {
                    next = next.max(num + 1);
                }
            }
        }

        Ok(next)
    }

    /// Path for a given file number.
    pub fn file_path(&self, file_number: u64) -> PathBuf {
        self.config.output_dir.join(format!(
            "{}{}{}",
            self.config.file_prefix,
            file_number,
            self.config.extension()
        ))
    }

    fn open_current(&mut self) -> Result<&mut CurrentFile> {
        if self.current.is_none() {
            let path = self.file_path(self.file_number);
            debug!("Creating new output file: {}", path.display());

            let file = File::create(&path)?;
            let writer = BufWriter::with_capacity(8 * 1024 * 1024, file); // 8MB buffer
            let sink = if self.config.compress {
                Sink::Gzip(GzEncoder::new(writer, Compression::default()))
            } else {
                Sink::Plain(writer)
            };

            self.current = Some(CurrentFile {
                sink,
                path,
                record_count: 0,
                size_bytes: 0,
            });
        }

        self.current
            .as_mut()
            .ok_or_else(|| Error::Rotation("No current file".to_string()))
    }

    /// Write one newline-terminated line.
    ///
    /// Returns `true` if the file was sealed as a result.
    pub fn write_line(&mut self, line: &str) -> Result<bool> {
        let max = self.config.max_records_per_file;
        let current = self.open_current()?;

        current.sink.write_all(line.as_bytes())?;
        current.record_count += 1;
        current.size_bytes += line.len() as u64;
        let should_seal = current.record_count >= max;

        self.stats.total_records += 1;
        self.stats.total_bytes += line.len() as u64;
        counter!("rotation_records_written_total").increment(1);

        if should_seal {
            self.seal()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Seal the current file, if one is open.
    pub fn seal(&mut self) -> Result<()> {
        let Some(CurrentFile {
            sink,
            path,
            record_count,
            size_bytes,
        }) = self.current.take()
        else {
            return Ok(());
        };

        sink.finish()?;

        let file_number = self.file_number;
        self.file_number += 1;

        let disk_bytes = fs::metadata(&path)?.len();
        info!(
            "Sealed file {}: {} records, {} bytes ({} on disk) at {}",
            file_number,
            record_count,
            size_bytes,
            disk_bytes,
            path.display()
        );

        self.stats.files_sealed += 1;
        self.stats.total_disk_bytes += disk_bytes;
        self.stats.sealed_paths.push(path);
        counter!("rotation_files_sealed_total").increment(1);
        Ok(())
    }

    /// Seal the last file and return the final statistics.
    pub fn finish(mut self) -> Result<RotationStats> {
        self.seal()?;
        Ok(self.stats())
    }

    /// Get statistics about the writer.
    pub fn stats(&self) -> RotationStats {
        RotationStats {
            current_file_records: self.current.as_ref().map_or(0, |c| c.record_count),
            ..self.stats.clone()
        }
    }
}

impl Drop for RotatingWriter {
    fn drop(&mut self) {
        // Error paths skip finish(); never leave a half-written file unflushed
        if self.current.is_some()
            && let Err(e) = self.seal()
        {
            warn!("Error sealing output file on drop: {}", e);
        }
    }
}

/// Single consumer of extracted records.
pub struct OutputRotator {
    writer: RotatingWriter,
    line: String,
}

impl OutputRotator {
    pub fn new(config: RotationConfig) -> Result<Self> {
        Ok(Self {
            writer: RotatingWriter::new(config)?,
            line: String::with_capacity(256),
        })
    }

    /// Serialize and write one record.
    pub fn write(&mut self, record: &ExtractedRecord) -> Result<bool> {
        self.line.clear();
        record.write_line(&mut self.line);
        self.writer.write_line(&self.line)
    }

    /// Consume records until every sender is dropped, then seal the last file.
    ///
    /// The first write error stops consumption and is returned; the receiver
    /// is dropped on return so producers see the failure on their next send.
    pub fn run(mut self, receiver: Receiver<ExtractedRecord>) -> Result<RotationStats> {
        for record in receiver.iter() {
            self.write(&record)?;
        }
        info!("Record channel closed, sealing final file");
        self.writer.finish()
    }

    pub fn stats(&self) -> RotationStats {
        self.writer.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctsieve_core::canonical_set;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn config(dir: &TempDir, max: u64, compress: bool) -> RotationConfig {
        RotationConfig {
            output_dir: dir.path().to_path_buf(),
            file_prefix: "ct-".to_string(),
            max_records_per_file: max,
            compress,
            continue_numbering: false,
        }
    }

    fn read_gz(path: &std::path::Path) -> String {
        let mut out = String::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    fn record(index: i64) -> ExtractedRecord {
        ExtractedRecord {
            index,
            domains: canonical_set([format!("host{index}.example.com")]),
            is_precert: false,
            not_before: 1_700_000_000,
            not_after: 1_731_536_000,
            leaf_timestamp: Some(1_700_000_000 + index),
            common_name: None,
        }
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            RotatingWriter::new(config(&tmp, 0, false)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_write_single_line() {
        let tmp = TempDir::new().unwrap();
        let mut writer = RotatingWriter::new(config(&tmp, 10, false)).unwrap();
        assert!(!writer.write_line("a\n").unwrap());

        let stats = writer.stats();
        assert_eq!(stats.total_records, 1);
        assert_eq!(stats.current_file_records, 1);
        assert_eq!(stats.files_sealed, 0);
    }

    #[test]
    fn test_rotation_boundary_exact_counts() {
        let tmp = TempDir::new().unwrap();
        let mut writer = RotatingWriter::new(config(&tmp, 3, false)).unwrap();
        for i in 0..8 {
            writer.write_line(&format!("{i}\n")).unwrap();
        }
        let stats = writer.finish().unwrap();

        assert_eq!(stats.files_sealed, 3);
        assert_eq!(stats.total_records, 8);
        let contents: Vec<String> = (0..3)
            .map(|n| fs::read_to_string(tmp.path().join(format!("ct-{n}.csv"))).unwrap())
            .collect();
        assert_eq!(contents[0], "0\n1\n2\n");
        assert_eq!(contents[1], "3\n4\n5\n");
        assert_eq!(contents[2], "6\n7\n");
    }

    #[test]
    fn test_no_trailing_empty_file_on_exact_multiple() {
        let tmp = TempDir::new().unwrap();
        let mut writer = RotatingWriter::new(config(&tmp, 2, false)).unwrap();
        for i in 0..4 {
            writer.write_line(&format!("{i}\n")).unwrap();
        }
        let stats = writer.finish().unwrap();

        assert_eq!(stats.files_sealed, 2);
        assert!(!tmp.path().join("ct-2.csv").exists());
    }

    #[test]
    fn test_nothing_written_creates_no_file() {
        let tmp = TempDir::new().unwrap();
        let writer = RotatingWriter::new(config(&tmp, 2, false)).unwrap();
        let stats = writer.finish().unwrap();
        assert_eq!(stats.files_sealed, 0);
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_compressed_output() {
        let tmp = TempDir::new().unwrap();
        let mut writer = RotatingWriter::new(config(&tmp, 100, true)).unwrap();
        writer.write_line("example.com,1\n").unwrap();
        writer.write_line("example.org,2\n").unwrap();
        let stats = writer.finish().unwrap();

        let path = tmp.path().join("ct-0.csv.gz");
        assert_eq!(stats.sealed_paths, vec![path.clone()]);
        assert_eq!(read_gz(&path), "example.com,1\nexample.org,2\n");
    }

    #[test]
    fn test_drop_seals_open_file() {
        let tmp = TempDir::new().unwrap();
        {
            let mut writer = RotatingWriter::new(config(&tmp, 100, true)).unwrap();
            writer.write_line("kept\n").unwrap();
        }
        assert_eq!(read_gz(&tmp.path().join("ct-0.csv.gz")), "kept\n");
    }

    #[test]
    fn test_continue_numbering() {
        let tmp = TempDir::new().unwrap();
        File::create(tmp.path().join("ct-0.csv.gz")).unwrap();
        File::create(tmp.path().join("ct-4.csv.gz")).unwrap();
        File::create(tmp.path().join("other-9.csv.gz")).unwrap();

        let mut writer = RotatingWriter::new(RotationConfig {
            continue_numbering: true,
            ..config(&tmp, 10, true)
        })
        .unwrap();
        writer.write_line("x\n").unwrap();
        let stats = writer.finish().unwrap();

        assert_eq!(stats.sealed_paths, vec![tmp.path().join("ct-5.csv.gz")]);
    }

    #[test]
    fn test_output_rotator_consumes_channel_in_order() {
        let tmp = TempDir::new().unwrap();
        let rotator = OutputRotator::new(config(&tmp, 2, false)).unwrap();

        let (tx, rx) = crossbeam_channel::bounded(4);
        let handle = std::thread::spawn(move || rotator.run(rx));
        for i in 0..5 {
            tx.send(record(i)).unwrap();
        }
        drop(tx);
        let stats = handle.join().unwrap().unwrap();

        assert_eq!(stats.total_records, 5);
        assert_eq!(stats.files_sealed, 3);

        let first = fs::read_to_string(tmp.path().join("ct-0.csv")).unwrap();
        let indices: Vec<i64> = first
            .lines()
            .map(|l| ExtractedRecord::parse_line(l).unwrap().index)
            .collect();
        assert_eq!(indices, vec![0, 1]);
        let last = fs::read_to_string(tmp.path().join("ct-2.csv")).unwrap();
        assert_eq!(last.lines().count(), 1);
    }

    #[test]
    fn test_output_rotator_write_error_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let out_dir = tmp.path().join("out");
        let rotator = OutputRotator::new(RotationConfig {
            output_dir: out_dir.clone(),
            ..config(&tmp, 2, false)
        })
        .unwrap();

        // A directory where the first output file should go makes create fail
        fs::create_dir(out_dir.join("ct-0.csv")).unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::spawn(move || rotator.run(rx));
        let _ = tx.send(record(1));
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Io(_))));

        // Receiver is gone, producers notice
        assert!(tx.send(record(2)).is_err());
    }
}
