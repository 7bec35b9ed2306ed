//! Partition rotated record files into per-bucket occurrence files.
//!
//! ```text
//! ct-0.csv.gz ─┐                                       ┌─▶ bucket_0.csv
//! ct-1.csv.gz ─┼─▶ N file workers ─▶ bounded channel ─▶ BucketPool ─┼─▶ bucket_1.csv
//! ct-2.csv.gz ─┘   parse + explode     (batches)       (one owner)  └─▶ ...
//! ```
//!
//! Workers parse record lines, explode each record into one occurrence per
//! domain and tag it with its bucket. Only the calling thread touches bucket
//! file handles.
//!
//! Failures on an input file are isolated to that file: the error is logged,
//! written to the error log and the remaining files are still processed. A
//! write error on a bucket file is fatal.

use crate::error::{Error, Result};
use crate::files::{Line, LineReader};
use crossbeam_channel::{Receiver, Sender, bounded};
use ctsieve_core::{BucketCount, BucketId, ErrorLog, ExtractedRecord, bucket_for};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};

/// Configuration for a sharding run.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Directory for `bucket_<id>.csv` files.
    pub output_dir: PathBuf,

    /// Number of buckets K. Must match the reduce run.
    pub buckets: BucketCount,

    /// Number of file reader threads.
    pub workers: usize,

    /// Occurrences per batch sent to the bucket writer.
    pub batch_size: usize,

    /// Append to existing bucket files instead of truncating them.
    pub append: bool,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("buckets"),
            buckets: BucketCount::default(),
            workers: num_cpus::get(),
            batch_size: 4096,
            append: true,
        }
    }
}

/// Statistics from a sharding run.
#[derive(Debug, Clone, Default)]
pub struct ShardStats {
    /// Input files read to the end.
    pub files_processed: u64,

    /// Input files abandoned after an error.
    pub files_failed: u64,

    /// Record lines read (including malformed ones).
    pub lines_read: u64,

    /// Lines skipped as malformed.
    pub malformed_lines: u64,

    /// Occurrences written to bucket files.
    pub occurrences: u64,

    /// Bucket files opened.
    pub buckets_opened: u64,

    /// Paths of the failed input files.
    pub failed_files: Vec<PathBuf>,
}

impl ShardStats {
    fn merge(&mut self, other: ShardStats) {
        self.files_processed += other.files_processed;
        self.files_failed += other.files_failed;
        self.lines_read += other.lines_read;
        self.malformed_lines += other.malformed_lines;
        self.failed_files.extend(other.failed_files);
    }
}

/// Owner of the open bucket file handles.
///
/// Handles are opened lazily on first write and kept open until
/// [`BucketPool::close_all`] or drop, so at most K files are open at once.
pub struct BucketPool {
    dir: PathBuf,
    append: bool,
    handles: HashMap<BucketId, BufWriter<File>>,
    opened: u64,
}

impl BucketPool {
    pub fn new(dir: impl Into<PathBuf>, append: bool) -> Self {
        Self {
            dir: dir.into(),
            append,
            handles: HashMap::new(),
            opened: 0,
        }
    }

    /// Return the handle for `bucket`, opening the file on first use.
    pub fn handle(&mut self, bucket: BucketId) -> Result<&mut BufWriter<File>> {
        if !self.handles.contains_key(&bucket) {
            let path = bucket.file_path(&self.dir);
            let file = if self.append {
                OpenOptions::new().create(true).append(true).open(&path)?
            } else {
                File::create(&path)?
            };
            debug!("Opened bucket file {}", path.display());
            self.handles
                .insert(bucket, BufWriter::with_capacity(256 * 1024, file));
            self.opened += 1;
        }
        self.handles
            .get_mut(&bucket)
            .ok_or_else(|| Error::Rotation(format!("bucket {bucket} not open")))
    }

    /// Append one line to a bucket file.
    pub fn write(&mut self, bucket: BucketId, line: &str) -> Result<()> {
        self.handle(bucket)?.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Number of bucket files currently open.
    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    /// Number of bucket files opened over the pool's lifetime.
    pub fn opened(&self) -> u64 {
        self.opened
    }

    /// Flush and close every open handle.
    ///
    /// All handles are closed even if one fails; the first error is returned.
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for (bucket, mut writer) in self.handles.drain() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush bucket {}: {}", bucket, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl Drop for BucketPool {
    fn drop(&mut self) {
        if !self.handles.is_empty()
            && let Err(e) = self.close_all()
        {
            warn!("Error closing bucket files on drop: {}", e);
        }
    }
}

type Batch = Vec<(BucketId, String)>;

/// Runs the sharding pass.
pub struct Sharder {
    config: ShardConfig,
    error_log: ErrorLog,
}

impl Sharder {
    /// Create a sharder. Malformed lines and failed files are appended to
    /// `error_log`.
    pub fn new(config: ShardConfig, error_log: ErrorLog) -> Result<Self> {
        if config.workers == 0 || config.batch_size == 0 {
            return Err(Error::Config(
                "shard workers and batch size must be at least 1".to_string(),
            ));
        }
        Ok(Self { config, error_log })
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }

    /// Shard every file in `files` into the output directory.
    pub fn run(&self, files: &[PathBuf]) -> Result<ShardStats> {
        fs::create_dir_all(&self.config.output_dir)?;
        info!(
            "Sharding {} files into {} buckets at {} ({} workers, {})",
            files.len(),
            self.config.buckets.get(),
            self.config.output_dir.display(),
            self.config.workers,
            if self.config.append { "append" } else { "truncate" }
        );

        let (file_tx, file_rx) = bounded::<PathBuf>(files.len().max(1));
        for path in files {
            file_tx
                .send(path.clone())
                .map_err(|e| Error::ChannelSend(e.to_string()))?;
        }
        drop(file_tx);

        let (batch_tx, batch_rx) = bounded::<Batch>(self.config.workers * 4);
        let mut pool = BucketPool::new(&self.config.output_dir, self.config.append);

        gauge!("shard_running").set(1.0);
        let result = thread::scope(|s| -> Result<ShardStats> {
            let mut workers = Vec::with_capacity(self.config.workers);
            for i in 0..self.config.workers {
                let file_rx = file_rx.clone();
                let batch_tx = batch_tx.clone();
                let handle = thread::Builder::new()
                    .name(format!("shard-{i}"))
                    .spawn_scoped(s, move || self.file_worker(file_rx, batch_tx))?;
                workers.push(handle);
            }
            drop(batch_tx);

            let written = Self::drain(&mut pool, batch_rx);

            let mut stats = ShardStats::default();
            let mut worker_panic = None;
            for (i, handle) in workers.into_iter().enumerate() {
                match handle.join() {
                    Ok(worker_stats) => stats.merge(worker_stats),
                    Err(payload) => {
                        worker_panic
                            .get_or_insert(Error::from_panic(&format!("shard-{i}"), payload));
                    }
                }
            }

            stats.occurrences = written?;
            if let Some(err) = worker_panic {
                return Err(err);
            }
            Ok(stats)
        });
        gauge!("shard_running").set(0.0);

        let close_result = pool.close_all();
        let mut stats = result?;
        close_result?;
        stats.buckets_opened = pool.opened();

        info!(
            "Sharding complete: {} files ({} failed), {} lines, {} malformed, {} occurrences, {} buckets",
            stats.files_processed,
            stats.files_failed,
            stats.lines_read,
            stats.malformed_lines,
            stats.occurrences,
            stats.buckets_opened
        );
        Ok(stats)
    }

    /// Write batches until every worker is done. Dropping the receiver on a
    /// write error makes the workers stop.
    fn drain(pool: &mut BucketPool, batches: Receiver<Batch>) -> Result<u64> {
        let mut written = 0u64;
        for batch in batches.iter() {
            for (bucket, line) in &batch {
                pool.write(*bucket, line)?;
            }
            written += batch.len() as u64;
            counter!("shard_occurrences_total").increment(batch.len() as u64);
        }
        Ok(written)
    }

    fn file_worker(&self, files: Receiver<PathBuf>, batches: Sender<Batch>) -> ShardStats {
        let mut stats = ShardStats::default();

        for path in files.iter() {
            match self.shard_file(&path, &batches, &mut stats) {
                Ok(()) => {
                    stats.files_processed += 1;
                    debug!("Finished {}", path.display());
                }
                Err(Error::ChannelSend(_)) => {
                    debug!("Bucket writer stopped, abandoning {}", path.display());
                    break;
                }
                Err(e) => {
                    warn!("Failed to process {}: {}", path.display(), e);
                    self.error_log
                        .record(&format!("Failed to process file {}: {}", path.display(), e));
                    counter!("shard_files_failed_total").increment(1);
                    stats.files_failed += 1;
                    stats.failed_files.push(path);
                }
            }
        }

        stats
    }

    /// Shard one file. Lines already sent stay in the buckets if the file
    /// fails part way. Only I/O and decompression errors fail the file.
    fn shard_file(&self, path: &Path, batches: &Sender<Batch>, stats: &mut ShardStats) -> Result<()> {
        let mut reader = LineReader::open(path)?;
        let mut batch: Batch = Vec::with_capacity(self.config.batch_size);

        while let Some(line) = reader.next_line()? {
            if let Line::Text(text) = &line
                && text.trim().is_empty()
            {
                continue;
            }
            stats.lines_read += 1;
            counter!("shard_lines_total").increment(1);

            let parsed = match &line {
                Line::Text(text) => ExtractedRecord::parse_line(text).map_err(|e| e.to_string()),
                Line::Invalid(_) => Err("invalid UTF-8".to_string()),
            };
            let record = match parsed {
                Ok(record) => record,
                Err(reason) => {
                    let raw = match &line {
                        Line::Text(text) => *text,
                        Line::Invalid(lossy) => lossy.as_str(),
                    };
                    warn!("Skipping invalid entry in file {}: {}", path.display(), reason);
                    self.error_log.record(&format!(
                        "Skipping invalid entry in file {}: {} ({})",
                        path.display(),
                        raw,
                        reason
                    ));
                    counter!("shard_malformed_lines_total").increment(1);
                    stats.malformed_lines += 1;
                    continue;
                }
            };

            for occurrence in record.occurrences() {
                let bucket = bucket_for(occurrence.domain, self.config.buckets);
                let mut out = String::with_capacity(occurrence.domain.len() + 12);
                occurrence.write_line(&mut out);
                batch.push((bucket, out));
            }

            if batch.len() >= self.config.batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(self.config.batch_size));
                batches
                    .send(full)
                    .map_err(|_| Error::ChannelSend("bucket writer stopped".to_string()))?;
            }
        }

        if !batch.is_empty() {
            batches
                .send(batch)
                .map_err(|_| Error::ChannelSend("bucket writer stopped".to_string()))?;
        }
        Ok(())
    }
}
