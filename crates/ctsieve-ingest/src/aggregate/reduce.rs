//! Fold bucket files into the sorted first/last-seen table.
//!
//! Each bucket is reduced on its own: a `domain -> (min, max)` map is built
//! from the bucket's occurrences, its keys are sorted and the rows are handed
//! to the single output writer. Memory is bounded by the largest bucket's
//! distinct-domain count times the number of concurrent workers.
//!
//! Buckets partition the domain namespace, so the concatenated output needs
//! no cross-bucket merge. Rows are sorted within a bucket; buckets appear in
//! the order they finish.

use crate::error::{Error, Result};
use crate::files::{Line, LineReader};
use crate::pipeline::{RotatingWriter, RotationConfig, RotationStats};
use crossbeam_channel::{Receiver, Sender, bounded};
use ctsieve_core::{BucketCount, BucketId, DomainOccurrence, DomainStat, ErrorLog, bucket_for};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{debug, info, warn};

/// File name prefix for result files.
pub const OUTPUT_FILE_PREFIX: &str = "output_";

/// Configuration for a reduce run.
#[derive(Debug, Clone)]
pub struct ReduceConfig {
    /// Directory for `output_<n>.csv` files.
    pub output_dir: PathBuf,

    /// Rows per result file before rotating.
    pub max_rows_per_file: u64,

    /// Buckets reduced concurrently.
    pub workers: usize,

    /// Bucket count used by the shard run, if known. Enables range and
    /// placement checks.
    pub buckets: Option<BucketCount>,

    /// Delete result files left by an earlier run instead of refusing to
    /// start.
    pub overwrite: bool,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("results"),
            max_rows_per_file: ctsieve_core::DEFAULT_MAX_RECORDS_PER_FILE,
            workers: 1,
            buckets: None,
            overwrite: false,
        }
    }
}

/// One reduced bucket.
#[derive(Debug, Clone, Default)]
pub struct BucketTable {
    /// Rows sorted by domain.
    pub rows: Vec<DomainStat>,

    /// Occurrence lines read.
    pub lines_read: u64,

    /// Lines skipped as malformed.
    pub malformed_lines: u64,

    /// Domains whose hash does not map to this bucket.
    pub misplaced_domains: u64,
}

/// Reduce one bucket file.
///
/// Malformed lines, including lines that are not valid UTF-8, are skipped
/// and recorded in `error_log`. Only an I/O error fails the whole bucket. When `expected` is given, domains that hash to a
/// different bucket are counted.
pub fn reduce_bucket(
    path: &Path,
    expected: Option<(BucketId, BucketCount)>,
    error_log: &ErrorLog,
) -> Result<BucketTable> {
    let mut reader = LineReader::open(path)?;
    let mut seen: HashMap<String, (i64, i64)> = HashMap::new();
    let mut table = BucketTable::default();

    let skip = |table: &mut BucketTable, line: &str, reason: &dyn std::fmt::Display| {
        warn!("Skipping invalid entry in file {}: {}", path.display(), reason);
        error_log.record(&format!(
            "Skipping invalid entry in file {}: {} ({})",
            path.display(),
            line,
            reason
        ));
        counter!("reduce_malformed_lines_total").increment(1);
        table.malformed_lines += 1;
    };

    while let Some(line) = reader.next_line()? {
        let line = match line {
            Line::Text(text) if text.trim().is_empty() => continue,
            Line::Text(text) => text,
            Line::Invalid(lossy) => {
                table.lines_read += 1;
                skip(&mut table, &lossy, &"invalid UTF-8");
                continue;
            }
        };
        table.lines_read += 1;

        let occurrence = match DomainOccurrence::parse_line(line) {
            Ok(occurrence) => occurrence,
            Err(e) => {
                skip(&mut table, line, &e);
                continue;
            }
        };

        let ts = occurrence.timestamp;
        match seen.get_mut(occurrence.domain) {
            Some((first, last)) => {
                *first = (*first).min(ts);
                *last = (*last).max(ts);
            }
            None => {
                if let Some((bucket, count)) = expected
                    && bucket_for(occurrence.domain, count) != bucket
                {
                    table.misplaced_domains += 1;
                }
                seen.insert(occurrence.domain.to_string(), (ts, ts));
            }
        }
    }

    table.rows = seen
        .into_iter()
        .map(|(domain, (first_seen, last_seen))| DomainStat {
            domain,
            first_seen,
            last_seen,
        })
        .collect();
    table.rows.sort_unstable_by(|a, b| a.domain.cmp(&b.domain));
    Ok(table)
}

/// List `output_<n>.csv` files already present in `dir`, sorted by path.
pub fn existing_outputs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_output = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(OUTPUT_FILE_PREFIX))
            .and_then(|rest| rest.strip_suffix(".csv"))
            .is_some_and(|number| number.parse::<u64>().is_ok());
        if is_output {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Statistics from a reduce run.
#[derive(Debug, Clone, Default)]
pub struct ReduceStats {
    /// Buckets reduced and written.
    pub buckets_reduced: u64,

    /// Buckets abandoned after a read error.
    pub buckets_failed: u64,

    /// Bucket files whose id is outside the configured bucket count.
    pub buckets_out_of_range: u64,

    /// Occurrence lines read.
    pub lines_read: u64,

    /// Lines skipped as malformed.
    pub malformed_lines: u64,

    /// Domains whose hash does not map to the bucket they were found in.
    pub misplaced_domains: u64,

    /// Result rows written (one per distinct domain).
    pub domains: u64,

    /// Paths of failed bucket files.
    pub failed_files: Vec<PathBuf>,

    /// Output file statistics.
    pub rotation: RotationStats,
}

type Job = (BucketId, PathBuf);
type Outcome = (BucketId, PathBuf, Result<BucketTable>);

/// Runs the reduce pass.
pub struct Reducer {
    config: ReduceConfig,
    error_log: ErrorLog,
}

impl Reducer {
    pub fn new(config: ReduceConfig, error_log: ErrorLog) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::Config(
                "reduce workers must be at least 1".to_string(),
            ));
        }
        if config.max_rows_per_file == 0 {
            return Err(Error::Config(
                "max rows per file must be at least 1".to_string(),
            ));
        }
        Ok(Self { config, error_log })
    }

    /// Select the `bucket_<id>.csv` files among `files`, ordered by id.
    pub fn bucket_files(files: &[PathBuf]) -> Vec<Job> {
        let mut jobs: Vec<Job> = files
            .iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                let bucket = BucketId::from_file_name(name);
                if bucket.is_none() {
                    debug!("Ignoring non-bucket file {}", path.display());
                }
                Some((bucket?, path.clone()))
            })
            .collect();
        jobs.sort();
        jobs
    }

    /// Reduce every bucket file among `files` into `output_<n>.csv` files.
    ///
    /// Numbering starts at 0, so result files from an earlier run would mix
    /// with this run's. They are removed when `overwrite` is set; otherwise
    /// the run fails before writing anything.
    pub fn run(&self, files: &[PathBuf]) -> Result<ReduceStats> {
        let stale = existing_outputs(&self.config.output_dir)?;
        if !stale.is_empty() {
            if !self.config.overwrite {
                return Err(Error::Config(format!(
                    "{} already holds {} result files (first: {}); enable overwrite or use an empty directory",
                    self.config.output_dir.display(),
                    stale.len(),
                    stale[0].display()
                )));
            }
            for path in &stale {
                warn!("Removing result file from an earlier run: {}", path.display());
                fs::remove_file(path)?;
            }
        }

        let jobs = Self::bucket_files(files);
        let mut stats = ReduceStats::default();

        if let Some(count) = self.config.buckets {
            for (bucket, path) in &jobs {
                if !count.contains(*bucket) {
                    warn!(
                        "Bucket file {} has id {} but the bucket count is {}; was it sharded with a different count?",
                        path.display(),
                        bucket,
                        count.get()
                    );
                    stats.buckets_out_of_range += 1;
                }
            }
        }

        let mut writer = RotatingWriter::new(RotationConfig {
            output_dir: self.config.output_dir.clone(),
            file_prefix: OUTPUT_FILE_PREFIX.to_string(),
            max_records_per_file: self.config.max_rows_per_file,
            compress: false,
            continue_numbering: false,
        })?;

        info!(
            "Reducing {} buckets into {} ({} workers, {} rows per file)",
            jobs.len(),
            self.config.output_dir.display(),
            self.config.workers,
            self.config.max_rows_per_file
        );

        let (job_tx, job_rx) = bounded::<Job>(jobs.len().max(1));
        for job in jobs {
            job_tx
                .send(job)
                .map_err(|e| Error::ChannelSend(e.to_string()))?;
        }
        drop(job_tx);

        // One finished table per worker may wait for the writer
        let (outcome_tx, outcome_rx) = bounded::<Outcome>(self.config.workers);

        gauge!("reduce_running").set(1.0);
        let result = thread::scope(|s| -> Result<()> {
            let mut workers = Vec::with_capacity(self.config.workers);
            for i in 0..self.config.workers {
                let job_rx = job_rx.clone();
                let outcome_tx = outcome_tx.clone();
                let handle = thread::Builder::new()
                    .name(format!("reduce-{i}"))
                    .spawn_scoped(s, move || self.bucket_worker(job_rx, outcome_tx))?;
                workers.push(handle);
            }
            drop(outcome_tx);

            let written = self.write_tables(&mut writer, outcome_rx, &mut stats);

            let mut worker_panic = None;
            for (i, handle) in workers.into_iter().enumerate() {
                if let Err(payload) = handle.join() {
                    worker_panic.get_or_insert(Error::from_panic(&format!("reduce-{i}"), payload));
                }
            }

            written?;
            match worker_panic {
                Some(err) => Err(err),
                None => Ok(()),
            }
        });
        gauge!("reduce_running").set(0.0);

        result?;
        stats.rotation = writer.finish()?;

        info!(
            "Reduce complete: {} buckets ({} failed), {} domains, {} malformed lines, {} files",
            stats.buckets_reduced,
            stats.buckets_failed,
            stats.domains,
            stats.malformed_lines,
            stats.rotation.files_sealed
        );
        if stats.misplaced_domains > 0 {
            warn!(
                "{} domains were found in a bucket they do not hash to; the shard and reduce bucket counts probably differ",
                stats.misplaced_domains
            );
        }
        Ok(stats)
    }

    fn bucket_worker(&self, jobs: Receiver<Job>, outcomes: Sender<Outcome>) {
        for (bucket, path) in jobs.iter() {
            let expected = self.config.buckets.map(|count| (bucket, count));
            let table = reduce_bucket(&path, expected, &self.error_log);
            if outcomes.send((bucket, path, table)).is_err() {
                debug!("Result writer stopped, reduce worker exiting");
                return;
            }
        }
    }

    /// Write finished tables as they arrive. A write error is fatal and
    /// drops the receiver so workers stop.
    fn write_tables(
        &self,
        writer: &mut RotatingWriter,
        outcomes: Receiver<Outcome>,
        stats: &mut ReduceStats,
    ) -> Result<()> {
        let mut line = String::with_capacity(128);

        for (bucket, path, table) in outcomes.iter() {
            let table = match table {
                Ok(table) => table,
                Err(e) => {
                    warn!("Failed to reduce bucket {} ({}): {}", bucket, path.display(), e);
                    self.error_log
                        .record(&format!("Failed to process file {}: {}", path.display(), e));
                    stats.buckets_failed += 1;
                    stats.failed_files.push(path);
                    continue;
                }
            };

            for row in &table.rows {
                line.clear();
                row.write_line(&mut line);
                writer.write_line(&line)?;
            }

            let rows = table.rows.len() as u64;
            stats.buckets_reduced += 1;
            stats.lines_read += table.lines_read;
            stats.malformed_lines += table.malformed_lines;
            stats.misplaced_domains += table.misplaced_domains;
            stats.domains += rows;
            counter!("reduce_rows_total").increment(table.lines_read);
            counter!("reduce_domains_total").increment(rows);
            debug!(
                "Bucket {}: {} lines, {} domains",
                bucket, table.lines_read, rows
            );
        }

        Ok(())
    }
}
