//! ctsieve ingestion job.
//!
//! Scans a fixed index range of a certificate transparency log, keeps the
//! certificates valid from after the cutoff and writes one record per
//! certificate to rotated CSV files.
//!
//! # Usage
//!
//! ```bash
//! # Everything currently in the log, default cutoff (2017-01-01)
//! ctsieve-ingest --url https://ct.example.net/logs/2024h1/ --out /data/ct/2024h1-
//!
//! # A sub-range, certificates only, uncompressed
//! ctsieve-ingest \
//!     --url https://ct.example.net/logs/2024h1/ \
//!     --out /data/ct/2024h1- \
//!     --from 1000000 --to 2000000 \
//!     --no-precert --no-compress
//! ```
//!
//! Output files are named `<out><n>.csv.gz`; numbering continues after any
//! existing files with the same prefix.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use ctsieve_core::metrics::serve_metrics_in_background;
use ctsieve_ingest::{
    ExtractStats, Extractor, ExtractorConfig, HttpLedgerSource, HttpSourceConfig, OutputRotator,
    RotationConfig, X509Decoder,
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// ctsieve ingestion job.
#[derive(Parser, Debug)]
#[command(name = "ctsieve-ingest")]
#[command(about = "Extract domain records from a certificate transparency log")]
#[command(version)]
struct Args {
    /// Log base URL
    #[arg(long)]
    url: String,

    /// Output path prefix (directory plus file stem)
    #[arg(long)]
    out: String,

    /// First index to scan (inclusive)
    #[arg(long, default_value = "0")]
    from: i64,

    /// Last index to scan (exclusive, 0 = current tree size)
    #[arg(long, default_value = "0")]
    to: i64,

    /// Keep certificates with notBefore strictly after this instant
    /// (epoch seconds, YYYY-MM-DD or RFC 3339)
    #[arg(long, default_value = "2017-01-01")]
    cutoff: String,

    /// Skip precertificates
    #[arg(long)]
    no_precert: bool,

    /// Records per output file
    #[arg(long, default_value = "10000000")]
    max_records_per_file: u64,

    /// Maximum entries waiting for or undergoing decoding
    #[arg(long, default_value = "2000")]
    max_in_flight: usize,

    /// Decode worker threads (default: number of CPUs)
    #[arg(long)]
    decode_workers: Option<usize>,

    /// Capacity of the record channel in front of the writer
    #[arg(long, default_value = "1000")]
    channel_capacity: usize,

    /// Concurrent get-entries requests
    #[arg(long, default_value = "10")]
    parallel_fetch: usize,

    /// Entries requested per get-entries call
    #[arg(long, default_value = "1000")]
    batch_size: i64,

    /// Write plain CSV instead of gzip
    #[arg(long)]
    no_compress: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "0")]
    metrics_port: u16,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("ctsieve_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let cutoff = parse_cutoff(&args.cutoff)?;
    let (output_dir, file_prefix) = split_prefix(&args.out);

    let _metrics = serve_metrics_in_background(args.metrics_port)
        .context("Failed to start metrics server")?;

    tracing::info!("ctsieve ingestion starting...");
    tracing::info!("Configuration:");
    tracing::info!("  Log: {}", args.url);
    tracing::info!("  Output: {}/{}<n>", output_dir.display(), file_prefix);
    tracing::info!("  Cutoff: {} ({})", cutoff, args.cutoff);
    tracing::info!("  Precertificates: {}", !args.no_precert);

    let mut source = HttpLedgerSource::new(HttpSourceConfig {
        url: args.url.clone(),
        batch_size: args.batch_size,
        parallel_fetch: args.parallel_fetch,
        ..Default::default()
    })
    .context("Failed to create ledger source")?;

    let mut config = ExtractorConfig {
        start_index: args.from,
        end_index: args.to,
        not_before_cutoff: cutoff,
        include_precerts: !args.no_precert,
        max_in_flight: args.max_in_flight,
        channel_capacity: args.channel_capacity,
        ..Default::default()
    };
    if let Some(workers) = args.decode_workers {
        config.decode_workers = workers;
    }
    let extractor = Extractor::new(config, X509Decoder).context("Invalid extractor settings")?;

    let rotator = OutputRotator::new(RotationConfig {
        output_dir: output_dir.clone(),
        file_prefix,
        max_records_per_file: args.max_records_per_file,
        compress: !args.no_compress,
        continue_numbering: true,
    })
    .with_context(|| format!("Failed to create output in {}", output_dir.display()))?;

    let start = Instant::now();
    let stats = extractor
        .run(&mut source, rotator)
        .context("Ingestion failed")?;

    print_summary(&args, &stats, start.elapsed());
    Ok(())
}

/// Parse a cutoff given as epoch seconds, a UTC date or an RFC 3339 timestamp.
fn parse_cutoff(value: &str) -> Result<i64> {
    if let Ok(seconds) = value.parse::<i64>() {
        return Ok(seconds);
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .context("Invalid cutoff date")?;
        return Ok(midnight.and_utc().timestamp());
    }
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc).timestamp());
    }
    bail!("Invalid cutoff {value:?}: expected epoch seconds, YYYY-MM-DD or RFC 3339")
}

/// Split an output prefix such as `/data/ct/log-` into `(/data/ct, "log-")`.
///
/// A prefix ending in a path separator names a directory and an empty stem.
fn split_prefix(out: &str) -> (PathBuf, String) {
    if out.ends_with(std::path::MAIN_SEPARATOR) || out.ends_with('/') {
        return (PathBuf::from(out), String::new());
    }
    let path = Path::new(out);
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    (dir, stem)
}

fn print_summary(args: &Args, stats: &ExtractStats, elapsed: std::time::Duration) {
    println!("\n══════════════════════════════════════════════════════════════════");
    println!("SUMMARY");
    println!("══════════════════════════════════════════════════════════════════\n");

    println!("Log:         {}", args.url);
    println!("Output:      {}", args.out);
    println!(
        "Range:       [{}, {}) of {}",
        stats.range.start, stats.range.end, stats.tree_head.tree_size
    );
    println!();
    println!("Entries seen:      {:>12}", stats.entries_seen);
    println!("Records written:   {:>12}", stats.records_emitted);
    println!("Entries skipped:   {:>12}", stats.skipped.total());
    if stats.skipped.total() > 0 {
        println!("  - Before cutoff:   {:>10}", stats.skipped.before_cutoff);
        println!("  - No domains:      {:>10}", stats.skipped.no_domains);
        println!("  - Precert:         {:>10}", stats.skipped.precert_excluded);
        println!("  - Decode failed:   {:>10}", stats.skipped.decode_failed);
        println!("  - Type mismatch:   {:>10}", stats.skipped.variant_mismatch);
        println!("  - Unknown type:    {:>10}", stats.skipped.unknown_type);
    }
    println!();
    println!("Files sealed:      {:>12}", stats.rotation.files_sealed);
    println!("Bytes written:     {:>12}", stats.rotation.total_bytes);
    println!("Bytes on disk:     {:>12}", stats.rotation.total_disk_bytes);
    println!("Fetch requests:    {:>12}", stats.scan.requests);
    println!();

    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        stats.entries_seen as f64 / secs
    } else {
        0.0
    };
    println!("Elapsed:           {:>12.1}s", secs);
    println!("Throughput:        {:>12.0} entries/s", rate);
}
