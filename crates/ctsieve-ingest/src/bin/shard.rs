//! Partition rotated record files into domain buckets.
//!
//! Reads every `*.csv` and `*.csv.gz` file in the input directory and writes
//! `bucket_<id>.csv` files (`domain,timestamp` lines) to the output
//! directory. Malformed lines and unreadable files are recorded in
//! `error_log.txt` in the output directory and do not stop the run.
//!
//! # Usage
//!
//! ```bash
//! ctsieve-shard --input-dir /data/ct --output-dir /data/buckets --buckets 128
//! ```
//!
//! The same `--buckets` value must be passed to `ctsieve-reduce`.

use anyhow::{Context, Result, bail};
use clap::Parser;
use ctsieve_core::metrics::serve_metrics_in_background;
use ctsieve_core::{BucketCount, ErrorLog};
use ctsieve_ingest::files::{collect_files, is_record_file};
use ctsieve_ingest::{ShardConfig, ShardStats, Sharder};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Partition record files into domain buckets.
#[derive(Parser, Debug)]
#[command(name = "ctsieve-shard")]
#[command(about = "Partition extracted records into per-domain buckets")]
#[command(version)]
struct Args {
    /// Directory containing rotated record files
    #[arg(long)]
    input_dir: PathBuf,

    /// Directory for bucket files and the error log
    #[arg(long)]
    output_dir: PathBuf,

    /// Number of buckets (must match the reduce run)
    #[arg(long, default_value = "128")]
    buckets: u32,

    /// File reader threads (default: number of CPUs)
    #[arg(long)]
    workers: Option<usize>,

    /// Start bucket files empty instead of appending to them
    #[arg(long)]
    truncate: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "0")]
    metrics_port: u16,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let buckets = BucketCount::new(args.buckets).context("Invalid --buckets")?;

    let files = collect_files(&args.input_dir, is_record_file)
        .with_context(|| format!("Failed to list {}", args.input_dir.display()))?;
    if files.is_empty() {
        bail!("No record files found in {}", args.input_dir.display());
    }

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;
    let error_log = ErrorLog::in_dir(&args.output_dir).context("Failed to open error log")?;

    let _metrics = serve_metrics_in_background(args.metrics_port)
        .context("Failed to start metrics server")?;

    let mut config = ShardConfig {
        output_dir: args.output_dir.clone(),
        buckets,
        append: !args.truncate,
        ..Default::default()
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    let sharder = Sharder::new(config, error_log).context("Invalid shard settings")?;

    let start = Instant::now();
    let stats = sharder.run(&files).context("Sharding failed")?;

    print_summary(&args, &stats, sharder, start.elapsed());
    Ok(())
}

fn print_summary(args: &Args, stats: &ShardStats, sharder: Sharder, elapsed: std::time::Duration) {
    println!("\n══════════════════════════════════════════════════════════════════");
    println!("SUMMARY");
    println!("══════════════════════════════════════════════════════════════════\n");

    println!("Input:       {}", args.input_dir.display());
    println!("Output:      {}", args.output_dir.display());
    println!("Buckets:     {}", args.buckets);
    println!("Error log:   {}", sharder.error_log().path().display());
    println!();
    println!("Files processed:   {:>12}", stats.files_processed);
    println!("Files failed:      {:>12}", stats.files_failed);
    for path in &stats.failed_files {
        println!("  - {}", path.display());
    }
    println!("Lines read:        {:>12}", stats.lines_read);
    println!("Malformed lines:   {:>12}", stats.malformed_lines);
    println!("Occurrences:       {:>12}", stats.occurrences);
    println!("Buckets written:   {:>12}", stats.buckets_opened);
    println!();
    println!("Elapsed:           {:>12.1}s", elapsed.as_secs_f64());
}
