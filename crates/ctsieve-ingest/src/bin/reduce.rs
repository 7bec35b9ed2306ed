//! Reduce bucket files to the per-domain first/last-seen table.
//!
//! Reads every `bucket_<id>.csv` file in the input directory and writes
//! `output_<n>.csv` files (`domain,firstSeen,lastSeen` lines, sorted by
//! domain within each bucket) to the output directory.
//!
//! # Usage
//!
//! ```bash
//! ctsieve-reduce --input-dir /data/buckets --output-dir /data/results --buckets 128
//! ```

use anyhow::{Context, Result, bail};
use clap::Parser;
use ctsieve_core::metrics::serve_metrics_in_background;
use ctsieve_core::{BucketCount, ErrorLog};
use ctsieve_ingest::files::collect_files;
use ctsieve_ingest::{ReduceConfig, ReduceStats, Reducer};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Reduce bucket files to first/last-seen rows.
#[derive(Parser, Debug)]
#[command(name = "ctsieve-reduce")]
#[command(about = "Fold domain buckets into sorted first/last-seen tables")]
#[command(version)]
struct Args {
    /// Directory containing bucket_<id>.csv files
    #[arg(long)]
    input_dir: PathBuf,

    /// Directory for output_<n>.csv files and the error log
    #[arg(long)]
    output_dir: PathBuf,

    /// Bucket count used by the shard run (enables consistency checks)
    #[arg(long)]
    buckets: Option<u32>,

    /// Rows per output file
    #[arg(long, default_value = "10000000")]
    max_rows_per_file: u64,

    /// Buckets reduced concurrently (memory grows with each)
    #[arg(long, default_value = "1")]
    workers: usize,

    /// Delete output_<n>.csv files left by an earlier run
    #[arg(long)]
    overwrite: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "0")]
    metrics_port: u16,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let buckets = args
        .buckets
        .map(BucketCount::new)
        .transpose()
        .context("Invalid --buckets")?;

    let files = collect_files(&args.input_dir, |_| true)
        .with_context(|| format!("Failed to list {}", args.input_dir.display()))?;
    if Reducer::bucket_files(&files).is_empty() {
        bail!("No bucket files found in {}", args.input_dir.display());
    }

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;
    let error_log = ErrorLog::in_dir(&args.output_dir).context("Failed to open error log")?;

    let _metrics = serve_metrics_in_background(args.metrics_port)
        .context("Failed to start metrics server")?;

    let reducer = Reducer::new(
        ReduceConfig {
            output_dir: args.output_dir.clone(),
            max_rows_per_file: args.max_rows_per_file,
            workers: args.workers,
            buckets,
            overwrite: args.overwrite,
        },
        error_log,
    )
    .context("Invalid reduce settings")?;

    let start = Instant::now();
    let stats = reducer.run(&files).context("Reduce failed")?;

    print_summary(&args, &stats, start.elapsed());
    Ok(())
}

fn print_summary(args: &Args, stats: &ReduceStats, elapsed: std::time::Duration) {
    println!("\n══════════════════════════════════════════════════════════════════");
    println!("SUMMARY");
    println!("══════════════════════════════════════════════════════════════════\n");

    println!("Input:       {}", args.input_dir.display());
    println!("Output:      {}", args.output_dir.display());
    println!();
    println!("Buckets reduced:   {:>12}", stats.buckets_reduced);
    println!("Buckets failed:    {:>12}", stats.buckets_failed);
    for path in &stats.failed_files {
        println!("  - {}", path.display());
    }
    println!("Rows read:         {:>12}", stats.lines_read);
    println!("Malformed rows:    {:>12}", stats.malformed_lines);
    println!("Distinct domains:  {:>12}", stats.domains);
    println!("Output files:      {:>12}", stats.rotation.files_sealed);
    if stats.buckets_out_of_range > 0 || stats.misplaced_domains > 0 {
        println!();
        println!("╭─────────────────────────────────────────────────────────────────╮");
        println!("│ BUCKET COUNT MISMATCH                                           │");
        println!("├─────────────────────────────────────────────────────────────────┤");
        println!(
            "│ Buckets out of range:  {:>12}                             │",
            stats.buckets_out_of_range
        );
        println!(
            "│ Misplaced domains:     {:>12}                             │",
            stats.misplaced_domains
        );
        println!("╰─────────────────────────────────────────────────────────────────╯");
    }
    println!();
    println!("Elapsed:           {:>12.1}s", elapsed.as_secs_f64());
}
