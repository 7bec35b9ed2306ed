//! Bounded-concurrency extraction of domain records from ledger entries.
//!
//! # Architecture
//!
//! ```text
//!                      entry channel                 record channel
//! [LedgerSource] ──▶ bounded(max_in_flight) ──▶ N decode workers ──▶ bounded(channel_capacity) ──▶ [OutputRotator]
//!   scan handler                                 extract()                                      single writer
//! ```
//!
//! The source's scan handler runs on the calling thread and pushes each entry
//! into the entry channel, blocking when `max_in_flight` entries are queued.
//! Decode workers block on the record channel when the writer falls behind,
//! so a slow disk throttles decoding and, through it, fetching.
//!
//! The run completes only after every worker has drained the entry channel
//! and the rotator has sealed its last file. A rotator error is fatal: once
//! its receiver is gone, workers exit on their next send and the scan handler
//! stops when no worker is left to take entries.

use crate::decode::{CertificateDecoder, DecodeError};
use crate::error::{Error, Result};
use crate::pipeline::rotate::{OutputRotator, RotationStats};
use crate::source::{EntryKind, LedgerEntry, LedgerSource, ScanStats, TreeHead};
use crossbeam_channel::{Receiver, Sender, bounded};
use ctsieve_core::{ExtractedRecord, canonical_set};
use metrics::{counter, gauge};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use tracing::{debug, info, warn};

/// Configuration for an extraction run.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// First ledger index to scan (inclusive).
    pub start_index: i64,

    /// Last ledger index to scan (exclusive). 0 means the tree size.
    pub end_index: i64,

    /// Entries with `notBefore <= cutoff` are dropped (epoch seconds).
    pub not_before_cutoff: i64,

    /// Emit records for precertificates.
    pub include_precerts: bool,

    /// Number of decode worker threads.
    pub decode_workers: usize,

    /// Maximum entries handed off but not yet decoded.
    pub max_in_flight: usize,

    /// Capacity of the record channel feeding the output rotator.
    pub channel_capacity: usize,

    /// Log progress every N entries (0 disables).
    pub progress_interval: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            start_index: 0,
            end_index: 0,
            not_before_cutoff: ctsieve_core::DEFAULT_NOT_BEFORE_CUTOFF,
            include_precerts: true,
            decode_workers: num_cpus::get(),
            max_in_flight: 2_000,
            channel_capacity: 1_000,
            progress_interval: 10_000,
        }
    }
}

/// Why an entry produced no record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Precertificate while precertificates are excluded.
    PrecertExcluded,
    /// Entry type is neither certificate nor precertificate.
    UnknownType(u16),
    /// Decoder rejected the entry.
    DecodeFailed(DecodeError),
    /// Payload variant differs from the entry's type marker.
    VariantMismatch { expected: EntryKind, found: EntryKind },
    /// `notBefore` at or before the cutoff.
    BeforeCutoff { not_before: i64 },
    /// No usable DNS names after canonicalization.
    NoDomains,
}

impl SkipReason {
    /// Short label for metrics and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PrecertExcluded => "precert_excluded",
            Self::UnknownType(_) => "unknown_type",
            Self::DecodeFailed(_) => "decode_failed",
            Self::VariantMismatch { .. } => "variant_mismatch",
            Self::BeforeCutoff { .. } => "before_cutoff",
            Self::NoDomains => "no_domains",
        }
    }

    fn slot(&self) -> usize {
        match self {
            Self::PrecertExcluded => 0,
            Self::UnknownType(_) => 1,
            Self::DecodeFailed(_) => 2,
            Self::VariantMismatch { .. } => 3,
            Self::BeforeCutoff { .. } => 4,
            Self::NoDomains => 5,
        }
    }
}

/// Outcome of extracting one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Record(ExtractedRecord),
    Skipped(SkipReason),
}

/// Turn one ledger entry into a record, or say why not.
///
/// Pure apart from debug logging of soft decode warnings.
pub fn extract<D: CertificateDecoder + ?Sized>(
    decoder: &D,
    entry: &LedgerEntry,
    not_before_cutoff: i64,
    include_precerts: bool,
) -> Extraction {
    if let EntryKind::Unknown(value) = entry.kind {
        return Extraction::Skipped(SkipReason::UnknownType(value));
    }
    if entry.kind.is_precert() && !include_precerts {
        return Extraction::Skipped(SkipReason::PrecertExcluded);
    }

    let decoded = match decoder.decode(entry) {
        Ok(decoded) => decoded,
        Err(e) => return Extraction::Skipped(SkipReason::DecodeFailed(e)),
    };
    for warning in &decoded.warnings {
        debug!("Entry {}: {}", entry.index, warning);
    }

    if decoded.kind != entry.kind {
        return Extraction::Skipped(SkipReason::VariantMismatch {
            expected: entry.kind,
            found: decoded.kind,
        });
    }
    if decoded.not_before <= not_before_cutoff {
        return Extraction::Skipped(SkipReason::BeforeCutoff {
            not_before: decoded.not_before,
        });
    }

    let domains = canonical_set(&decoded.dns_names);
    if domains.is_empty() {
        return Extraction::Skipped(SkipReason::NoDomains);
    }

    Extraction::Record(ExtractedRecord {
        index: entry.index,
        domains,
        is_precert: entry.kind.is_precert(),
        not_before: decoded.not_before,
        not_after: decoded.not_after,
        leaf_timestamp: decoded.leaf_timestamp,
        common_name: decoded.common_name,
    })
}

/// Per-reason skip counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipCounts {
    pub precert_excluded: u64,
    pub unknown_type: u64,
    pub decode_failed: u64,
    pub variant_mismatch: u64,
    pub before_cutoff: u64,
    pub no_domains: u64,
}

impl SkipCounts {
    pub fn total(&self) -> u64 {
        self.precert_excluded
            + self.unknown_type
            + self.decode_failed
            + self.variant_mismatch
            + self.before_cutoff
            + self.no_domains
    }
}

/// Statistics from one extraction run.
#[derive(Debug, Clone)]
pub struct ExtractStats {
    /// Head reported by the source before scanning.
    pub tree_head: TreeHead,

    /// Index range actually scanned.
    pub range: Range<i64>,

    /// Entries delivered by the source.
    pub entries_seen: u64,

    /// Records handed to the output rotator.
    pub records_emitted: u64,

    /// Entries dropped, by reason.
    pub skipped: SkipCounts,

    /// Source-side statistics.
    pub scan: ScanStats,

    /// Output-side statistics.
    pub rotation: RotationStats,
}

/// Scan result, rotator result and the first worker panic.
type Joined = (Result<ScanStats>, Result<RotationStats>, Option<Error>);

#[derive(Default)]
struct Counters {
    /// Set once the output rotator has failed.
    halted: AtomicBool,
    entries: AtomicU64,
    records: AtomicU64,
    skipped: [AtomicU64; 6],
}

impl Counters {
    fn skip_counts(&self) -> SkipCounts {
        let get = |i: usize| self.skipped[i].load(Ordering::Relaxed);
        SkipCounts {
            precert_excluded: get(0),
            unknown_type: get(1),
            decode_failed: get(2),
            variant_mismatch: get(3),
            before_cutoff: get(4),
            no_domains: get(5),
        }
    }
}

/// Runs the extraction pipeline over one index range.
pub struct Extractor<D> {
    config: ExtractorConfig,
    decoder: D,
}

impl<D: CertificateDecoder> Extractor<D> {
    /// Create an extractor, validating the configuration.
    pub fn new(config: ExtractorConfig, decoder: D) -> Result<Self> {
        if config.start_index < 0 {
            return Err(Error::Config(format!(
                "start index must not be negative (got {})",
                config.start_index
            )));
        }
        if config.end_index < 0 {
            return Err(Error::Config(format!(
                "end index must not be negative (got {})",
                config.end_index
            )));
        }
        if config.decode_workers == 0 || config.max_in_flight == 0 || config.channel_capacity == 0 {
            return Err(Error::Config(
                "decode workers, max in-flight and channel capacity must be at least 1"
                    .to_string(),
            ));
        }
        Ok(Self { config, decoder })
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Resolve the configured range against the ledger's tree size.
    ///
    /// An end of 0 means the tree size; an end past it is clamped.
    pub fn resolve_range(&self, tree_size: i64) -> Result<Range<i64>> {
        let start = self.config.start_index;
        let mut end = match self.config.end_index {
            0 => tree_size,
            end => end,
        };
        if end > tree_size {
            warn!(
                "End index {} is past the tree size {}, clamping",
                end, tree_size
            );
            end = tree_size;
        }
        if start >= end {
            return Err(Error::Config(format!(
                "empty index range [{start}, {end}) (tree size {tree_size})"
            )));
        }
        Ok(start..end)
    }

    /// Scan the source and stream every accepted record into `rotator`.
    ///
    /// Fails before creating any output if `prepare` fails or the range is
    /// empty. Output already written stays sealed on every other failure.
    pub fn run<S: LedgerSource>(
        &self,
        source: &mut S,
        rotator: OutputRotator,
    ) -> Result<ExtractStats> {
        let tree_head = source.prepare()?;
        info!(
            "Source {} ready: tree size {}, head timestamp {}",
            source.name(),
            tree_head.tree_size,
            tree_head.timestamp_ms
        );
        let range = self.resolve_range(tree_head.tree_size)?;
        info!(
            "Extracting [{}, {}) with {} decode workers, max in-flight {}, cutoff {}",
            range.start,
            range.end,
            self.config.decode_workers,
            self.config.max_in_flight,
            self.config.not_before_cutoff
        );

        gauge!("extract_running").set(1.0);
        let result = self.run_range(source, rotator, range.clone());
        gauge!("extract_running").set(0.0);
        let (scan, rotation, counters) = result?;

        let stats = ExtractStats {
            tree_head,
            range,
            entries_seen: counters.entries.load(Ordering::Relaxed),
            records_emitted: counters.records.load(Ordering::Relaxed),
            skipped: counters.skip_counts(),
            scan,
            rotation,
        };
        info!(
            "Extraction complete: {} entries, {} records, {} skipped, {} files",
            stats.entries_seen,
            stats.records_emitted,
            stats.skipped.total(),
            stats.rotation.files_sealed
        );
        Ok(stats)
    }

    fn run_range<S: LedgerSource>(
        &self,
        source: &mut S,
        rotator: OutputRotator,
        range: Range<i64>,
    ) -> Result<(ScanStats, RotationStats, Counters)> {
        let counters = Counters::default();
        let (entry_tx, entry_rx) = bounded::<LedgerEntry>(self.config.max_in_flight);
        let (record_tx, record_rx) = bounded::<ExtractedRecord>(self.config.channel_capacity);

        let (scan_result, rotation_result, worker_panic) = thread::scope(|s| -> Result<Joined> {
            let halted = &counters.halted;
            let writer = thread::Builder::new()
                .name("output-rotator".to_string())
                .spawn_scoped(s, move || {
                    let result = rotator.run(record_rx);
                    if result.is_err() {
                        halted.store(true, Ordering::Release);
                    }
                    result
                })?;

            let mut workers = Vec::with_capacity(self.config.decode_workers);
            for i in 0..self.config.decode_workers {
                let entry_rx = entry_rx.clone();
                let record_tx = record_tx.clone();
                let counters = &counters;
                let handle = thread::Builder::new()
                    .name(format!("decode-{i}"))
                    .spawn_scoped(s, move || self.decode_worker(entry_rx, record_tx, counters))?;
                workers.push(handle);
            }
            // Workers and the writer hold the only remaining ends
            drop(entry_rx);
            drop(record_tx);

            let scan_result = source.scan(range, |entry| {
                if counters.halted.load(Ordering::Acquire) {
                    warn!("Output failed, ending scan");
                    return Ok(false);
                }
                let seen = counters.entries.fetch_add(1, Ordering::Relaxed) + 1;
                counter!("extract_entries_total").increment(1);
                if self.config.progress_interval > 0 && seen % self.config.progress_interval == 0 {
                    info!(
                        "Progress: {} entries, {} records",
                        seen,
                        counters.records.load(Ordering::Relaxed)
                    );
                }

                if entry_tx.send(entry).is_err() {
                    warn!("All decode workers have stopped, ending scan");
                    return Ok(false);
                }
                Ok(true)
            });
            drop(entry_tx);

            let mut worker_panic = None;
            for (i, handle) in workers.into_iter().enumerate() {
                if let Err(payload) = handle.join() {
                    let err = Error::from_panic(&format!("decode-{i}"), payload);
                    worker_panic.get_or_insert(err);
                }
            }
            let rotation_result = writer
                .join()
                .map_err(|payload| Error::from_panic("output-rotator", payload))
                .and_then(|r| r);

            Ok((scan_result, rotation_result, worker_panic))
        })?;

        // Output failures outrank everything else
        let rotation = rotation_result?;
        let scan = scan_result?;
        if let Some(err) = worker_panic {
            return Err(err);
        }
        if scan.stopped_early {
            return Err(Error::ScanStopped(
                "decode workers stopped before the range was exhausted".to_string(),
            ));
        }
        Ok((scan, rotation, counters))
    }

    fn decode_worker(
        &self,
        entries: Receiver<LedgerEntry>,
        records: Sender<ExtractedRecord>,
        counters: &Counters,
    ) {
        for entry in entries.iter() {
            if counters.halted.load(Ordering::Acquire) {
                debug!("Output failed, decode worker exiting");
                return;
            }
            let index = entry.index;
            match extract(
                &self.decoder,
                &entry,
                self.config.not_before_cutoff,
                self.config.include_precerts,
            ) {
                Extraction::Record(record) => {
                    // Blocks while the rotator is behind
                    if records.send(record).is_err() {
                        debug!("Record channel closed, decode worker exiting");
                        return;
                    }
                    counters.records.fetch_add(1, Ordering::Relaxed);
                    counter!("extract_records_total").increment(1);
                }
                Extraction::Skipped(reason) => {
                    match &reason {
                        SkipReason::DecodeFailed(e) => {
                            warn!("Skipping entry {}: {}", index, e);
                        }
                        SkipReason::VariantMismatch { expected, found } => {
                            warn!(
                                "Skipping entry {}: marked {:?} but payload is {:?}",
                                index, expected, found
                            );
                        }
                        SkipReason::UnknownType(value) => {
                            warn!("Skipping entry {}: unknown entry type {}", index, value);
                        }
                        other => debug!("Skipping entry {}: {}", index, other.label()),
                    }
                    counters.skipped[reason.slot()].fetch_add(1, Ordering::Relaxed);
                    counter!("extract_skipped_total", "reason" => reason.label()).increment(1);
                }
            }
        }
    }
}
