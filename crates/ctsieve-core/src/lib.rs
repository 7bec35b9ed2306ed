//! Core types and shared utilities for the ctsieve pipeline.
//!
//! This crate provides:
//! - Domain canonicalization, applied identically by every stage
//! - Deterministic bucket assignment for the partition-and-reduce passes
//! - The line schemas for extracted records, bucket occurrences and results
//! - The append-only error log used by the batch passes
//! - Prometheus metrics helpers
//! - Shared error types

pub mod bucket;
pub mod domain;
mod error;
pub mod error_log;
pub mod metrics;
pub mod record;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Column separator in every line schema.
pub const FIELD_DELIMITER: char = ',';

/// Separator between names inside the domain-list column.
pub const DOMAIN_DELIMITER: char = ';';

/// Default number of records (or result rows) per rotated file.
pub const DEFAULT_MAX_RECORDS_PER_FILE: u64 = 10_000_000;

/// Default number of buckets for sharding.
pub const DEFAULT_BUCKET_COUNT: u32 = 128;

/// Default `notBefore` cutoff: 2017-01-01 00:00:00 UTC.
/// Only certificates valid from strictly after this instant are kept.
pub const DEFAULT_NOT_BEFORE_CUTOFF: i64 = 1_483_228_800;

pub use bucket::{BucketCount, BucketId, bucket_for};
pub use domain::{canonical_set, canonicalize};
pub use error::{Error, Result};
pub use error_log::ErrorLog;
pub use record::{DomainOccurrence, DomainStat, ExtractedRecord};
