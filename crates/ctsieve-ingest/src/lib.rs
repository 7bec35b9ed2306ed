//! ctsieve ingestion and aggregation jobs.
//!
//! This crate turns a certificate transparency log into a per-domain
//! first-seen/last-seen table in three batch jobs.
//!
//! # Modules
//!
//! - [`source`] - Ledger source trait and the RFC 6962 HTTP adapter
//! - [`decode`] - Certificate decoder trait and the X.509 adapter
//! - [`pipeline`] - Extractor and output rotator (the ingestion job)
//! - [`aggregate`] - Sharder and reducer (the aggregation jobs)
//! - [`files`] - Input discovery and line readers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  LedgerSource   │  get-sth / get-entries, parallel batch fetch
//! └────────┬────────┘
//!          │  entries (any order, each index once)
//!          ▼
//! ┌─────────────────┐
//! │    Extractor    │  bounded decode pool, cutoff filter, domain sets
//! └────────┬────────┘
//!          │  bounded record channel
//!          ▼
//! ┌─────────────────┐
//! │  OutputRotator  │  <prefix><n>.csv.gz, every N records
//! └────────┬────────┘
//!          │  (separate job)
//!          ▼
//! ┌─────────────────┐
//! │     Sharder     │  bucket_<id>.csv by hash(domain) mod K
//! └────────┬────────┘
//!          │  (separate job)
//!          ▼
//! ┌─────────────────┐
//! │     Reducer     │  output_<n>.csv, sorted (domain, first, last)
//! └─────────────────┘
//! ```

pub mod aggregate;
pub mod decode;
pub mod error;
pub mod files;
pub mod pipeline;
pub mod source;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use aggregate::{
    BucketPool, BucketTable, ReduceConfig, ReduceStats, Reducer, ShardConfig, ShardStats,
    Sharder, reduce_bucket,
};
pub use decode::{CertificateDecoder, DecodeError, DecodedEntry, X509Decoder};
pub use pipeline::{
    ExtractStats, Extraction, Extractor, ExtractorConfig, OutputRotator, RotatingWriter,
    RotationConfig, RotationStats, SkipCounts, SkipReason,
};
pub use source::{
    EntryKind, HttpLedgerSource, HttpSourceConfig, LedgerEntry, LedgerSource, ScanStats,
    TreeHead,
};
