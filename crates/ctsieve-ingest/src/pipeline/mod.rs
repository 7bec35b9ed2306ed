//! The ingestion pipeline: extraction and output rotation.
//!
//! - [`Extractor`] - Decodes ledger entries on a bounded worker pool and
//!   emits [`ExtractedRecord`](ctsieve_core::ExtractedRecord)s
//! - [`OutputRotator`] - Single consumer writing records to rotated files
//!
//! # Architecture
//!
//! ```text
//! [LedgerSource] → [decode workers] → bounded channel → [OutputRotator]
//!                        ↓                                    ↓
//!               CertificateDecoder                  <prefix><n>.csv.gz
//! ```
//!
//! The rotated files are the input of the sharding pass.

mod extract;
mod rotate;

pub use extract::{
    ExtractStats, Extraction, Extractor, ExtractorConfig, SkipCounts, SkipReason, extract,
};
pub use rotate::{OutputRotator, RotatingWriter, RotationConfig, RotationStats};
