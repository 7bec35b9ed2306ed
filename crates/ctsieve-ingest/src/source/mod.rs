//! Ledger source adapters.
//!
//! A [`LedgerSource`] delivers raw entries for a fixed index range. Each index
//! in the range is handed to the handler exactly once; the order is
//! unspecified because sources may fetch batches in parallel.
//!
//! # Available Sources
//!
//! - [`HttpLedgerSource`] - Fetches entries from an RFC 6962 log over HTTP

mod http;

pub use http::{HttpLedgerSource, HttpSourceConfig};

use crate::Result;
use std::ops::Range;

/// Type marker carried by a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A final X.509 certificate.
    Certificate,
    /// A precertificate (TBS certificate submitted before issuance).
    Precertificate,
    /// An entry type this pipeline does not understand.
    Unknown(u16),
}

impl EntryKind {
    /// Map the RFC 6962 `LogEntryType` value.
    pub fn from_wire(value: u16) -> Self {
        match value {
            0 => Self::Certificate,
            1 => Self::Precertificate,
            other => Self::Unknown(other),
        }
    }

    /// Read the entry type out of a serialized `MerkleTreeLeaf`.
    ///
    /// The type sits after the version, leaf type and 8-byte timestamp.
    pub fn from_leaf_input(leaf: &[u8]) -> Self {
        match leaf.get(10..12) {
            Some(&[hi, lo]) => Self::from_wire(u16::from_be_bytes([hi, lo])),
            _ => Self::Unknown(u16::MAX),
        }
    }

    pub fn is_precert(self) -> bool {
        matches!(self, Self::Precertificate)
    }
}

/// One raw ledger entry. Immutable once delivered.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    /// Position of the entry in the ledger.
    pub index: i64,

    /// Certificate or precertificate marker.
    pub kind: EntryKind,

    /// Serialized `MerkleTreeLeaf`.
    pub leaf_input: Vec<u8>,

    /// Chain data accompanying the leaf.
    pub extra_data: Vec<u8>,
}

/// Checkpoint returned by [`LedgerSource::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeHead {
    /// Number of entries in the ledger.
    pub tree_size: i64,

    /// Head timestamp, milliseconds since the epoch.
    pub timestamp_ms: u64,

    /// Base64 Merkle root hash as reported by the ledger.
    pub root_hash: String,
}

/// Statistics from one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanStats {
    /// Entries handed to the handler.
    pub entries_delivered: u64,

    /// Fetch requests issued (including retries).
    pub requests: u64,

    /// Bytes of leaf and chain data received.
    pub bytes_received: u64,

    /// Whether the handler asked to stop before the range was exhausted.
    pub stopped_early: bool,
}

/// A source of raw ledger entries.
pub trait LedgerSource {
    /// Human-readable name for this source (used in logs).
    fn name(&self) -> &'static str;

    /// Reach the ledger and return its current head.
    ///
    /// Called once before scanning; a failure here aborts the run before any
    /// output is created.
    fn prepare(&mut self) -> Result<TreeHead>;

    /// Deliver every entry in `range` to `handler`, once each, in any order.
    ///
    /// The handler returns `Ok(true)` to continue, `Ok(false)` to stop
    /// gracefully, or `Err` to abort the scan with that error.
    fn scan<F>(&mut self, range: Range<i64>, handler: F) -> Result<ScanStats>
    where
        F: FnMut(LedgerEntry) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_kind_from_wire() {
        assert_eq!(EntryKind::from_wire(0), EntryKind::Certificate);
        assert_eq!(EntryKind::from_wire(1), EntryKind::Precertificate);
        assert_eq!(EntryKind::from_wire(7), EntryKind::Unknown(7));
    }

    #[test]
    fn test_entry_kind_from_leaf_input() {
        let mut leaf = vec![0u8; 12];
        assert_eq!(EntryKind::from_leaf_input(&leaf), EntryKind::Certificate);
        leaf[11] = 1;
        assert_eq!(EntryKind::from_leaf_input(&leaf), EntryKind::Precertificate);
    }

    #[test]
    fn test_entry_kind_truncated_leaf() {
        assert_eq!(
            EntryKind::from_leaf_input(&[0, 0, 1]),
            EntryKind::Unknown(u16::MAX)
        );
    }

    #[test]
    fn test_is_precert() {
        assert!(EntryKind::Precertificate.is_precert());
        assert!(!EntryKind::Certificate.is_precert());
        assert!(!EntryKind::Unknown(3).is_precert());
    }
}
