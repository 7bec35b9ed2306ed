//! Certificate decoding for ledger entries.
//!
//! The extractor only needs a handful of fields from each entry: validity,
//! SAN DNS names, the subject common name and the ledger timestamp. The
//! [`CertificateDecoder`] trait is the seam for that; [`X509Decoder`] is the
//! implementation used in production, parsing the RFC 6962 leaf structure and
//! handing the DER to `x509-parser`.
//!
//! # Leaf Format
//!
//! ```text
//! MerkleTreeLeaf:
//!   u8  version          (0)
//!   u8  leaf_type        (0 = timestamped_entry)
//!   u64 timestamp        (milliseconds)
//!   u16 entry_type       (0 = x509_entry, 1 = precert_entry)
//!   x509_entry:   u24 length, DER certificate
//!   precert_entry: [u8; 32] issuer_key_hash, u24 length, DER TBSCertificate
//!   u16 extensions length, extensions
//! ```
//!
//! # Variant Detection
//!
//! The decoder reports the variant it finds in the payload, independent of
//! the leaf's `entry_type`: a bare TBSCertificate, or a certificate carrying
//! the CT poison extension, is a precertificate. A disagreement with the
//! leaf marker surfaces as a variant mismatch in the extractor.

use crate::source::{EntryKind, LedgerEntry};
use thiserror::Error;
use x509_parser::prelude::*;

/// Why an entry could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The entry is unusable.
    #[error("fatal decode error: {0}")]
    Fatal(String),

    /// A non-essential part of the entry was unreadable.
    #[error("soft decode error: {0}")]
    Soft(String),
}

impl DecodeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Fields the extractor needs from one certificate or precertificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEntry {
    /// Variant actually found in the payload.
    pub kind: EntryKind,

    /// Validity start (epoch seconds).
    pub not_before: i64,

    /// Validity end (epoch seconds).
    pub not_after: i64,

    /// SAN DNS names as they appear in the certificate.
    pub dns_names: Vec<String>,

    /// Subject common name.
    pub common_name: Option<String>,

    /// Ledger integration time (epoch seconds).
    pub leaf_timestamp: Option<i64>,

    /// Problems that did not prevent decoding.
    pub warnings: Vec<DecodeError>,
}

/// Turns raw ledger entries into [`DecodedEntry`] values.
///
/// Implementations must be pure and safe to call from many threads at once.
pub trait CertificateDecoder: Send + Sync {
    fn decode(&self, entry: &LedgerEntry) -> Result<DecodedEntry, DecodeError>;
}

/// Parsed header of a `MerkleTreeLeaf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTreeLeaf<'a> {
    /// Integration time, milliseconds since the epoch.
    pub timestamp_ms: u64,

    /// Entry type from the leaf.
    pub kind: EntryKind,

    /// DER certificate (x509 entries) or DER TBSCertificate (precerts).
    pub der: &'a [u8],
}

impl<'a> MerkleTreeLeaf<'a> {
    /// Parse a serialized leaf.
    pub fn parse(input: &'a [u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(input);

        let version = reader.u8()?;
        if version != 0 {
            return Err(DecodeError::Fatal(format!("unsupported leaf version {version}")));
        }
        let leaf_type = reader.u8()?;
        if leaf_type != 0 {
            return Err(DecodeError::Fatal(format!("unsupported leaf type {leaf_type}")));
        }

        let timestamp_ms = reader.u64()?;
        let kind = EntryKind::from_wire(reader.u16()?);
        let der = match kind {
            EntryKind::Certificate => reader.u24_prefixed()?,
            EntryKind::Precertificate => {
                reader.take(32)?;
                reader.u24_prefixed()?
            }
            EntryKind::Unknown(value) => {
                return Err(DecodeError::Fatal(format!("unknown entry type {value}")));
            }
        };

        Ok(Self {
            timestamp_ms,
            kind,
            der,
        })
    }
}

struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.input.len());
        let Some(end) = end else {
            return Err(DecodeError::Fatal(format!(
                "leaf truncated: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.input.len() - self.pos
            )));
        };
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn u24_prefixed(&mut self) -> Result<&'a [u8], DecodeError> {
        let b = self.take(3)?;
        let len = (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]);
        self.take(len)
    }
}

/// OID of the critical extension that marks a precertificate (RFC 6962 3.1).
const CT_POISON_OID: &str = "1.3.6.1.4.1.11129.2.4.3";

fn has_ct_poison(tbs: &TbsCertificate<'_>) -> bool {
    tbs.extensions()
        .iter()
        .any(|ext| ext.oid.to_id_string() == CT_POISON_OID)
}

/// Decoder backed by `x509-parser`.
#[derive(Debug, Clone, Copy, Default)]
pub struct X509Decoder;

impl X509Decoder {
    fn fields(
        tbs: &TbsCertificate<'_>,
        kind: EntryKind,
        timestamp_ms: u64,
    ) -> DecodedEntry {
        let mut warnings = Vec::new();

        let dns_names = match tbs.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warnings.push(DecodeError::Soft(format!("subjectAltName: {e}")));
                Vec::new()
            }
        };

        let common_name = tbs
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        DecodedEntry {
            kind,
            not_before: tbs.validity().not_before.timestamp(),
            not_after: tbs.validity().not_after.timestamp(),
            dns_names,
            common_name,
            leaf_timestamp: i64::try_from(timestamp_ms / 1000).ok(),
            warnings,
        }
    }
}

impl CertificateDecoder for X509Decoder {
    fn decode(&self, entry: &LedgerEntry) -> Result<DecodedEntry, DecodeError> {
        let leaf = MerkleTreeLeaf::parse(&entry.leaf_input)?;

        if let Ok((_, cert)) = X509Certificate::from_der(leaf.der) {
            let tbs = &cert.tbs_certificate;
            let kind = if has_ct_poison(tbs) {
                EntryKind::Precertificate
            } else {
                EntryKind::Certificate
            };
            return Ok(Self::fields(tbs, kind, leaf.timestamp_ms));
        }

        match TbsCertificate::from_der(leaf.der) {
            Ok((_, tbs)) => Ok(Self::fields(&tbs, EntryKind::Precertificate, leaf.timestamp_ms)),
            Err(e) => {
                let what = if leaf.kind.is_precert() {
                    "precertificate TBS"
                } else {
                    "certificate"
                };
                Err(DecodeError::Fatal(format!("{what}: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Extraction, SkipReason, extract};
    use std::collections::BTreeSet;

    /// SAN `Example.COM`, `www.example.com`, `example.com.`; CN `Example.COM`.
    const CERT_DER: &[u8] = include_bytes!("../testdata/cert.der");
    /// Precert TBS with SAN `precert.example.org`, `*.example.org`.
    const PRECERT_TBS_DER: &[u8] = include_bytes!("../testdata/precert_tbs.der");
    /// Full certificate carrying the CT poison extension.
    const POISONED_DER: &[u8] = include_bytes!("../testdata/poisoned.der");

    // All fixtures are valid from 2023-11-14T22:13:20Z for 90 days
    const NOT_BEFORE: i64 = 1_700_000_000;
    const NOT_AFTER: i64 = NOT_BEFORE + 90 * 86_400;

    fn leaf(entry_type: u16, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8, 0u8];
        out.extend_from_slice(&1_700_000_123_456u64.to_be_bytes());
        out.extend_from_slice(&entry_type.to_be_bytes());
        if entry_type == 1 {
            out.extend_from_slice(&[0xaa; 32]);
        }
        let len = body.len();
        out.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
        out.extend_from_slice(body);
        out.extend_from_slice(&[0, 0]);
        out
    }

    fn entry(leaf_input: Vec<u8>) -> LedgerEntry {
        LedgerEntry {
            index: 7,
            kind: EntryKind::from_leaf_input(&leaf_input),
            leaf_input,
            extra_data: Vec::new(),
        }
    }

    #[test]
    fn test_parse_x509_leaf() {
        let input = leaf(0, b"der-bytes");
        let parsed = MerkleTreeLeaf::parse(&input).unwrap();
        assert_eq!(parsed.timestamp_ms, 1_700_000_123_456);
        assert_eq!(parsed.kind, EntryKind::Certificate);
        assert_eq!(parsed.der, b"der-bytes");
    }

    #[test]
    fn test_parse_precert_leaf_skips_issuer_hash() {
        let input = leaf(1, b"tbs");
        let parsed = MerkleTreeLeaf::parse(&input).unwrap();
        assert_eq!(parsed.kind, EntryKind::Precertificate);
        assert_eq!(parsed.der, b"tbs");
    }

    #[test]
    fn test_parse_rejects_bad_version() {
        let mut input = leaf(0, b"x");
        input[0] = 1;
        assert!(MerkleTreeLeaf::parse(&input).unwrap_err().is_fatal());
    }

    #[test]
    fn test_parse_rejects_truncated_body() {
        let mut input = leaf(0, b"0123456789");
        input.truncate(16);
        let err = MerkleTreeLeaf::parse(&input).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let input = leaf(5, b"x");
        assert!(matches!(
            MerkleTreeLeaf::parse(&input),
            Err(DecodeError::Fatal(msg)) if msg.contains("unknown entry type 5")
        ));
    }

    #[test]
    fn test_parse_empty_input() {
        assert!(MerkleTreeLeaf::parse(&[]).is_err());
    }

    #[test]
    fn test_x509_decoder_garbage_certificate_is_fatal() {
        let err = X509Decoder.decode(&entry(leaf(0, b"not der"))).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("certificate"));
    }

    #[test]
    fn test_x509_decoder_garbage_precert_is_fatal() {
        let err = X509Decoder.decode(&entry(leaf(1, b"not der"))).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("precertificate"));
    }

    #[test]
    fn test_x509_decoder_certificate_fields() {
        let decoded = X509Decoder.decode(&entry(leaf(0, CERT_DER))).unwrap();
        assert_eq!(decoded.kind, EntryKind::Certificate);
        assert_eq!(
            decoded.dns_names,
            vec!["Example.COM", "www.example.com", "example.com."]
        );
        assert_eq!(decoded.common_name.as_deref(), Some("Example.COM"));
        assert_eq!(decoded.not_before, NOT_BEFORE);
        assert_eq!(decoded.not_after, NOT_AFTER);
        // 1_700_000_123_456 ms in the leaf
        assert_eq!(decoded.leaf_timestamp, Some(1_700_000_123));
        assert!(decoded.warnings.is_empty());
    }

    #[test]
    fn test_x509_decoder_precert_tbs_fields() {
        let decoded = X509Decoder.decode(&entry(leaf(1, PRECERT_TBS_DER))).unwrap();
        assert_eq!(decoded.kind, EntryKind::Precertificate);
        assert_eq!(decoded.dns_names, vec!["precert.example.org", "*.example.org"]);
        assert_eq!(decoded.common_name.as_deref(), Some("precert.example.org"));
        assert_eq!(decoded.not_before, NOT_BEFORE);
        assert_eq!(decoded.leaf_timestamp, Some(1_700_000_123));
    }

    #[test]
    fn test_extract_real_certificate() {
        let Extraction::Record(record) =
            extract(&X509Decoder, &entry(leaf(0, CERT_DER)), NOT_BEFORE - 1, true)
        else {
            panic!("certificate should produce a record");
        };
        assert_eq!(record.index, 7);
        assert!(!record.is_precert);
        let expected: BTreeSet<String> = ["example.com", "www.example.com"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(record.domains, expected);
        assert_eq!(record.not_after, NOT_AFTER);
        assert_eq!(record.leaf_timestamp, Some(1_700_000_123));
    }

    #[test]
    fn test_extract_real_precertificate() {
        let Extraction::Record(record) =
            extract(&X509Decoder, &entry(leaf(1, PRECERT_TBS_DER)), NOT_BEFORE - 1, true)
        else {
            panic!("precertificate should produce a record");
        };
        assert!(record.is_precert);
        let expected: BTreeSet<String> = ["*.example.org", "precert.example.org"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(record.domains, expected);
    }

    #[test]
    fn test_extract_real_certificate_at_cutoff_is_skipped() {
        assert!(matches!(
            extract(&X509Decoder, &entry(leaf(0, CERT_DER)), NOT_BEFORE, true),
            Extraction::Skipped(SkipReason::BeforeCutoff { not_before: NOT_BEFORE })
        ));
    }

    #[test]
    fn test_payload_decides_variant() {
        let decoded = X509Decoder.decode(&entry(leaf(0, POISONED_DER))).unwrap();
        assert_eq!(decoded.kind, EntryKind::Precertificate);

        // A poisoned certificate in an x509 leaf
        assert!(matches!(
            extract(&X509Decoder, &entry(leaf(0, POISONED_DER)), 0, true),
            Extraction::Skipped(SkipReason::VariantMismatch {
                expected: EntryKind::Certificate,
                found: EntryKind::Precertificate,
            })
        ));
        // A final certificate in a precert leaf
        assert!(matches!(
            extract(&X509Decoder, &entry(leaf(1, CERT_DER)), 0, true),
            Extraction::Skipped(SkipReason::VariantMismatch {
                expected: EntryKind::Precertificate,
                found: EntryKind::Certificate,
            })
        ));
    }

    #[test]
    fn test_soft_error_is_not_fatal() {
        assert!(!DecodeError::Soft("san".to_string()).is_fatal());
    }
}
