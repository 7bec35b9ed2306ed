//! Line schemas for every file the pipeline writes.
//!
//! # Extracted records
//!
//! One line per certificate, seven columns separated by [`FIELD_DELIMITER`]:
//!
//! ```text
//! index,commonName,domain;domain;...,isPrecert,notBefore,notAfter,leafTimestamp
//! 1042,example.com,example.com;www.example.com,0,1700000000,1731536000,1700000123
//! ```
//!
//! An absent common name or leaf timestamp is an empty column.
//!
//! # Bucket occurrences
//!
//! ```text
//! domain,timestamp
//! ```
//!
//! # Domain stats
//!
//! ```text
//! domain,firstSeen,lastSeen
//! ```

use crate::domain::canonical_set;
use crate::error::{Error, Result};
use crate::{DOMAIN_DELIMITER, FIELD_DELIMITER};
use std::collections::BTreeSet;
use std::fmt::Write as _;

/// Number of columns in an extracted record line.
pub const RECORD_COLUMNS: usize = 7;

/// Number of columns in a bucket occurrence line.
pub const OCCURRENCE_COLUMNS: usize = 2;

/// Number of columns in a domain stat line.
pub const STAT_COLUMNS: usize = 3;

/// Domain metadata extracted from one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedRecord {
    /// Ledger index of the entry.
    pub index: i64,

    /// Canonical, deduplicated DNS names. Never empty for an emitted record.
    pub domains: BTreeSet<String>,

    /// Whether the entry was a precertificate.
    pub is_precert: bool,

    /// Certificate validity start (epoch seconds).
    pub not_before: i64,

    /// Certificate validity end (epoch seconds).
    pub not_after: i64,

    /// Time the ledger integrated the entry (epoch seconds).
    pub leaf_timestamp: Option<i64>,

    /// Subject common name, if present.
    pub common_name: Option<String>,
}

impl ExtractedRecord {
    /// Timestamp attached to every domain occurrence derived from this record.
    ///
    /// The ledger integration time when known, otherwise `notAfter`. This is
    /// the one rule used for first/last-seen everywhere.
    pub fn occurrence_timestamp(&self) -> i64 {
        self.leaf_timestamp.unwrap_or(self.not_after)
    }

    /// Explode the record into one occurrence per domain.
    pub fn occurrences(&self) -> impl Iterator<Item = DomainOccurrence<'_>> {
        let timestamp = self.occurrence_timestamp();
        self.domains
            .iter()
            .map(move |domain| DomainOccurrence { domain, timestamp })
    }

    /// Append this record's line (newline-terminated) to `buf`.
    pub fn write_line(&self, buf: &mut String) {
        let _ = write!(buf, "{}{FIELD_DELIMITER}", self.index);
        if let Some(cn) = &self.common_name {
            buf.extend(cn.chars().filter(|c| !is_reserved(*c)));
        }
        buf.push(FIELD_DELIMITER);

        for (i, domain) in self.domains.iter().enumerate() {
            if i > 0 {
                buf.push(DOMAIN_DELIMITER);
            }
            buf.push_str(domain);
        }

        let _ = write!(
            buf,
            "{FIELD_DELIMITER}{}{FIELD_DELIMITER}{}{FIELD_DELIMITER}{}{FIELD_DELIMITER}",
            u8::from(self.is_precert),
            self.not_before,
            self.not_after
        );
        if let Some(ts) = self.leaf_timestamp {
            let _ = write!(buf, "{ts}");
        }
        buf.push('\n');
    }

    /// Serialize to a newline-terminated line.
    pub fn to_line(&self) -> String {
        let mut buf = String::with_capacity(128);
        self.write_line(&mut buf);
        buf
    }

    /// Parse a line written by [`ExtractedRecord::write_line`].
    ///
    /// Domains are canonicalized again on the way in; a line whose domain
    /// list ends up empty is rejected.
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let fields: Vec<&str> = line.split(FIELD_DELIMITER).collect();
        if fields.len() != RECORD_COLUMNS {
            return Err(Error::ColumnCount {
                expected: RECORD_COLUMNS,
                found: fields.len(),
            });
        }

        let index = parse_i64("index", fields[0])?;
        let common_name = Some(fields[1])
            .filter(|cn| !cn.is_empty())
            .map(str::to_string);

        let domains = canonical_set(fields[2].split(DOMAIN_DELIMITER));
        if domains.is_empty() {
            return Err(Error::invalid("domains", "no valid domain names"));
        }

        let is_precert = match fields[3] {
            "0" => false,
            "1" => true,
            other => {
                return Err(Error::invalid(
                    "isPrecert",
                    format!("expected 0 or 1, got {other:?}"),
                ));
            }
        };

        let not_before = parse_i64("notBefore", fields[4])?;
        let not_after = parse_i64("notAfter", fields[5])?;
        let leaf_timestamp = match fields[6] {
            "" => None,
            ts => Some(parse_i64("leafTimestamp", ts)?),
        };

        Ok(Self {
            index,
            domains,
            is_precert,
            not_before,
            not_after,
            leaf_timestamp,
            common_name,
        })
    }
}

/// One observed (domain, timestamp) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainOccurrence<'a> {
    /// Canonical domain name.
    pub domain: &'a str,

    /// Occurrence time (epoch seconds).
    pub timestamp: i64,
}

impl DomainOccurrence<'_> {
    /// Append the occurrence's bucket line to `buf`.
    pub fn write_line(&self, buf: &mut String) {
        let _ = writeln!(buf, "{}{FIELD_DELIMITER}{}", self.domain, self.timestamp);
    }

    /// Parse a bucket line into `(domain, timestamp)`.
    ///
    /// Surrounding whitespace in either column is tolerated.
    pub fn parse_line(line: &str) -> Result<DomainOccurrence<'_>> {
        let line = line.trim_end_matches(['\n', '\r']);
        let mut fields = line.split(FIELD_DELIMITER);
        let (Some(domain), Some(timestamp), None) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::ColumnCount {
                expected: OCCURRENCE_COLUMNS,
                found: line.split(FIELD_DELIMITER).count(),
            });
        };

        let domain = domain.trim();
        if domain.is_empty() {
            return Err(Error::invalid("domain", "empty"));
        }

        Ok(DomainOccurrence {
            domain,
            timestamp: parse_i64("timestamp", timestamp.trim())?,
        })
    }
}

/// First and last time a domain was observed across the corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStat {
    /// Canonical domain name.
    pub domain: String,

    /// Minimum occurrence timestamp.
    pub first_seen: i64,

    /// Maximum occurrence timestamp.
    pub last_seen: i64,
}

impl DomainStat {
    /// Append the stat's result line to `buf`.
    pub fn write_line(&self, buf: &mut String) {
        let _ = writeln!(
            buf,
            "{}{FIELD_DELIMITER}{}{FIELD_DELIMITER}{}",
            self.domain, self.first_seen, self.last_seen
        );
    }

    /// Parse a result line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let fields: Vec<&str> = line.split(FIELD_DELIMITER).collect();
        if fields.len() != STAT_COLUMNS {
            return Err(Error::ColumnCount {
                expected: STAT_COLUMNS,
                found: fields.len(),
            });
        }
        Ok(Self {
            domain: fields[0].to_string(),
            first_seen: parse_i64("firstSeen", fields[1])?,
            last_seen: parse_i64("lastSeen", fields[2])?,
        })
    }
}

fn is_reserved(c: char) -> bool {
    c == FIELD_DELIMITER || c == DOMAIN_DELIMITER || c == '\n' || c == '\r'
}

fn parse_i64(field: &'static str, value: &str) -> Result<i64> {
    value
        .parse()
        .map_err(|e| Error::invalid(field, format!("{value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ExtractedRecord {
        ExtractedRecord {
            index: 1042,
            domains: canonical_set(["www.example.com", "example.com"]),
            is_precert: false,
            not_before: 1_700_000_000,
            not_after: 1_731_536_000,
            leaf_timestamp: Some(1_700_000_123),
            common_name: Some("example.com".to_string()),
        }
    }

    // =========================================================================
    // ExtractedRecord
    // =========================================================================

    #[test]
    fn test_record_line_layout() {
        assert_eq!(
            record().to_line(),
            "1042,example.com,example.com;www.example.com,0,1700000000,1731536000,1700000123\n"
        );
    }

    #[test]
    fn test_record_line_optional_columns_empty() {
        let rec = ExtractedRecord {
            common_name: None,
            leaf_timestamp: None,
            is_precert: true,
            ..record()
        };
        assert_eq!(
            rec.to_line(),
            "1042,,example.com;www.example.com,1,1700000000,1731536000,\n"
        );
    }

    #[test]
    fn test_record_line_strips_delimiters_from_common_name() {
        let rec = ExtractedRecord {
            common_name: Some("Acme, Inc; Ltd".to_string()),
            ..record()
        };
        let line = rec.to_line();
        assert!(line.starts_with("1042,Acme Inc Ltd,"));
        assert_eq!(line.trim_end().split(',').count(), RECORD_COLUMNS);
    }

    #[test]
    fn test_record_parse_written_line() {
        let rec = record();
        assert_eq!(ExtractedRecord::parse_line(&rec.to_line()).unwrap(), rec);
    }

    #[test]
    fn test_record_parse_wrong_column_count() {
        let err = ExtractedRecord::parse_line("1,example.com,0,1,2").unwrap_err();
        assert!(matches!(
            err,
            Error::ColumnCount {
                expected: 7,
                found: 5
            }
        ));
    }

    #[test]
    fn test_record_parse_bad_precert_flag() {
        let err = ExtractedRecord::parse_line("1,,a.com,2,1,2,3").unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "isPrecert", .. }));
    }

    #[test]
    fn test_record_parse_bad_number() {
        let err = ExtractedRecord::parse_line("1,,a.com,0,soon,2,3").unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "notBefore", .. }));
    }

    #[test]
    fn test_record_parse_empty_domains() {
        let err = ExtractedRecord::parse_line("1,,;;,0,1,2,3").unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "domains", .. }));
    }

    #[test]
    fn test_record_parse_canonicalizes_domains() {
        let rec = ExtractedRecord::parse_line("5,,Example.COM;example.com.,0,1,2,").unwrap();
        assert_eq!(rec.domains.len(), 1);
        assert!(rec.domains.contains("example.com"));
        assert_eq!(rec.leaf_timestamp, None);
    }

    #[test]
    fn test_occurrence_timestamp_prefers_leaf_time() {
        assert_eq!(record().occurrence_timestamp(), 1_700_000_123);
        let rec = ExtractedRecord {
            leaf_timestamp: None,
            ..record()
        };
        assert_eq!(rec.occurrence_timestamp(), 1_731_536_000);
    }

    #[test]
    fn test_occurrences_one_per_domain() {
        let rec = record();
        let occurrences: Vec<_> = rec.occurrences().collect();
        assert_eq!(occurrences.len(), 2);
        assert!(occurrences.iter().all(|o| o.timestamp == 1_700_000_123));
        assert_eq!(occurrences[0].domain, "example.com");
        assert_eq!(occurrences[1].domain, "www.example.com");
    }

    // =========================================================================
    // DomainOccurrence
    // =========================================================================

    #[test]
    fn test_occurrence_line() {
        let mut buf = String::new();
        DomainOccurrence {
            domain: "example.com",
            timestamp: 1_700_000_000,
        }
        .write_line(&mut buf);
        assert_eq!(buf, "example.com,1700000000\n");
    }

    #[test]
    fn test_occurrence_parse_tolerates_spaces() {
        let occ = DomainOccurrence::parse_line("example.com, 1700000000").unwrap();
        assert_eq!(occ.domain, "example.com");
        assert_eq!(occ.timestamp, 1_700_000_000);
    }

    #[test]
    fn test_occurrence_parse_wrong_columns() {
        assert!(matches!(
            DomainOccurrence::parse_line("example.com"),
            Err(Error::ColumnCount { found: 1, .. })
        ));
        assert!(matches!(
            DomainOccurrence::parse_line("a.com,1,2"),
            Err(Error::ColumnCount { found: 3, .. })
        ));
    }

    #[test]
    fn test_occurrence_parse_bad_timestamp() {
        assert!(matches!(
            DomainOccurrence::parse_line("a.com,yesterday"),
            Err(Error::InvalidField { field: "timestamp", .. })
        ));
    }

    // =========================================================================
    // DomainStat
    // =========================================================================

    #[test]
    fn test_stat_line() {
        let stat = DomainStat {
            domain: "example.com".to_string(),
            first_seen: 1_700_000_000,
            last_seen: 1_700_005_000,
        };
        let mut buf = String::new();
        stat.write_line(&mut buf);
        assert_eq!(buf, "example.com,1700000000,1700005000\n");
        assert_eq!(DomainStat::parse_line(&buf).unwrap(), stat);
    }
}
