//! Domain name canonicalization.
//!
//! Every name that enters the pipeline goes through [`canonicalize`] exactly
//! as written here, once in the extractor and again in the sharder. Bucket
//! assignment and deduplication both operate on the canonical form, so the
//! two call sites must never diverge.
//!
//! # Policy
//!
//! - Surrounding whitespace is trimmed and trailing dots are dropped
//!   (`Example.COM.` and `example.com` are the same name)
//! - Letters are lower-cased with Unicode case mapping
//! - Wildcard labels (`*.example.com`) and `www.` prefixes are kept, they are
//!   distinct names in a certificate
//! - Names that end up empty, or that contain whitespace, control characters
//!   or one of the schema delimiters, are rejected

use crate::{DOMAIN_DELIMITER, FIELD_DELIMITER};
use std::collections::BTreeSet;

/// Canonicalize a single DNS name, returning `None` if it cannot be stored.
pub fn canonicalize(name: &str) -> Option<String> {
    let trimmed = name.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.chars().any(|c| {
        c.is_whitespace() || c.is_control() || c == FIELD_DELIMITER || c == DOMAIN_DELIMITER
    }) {
        return None;
    }

    Some(trimmed.to_lowercase())
}

/// Canonicalize and deduplicate a collection of names.
///
/// The result is ordered, which keeps serialized records stable between runs.
pub fn canonical_set<I, S>(names: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .filter_map(|name| canonicalize(name.as_ref()))
        .collect()
}
