//! Key Filtering
//!
//! A pluggable predicate applied to mutation and deletion keys before
//! dispatch, so internal metadata namespaces never reach the workers or the
//! downstream feed. Snapshot markers, stream ends, and seqno advances are
//! never filtered.

use std::fmt;

/// Predicate over document keys. Returns `true` for keys that must be
/// dropped before dispatch.
pub trait KeyFilter: Send + Sync {
    fn is_filtered(&self, key: &[u8]) -> bool;

    /// Short name used in logs and config dumps.
    fn name(&self) -> &str;
}

impl fmt::Debug for dyn KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyFilter({})", self.name())
    }
}

/// Passes every key through unfiltered.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFilter;

impl KeyFilter for NoFilter {
    fn is_filtered(&self, _key: &[u8]) -> bool {
        false
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Drops keys starting with any of the configured prefixes.
#[derive(Debug, Clone, Default)]
pub struct PrefixFilter {
    prefixes: Vec<Vec<u8>>,
}

impl PrefixFilter {
    pub fn new<I, P>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl KeyFilter for PrefixFilter {
    fn is_filtered(&self, key: &[u8]) -> bool {
        self.prefixes.iter().any(|p| key.starts_with(p))
    }

    fn name(&self) -> &str {
        "prefix"
    }
}
