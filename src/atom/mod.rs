use crate::model::MatchTree;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum AtomError {
    #[error("atom raw content must not be empty")]
    EmptyContent,
}

/// Identity of an originating source. Used purely as a map key by the
/// synchronizer and for diagnostics; never dereferenced back to the
/// resource it names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(Arc<str>);

impl SourceId {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// One fully delimited record extracted from a byte stream, together with
/// its parse result and timestamp.
///
/// Atoms are created once per extracted record and are immutable apart
/// from [`LogAtom::set_timestamp`], which exists so correction filters can
/// fine-adjust timestamps after initial parsing.
#[derive(Debug, Clone)]
pub struct LogAtom {
    raw: Vec<u8>,
    parser_match: Option<MatchTree>,
    timestamp: Option<DateTime<Utc>>,
    source: SourceId,
    sequence: u64,
}

impl LogAtom {
    /// Create an atom from raw record bytes. The content must be non-empty.
    pub fn new(
        raw: Vec<u8>,
        parser_match: Option<MatchTree>,
        timestamp: Option<DateTime<Utc>>,
        source: SourceId,
    ) -> Result<Self, AtomError> {
        if raw.is_empty() {
            return Err(AtomError::EmptyContent);
        }
        Ok(Self {
            raw,
            parser_match,
            timestamp,
            source,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The match produced by the parsing model, or `None` for (yet)
    /// unparsed atoms.
    pub fn parser_match(&self) -> Option<&MatchTree> {
        self.parser_match.as_ref()
    }

    pub fn is_parsed(&self) -> bool {
        self.parser_match.is_some()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Replace the timestamp. The single permitted mutation; may be called
    /// more than once by upstream correction filters.
    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp = Some(timestamp);
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    /// Process-wide monotonically increasing id, assigned at construction.
    /// Only meaningful for diagnostics and ordering ties.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}
