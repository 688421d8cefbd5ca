//! Interface boundary to the external parsing model.
//!
//! The atomization core never inspects a grammar; it hands completed record
//! bytes to a [`ParseModel`] and receives either a [`MatchTree`] or a
//! failure. Delegated boundary detection (used for XML-style records whose
//! end only the model can determine) goes through [`ParseModel::find_boundary`].

pub mod regexp;

pub use regexp::{ModelError, RegexModel};

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;

/// A single matched value at some path of the match tree.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchValue {
    Bytes(Vec<u8>),
    Integer(i64),
    Float(f64),
    Time(DateTime<Utc>),
}

impl MatchValue {
    /// Interpret this value as a timestamp, if it carries one.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            MatchValue::Time(t) => Some(*t),
            MatchValue::Integer(secs) => Utc.timestamp_opt(*secs, 0).single(),
            MatchValue::Float(secs) => {
                let whole = secs.trunc() as i64;
                let nanos = ((secs.fract()) * 1e9) as u32;
                Utc.timestamp_opt(whole, nanos).single()
            }
            MatchValue::Bytes(_) => None,
        }
    }
}

/// Result of matching one record against the parsing model: a flat view of
/// the match tree, keyed by path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchTree {
    values: BTreeMap<String, MatchValue>,
}

impl MatchTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, value: MatchValue) {
        self.values.insert(path.into(), value);
    }

    pub fn get(&self, path: &str) -> Option<&MatchValue> {
        self.values.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Look up the first of the given paths that resolves to a timestamp.
    pub fn timestamp_at<'a, I>(&self, paths: I) -> Option<DateTime<Utc>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        paths
            .into_iter()
            .filter_map(|p| self.get(p).and_then(MatchValue::as_timestamp))
            .next()
    }
}

/// Outcome of delegated boundary detection over buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// The leading `len` bytes form exactly one complete record.
    Complete { len: usize },
    /// A record has started but its end is not yet in the buffer.
    Incomplete,
    /// The buffer head cannot start a record for this model.
    NoMatch,
}

/// The contract the atomization core holds against the parsing model.
pub trait ParseModel: Send + Sync {
    /// Attempt to match one complete record. `None` means the record does
    /// not conform to the model; the atom still flows, unparsed.
    fn try_match(&self, data: &[u8]) -> Option<MatchTree>;

    /// Report how many leading bytes of `data` form one complete record,
    /// for models that own the boundary decision (balanced-tag formats).
    /// Models without that capability report [`Boundary::NoMatch`].
    fn find_boundary(&self, _data: &[u8]) -> Boundary {
        Boundary::NoMatch
    }
}

/// Accepts every record with an empty match tree. Used for sources whose
/// records flow through unparsed.
#[derive(Debug, Default)]
pub struct PassthroughModel;

impl ParseModel for PassthroughModel {
    fn try_match(&self, _data: &[u8]) -> Option<MatchTree> {
        Some(MatchTree::new())
    }
}
