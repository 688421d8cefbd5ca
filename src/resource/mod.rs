//! Log resources: single addressable byte sources with buffering,
//! consumed-length bookkeeping and (for files) restart repositioning.

pub mod file;
pub mod socket;

pub use file::FileResource;
pub use socket::UnixSocketResource;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("invalid resource url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("resource '{0}' is already open")]
    AlreadyOpen(String),

    #[error("resource '{0}' is not open")]
    NotOpen(String),

    #[error("commit of {requested} bytes exceeds buffered {available}")]
    CommitBeyondBuffer { requested: usize, available: usize },

    #[error("chunk size must be positive")]
    ZeroChunkSize,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    File,
    Unix,
}

impl Scheme {
    pub fn prefix(self) -> &'static str {
        match self {
            Scheme::File => "file://",
            Scheme::Unix => "unix://",
        }
    }
}

/// Canonical scheme-prefixed resource address: `file://path` or `unix://path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUrl {
    raw: String,
    scheme: Scheme,
    path: PathBuf,
}

impl ResourceUrl {
    pub fn parse(raw: &str) -> Result<Self, ResourceError> {
        let (scheme, rest) = if let Some(rest) = raw.strip_prefix("file://") {
            (Scheme::File, rest)
        } else if let Some(rest) = raw.strip_prefix("unix://") {
            (Scheme::Unix, rest)
        } else {
            return Err(ResourceError::InvalidUrl {
                url: raw.to_string(),
                reason: "scheme must be file:// or unix://".to_string(),
            });
        };
        if rest.is_empty() {
            return Err(ResourceError::InvalidUrl {
                url: raw.to_string(),
                reason: "path must not be empty".to_string(),
            });
        }
        Ok(Self {
            raw: raw.to_string(),
            scheme,
            path: PathBuf::from(rest),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub(crate) fn expect_scheme(&self, scheme: Scheme) -> Result<(), ResourceError> {
        if self.scheme != scheme {
            return Err(ResourceError::InvalidUrl {
                url: self.raw.clone(),
                reason: format!("expected a {} url", scheme.prefix()),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for ResourceUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Persisted resume state for a file resource, serialized as the JSON
/// triple `[inode, consumed_length, content_hash]`. Anything other than
/// exactly those three fields fails deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RepositioningTuple", into = "RepositioningTuple")]
pub struct RepositioningData {
    pub inode: u64,
    pub consumed_length: u64,
    /// base64 of the hash over the first `consumed_length` bytes.
    pub content_hash: String,
}

type RepositioningTuple = (u64, u64, String);

impl From<RepositioningTuple> for RepositioningData {
    fn from((inode, consumed_length, content_hash): RepositioningTuple) -> Self {
        Self {
            inode,
            consumed_length,
            content_hash,
        }
    }
}

impl From<RepositioningData> for RepositioningTuple {
    fn from(data: RepositioningData) -> Self {
        (data.inode, data.consumed_length, data.content_hash)
    }
}

/// One open-or-openable byte source. The buffer/commit split is the heart
/// of the contract: `fill_buffer` appends newly read bytes, the atomizer
/// decides how much of the buffer forms complete records, and
/// `update_position` commits exactly that prefix. Uncommitted bytes
/// survive across calls and, via repositioning data, across restarts.
pub trait LogResource: Send {
    fn url(&self) -> &ResourceUrl;

    fn is_open(&self) -> bool;

    /// Open the underlying handle. With `reopen` false, opening an already
    /// open resource is an error. With `reopen` true, the same URL is
    /// re-resolved; the return value tells whether a genuinely different
    /// underlying file was obtained.
    fn open(&mut self, reopen: bool) -> Result<bool, ResourceError>;

    /// One bounded read appended to the buffer. `Ok(0)` is end-of-data;
    /// errors are returned for the caller to decide retry vs rollover
    /// (`ErrorKind::WouldBlock` marks a transient condition).
    fn fill_buffer(&mut self) -> Result<usize, ResourceError>;

    fn buffer(&self) -> &[u8];

    fn consumed_length(&self) -> u64;

    /// Commit `length` buffered bytes as consumed and drop them from the
    /// front of the buffer.
    fn update_position(&mut self, length: usize) -> Result<(), ResourceError>;

    /// Resume state for cross-restart persistence; `None` for sources that
    /// cannot be repositioned (sockets).
    fn repositioning_data(&self) -> Option<RepositioningData>;

    fn close(&mut self) -> Result<(), ResourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_url() {
        let url = ResourceUrl::parse("file:///var/log/syslog").unwrap();
        assert_eq!(url.scheme(), Scheme::File);
        assert_eq!(url.path(), Path::new("/var/log/syslog"));
        assert_eq!(url.as_str(), "file:///var/log/syslog");
    }

    #[test]
    fn test_parse_unix_url() {
        let url = ResourceUrl::parse("unix:///run/app.sock").unwrap();
        assert_eq!(url.scheme(), Scheme::Unix);
    }

    #[test]
    fn test_reject_unknown_scheme_and_empty_path() {
        assert!(ResourceUrl::parse("http://host/log").is_err());
        assert!(ResourceUrl::parse("/var/log/syslog").is_err());
        assert!(ResourceUrl::parse("file://").is_err());
        assert!(ResourceUrl::parse("").is_err());
    }

    #[test]
    fn test_repositioning_round_trip_as_triple() {
        let data = RepositioningData {
            inode: 42,
            consumed_length: 65536,
            content_hash: "aGFzaA==".to_string(),
        };
        let json = serde_json::to_string(&data).unwrap();
        assert_eq!(json, r#"[42,65536,"aGFzaA=="]"#);

        let back: RepositioningData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_repositioning_rejects_malformed_triples() {
        assert!(serde_json::from_str::<RepositioningData>("[42,65536]").is_err());
        assert!(serde_json::from_str::<RepositioningData>(r#"[42,65536,"h",4]"#).is_err());
        assert!(serde_json::from_str::<RepositioningData>(r#"["d",65536,"h"]"#).is_err());
        assert!(serde_json::from_str::<RepositioningData>(r#"[42,true,"h"]"#).is_err());
        assert!(serde_json::from_str::<RepositioningData>(r#"[42,65536,1]"#).is_err());
    }
}
