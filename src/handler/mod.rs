//! Downstream seams: atom consumers and out-of-band stream diagnostics.

use crate::atom::{LogAtom, SourceId};
use crate::model::MatchValue;
use std::io::Write;
use tracing::warn;

/// Receiver of extracted atoms. The return value reports whether the atom
/// was accepted; `false` means the handler could not take it now and the
/// caller should hold it back and offer it again (the synchronizer uses
/// this to delay out-of-order atoms).
pub trait AtomHandler: Send {
    fn receive_atom(&mut self, atom: &LogAtom) -> bool;
}

/// Diagnostic condition observed while splitting a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A record exceeded the length bound and its end was seen in the same
    /// pass.
    OverlongRecord,
    /// A record exceeded the length bound and continues beyond the buffer.
    OverlongRecordStart,
    /// The terminator of a previously reported overlong record arrived.
    OverlongRecordEnd,
    /// An overlong record was cut off by the end of the stream.
    OverlongRecordEndOfStream,
    /// The stream ended mid-record without a terminator.
    IncompleteLastRecord,
    /// A complete record did not conform to the parsing model.
    UnparsedRecord,
}

impl EventKind {
    pub fn message(self) -> &'static str {
        match self {
            EventKind::OverlongRecord => "Overlong record detected",
            EventKind::OverlongRecordStart => "Start of overlong record detected",
            EventKind::OverlongRecordEnd => "Overlong record terminated",
            EventKind::OverlongRecordEndOfStream => {
                "Overlong record terminated by end of stream"
            }
            EventKind::IncompleteLastRecord => "Incomplete last record",
            EventKind::UnparsedRecord => "Record did not match the parsing model",
        }
    }
}

/// One diagnostic event, tagged with the source, the count of records
/// extracted from it so far and the raw bytes involved.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub source: SourceId,
    pub record_count: u64,
    pub raw: Vec<u8>,
}

/// Receiver of stream diagnostics.
pub trait EventHandler: Send {
    fn receive_event(&mut self, event: &StreamEvent);
}

/// Forwards diagnostic events to the process log.
#[derive(Debug, Default)]
pub struct TracingEventLog;

impl EventHandler for TracingEventLog {
    fn receive_event(&mut self, event: &StreamEvent) {
        warn!(
            source = %event.source,
            records = event.record_count,
            raw_len = event.raw.len(),
            "{}",
            event.kind.message()
        );
    }
}

/// Writes each atom as one JSON object per line.
pub struct JsonLineWriter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLineWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn render_value(value: &MatchValue) -> serde_json::Value {
    match value {
        MatchValue::Bytes(b) => {
            serde_json::Value::String(String::from_utf8_lossy(b).into_owned())
        }
        MatchValue::Integer(i) => serde_json::Value::from(*i),
        MatchValue::Float(f) => serde_json::Value::from(*f),
        MatchValue::Time(t) => serde_json::Value::String(t.to_rfc3339()),
    }
}

impl<W: Write + Send> AtomHandler for JsonLineWriter<W> {
    fn receive_atom(&mut self, atom: &LogAtom) -> bool {
        let parsed = atom.parser_match().map(|tree| {
            tree.paths()
                .filter_map(|p| tree.get(p).map(|v| (p.to_string(), render_value(v))))
                .collect::<serde_json::Map<_, _>>()
        });
        let line = serde_json::json!({
            "source": atom.source().as_str(),
            "sequence": atom.sequence(),
            "timestamp": atom.timestamp().map(|t| t.to_rfc3339()),
            "raw": String::from_utf8_lossy(atom.raw()),
            "parsed": parsed,
        });
        let ok = serde_json::to_writer(&mut self.out, &line).is_ok()
            && self.out.write_all(b"\n").is_ok();
        if !ok {
            warn!(source = %atom.source(), "failed to write atom");
        }
        ok
    }
}
