//! Splitting buffered bytes into records.
//!
//! [`ByteStreamAtomizer`] implements the `consume_data` contract: offered a
//! byte slice, it consumes a prefix covering the records it could complete
//! and the caller keeps re-offering the unconsumed suffix. Three boundary
//! strategies are supported (separator-delimited lines, JSON value
//! scanning, model-delegated balanced-tag detection), all sharing the
//! overlong-record state machine and the diagnostic event surface.

pub mod json;

use crate::atom::{LogAtom, SourceId};
use crate::handler::{AtomHandler, EventHandler, EventKind, StreamEvent};
use crate::model::{Boundary, ParseModel};
use chrono::Utc;
use json::{scan_json, JsonScan};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AtomizerError {
    #[error("maximum record length must be positive")]
    ZeroMaxRecordLength,

    #[error("end-of-line separator must not be empty")]
    EmptySeparator,
}

/// How record boundaries are found in the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundaryMode {
    #[default]
    Line,
    Json,
    Xml,
}

/// Carried across `consume_data` calls: a record that blew the length
/// bound is consumed piecewise until its terminator shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitState {
    Normal,
    Overlong,
}

enum Step {
    Advance(usize),
    Done,
}

pub struct AtomizerBuilder {
    source: SourceId,
    max_record_length: usize,
    mode: BoundaryMode,
    eol_separator: Vec<u8>,
    use_real_time: bool,
    timestamp_paths: Vec<String>,
    continuous_timestamp_missing_warning: bool,
    atom_handlers: Vec<Box<dyn AtomHandler>>,
    event_handlers: Vec<Box<dyn EventHandler>>,
}

impl AtomizerBuilder {
    pub fn mode(mut self, mode: BoundaryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn eol_separator(mut self, separator: impl Into<Vec<u8>>) -> Self {
        self.eol_separator = separator.into();
        self
    }

    /// Stamp atoms with the wall clock instead of a parsed timestamp.
    pub fn use_real_time(mut self, enabled: bool) -> Self {
        self.use_real_time = enabled;
        self
    }

    /// Match-tree paths checked, in order, for the record timestamp.
    pub fn timestamp_paths(mut self, paths: Vec<String>) -> Self {
        self.timestamp_paths = paths;
        self
    }

    pub fn continuous_timestamp_missing_warning(mut self, enabled: bool) -> Self {
        self.continuous_timestamp_missing_warning = enabled;
        self
    }

    pub fn atom_handler(mut self, handler: Box<dyn AtomHandler>) -> Self {
        self.atom_handlers.push(handler);
        self
    }

    pub fn event_handler(mut self, handler: Box<dyn EventHandler>) -> Self {
        self.event_handlers.push(handler);
        self
    }

    pub fn build(self, model: Arc<dyn ParseModel>) -> Result<ByteStreamAtomizer, AtomizerError> {
        if self.max_record_length == 0 {
            return Err(AtomizerError::ZeroMaxRecordLength);
        }
        if self.eol_separator.is_empty() {
            return Err(AtomizerError::EmptySeparator);
        }
        Ok(ByteStreamAtomizer {
            source: self.source,
            model,
            mode: self.mode,
            max_record_length: self.max_record_length,
            eol_separator: self.eol_separator,
            use_real_time: self.use_real_time,
            timestamp_paths: self.timestamp_paths,
            continuous_timestamp_missing_warning: self.continuous_timestamp_missing_warning,
            atom_handlers: self.atom_handlers,
            event_handlers: self.event_handlers,
            state: SplitState::Normal,
            record_count: 0,
            warned_missing_timestamp: false,
        })
    }
}

pub struct ByteStreamAtomizer {
    source: SourceId,
    model: Arc<dyn ParseModel>,
    mode: BoundaryMode,
    max_record_length: usize,
    eol_separator: Vec<u8>,
    use_real_time: bool,
    timestamp_paths: Vec<String>,
    continuous_timestamp_missing_warning: bool,
    atom_handlers: Vec<Box<dyn AtomHandler>>,
    event_handlers: Vec<Box<dyn EventHandler>>,
    state: SplitState,
    record_count: u64,
    warned_missing_timestamp: bool,
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl ByteStreamAtomizer {
    pub fn builder(source: SourceId, max_record_length: usize) -> AtomizerBuilder {
        AtomizerBuilder {
            source,
            max_record_length,
            mode: BoundaryMode::Line,
            eol_separator: b"\n".to_vec(),
            use_real_time: false,
            timestamp_paths: Vec::new(),
            continuous_timestamp_missing_warning: false,
            atom_handlers: Vec::new(),
            event_handlers: Vec::new(),
        }
    }

    /// Records completed so far, overlong and incomplete ones included.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Consume as many complete records as the offered bytes allow and
    /// return how many bytes were taken. `0` with `end_of_stream` false
    /// means more data is needed; with `end_of_stream` true every byte is
    /// accounted for and any unterminated tail is reported as an event.
    pub fn consume_data(&mut self, data: &[u8], end_of_stream: bool) -> usize {
        let mut consumed = 0;
        while consumed < data.len() {
            let rest = &data[consumed..];
            let step = match self.state {
                SplitState::Overlong => self.overlong_step(rest, end_of_stream),
                SplitState::Normal => match self.mode {
                    BoundaryMode::Line => self.line_step(rest, end_of_stream),
                    BoundaryMode::Json => self.json_step(rest, end_of_stream),
                    BoundaryMode::Xml => self.xml_step(rest, end_of_stream),
                },
            };
            match step {
                Step::Advance(n) => consumed += n,
                Step::Done => break,
            }
        }
        // a stream must not end while the overlong state lingers; the next
        // resource after rollover starts clean
        if end_of_stream && self.state == SplitState::Overlong {
            self.emit(EventKind::OverlongRecordEndOfStream, Vec::new());
            self.state = SplitState::Normal;
        }
        consumed
    }

    fn overlong_step(&mut self, rest: &[u8], end_of_stream: bool) -> Step {
        if let Some(p) = find_sub(rest, &self.eol_separator) {
            self.emit(EventKind::OverlongRecordEnd, rest[..p].to_vec());
            self.state = SplitState::Normal;
            Step::Advance(p + self.eol_separator.len())
        } else if end_of_stream {
            self.emit(EventKind::OverlongRecordEndOfStream, rest.to_vec());
            self.state = SplitState::Normal;
            Step::Advance(rest.len())
        } else {
            // still inside the oversized record, keep discarding; retain a
            // partial separator at the tail so a terminator split across
            // offers is still recognized
            let keep = (self.eol_separator.len() - 1).min(rest.len());
            if rest.len() == keep {
                Step::Done
            } else {
                Step::Advance(rest.len() - keep)
            }
        }
    }

    fn line_step(&mut self, rest: &[u8], end_of_stream: bool) -> Step {
        match find_sub(rest, &self.eol_separator) {
            Some(p) => {
                self.record_count += 1;
                if p > self.max_record_length {
                    self.emit(EventKind::OverlongRecord, rest[..p].to_vec());
                } else if p > 0 {
                    self.dispatch_record(&rest[..p]);
                }
                Step::Advance(p + self.eol_separator.len())
            }
            None => self.no_boundary(rest, end_of_stream),
        }
    }

    fn json_step(&mut self, rest: &[u8], end_of_stream: bool) -> Step {
        if rest.starts_with(&self.eol_separator) {
            return Step::Advance(self.eol_separator.len());
        }
        match scan_json(rest) {
            JsonScan::Complete { start, end } => {
                if end - start <= self.max_record_length {
                    self.record_count += 1;
                    self.dispatch_record(&rest[start..end]);
                    Step::Advance(end)
                } else {
                    // the boundary is known, so the oversized value itself
                    // is the resynchronization point
                    debug!(
                        source = %self.source,
                        len = end - start,
                        "discarding oversized json value"
                    );
                    Step::Advance(end)
                }
            }
            JsonScan::Incomplete => {
                if rest.len() > self.max_record_length {
                    self.resync_json(rest, end_of_stream)
                } else {
                    self.no_boundary(rest, end_of_stream)
                }
            }
            JsonScan::Invalid => self.resync_json(rest, end_of_stream),
        }
    }

    /// The buffer head is not a usable JSON value. Try each position after
    /// a separator occurrence as a restart point; the first that yields a
    /// size-respecting value (or a plausible prefix of one) wins and
    /// everything before it is consumed as waste.
    fn resync_json(&mut self, rest: &[u8], end_of_stream: bool) -> Step {
        let sep_len = self.eol_separator.len();
        let mut search = 0;
        let mut last_sep_end = None;
        while let Some(p) = find_sub(&rest[search..], &self.eol_separator) {
            let candidate = search + p + sep_len;
            last_sep_end = Some(candidate);
            let viable = match scan_json(&rest[candidate..]) {
                JsonScan::Complete { start, end } => end - start <= self.max_record_length,
                JsonScan::Incomplete => rest.len() - candidate <= self.max_record_length,
                JsonScan::Invalid => false,
            };
            if viable {
                debug!(source = %self.source, skipped = candidate, "resynchronized json stream");
                return Step::Advance(candidate);
            }
            search = candidate;
        }
        match last_sep_end {
            // no restart point parses; drop up to the last separator and
            // let the next offer retry the remainder
            Some(end) => {
                debug!(source = %self.source, skipped = end, "discarding unparseable json data");
                Step::Advance(end)
            }
            None => self.no_boundary(rest, end_of_stream),
        }
    }

    fn xml_step(&mut self, rest: &[u8], end_of_stream: bool) -> Step {
        if rest.starts_with(&self.eol_separator) {
            return Step::Advance(self.eol_separator.len());
        }
        match self.model.find_boundary(rest) {
            Boundary::Complete { len } if len == 0 || len > rest.len() => {
                warn!(
                    source = %self.source,
                    len,
                    available = rest.len(),
                    "parsing model reported an impossible boundary"
                );
                self.skip_to_separator(rest, end_of_stream)
            }
            Boundary::Complete { len } => {
                self.record_count += 1;
                if len <= self.max_record_length {
                    self.dispatch_record(&rest[..len]);
                } else {
                    self.emit(EventKind::OverlongRecord, rest[..len].to_vec());
                }
                Step::Advance(len)
            }
            Boundary::Incomplete => self.no_boundary(rest, end_of_stream),
            Boundary::NoMatch => self.skip_to_separator(rest, end_of_stream),
        }
    }

    fn skip_to_separator(&mut self, rest: &[u8], end_of_stream: bool) -> Step {
        match find_sub(rest, &self.eol_separator) {
            Some(p) => {
                debug!(source = %self.source, skipped = p, "discarding unmatchable data");
                Step::Advance(p + self.eol_separator.len())
            }
            None => self.no_boundary(rest, end_of_stream),
        }
    }

    /// No boundary is visible in `rest`: either the record is already over
    /// the limit, or the stream ended mid-record, or we wait for more data.
    fn no_boundary(&mut self, rest: &[u8], end_of_stream: bool) -> Step {
        if rest.len() > self.max_record_length {
            if end_of_stream {
                self.record_count += 1;
                self.emit(EventKind::OverlongRecordEndOfStream, rest.to_vec());
                return Step::Advance(rest.len());
            }
            // hold back any bytes that could be the start of a separator
            let keep = (self.eol_separator.len() - 1).min(rest.len());
            let take = rest.len() - keep;
            if take == 0 {
                return Step::Done;
            }
            self.record_count += 1;
            self.emit(EventKind::OverlongRecordStart, rest[..take].to_vec());
            self.state = SplitState::Overlong;
            Step::Advance(take)
        } else if end_of_stream {
            self.record_count += 1;
            self.emit(EventKind::IncompleteLastRecord, rest.to_vec());
            Step::Advance(rest.len())
        } else {
            Step::Done
        }
    }

    fn dispatch_record(&mut self, record: &[u8]) {
        let parser_match = self.model.try_match(record);
        let timestamp = if self.use_real_time {
            Some(Utc::now())
        } else {
            parser_match.as_ref().and_then(|tree| {
                tree.timestamp_at(self.timestamp_paths.iter().map(String::as_str))
            })
        };

        if parser_match.is_some()
            && !self.use_real_time
            && !self.timestamp_paths.is_empty()
            && timestamp.is_none()
            && (self.continuous_timestamp_missing_warning || !self.warned_missing_timestamp)
        {
            warn!(
                source = %self.source,
                "parsed record carries no timestamp at the configured paths"
            );
            self.warned_missing_timestamp = true;
        }

        if parser_match.is_none() {
            self.emit(EventKind::UnparsedRecord, record.to_vec());
        }

        match LogAtom::new(record.to_vec(), parser_match, timestamp, self.source.clone()) {
            Ok(atom) => {
                for handler in &mut self.atom_handlers {
                    handler.receive_atom(&atom);
                }
            }
            Err(e) => warn!(source = %self.source, error = %e, "dropping malformed record"),
        }
    }

    fn emit(&mut self, kind: EventKind, raw: Vec<u8>) {
        let event = StreamEvent {
            kind,
            source: self.source.clone(),
            record_count: self.record_count,
            raw,
        };
        for handler in &mut self.event_handlers {
            handler.receive_event(&event);
        }
    }
}
