//! Bounded-time reordering of atoms arriving from concurrent streams.

use crate::atom::{LogAtom, SourceId};
use crate::handler::AtomHandler;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

struct SourceSlot {
    /// Timestamp of the newest atom this source has produced.
    last_timestamp: Option<DateTime<Utc>>,
    /// Atoms waiting for the other sources to catch up, in arrival order.
    pending: VecDeque<(DateTime<Utc>, LogAtom)>,
    last_seen: Instant,
}

/// Reorders atoms from several sources into increasing-timestamp order,
/// within a bounded wait window.
///
/// A buffered atom is released once every other tracked source has either
/// produced an atom with an equal-or-later timestamp or has been idle for
/// at least the wait time. An idle-expired source is excluded from the
/// comparison so it cannot block release indefinitely; once released, an
/// atom is never retroactively reordered. Callers must serialize access,
/// there is no internal locking.
pub struct MultisourceAtomSync {
    sync_wait_time: Duration,
    sources: HashMap<SourceId, SourceSlot>,
    handlers: Vec<Box<dyn AtomHandler>>,
}

impl MultisourceAtomSync {
    pub fn new(sync_wait_time: Duration, handlers: Vec<Box<dyn AtomHandler>>) -> Self {
        Self {
            sync_wait_time,
            sources: HashMap::new(),
            handlers,
        }
    }

    /// Track a source before its first atom. A registered-but-silent
    /// source participates in the ordering decision (and blocks release)
    /// until it expires.
    pub fn register_source(&mut self, source: SourceId) {
        self.sources.entry(source).or_insert_with(|| SourceSlot {
            last_timestamp: None,
            pending: VecDeque::new(),
            last_seen: Instant::now(),
        });
    }

    pub fn pending_count(&self) -> usize {
        self.sources.values().map(|s| s.pending.len()).sum()
    }

    /// Re-evaluate idleness without a new arrival; called periodically by
    /// the driver so a stalled source expires even when no traffic flows.
    pub fn release_expired(&mut self) -> usize {
        self.release_pass(Instant::now())
    }

    /// Release everything still buffered, in timestamp order, ignoring the
    /// wait window. For shutdown.
    pub fn flush(&mut self) -> usize {
        let mut drained: Vec<(DateTime<Utc>, LogAtom)> = self
            .sources
            .values_mut()
            .flat_map(|slot| slot.pending.drain(..))
            .collect();
        drained.sort_by_key(|(ts, _)| *ts);
        let count = drained.len();
        for (_, atom) in drained {
            self.forward(&atom);
        }
        count
    }

    /// True when every other tracked source has caught up to `ts` or is
    /// idle-expired.
    fn blocked(&self, source: &SourceId, ts: DateTime<Utc>, now: Instant) -> bool {
        self.sources.iter().any(|(id, slot)| {
            if id == source {
                return false;
            }
            let expired = now.duration_since(slot.last_seen) >= self.sync_wait_time;
            let caught_up = slot.last_timestamp.is_some_and(|last| last >= ts);
            !expired && !caught_up
        })
    }

    fn release_pass(&mut self, now: Instant) -> usize {
        let mut count = 0;
        loop {
            let mut best: Option<(SourceId, DateTime<Utc>)> = None;
            for (id, slot) in &self.sources {
                let Some((ts, _)) = slot.pending.front() else {
                    continue;
                };
                if self.blocked(id, *ts, now) {
                    continue;
                }
                if best.as_ref().map_or(true, |(_, b)| ts < b) {
                    best = Some((id.clone(), *ts));
                }
            }
            let Some((id, _)) = best else { break };
            let released = self
                .sources
                .get_mut(&id)
                .and_then(|slot| slot.pending.pop_front());
            if let Some((_, atom)) = released {
                self.forward(&atom);
                count += 1;
            }
        }
        count
    }

    fn forward(&mut self, atom: &LogAtom) {
        for handler in &mut self.handlers {
            handler.receive_atom(atom);
        }
    }
}

impl AtomHandler for MultisourceAtomSync {
    /// Buffer the atom and release whatever the ordering rule now allows.
    /// Returns whether any release happened in this call; `false` means
    /// the atom was only buffered. Atoms without a timestamp cannot be
    /// meaningfully interleaved and pass straight through.
    fn receive_atom(&mut self, atom: &LogAtom) -> bool {
        let now = Instant::now();
        let Some(ts) = atom.timestamp() else {
            self.forward(atom);
            return true;
        };

        let slot = self
            .sources
            .entry(atom.source().clone())
            .or_insert_with(|| SourceSlot {
                last_timestamp: None,
                pending: VecDeque::new(),
                last_seen: now,
            });
        slot.last_seen = now;
        slot.last_timestamp = Some(ts);
        slot.pending.push_back((ts, atom.clone()));
        debug!(source = %atom.source(), %ts, "buffered atom");

        self.release_pass(now) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Collector {
        released: Arc<Mutex<Vec<(String, i64)>>>,
    }

    impl AtomHandler for Collector {
        fn receive_atom(&mut self, atom: &LogAtom) -> bool {
            self.released.lock().unwrap().push((
                atom.source().as_str().to_string(),
                atom.timestamp().map(|t| t.timestamp()).unwrap_or(-1),
            ));
            true
        }
    }

    fn atom(source: &str, ts: i64) -> LogAtom {
        LogAtom::new(
            format!("{source} {ts}").into_bytes(),
            None,
            Some(Utc.timestamp_opt(ts, 0).unwrap()),
            SourceId::from(source),
        )
        .unwrap()
    }

    fn sync_with(wait: Duration) -> (MultisourceAtomSync, Collector) {
        let collector = Collector::default();
        let sync = MultisourceAtomSync::new(wait, vec![Box::new(collector.clone())]);
        (sync, collector)
    }

    #[test]
    fn test_timestampless_atom_passes_through() {
        let (mut sync, collector) = sync_with(Duration::from_secs(10));
        sync.register_source(SourceId::from("a"));
        sync.register_source(SourceId::from("b"));

        let bare = LogAtom::new(b"x".to_vec(), None, None, SourceId::from("a")).unwrap();
        assert!(sync.receive_atom(&bare));
        assert_eq!(collector.released.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_silent_source_blocks_release() {
        let (mut sync, collector) = sync_with(Duration::from_secs(10));
        sync.register_source(SourceId::from("a"));
        sync.register_source(SourceId::from("b"));

        assert!(!sync.receive_atom(&atom("a", 100)));
        assert!(!sync.receive_atom(&atom("a", 101)));
        assert!(collector.released.lock().unwrap().is_empty());
        assert_eq!(sync.pending_count(), 2);
    }

    #[test]
    fn test_caught_up_source_releases_in_timestamp_order() {
        let (mut sync, collector) = sync_with(Duration::from_secs(10));
        sync.register_source(SourceId::from("a"));
        sync.register_source(SourceId::from("b"));

        sync.receive_atom(&atom("a", 100));
        sync.receive_atom(&atom("a", 101));
        // b catches up past everything buffered
        assert!(sync.receive_atom(&atom("b", 101)));

        let released = collector.released.lock().unwrap();
        let timestamps: Vec<i64> = released.iter().map(|(_, t)| *t).collect();
        assert_eq!(timestamps, vec![100, 101, 101]);
        assert_eq!(released[0].0, "a");
    }

    #[test]
    fn test_partial_catch_up_releases_only_older_atoms() {
        let (mut sync, collector) = sync_with(Duration::from_secs(10));
        sync.register_source(SourceId::from("a"));
        sync.register_source(SourceId::from("b"));

        sync.receive_atom(&atom("a", 100));
        sync.receive_atom(&atom("a", 200));
        assert!(sync.receive_atom(&atom("b", 150)));

        // a@100 and b@150 may go (the other source has seen >= their ts),
        // a@200 still waits for b
        let released: Vec<i64> = collector
            .released
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| *t)
            .collect();
        assert_eq!(released, vec![100, 150]);
        assert_eq!(sync.pending_count(), 1);
    }

    #[test]
    fn test_idle_source_expires() {
        let (mut sync, collector) = sync_with(Duration::from_millis(50));
        sync.register_source(SourceId::from("a"));
        sync.register_source(SourceId::from("b"));

        assert!(!sync.receive_atom(&atom("a", 100)));
        assert!(collector.released.lock().unwrap().is_empty());

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(sync.release_expired(), 1);
        assert_eq!(
            *collector.released.lock().unwrap(),
            vec![("a".to_string(), 100)]
        );
    }

    #[test]
    fn test_unregistered_source_is_tracked_on_first_atom() {
        let (mut sync, collector) = sync_with(Duration::from_secs(10));
        // single source: nothing else can block it
        assert!(sync.receive_atom(&atom("solo", 7)));
        assert_eq!(collector.released.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_flush_releases_everything_in_order() {
        let (mut sync, collector) = sync_with(Duration::from_secs(10));
        sync.register_source(SourceId::from("a"));
        sync.register_source(SourceId::from("b"));
        // a silent third source keeps everything buffered
        sync.register_source(SourceId::from("c"));

        sync.receive_atom(&atom("b", 300));
        sync.receive_atom(&atom("a", 100));
        sync.receive_atom(&atom("a", 200));
        assert!(collector.released.lock().unwrap().is_empty());

        assert_eq!(sync.flush(), 3);
        let released: Vec<i64> = collector
            .released
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| *t)
            .collect();
        assert_eq!(released, vec![100, 200, 300]);
    }
}
