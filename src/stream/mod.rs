//! One stream of records: a current resource, its atomizer, and a FIFO of
//! successor resources for rollover.

use crate::atomizer::ByteStreamAtomizer;
use crate::resource::{LogResource, RepositioningData, ResourceError};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("stream has no current resource")]
    NoCurrentResource,
}

/// Drives the fill→split→commit cycle over exactly one current resource.
///
/// Ownership of a resource transfers to the stream when added; rollover
/// flushes the old resource's unconsumed tail through the atomizer with
/// the end-of-stream flag before closing it, so truncated records are
/// reported rather than dropped.
pub struct LogStream {
    current: Option<Box<dyn LogResource>>,
    atomizer: ByteStreamAtomizer,
    queue: VecDeque<Box<dyn LogResource>>,
}

impl LogStream {
    /// Take ownership of the initial resource, opening it if the caller
    /// has not already done so.
    pub fn new(
        mut resource: Box<dyn LogResource>,
        atomizer: ByteStreamAtomizer,
    ) -> Result<Self, StreamError> {
        if !resource.is_open() {
            resource.open(false)?;
        }
        Ok(Self {
            current: Some(resource),
            atomizer,
            queue: VecDeque::new(),
        })
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn repositioning_data(&self) -> Option<RepositioningData> {
        self.current.as_ref().and_then(|r| r.repositioning_data())
    }

    /// One fill→split→commit cycle. Returns the number of freshly read
    /// bytes; `Ok(0)` means no new data (end of the file so far, or a
    /// closed socket). Read errors propagate for the driver to decide
    /// retry versus rollover.
    pub fn handle_stream(&mut self) -> Result<usize, StreamError> {
        let resource = self
            .current
            .as_mut()
            .ok_or(StreamError::NoCurrentResource)?;
        let read = resource.fill_buffer()?;
        let consumed = self.atomizer.consume_data(resource.buffer(), false);
        if consumed > 0 {
            resource.update_position(consumed)?;
        }
        Ok(read)
    }

    /// Enqueue a successor resource; it becomes current at the next
    /// rollover.
    pub fn add_next_resource(&mut self, resource: Box<dyn LogResource>) {
        self.queue.push_back(resource);
    }

    /// Close the current resource and promote the head of the queue. Any
    /// failure to access the successor propagates; silently skipping a
    /// configured source would hide data loss.
    pub fn roll_over(&mut self) -> Result<(), StreamError> {
        if let Some(mut old) = self.current.take() {
            let consumed = self.atomizer.consume_data(old.buffer(), true);
            if consumed > 0 {
                old.update_position(consumed)?;
            }
            old.close()?;
            debug!(url = %old.url(), "closed rolled-over resource");
        }
        if let Some(mut next) = self.queue.pop_front() {
            if !next.is_open() {
                next.open(false)?;
            }
            info!(url = %next.url(), "rolled over to next resource");
            self.current = Some(next);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{LogAtom, SourceId};
    use crate::handler::{AtomHandler, EventHandler, EventKind, StreamEvent};
    use crate::model::{MatchTree, ParseModel};
    use crate::resource::{FileResource, ResourceUrl};
    use std::fs::File;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Collector {
        atoms: Arc<Mutex<Vec<Vec<u8>>>>,
        events: Arc<Mutex<Vec<EventKind>>>,
    }

    impl AtomHandler for Collector {
        fn receive_atom(&mut self, atom: &LogAtom) -> bool {
            self.atoms.lock().unwrap().push(atom.raw().to_vec());
            true
        }
    }

    impl EventHandler for Collector {
        fn receive_event(&mut self, event: &StreamEvent) {
            self.events.lock().unwrap().push(event.kind);
        }
    }

    struct AnyModel;

    impl ParseModel for AnyModel {
        fn try_match(&self, _data: &[u8]) -> Option<MatchTree> {
            Some(MatchTree::new())
        }
    }

    fn file_resource(dir: &TempDir, name: &str, content: &[u8]) -> Box<FileResource> {
        let path = dir.path().join(name);
        File::create(&path).unwrap().write_all(content).unwrap();
        let url = ResourceUrl::parse(&format!("file://{}", path.display())).unwrap();
        Box::new(FileResource::new(url, 64).unwrap())
    }

    fn stream_with(
        resource: Box<FileResource>,
        collector: &Collector,
    ) -> LogStream {
        let atomizer = ByteStreamAtomizer::builder(SourceId::from("test"), 1024)
            .atom_handler(Box::new(collector.clone()))
            .event_handler(Box::new(collector.clone()))
            .build(Arc::new(AnyModel))
            .unwrap();
        LogStream::new(resource, atomizer).unwrap()
    }

    #[test]
    fn test_fill_split_commit_cycle() {
        let dir = TempDir::new().unwrap();
        let collector = Collector::default();
        let mut stream =
            stream_with(file_resource(&dir, "a.log", b"one\ntwo\npart"), &collector);

        assert_eq!(stream.handle_stream().unwrap(), 12);
        assert_eq!(
            *collector.atoms.lock().unwrap(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
        // the partial tail stays buffered, committed length covers only
        // complete records
        assert_eq!(stream.repositioning_data().unwrap().consumed_length, 8);

        // nothing new to read
        assert_eq!(stream.handle_stream().unwrap(), 0);
    }

    #[test]
    fn test_appended_data_completes_buffered_tail() {
        let dir = TempDir::new().unwrap();
        let collector = Collector::default();
        let path = dir.path().join("a.log");
        File::create(&path).unwrap().write_all(b"par").unwrap();
        let url = ResourceUrl::parse(&format!("file://{}", path.display())).unwrap();
        let mut stream = stream_with(
            Box::new(FileResource::new(url, 64).unwrap()),
            &collector,
        );

        stream.handle_stream().unwrap();
        assert!(collector.atoms.lock().unwrap().is_empty());

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"tial\n").unwrap();

        stream.handle_stream().unwrap();
        assert_eq!(*collector.atoms.lock().unwrap(), vec![b"partial".to_vec()]);
    }

    #[test]
    fn test_roll_over_flushes_truncated_tail() {
        let dir = TempDir::new().unwrap();
        let collector = Collector::default();
        let mut stream =
            stream_with(file_resource(&dir, "a.log", b"full\ntrunc"), &collector);
        stream.handle_stream().unwrap();

        stream.add_next_resource(file_resource(&dir, "b.log", b"next\n"));
        stream.roll_over().unwrap();

        assert_eq!(
            *collector.events.lock().unwrap(),
            vec![EventKind::IncompleteLastRecord]
        );

        stream.handle_stream().unwrap();
        assert_eq!(
            *collector.atoms.lock().unwrap(),
            vec![b"full".to_vec(), b"next".to_vec()]
        );
    }

    #[test]
    fn test_roll_over_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let collector = Collector::default();
        let mut stream = stream_with(file_resource(&dir, "a.log", b"x\n"), &collector);
        stream.handle_stream().unwrap();

        let missing = ResourceUrl::parse(&format!(
            "file://{}",
            dir.path().join("missing.log").display()
        ))
        .unwrap();
        stream.add_next_resource(Box::new(FileResource::new(missing, 64).unwrap()));

        assert!(stream.roll_over().is_err());
    }

    #[test]
    fn test_roll_over_retryable_after_failure() {
        let dir = TempDir::new().unwrap();
        let collector = Collector::default();
        let mut stream = stream_with(file_resource(&dir, "a.log", b"x\n"), &collector);
        stream.handle_stream().unwrap();

        let missing = ResourceUrl::parse(&format!(
            "file://{}",
            dir.path().join("missing.log").display()
        ))
        .unwrap();
        stream.add_next_resource(Box::new(FileResource::new(missing, 64).unwrap()));
        assert!(stream.roll_over().is_err());
        assert!(matches!(
            stream.handle_stream(),
            Err(StreamError::NoCurrentResource)
        ));

        // a later successor still rolls in and the stream keeps working
        stream.add_next_resource(file_resource(&dir, "b.log", b"recovered\n"));
        assert_eq!(stream.queued(), 1);
        stream.roll_over().unwrap();
        stream.handle_stream().unwrap();
        assert_eq!(
            *collector.atoms.lock().unwrap(),
            vec![b"x".to_vec(), b"recovered".to_vec()]
        );
    }

    #[test]
    fn test_exhausted_stream_errors() {
        let dir = TempDir::new().unwrap();
        let collector = Collector::default();
        let mut stream = stream_with(file_resource(&dir, "a.log", b"x\n"), &collector);
        stream.handle_stream().unwrap();

        stream.roll_over().unwrap();
        assert!(matches!(
            stream.handle_stream(),
            Err(StreamError::NoCurrentResource)
        ));
    }
}
