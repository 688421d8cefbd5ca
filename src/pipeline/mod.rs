//! The async driver: one reader task per configured stream, a fan-in task
//! owning the synchronizer and the downstream handlers.
//!
//! Reader tasks poll their stream, detect file rotation on EOF, persist
//! repositioning data and roll over; extracted atoms funnel through an
//! mpsc channel so the synchronizer and handlers are only ever touched
//! from one task.

use crate::atom::{LogAtom, SourceId};
use crate::atomizer::{AtomizerError, BoundaryMode, ByteStreamAtomizer};
use crate::config::{Config, ConfigError, SourceConfig, SyncConfig};
use crate::handler::{AtomHandler, TracingEventLog};
use crate::model::{ModelError, ParseModel, PassthroughModel, RegexModel};
use crate::resource::{
    FileResource, LogResource, RepositioningData, ResourceError, ResourceUrl, Scheme,
    UnixSocketResource,
};
use crate::stream::{LogStream, StreamError};
use crate::sync::MultisourceAtomSync;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Atomizer(#[from] AtomizerError),
}

struct ChannelHandler {
    tx: mpsc::UnboundedSender<LogAtom>,
}

impl AtomHandler for ChannelHandler {
    fn receive_atom(&mut self, atom: &LogAtom) -> bool {
        self.tx.send(atom.clone()).is_ok()
    }
}

/// Run the configured streams until the token is cancelled. Extracted
/// atoms go to `handlers`, through the synchronizer when enabled.
pub async fn run(
    config: Config,
    handlers: Vec<Box<dyn AtomHandler>>,
    token: CancellationToken,
) -> Result<(), PipelineError> {
    config.validate()?;

    let (tx, rx) = mpsc::unbounded_channel();
    let mut source_ids = Vec::new();
    let mut tasks = Vec::new();

    for source in &config.sources {
        let worker = StreamWorker::build(source, &config, tx.clone())?;
        source_ids.push(SourceId::from(source.url.as_str()));
        tasks.push(tokio::spawn(worker.run(token.clone())));
    }
    drop(tx);

    fan_in(rx, config.sync.clone(), source_ids, handlers).await;

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "reader task panicked");
        }
    }
    Ok(())
}

async fn fan_in(
    mut rx: mpsc::UnboundedReceiver<LogAtom>,
    sync_config: SyncConfig,
    sources: Vec<SourceId>,
    mut handlers: Vec<Box<dyn AtomHandler>>,
) {
    if !sync_config.enabled {
        while let Some(atom) = rx.recv().await {
            for handler in &mut handlers {
                handler.receive_atom(&atom);
            }
        }
        return;
    }

    let mut sync = MultisourceAtomSync::new(sync_config.wait_time, handlers);
    for source in sources {
        sync.register_source(source);
    }
    // re-check idleness well within the wait window
    let period = std::cmp::max(sync_config.wait_time / 4, Duration::from_millis(50));
    let mut tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            atom = rx.recv() => match atom {
                Some(atom) => {
                    sync.receive_atom(&atom);
                }
                None => break,
            },
            _ = tick.tick() => {
                sync.release_expired();
            }
        }
    }
    let flushed = sync.flush();
    if flushed > 0 {
        info!(count = flushed, "flushed buffered atoms at shutdown");
    }
}

#[cfg(unix)]
fn path_inode(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| m.ino())
}

#[cfg(not(unix))]
fn path_inode(_path: &Path) -> Option<u64> {
    None
}

fn state_path(dir: &Path, url: &ResourceUrl) -> PathBuf {
    let name: String = url
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    // the readable name alone is not injective ("a.log" and "a_log"
    // sanitize identically), so tag it with a digest of the url
    let digest = Sha256::digest(url.as_str().as_bytes());
    let tag: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    dir.join(format!("{name}-{tag}.json"))
}

fn load_state(dir: &Path, url: &ResourceUrl) -> Option<RepositioningData> {
    let raw = std::fs::read_to_string(state_path(dir, url)).ok()?;
    match serde_json::from_str(&raw) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!(url = %url, error = %e, "ignoring malformed repositioning data");
            None
        }
    }
}

fn build_model(source: &SourceConfig) -> Result<Arc<dyn ParseModel>, ModelError> {
    let Some(pattern) = &source.pattern else {
        return Ok(Arc::new(PassthroughModel));
    };
    let mut model = RegexModel::new(pattern)?;
    if let Some(group) = &source.timestamp_group {
        let format = source.timestamp_format.as_deref().unwrap_or("iso8601");
        model = model.with_timestamp(group, format)?;
    }
    Ok(Arc::new(model))
}

struct StreamWorker {
    stream: LogStream,
    url: ResourceUrl,
    chunk_size: usize,
    poll_interval: Duration,
    state_dir: Option<PathBuf>,
    inode: Option<u64>,
}

impl StreamWorker {
    fn build(
        source: &SourceConfig,
        config: &Config,
        tx: mpsc::UnboundedSender<LogAtom>,
    ) -> Result<Self, PipelineError> {
        let url = ResourceUrl::parse(&source.url)?;
        let model = build_model(source)?;

        let mode = if source.json_format {
            BoundaryMode::Json
        } else if source.xml_format {
            warn!(
                url = %url,
                "xml_format configured with the built-in regex model, which \
                 cannot delegate boundary detection"
            );
            BoundaryMode::Xml
        } else {
            BoundaryMode::Line
        };

        let atomizer =
            ByteStreamAtomizer::builder(SourceId::from(source.url.as_str()), source.max_record_length)
                .mode(mode)
                .eol_separator(source.eol_separator.as_bytes().to_vec())
                .use_real_time(source.use_real_time)
                .timestamp_paths(source.effective_timestamp_paths())
                .continuous_timestamp_missing_warning(source.continuous_timestamp_missing_warning)
                .atom_handler(Box::new(ChannelHandler { tx }))
                .event_handler(Box::new(TracingEventLog))
                .build(model)?;

        let resource: Box<dyn LogResource> = match url.scheme() {
            Scheme::File => {
                let saved = config
                    .state_dir
                    .as_deref()
                    .and_then(|dir| load_state(dir, &url));
                Box::new(FileResource::with_repositioning(
                    url.clone(),
                    config.chunk_size,
                    saved,
                )?)
            }
            Scheme::Unix => {
                Box::new(UnixSocketResource::new(url.clone(), config.chunk_size)?)
            }
        };

        let stream = LogStream::new(resource, atomizer)?;
        info!(url = %url, "opened source");
        let inode = path_inode(url.path());
        Ok(Self {
            stream,
            url,
            chunk_size: config.chunk_size,
            poll_interval: config.poll_interval,
            state_dir: config.state_dir.clone(),
            inode,
        })
    }

    async fn run(mut self, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                break;
            }
            match self.stream.handle_stream() {
                Ok(0) => {
                    self.persist();
                    self.check_rotation();
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
                Ok(_) => {}
                Err(StreamError::Resource(ResourceError::Io(ref e)))
                    if e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
                Err(StreamError::NoCurrentResource) => {
                    if self.url.scheme() == Scheme::File {
                        warn!(url = %self.url, "no current resource, reopening");
                        self.reacquire();
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = sleep(self.poll_interval) => {}
                        }
                    } else {
                        debug!(url = %self.url, "stream exhausted");
                        break;
                    }
                }
                Err(e) => {
                    error!(url = %self.url, error = %e, "stream error, retrying");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        // keep the unconsumed tail out of the persisted position so the
        // next start resumes exactly where parsing stopped
        self.persist();
    }

    /// On EOF, check whether the path now points at a different file and
    /// roll over to it.
    fn check_rotation(&mut self) {
        if self.url.scheme() != Scheme::File {
            return;
        }
        let Some(current) = path_inode(self.url.path()) else {
            // file vanished; it may reappear after rotation completes
            return;
        };
        if self.inode == Some(current) {
            return;
        }
        info!(url = %self.url, inode = current, "log rotation detected");
        self.reacquire();
    }

    /// Queue a fresh resource for the url and roll over to it. A failure
    /// leaves the stream without a current resource; the run loop calls
    /// back in here on the next poll, so the source is not lost.
    fn reacquire(&mut self) {
        match FileResource::new(self.url.clone(), self.chunk_size) {
            Ok(next) => {
                self.stream.add_next_resource(Box::new(next));
                match self.stream.roll_over() {
                    Ok(()) => self.inode = path_inode(self.url.path()),
                    Err(e) => {
                        error!(url = %self.url, error = %e, "rollover failed, will retry")
                    }
                }
            }
            Err(e) => error!(url = %self.url, error = %e, "cannot reopen source, will retry"),
        }
    }

    fn persist(&self) {
        let Some(dir) = &self.state_dir else { return };
        let Some(data) = self.stream.repositioning_data() else {
            return;
        };
        let path = state_path(dir, &self.url);
        let write = std::fs::create_dir_all(dir).and_then(|()| {
            let raw = serde_json::to_vec(&data)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            std::fs::write(&path, raw)
        });
        if let Err(e) = write {
            warn!(url = %self.url, error = %e, "failed to persist repositioning data");
        }
    }
}
