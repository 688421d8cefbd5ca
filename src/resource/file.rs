use super::{
    LogResource, RepositioningData, ResourceError, ResourceUrl, Scheme,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{info, warn};

#[cfg(unix)]
fn get_inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn get_inode(_metadata: &std::fs::Metadata) -> u64 {
    0
}

fn stat_inode(path: &Path) -> Result<u64, ResourceError> {
    Ok(get_inode(&std::fs::metadata(path)?))
}

/// A plain file as a log resource.
///
/// Consumed bytes are hashed incrementally; the inode, the consumed length
/// and the hash together form the repositioning data that lets a restarted
/// process resume mid-file without replaying records. On open with pending
/// repositioning data the file's leading bytes are re-read and re-hashed;
/// any disagreement falls back to reading from the start.
pub struct FileResource {
    url: ResourceUrl,
    chunk_size: usize,
    file: Option<File>,
    inode: Option<u64>,
    buffer: Vec<u8>,
    consumed: u64,
    hasher: Sha256,
    pending: Option<RepositioningData>,
}

impl FileResource {
    pub fn new(url: ResourceUrl, chunk_size: usize) -> Result<Self, ResourceError> {
        Self::with_repositioning(url, chunk_size, None)
    }

    /// Construct with resume state from a previous run. The data is only
    /// trusted after verification on `open`.
    pub fn with_repositioning(
        url: ResourceUrl,
        chunk_size: usize,
        repositioning: Option<RepositioningData>,
    ) -> Result<Self, ResourceError> {
        url.expect_scheme(Scheme::File)?;
        if chunk_size == 0 {
            return Err(ResourceError::ZeroChunkSize);
        }
        Ok(Self {
            url,
            chunk_size,
            file: None,
            inode: None,
            buffer: Vec::new(),
            consumed: 0,
            hasher: Sha256::new(),
            pending: repositioning,
        })
    }

    pub fn inode(&self) -> Option<u64> {
        self.inode
    }

    /// Re-read and hash the first `expected.consumed_length` bytes of the
    /// freshly opened file. On agreement the read position already sits at
    /// the resume point; on disagreement rewind to the start.
    fn verify_resume(
        &mut self,
        file: &mut File,
        inode: u64,
        expected: RepositioningData,
    ) -> Result<(), ResourceError> {
        if expected.inode != inode {
            warn!(
                url = %self.url,
                expected = expected.inode,
                actual = inode,
                "inode changed since last run, reading from start"
            );
            return Ok(());
        }

        let mut prefix = Vec::with_capacity(expected.consumed_length as usize);
        (&mut *file)
            .take(expected.consumed_length)
            .read_to_end(&mut prefix)?;

        let mut hasher = Sha256::new();
        hasher.update(&prefix);
        let hash = BASE64.encode(hasher.clone().finalize());

        if prefix.len() as u64 == expected.consumed_length && hash == expected.content_hash {
            info!(
                url = %self.url,
                consumed = expected.consumed_length,
                "resuming at saved position"
            );
            self.consumed = expected.consumed_length;
            self.hasher = hasher;
        } else {
            warn!(
                url = %self.url,
                "saved position does not match file content, reading from start"
            );
            file.seek(SeekFrom::Start(0))?;
        }
        Ok(())
    }
}

impl LogResource for FileResource {
    fn url(&self) -> &ResourceUrl {
        &self.url
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn open(&mut self, reopen: bool) -> Result<bool, ResourceError> {
        if self.file.is_some() {
            if !reopen {
                return Err(ResourceError::AlreadyOpen(self.url.as_str().to_string()));
            }
            // Re-resolve the path; if the inode is unchanged the current
            // handle already points at the right file.
            let current = stat_inode(self.url.path())?;
            if Some(current) == self.inode {
                return Ok(false);
            }
            info!(url = %self.url, inode = current, "file was replaced, opening new handle");
            self.file = Some(File::open(self.url.path())?);
            self.inode = Some(current);
            self.buffer.clear();
            self.consumed = 0;
            self.hasher = Sha256::new();
            return Ok(true);
        }

        let mut file = File::open(self.url.path())?;
        let inode = get_inode(&file.metadata()?);

        self.consumed = 0;
        self.hasher = Sha256::new();
        if let Some(expected) = self.pending.take() {
            self.verify_resume(&mut file, inode, expected)?;
        }

        self.file = Some(file);
        self.inode = Some(inode);
        Ok(true)
    }

    fn fill_buffer(&mut self) -> Result<usize, ResourceError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ResourceError::NotOpen(self.url.as_str().to_string()))?;
        let mut chunk = vec![0u8; self.chunk_size];
        let n = file.read(&mut chunk)?;
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    fn consumed_length(&self) -> u64 {
        self.consumed
    }

    fn update_position(&mut self, length: usize) -> Result<(), ResourceError> {
        if length > self.buffer.len() {
            return Err(ResourceError::CommitBeyondBuffer {
                requested: length,
                available: self.buffer.len(),
            });
        }
        self.hasher.update(&self.buffer[..length]);
        self.consumed += length as u64;
        self.buffer.drain(..length);
        Ok(())
    }

    fn repositioning_data(&self) -> Option<RepositioningData> {
        let inode = self.inode?;
        Some(RepositioningData {
            inode,
            consumed_length: self.consumed,
            content_hash: BASE64.encode(self.hasher.clone().finalize()),
        })
    }

    fn close(&mut self) -> Result<(), ResourceError> {
        if self.file.take().is_none() {
            return Err(ResourceError::NotOpen(self.url.as_str().to_string()));
        }
        Ok(())
    }
}
