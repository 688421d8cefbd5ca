use super::{LogResource, RepositioningData, ResourceError, ResourceUrl, Scheme};
use std::io::Read;
use std::os::unix::net::UnixStream;
use tracing::info;

/// A connected unix domain socket as a log resource.
///
/// Sockets have no stable identity across connections, so no repositioning
/// data is produced; a restart always starts from the live stream. Reads
/// are non-blocking and surface `WouldBlock` for the caller to treat as a
/// transient no-data condition.
pub struct UnixSocketResource {
    url: ResourceUrl,
    chunk_size: usize,
    stream: Option<UnixStream>,
    buffer: Vec<u8>,
    consumed: u64,
}

impl UnixSocketResource {
    pub fn new(url: ResourceUrl, chunk_size: usize) -> Result<Self, ResourceError> {
        url.expect_scheme(Scheme::Unix)?;
        if chunk_size == 0 {
            return Err(ResourceError::ZeroChunkSize);
        }
        Ok(Self {
            url,
            chunk_size,
            stream: None,
            buffer: Vec::new(),
            consumed: 0,
        })
    }

    /// Wrap an already-connected stream, as handed over by an accept loop.
    pub fn from_stream(
        url: ResourceUrl,
        stream: UnixStream,
        chunk_size: usize,
    ) -> Result<Self, ResourceError> {
        let mut resource = Self::new(url, chunk_size)?;
        stream.set_nonblocking(true)?;
        resource.stream = Some(stream);
        Ok(resource)
    }
}

impl LogResource for UnixSocketResource {
    fn url(&self) -> &ResourceUrl {
        &self.url
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn open(&mut self, reopen: bool) -> Result<bool, ResourceError> {
        if self.stream.is_some() && !reopen {
            return Err(ResourceError::AlreadyOpen(self.url.as_str().to_string()));
        }
        let stream = UnixStream::connect(self.url.path())?;
        stream.set_nonblocking(true)?;
        if self.stream.replace(stream).is_some() {
            info!(url = %self.url, "reconnected socket");
        }
        self.consumed = 0;
        // a new connection is always a new data source
        Ok(true)
    }

    fn fill_buffer(&mut self) -> Result<usize, ResourceError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ResourceError::NotOpen(self.url.as_str().to_string()))?;
        let mut chunk = vec![0u8; self.chunk_size];
        let n = stream.read(&mut chunk)?;
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
        self.consumed += length as u64;
        self.buffer.drain(..length);
        Ok(())
    }

    fn repositioning_data(&self) -> Option<RepositioningData> {
        None
    }

    fn close(&mut self) -> Result<(), ResourceError> {
        if self.stream.take().is_none() {
            return Err(ResourceError::NotOpen(self.url.as_str().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pair_resource() -> (UnixSocketResource, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let url = ResourceUrl::parse("unix:///run/test.sock").unwrap();
        let resource = UnixSocketResource::from_stream(url, ours, 64).unwrap();
        (resource, theirs)
    }

    #[test]
    fn test_read_from_connected_stream() {
        let (mut res, mut peer) = pair_resource();
        peer.write_all(b"hello over socket\n").unwrap();

        assert_eq!(res.fill_buffer().unwrap(), 18);
        assert_eq!(res.buffer(), b"hello over socket\n");
        res.update_position(18).unwrap();
        assert_eq!(res.consumed_length(), 18);
    }

    #[test]
    fn test_would_block_when_no_data() {
        let (mut res, _peer) = pair_resource();
        match res.fill_buffer() {
            Err(ResourceError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::WouldBlock)
            }
            other => panic!("expected WouldBlock, got {other:?}"),
        }
    }

    #[test]
    fn test_peer_close_is_end_of_data() {
        let (mut res, peer) = pair_resource();
        drop(peer);
        assert_eq!(res.fill_buffer().unwrap(), 0);
    }

    #[test]
    fn test_no_repositioning_data() {
        let (res, _peer) = pair_resource();
        assert!(res.repositioning_data().is_none());
    }

    #[test]
    fn test_file_url_rejected() {
        let url = ResourceUrl::parse("file:///var/log/syslog").unwrap();
        assert!(UnixSocketResource::new(url, 64).is_err());
    }
}
