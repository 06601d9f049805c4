/// Output stream watchers: drain a pipe chunk by chunk, keep every byte, and
/// report each chunk as activity.
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::idle::ActivityClock;

const READ_CHUNK_SIZE: usize = 8192;

/// Which output stream a watcher is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Drains one output stream into its own buffer.
///
/// The buffer has a single writer (this watcher) and is only read back once
/// the watcher is done, through [`ActivityWatcher::into_output`].
pub struct ActivityWatcher<R> {
    kind: StreamKind,
    reader: Option<R>,
    data: Vec<u8>,
    chunk: Box<[u8]>,
    clock: ActivityClock,
}

impl<R: AsyncRead + Unpin> ActivityWatcher<R> {
    pub fn new(kind: StreamKind, reader: R, clock: ActivityClock) -> Self {
        Self {
            kind,
            reader: Some(reader),
            data: Vec::new(),
            chunk: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            clock,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_attached(&self) -> bool {
        self.reader.is_some()
    }

    /// Bytes captured so far, in arrival order.
    pub fn captured(&self) -> &[u8] {
        &self.data
    }

    /// Wait for the next chunk and append it.
    ///
    /// Returns the number of bytes read; `0` means end-of-stream (or a read
    /// error) and the watcher has detached itself. Safe to cancel: a chunk is
    /// either fully appended or not read at all.
    pub async fn pump(&mut self) -> usize {
        let Some(reader) = self.reader.as_mut() else {
            return 0;
        };
        match reader.read(&mut self.chunk).await {
            Ok(0) => {
                tracing::debug!(stream = %self.kind, bytes = self.data.len(), "end of stream");
                self.detach();
                0
            }
            Ok(n) => {
                self.data.extend_from_slice(&self.chunk[..n]);
                self.clock.touch();
                n
            }
            Err(e) => {
                tracing::warn!(stream = %self.kind, error = %e, "read failed, detaching watcher");
                self.detach();
                0
            }
        }
    }

    /// Stop reading. Already captured bytes are kept.
    pub fn detach(&mut self) {
        self.reader = None;
    }

    pub fn into_output(self) -> Vec<u8> {
        self.data
    }
}
