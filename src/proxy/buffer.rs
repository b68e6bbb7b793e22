//! Bounded replay buffer for client input received while no worker can take it.

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Default number of chunks retained during a restart.
pub const DEFAULT_BUFFER_CAPACITY: usize = 100;

const PREALLOCATED_CHUNKS: usize = 128;

/// A replay stopped on a failed write or flush.
///
/// Chunks written before the failure are gone from the buffer; the failed
/// chunk and everything after it are still buffered in arrival order.
#[derive(thiserror::Error, Debug)]
#[error("Replay failed after {written} of {pending} chunks: {source}")]
pub struct ReplayError {
    /// Chunks successfully written before the failure.
    pub written: usize,
    /// Chunks buffered when the replay started.
    pub pending: usize,
    /// The underlying write error.
    #[source]
    pub source: io::Error,
}

impl ReplayError {
    /// The sink was unavailable before anything could be written.
    #[must_use]
    pub fn sink_closed(pending: usize) -> Self {
        Self {
            written: 0,
            pending,
            source: io::Error::new(io::ErrorKind::BrokenPipe, "replay sink closed"),
        }
    }
}

#[derive(Debug, Default)]
struct Chunks {
    queue: VecDeque<Vec<u8>>,
    dropped: u64,
}

/// Thread-safe FIFO of pending input chunks with drop-oldest overflow.
///
/// All operations share one lock, so a replay is never interleaved with an
/// insertion and no chunk is replayed twice.
#[derive(Debug)]
pub struct ReplayBuffer {
    chunks: Mutex<Chunks>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Create a buffer holding at most `capacity` chunks.
    ///
    /// A capacity of zero retains nothing.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: Mutex::new(Chunks {
                queue: VecDeque::with_capacity(capacity.min(PREALLOCATED_CHUNKS)),
                dropped: 0,
            }),
            capacity,
        }
    }

    /// Maximum number of chunks retained.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a copy of `chunk`, evicting the oldest chunk when full.
    pub async fn add(&self, chunk: &[u8]) {
        let mut chunks = self.chunks.lock().await;

        if self.capacity == 0 {
            chunks.dropped = chunks.dropped.saturating_add(1);
            return;
        }

        if chunks.queue.len() >= self.capacity {
            chunks.queue.pop_front();
            chunks.dropped = chunks.dropped.saturating_add(1);
            tracing::warn!(
                capacity = self.capacity,
                "Replay buffer full, dropped oldest chunk"
            );
        }

        chunks.queue.push_back(chunk.to_vec());
    }

    /// Write every buffered chunk to `sink` in arrival order, then flush.
    ///
    /// Each chunk is removed once its write succeeds. Returns the number of
    /// chunks written.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError` on the first failed write or flush; unwritten
    /// chunks stay buffered.
    pub async fn replay<W>(&self, sink: &mut W) -> Result<usize, ReplayError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut chunks = self.chunks.lock().await;
        let pending = chunks.queue.len();
        let mut written = 0;

        while let Some(chunk) = chunks.queue.front() {
            if let Err(source) = sink.write_all(chunk).await {
                return Err(ReplayError {
                    written,
                    pending,
                    source,
                });
            }
            chunks.queue.pop_front();
            written += 1;
        }

        sink.flush().await.map_err(|source| ReplayError {
            written,
            pending,
            source,
        })?;

        Ok(written)
    }

    /// Current number of buffered chunks.
    pub async fn len(&self) -> usize {
        self.chunks.lock().await.queue.len()
    }

    /// Check whether the buffer holds no chunks.
    pub async fn is_empty(&self) -> bool {
        self.chunks.lock().await.queue.is_empty()
    }

    /// Total chunks evicted (or refused, at capacity zero) so far.
    pub async fn dropped(&self) -> u64 {
        self.chunks.lock().await.dropped
    }

    /// Drop all buffered chunks.
    pub async fn clear(&self) {
        self.chunks.lock().await.queue.clear();
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
