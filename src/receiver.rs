//! Asynchronous ingestion: one task per byte source, committing raw chunks
//! into a data buffer.
//!
//! A [`Receiver`] owns its [`ChunkSource`] and target [`DataBuffer`] and
//! communicates with the rest of the system exclusively through the buffer's
//! acquire/commit protocol; no other state crosses the task boundary. When no
//! writable slot is available the chunk is dropped and counted rather than
//! stalling the ingestion path: the pipeline side falling behind is an
//! explicit, logged data-loss policy.

use crate::buffer::DataBuffer;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A framed byte source. Implementations own the source's framing: they
/// report the next chunk's length, then fill a caller-provided region of
/// exactly that length.
#[async_trait]
pub trait ChunkSource: Send {
    /// Waits for the next chunk and returns its byte length, or `Ok(None)` on
    /// a clean end of stream.
    async fn next_chunk_len(&mut self) -> std::io::Result<Option<usize>>;

    /// Fills `buf` with the chunk announced by the last `next_chunk_len`.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<()>;
}

/// Chunk source over a TCP stream with u32 little-endian length-prefix
/// framing.
pub struct TcpChunkSource {
    stream: TcpStream,
}

impl TcpChunkSource {
    /// Connects to an instrument stream at `addr` (`host:port`).
    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream })
    }

    /// Wraps an already-connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl ChunkSource for TcpChunkSource {
    async fn next_chunk_len(&mut self) -> std::io::Result<Option<usize>> {
        match self.stream.read_u32_le().await {
            Ok(len) => Ok(Some(len as usize)),
            // EOF on the length prefix is a clean close.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.stream.read_exact(buf).await.map(|_| ())
    }
}

/// Why a receiver task ended.
#[derive(Debug)]
pub enum ReceiverStatus {
    /// Cooperative stop was requested.
    Stopped,
    /// The source reported a clean end of stream.
    SourceClosed,
    /// A fatal source error.
    Failed(std::io::Error),
}

/// Terminal report of a receiver task.
#[derive(Debug)]
pub struct ReceiverReport {
    /// How the task ended.
    pub status: ReceiverStatus,
    /// Chunks committed into the buffer.
    pub committed: u64,
    /// Chunks dropped because no writable slot was available.
    pub dropped: u64,
}

/// Ingestion task binding one chunk source to one data buffer.
pub struct Receiver {
    buffer: Arc<DataBuffer>,
    source: Box<dyn ChunkSource>,
}

/// Control handle for a spawned receiver.
pub struct ReceiverHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<ReceiverReport>,
}

impl ReceiverHandle {
    /// Requests a cooperative stop. An in-flight chunk finishes first.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Waits for the task to end and returns its report.
    pub async fn join(self) -> ReceiverReport {
        match self.join.await {
            Ok(report) => report,
            Err(e) => ReceiverReport {
                status: ReceiverStatus::Failed(std::io::Error::other(e)),
                committed: 0,
                dropped: 0,
            },
        }
    }
}

impl Receiver {
    /// Creates a receiver ingesting from `source` into `buffer`.
    pub fn new(buffer: Arc<DataBuffer>, source: Box<dyn ChunkSource>) -> Self {
        Self { buffer, source }
    }

    /// Spawns the ingestion task and returns its control handle.
    pub fn spawn(self) -> ReceiverHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(stop_rx));
        ReceiverHandle {
            stop: stop_tx,
            join,
        }
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) -> ReceiverReport {
        let mut committed = 0u64;
        let mut dropped = 0u64;
        // Scratch region for draining dropped chunks, allocated once.
        let mut scratch = vec![0u8; self.buffer.slot_capacity()];

        let status = loop {
            let framing = tokio::select! {
                // A closed sender counts as a stop request.
                _ = stop.changed() => break ReceiverStatus::Stopped,
                result = self.source.next_chunk_len() => result,
            };

            let len = match framing {
                Ok(Some(len)) => len,
                Ok(None) => break ReceiverStatus::SourceClosed,
                Err(e) if is_transient(&e) => {
                    debug!(buffer = self.buffer.name(), error = %e, "Transient read error, retrying");
                    continue;
                }
                Err(e) => break ReceiverStatus::Failed(e),
            };

            // A declared length beyond the slot capacity can never be
            // committed; a desynced or corrupt source is a framing failure,
            // not contention.
            if len > self.buffer.slot_capacity() {
                break ReceiverStatus::Failed(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "declared chunk of {len} bytes exceeds slot capacity {}",
                        self.buffer.slot_capacity()
                    ),
                ));
            }

            // The in-flight chunk finishes before any stop takes effect.
            match self.buffer.acquire_writable(len) {
                Some(mut handle) => {
                    if let Err(e) = self.source.read_chunk(handle.bytes_mut()).await {
                        handle.abort();
                        break ReceiverStatus::Failed(e);
                    }
                    handle.commit();
                    committed += 1;
                }
                None => {
                    // No writable slot: drain the chunk to keep the stream
                    // framed, then drop it. The capacity check above bounds
                    // `len` to the scratch region.
                    if let Err(e) = self.source.read_chunk(&mut scratch[..len]).await {
                        break ReceiverStatus::Failed(e);
                    }
                    dropped += 1;
                    warn!(
                        buffer = self.buffer.name(),
                        chunk_len = len,
                        dropped,
                        "No writable slot available; chunk dropped"
                    );
                }
            }
        };

        info!(
            buffer = self.buffer.name(),
            committed,
            dropped,
            status = ?status,
            "Receiver finished"
        );
        ReceiverReport {
            status,
            committed,
            dropped,
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}
