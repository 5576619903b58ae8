//! # Transport Pipes
//!
//! A [`TransportPipe`] is the read end of one client's byte stream. Once
//! handed to the manager it is started on the shared I/O runtime and pushes
//! every chunk it reads, in order, into a [`PipeSink`], then reports exactly
//! one close.
//!
//! ```text
//! socket ──read──▶ tokio task ──PipeSink──▶ worker inbox (crossbeam)
//! ```
//!
//! Two implementations ship here:
//!
//! - [`StreamPipe`]: any `AsyncRead` (Unix sockets in the daemon)
//! - [`MemoryPipe`]: in-process chunks, fed by a [`PipeWriter`]

use std::io;

use crossbeam_channel::Sender;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::worker::WorkerMessage;
use crate::domain::Pid;

/// Default read size for [`StreamPipe`]
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// Read end of a client stream
pub trait TransportPipe: Send + 'static {
    /// Start delivering bytes to `sink` on the I/O runtime.
    ///
    /// Aborting the returned task disconnects the pipe.
    fn start_reading(self: Box<Self>, io: &Handle, sink: PipeSink) -> JoinHandle<()>;
}

/// Destination of one pipe's bytes
pub struct PipeSink {
    pid: Pid,
    inbox: Sender<WorkerMessage>,
}

impl PipeSink {
    pub(crate) fn new(pid: Pid, inbox: Sender<WorkerMessage>) -> Self {
        Self { pid, inbox }
    }

    /// Forward a chunk. Returns false once nobody is listening; the pipe
    /// should stop reading.
    pub fn on_bytes(&self, chunk: Vec<u8>) -> bool {
        if chunk.is_empty() {
            return true;
        }
        self.inbox.send(WorkerMessage::Bytes(chunk)).is_ok()
    }

    /// End of stream, clean (`None`) or not
    pub fn on_closed(self, error: Option<io::Error>) {
        match &error {
            Some(e) => debug!("{}: transport error: {e}", self.pid),
            None => debug!("{}: transport closed", self.pid),
        }
        let _ = self.inbox.send(WorkerMessage::Closed(error.map(|e| e.to_string())));
    }
}

// ============================================================================
// Stream transport
// ============================================================================

/// Pipe over any async byte stream
pub struct StreamPipe<R> {
    reader: R,
    chunk_size: usize,
}

impl<R> StreamPipe<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, DEFAULT_READ_CHUNK)
    }

    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        Self { reader, chunk_size: chunk_size.max(1) }
    }
}

impl<R> TransportPipe for StreamPipe<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn start_reading(self: Box<Self>, io: &Handle, sink: PipeSink) -> JoinHandle<()> {
        let StreamPipe { mut reader, chunk_size } = *self;

        io.spawn(async move {
            let mut buf = vec![0u8; chunk_size];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        sink.on_closed(None);
                        return;
                    }
                    Ok(n) => {
                        if !sink.on_bytes(buf[..n].to_vec()) {
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        sink.on_closed(Some(e));
                        return;
                    }
                }
            }
        })
    }
}

// ============================================================================
// In-memory transport
// ============================================================================

enum PipeEvent {
    Bytes(Vec<u8>),
    Fail(String),
}

/// Pipe fed from inside the process
pub struct MemoryPipe {
    rx: mpsc::UnboundedReceiver<PipeEvent>,
}

/// Write end of a [`MemoryPipe`]. Dropping it closes the pipe cleanly.
pub struct PipeWriter {
    tx: mpsc::UnboundedSender<PipeEvent>,
}

impl MemoryPipe {
    /// Connected writer/pipe pair
    #[must_use]
    pub fn channel() -> (PipeWriter, MemoryPipe) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PipeWriter { tx }, MemoryPipe { rx })
    }

    /// Pipe that delivers `chunks` in order, then closes
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let (writer, pipe) = Self::channel();
        for chunk in chunks {
            writer.write(chunk);
        }
        pipe
    }
}

impl PipeWriter {
    /// Queue a chunk. Returns false once the reading side is gone.
    pub fn write(&self, chunk: impl Into<Vec<u8>>) -> bool {
        self.tx.send(PipeEvent::Bytes(chunk.into())).is_ok()
    }

    /// Close cleanly after everything written so far
    pub fn close(self) {}

    /// Close with a transport error after everything written so far
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send(PipeEvent::Fail(reason.into()));
    }
}

impl TransportPipe for MemoryPipe {
    fn start_reading(self: Box<Self>, io: &Handle, sink: PipeSink) -> JoinHandle<()> {
        let MemoryPipe { mut rx } = *self;

        io.spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    PipeEvent::Bytes(chunk) => {
                        if !sink.on_bytes(chunk) {
                            return;
                        }
                    }
                    PipeEvent::Fail(reason) => {
                        sink.on_closed(Some(io::Error::other(reason)));
                        return;
                    }
                }
            }
            sink.on_closed(None);
        })
    }
}
