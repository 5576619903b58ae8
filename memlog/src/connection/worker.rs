//! # Connection Worker
//!
//! One OS thread per connection. The worker owns the connection's
//! [`StreamParser`] and [`AllocationTracker`] and is the only code that ever
//! touches them, so the tracker needs no locking.
//!
//! Everything the worker does arrives through a single inbox, which gives
//! dump requests their ordering: a manager-issued dump sits in the inbox
//! after every chunk received before it and before every chunk received
//! after it.
//!
//! ```text
//!   reader task ──Bytes/Closed──┐
//!                               ├──▶ inbox ──▶ parser ──▶ tracker
//!   manager ──Dump/DumpAtBarrier┘                           │
//!                                                           ▼
//!                                    manager queue ◀── DumpReply / completion
//! ```

use std::io;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use log::{debug, warn};

use super::handle::{DumpReply, ManagerHandle};
use crate::domain::{BarrierId, Pid};
use crate::protocol::{ParserLimits, StreamParser};
use crate::tracker::AllocationTracker;

/// Everything a worker can be asked to do
pub(crate) enum WorkerMessage {
    /// Next chunk of the client stream
    Bytes(Vec<u8>),
    /// Stream ended; `Some` carries the transport error
    Closed(Option<String>),
    /// Snapshot at this inbox position
    Dump { id: BarrierId, reply: DumpReply },
    /// Snapshot when the client's own stream reaches `id`
    DumpAtBarrier { id: BarrierId, reply: DumpReply },
    Shutdown,
}

enum Flow {
    Continue,
    Stop,
}

/// Parser and tracker for one connection
pub(crate) struct ConnectionWorker {
    pid: Pid,
    parser: StreamParser,
    tracker: AllocationTracker,
    manager: ManagerHandle,
    chunks_received: u64,
}

impl ConnectionWorker {
    pub(crate) fn new(pid: Pid, limits: ParserLimits, manager: ManagerHandle) -> Self {
        Self {
            pid,
            parser: StreamParser::new(limits),
            tracker: AllocationTracker::new(pid),
            manager,
            chunks_received: 0,
        }
    }

    /// Run on a dedicated thread until the stream ends or shutdown
    pub(crate) fn spawn(self, inbox: Receiver<WorkerMessage>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("memlog-worker-{}", self.pid.0))
            .spawn(move || self.run(&inbox))
    }

    fn run(mut self, inbox: &Receiver<WorkerMessage>) {
        debug!("{}: worker started", self.pid);

        for message in inbox {
            if let Flow::Stop = self.process_message(message) {
                break;
            }
        }

        // Requests that raced the end of the stream get the final answer
        for message in inbox.try_iter() {
            match message {
                WorkerMessage::Dump { id, reply } => self.tracker.fence(id, reply.into_callback()),
                WorkerMessage::DumpAtBarrier { id, reply } => {
                    self.tracker.snapshot_on_barrier(id, reply.into_callback());
                }
                WorkerMessage::Bytes(_) | WorkerMessage::Closed(_) | WorkerMessage::Shutdown => {}
            }
        }

        debug!(
            "{}: worker exiting after {} chunk(s), {} record(s)",
            self.pid,
            self.chunks_received,
            self.parser.records_decoded()
        );
    }

    fn process_message(&mut self, message: WorkerMessage) -> Flow {
        match message {
            WorkerMessage::Bytes(chunk) => {
                self.chunks_received += 1;
                match self.parser.push(&chunk, &mut self.tracker) {
                    Ok(_) => Flow::Continue,
                    Err(err) => {
                        warn!("{}: dropping connection: {err}", self.pid);
                        self.tracker.mark_failed(err.to_string());
                        self.finish();
                        Flow::Stop
                    }
                }
            }
            WorkerMessage::Closed(error) => {
                let pid = self.pid;
                self.manager.post(move |manager| manager.on_connection_draining(pid));

                if let Some(reason) = error {
                    warn!("{}: transport error: {reason}", self.pid);
                    self.tracker.mark_failed(format!("transport error: {reason}"));
                } else if let Err(err) = self.parser.finish() {
                    warn!("{}: {err}", self.pid);
                    self.tracker.mark_failed(err.to_string());
                }
                self.finish();
                Flow::Stop
            }
            WorkerMessage::Dump { id, reply } => {
                self.tracker.fence(id, reply.into_callback());
                Flow::Continue
            }
            WorkerMessage::DumpAtBarrier { id, reply } => {
                self.tracker.snapshot_on_barrier(id, reply.into_callback());
                Flow::Continue
            }
            WorkerMessage::Shutdown => {
                debug!("{}: shutdown requested", self.pid);
                Flow::Stop
            }
        }
    }

    /// Deliver the final state to the manager and stop accepting input
    fn finish(&mut self) {
        let pid = self.pid;
        let stats = self.tracker.stats();
        let manager = self.manager.clone();

        self.tracker.complete(Box::new(move |outcome| {
            manager.post(move |m| m.on_connection_complete(pid, outcome, stats));
        }));
        self.tracker.on_stream_closed();
    }
}
