//! # Connection Manager
//!
//! Registry of live client connections, one per process id.
//!
//! The manager is single-threaded: it lives on the thread that created it
//! and every public method, as well as every task posted through a
//! [`ManagerHandle`], runs there. Workers and reader tasks never touch the
//! registry directly; they post tasks instead.
//!
//! ## Lifecycle
//!
//! ```text
//! on_new_connection ──▶ ACTIVE ──stream closed──▶ DRAINING ──▶ COMPLETE (removed)
//!                          │                                       ▲
//!                          └───────────protocol error──────────────┘
//! ```
//!
//! ## Dumps
//!
//! Every dump callback runs on the manager thread, exactly once:
//!
//! - [`ConnectionManager::dump_process`] fences the worker's inbox with a
//!   manager-allocated barrier id, so the snapshot includes every record
//!   received before the request.
//! - [`ConnectionManager::dump_process_at_barrier`] waits for a barrier the
//!   client writes into its own stream.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use tokio::runtime::Handle;

use super::handle::{DumpReply, ManagerHandle, ManagerMessage};
use super::transport::{PipeSink, TransportPipe};
use super::worker::{ConnectionWorker, WorkerMessage};
use crate::domain::{BarrierId, ByteSize, DumpError, ManagerError, Pid};
use crate::protocol::ParserLimits;
use crate::tracker::{DumpResult, SnapshotCallback, TrackerStats};

/// Completed pids remembered for [`ConnectionManager::connection_state`],
/// oldest evicted first
const COMPLETED_HISTORY: usize = 1024;

/// Manager construction options
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerConfig {
    /// Decoder limits applied to every connection
    pub limits: ParserLimits,
}

/// Externally visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    /// Stream ended, final snapshot in flight
    Draining,
    /// Removed from the registry
    Complete,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Draining => write!(f, "draining"),
            ConnectionState::Complete => write!(f, "complete"),
        }
    }
}

/// Final report for a connection that reached COMPLETE
#[derive(Debug)]
pub struct CompletionReport {
    pub pid: Pid,
    /// Final snapshot, or why tracking failed
    pub outcome: DumpResult,
    pub stats: TrackerStats,
    pub duration: Duration,
}

type CompletionHandler = Box<dyn FnMut(CompletionReport)>;

struct Connection {
    inbox: Sender<WorkerMessage>,
    worker: Option<thread::JoinHandle<()>>,
    reader: tokio::task::JoinHandle<()>,
    state: ConnectionState,
    connected_at: Instant,
}

impl Connection {
    fn disconnect(&mut self) {
        self.reader.abort();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
    }
}

/// Owns every live connection and runs the manager task queue
pub struct ConnectionManager {
    io: Handle,
    config: ManagerConfig,
    connections: HashMap<Pid, Connection>,
    completed: VecDeque<Pid>,

    tasks_tx: Sender<ManagerMessage>,
    tasks_rx: Receiver<ManagerMessage>,
    quit_requested: bool,

    next_barrier: u32,
    completion_handler: Option<CompletionHandler>,
}

impl ConnectionManager {
    /// Create a manager whose transports read on `io`
    #[must_use]
    pub fn new(io: Handle, config: ManagerConfig) -> Self {
        let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded();
        Self {
            io,
            config,
            connections: HashMap::new(),
            completed: VecDeque::new(),
            tasks_tx,
            tasks_rx,
            quit_requested: false,
            next_barrier: BarrierId::MANAGER_RANGE_START,
            completion_handler: None,
        }
    }

    /// Handle for posting work to this manager from any thread
    #[must_use]
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle::new(self.tasks_tx.clone())
    }

    /// Called with the final report of every connection that completes
    pub fn set_completion_handler(&mut self, handler: impl FnMut(CompletionReport) + 'static) {
        self.completion_handler = Some(Box::new(handler));
    }

    // ========================================================================
    // Connection registry
    // ========================================================================

    /// Take ownership of a client connection and start tracking it
    pub fn on_new_connection(
        &mut self,
        pid: Pid,
        transport: Box<dyn TransportPipe>,
    ) -> Result<(), ManagerError> {
        if self.connections.contains_key(&pid) {
            warn!("Rejecting second connection for {pid}");
            return Err(ManagerError::DuplicateProcess(pid));
        }

        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        let worker = ConnectionWorker::new(pid, self.config.limits, self.handle())
            .spawn(inbox_rx)
            .map_err(|e| ManagerError::WorkerSpawnFailed { pid, reason: e.to_string() })?;
        let reader = transport.start_reading(&self.io, PipeSink::new(pid, inbox_tx.clone()));

        self.completed.retain(|&done| done != pid);
        self.connections.insert(
            pid,
            Connection {
                inbox: inbox_tx,
                worker: Some(worker),
                reader,
                state: ConnectionState::Active,
                connected_at: Instant::now(),
            },
        );
        info!("{pid} connected ({} active)", self.connections.len());
        Ok(())
    }

    /// Current state of `pid`'s connection; `None` if it never connected or
    /// completed too long ago to be remembered
    #[must_use]
    pub fn connection_state(&self, pid: Pid) -> Option<ConnectionState> {
        match self.connections.get(&pid) {
            Some(connection) => Some(connection.state),
            None if self.completed.contains(&pid) => Some(ConnectionState::Complete),
            None => None,
        }
    }

    /// Registered process ids, ascending
    #[must_use]
    pub fn active_processes(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.connections.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ========================================================================
    // Dumps
    // ========================================================================

    /// Snapshot `pid` including every record received before this call.
    ///
    /// `callback` runs on the manager thread; immediately with
    /// [`DumpError::NotFound`] if `pid` has no connection.
    pub fn dump_process(&mut self, pid: Pid, callback: impl FnOnce(DumpResult) + Send + 'static) {
        let callback: SnapshotCallback = Box::new(callback);
        if !self.connections.contains_key(&pid) {
            debug!("Dump requested for unknown {pid}");
            callback(Err(DumpError::NotFound(pid)));
            return;
        }

        let id = self.allocate_barrier();
        let reply = DumpReply::new(pid, self.handle(), callback);
        self.send_to_worker(pid, WorkerMessage::Dump { id, reply });
    }

    /// Snapshot `pid` when its stream reaches client barrier `id`
    pub fn dump_process_at_barrier(
        &mut self,
        pid: Pid,
        id: BarrierId,
        callback: impl FnOnce(DumpResult) + Send + 'static,
    ) {
        let callback: SnapshotCallback = Box::new(callback);
        if id.is_manager_allocated() {
            callback(Err(DumpError::InvalidBarrier(id)));
            return;
        }
        if !self.connections.contains_key(&pid) {
            debug!("Barrier dump requested for unknown {pid}");
            callback(Err(DumpError::NotFound(pid)));
            return;
        }

        let reply = DumpReply::new(pid, self.handle(), callback);
        self.send_to_worker(pid, WorkerMessage::DumpAtBarrier { id, reply });
    }

    /// A failed send drops the message; any [`DumpReply`] inside it reports
    /// `ConnectionClosed` through the task queue.
    fn send_to_worker(&self, pid: Pid, message: WorkerMessage) {
        if let Some(connection) = self.connections.get(&pid) {
            if connection.inbox.send(message).is_err() {
                debug!("{pid}: worker inbox closed");
            }
        }
    }

    fn allocate_barrier(&mut self) -> BarrierId {
        let id = BarrierId(self.next_barrier);
        self.next_barrier = if self.next_barrier == u32::MAX {
            BarrierId::MANAGER_RANGE_START
        } else {
            self.next_barrier + 1
        };
        id
    }

    // ========================================================================
    // Worker notifications (run as posted tasks)
    // ========================================================================

    pub(crate) fn on_connection_draining(&mut self, pid: Pid) {
        if let Some(connection) = self.connections.get_mut(&pid) {
            connection.state = ConnectionState::Draining;
            debug!("{pid} draining");
        }
    }

    pub(crate) fn on_connection_complete(
        &mut self,
        pid: Pid,
        outcome: DumpResult,
        stats: TrackerStats,
    ) {
        let Some(mut connection) = self.connections.remove(&pid) else {
            debug!("Completion for unregistered {pid}");
            return;
        };
        connection.disconnect();
        self.remember_completed(pid);

        let duration = connection.connected_at.elapsed();
        match &outcome {
            Ok(snapshot) => info!(
                "{pid} complete after {:.1}s: {} live allocation(s), {}",
                duration.as_secs_f64(),
                snapshot.live_count(),
                ByteSize(snapshot.live_bytes())
            ),
            Err(err) => warn!("{pid} complete after {:.1}s: {err}", duration.as_secs_f64()),
        }

        if let Some(handler) = self.completion_handler.as_mut() {
            handler(CompletionReport { pid, outcome, stats, duration });
        }
    }

    fn remember_completed(&mut self, pid: Pid) {
        if self.completed.len() == COMPLETED_HISTORY {
            self.completed.pop_front();
        }
        self.completed.push_back(pid);
    }

    // ========================================================================
    // Task queue
    // ========================================================================

    /// Run every queued task without blocking; returns how many ran
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(message) = self.tasks_rx.try_recv() {
            self.dispatch(message);
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for one task and run it
    pub fn run_once(&mut self, timeout: Duration) -> bool {
        match self.tasks_rx.recv_timeout(timeout) {
            Ok(message) => {
                self.dispatch(message);
                true
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Run tasks until `done` holds or `timeout` elapses; returns `done`'s
    /// final value
    pub fn run_until(&mut self, timeout: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done(&*self) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.run_once(remaining);
        }
    }

    /// Run tasks until [`ManagerHandle::quit`]
    pub fn run(&mut self) {
        self.quit_requested = false;
        while !self.quit_requested {
            match self.tasks_rx.recv() {
                Ok(message) => self.dispatch(message),
                Err(_) => break,
            }
        }
    }

    /// True once a quit request has been processed
    #[must_use]
    pub fn quit_requested(&self) -> bool {
        self.quit_requested
    }

    fn dispatch(&mut self, message: ManagerMessage) {
        match message {
            ManagerMessage::Task(task) => task(self),
            ManagerMessage::Quit => self.quit_requested = true,
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for (pid, mut connection) in self.connections.drain() {
            debug!("Shutting down {pid} ({})", connection.state);
            let _ = connection.inbox.send(WorkerMessage::Shutdown);
            connection.disconnect();
        }
    }
}
