//! Cross-context hand-off
//!
//! Two pieces carry work between the manager's owning thread and the
//! per-connection workers:
//!
//! - [`ManagerHandle`] posts tasks onto the manager's queue. Tasks run only
//!   when the owning thread drains the queue, never on the poster's thread.
//! - [`DumpReply`] carries a dump callback to a worker and back. Whatever
//!   happens to it, the callback ends up running on the manager thread
//!   exactly once, or not at all if the manager itself is gone.

use crossbeam_channel::Sender;

use super::manager::ConnectionManager;
use crate::domain::{DumpError, Pid};
use crate::tracker::{DumpResult, SnapshotCallback};

/// Work item executed on the manager's owning thread
pub type ManagerTask = Box<dyn FnOnce(&mut ConnectionManager) + Send>;

pub(crate) enum ManagerMessage {
    Task(ManagerTask),
    Quit,
}

/// Cloneable, `Send` handle for posting work to a [`ConnectionManager`]
#[derive(Clone)]
pub struct ManagerHandle {
    tx: Sender<ManagerMessage>,
}

impl ManagerHandle {
    pub(crate) fn new(tx: Sender<ManagerMessage>) -> Self {
        Self { tx }
    }

    /// Queue `task` for the manager thread.
    ///
    /// Returns false if the manager has been dropped.
    pub fn post(&self, task: impl FnOnce(&mut ConnectionManager) + Send + 'static) -> bool {
        self.tx.send(ManagerMessage::Task(Box::new(task))).is_ok()
    }

    /// Ask [`ConnectionManager::run`] to return
    pub fn quit(&self) {
        let _ = self.tx.send(ManagerMessage::Quit);
    }
}

/// One-shot dump callback travelling manager → worker → manager
///
/// Dropping an unconsumed reply reports [`DumpError::ConnectionClosed`], so a
/// request lost with a worker's inbox still resolves.
pub(crate) struct DumpReply {
    pid: Pid,
    manager: ManagerHandle,
    callback: Option<SnapshotCallback>,
}

impl DumpReply {
    pub(crate) fn new(pid: Pid, manager: ManagerHandle, callback: SnapshotCallback) -> Self {
        Self { pid, manager, callback: Some(callback) }
    }

    /// Marshal `result` back to the manager thread
    pub(crate) fn complete(mut self, result: DumpResult) {
        if let Some(callback) = self.callback.take() {
            self.manager.post(move |_| callback(result));
        }
    }

    /// Adapt into the tracker's callback type
    pub(crate) fn into_callback(self) -> SnapshotCallback {
        Box::new(move |result| self.complete(result))
    }
}

impl Drop for DumpReply {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            let pid = self.pid;
            self.manager.post(move |_| callback(Err(DumpError::ConnectionClosed(pid))));
        }
    }
}
