//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a barrier id where
//! a context id is expected, and make function signatures more expressive.

use serde::Serialize;
use std::fmt;

/// Process ID of a monitored process
///
/// Identifies a connection in the manager. Unique while the connection is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<u32> for Pid {
    fn from(pid: u32) -> Self {
        Pid(pid)
    }
}

/// Allocation address in the monitored process
///
/// An opaque handle: it is only ever compared and hashed, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u64);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// One stack frame identifier (return address or symbol handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Frame(pub u64);

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Barrier identifier carried by BARRIER records and dump requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BarrierId(pub u32);

impl BarrierId {
    /// First id of the range the manager allocates for its own dump requests.
    ///
    /// Clients must keep their stream barriers below this value.
    pub const MANAGER_RANGE_START: u32 = 0x8000_0000;

    /// Returns true if this id belongs to the manager's reserved range
    #[must_use]
    pub fn is_manager_allocated(self) -> bool {
        self.0 >= Self::MANAGER_RANGE_START
    }
}

impl fmt::Display for BarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Barrier#{}", self.0)
    }
}

/// Interned allocation context string, scoped to one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context#{}", self.0)
    }
}

/// Byte count with human-readable display
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const KIB: u64 = 1024;
        const MIB: u64 = 1024 * KIB;
        const GIB: u64 = 1024 * MIB;

        match self.0 {
            n if n >= GIB => write!(f, "{:.2}GiB", n as f64 / GIB as f64),
            n if n >= MIB => write!(f, "{:.2}MiB", n as f64 / MIB as f64),
            n if n >= KIB => write!(f, "{:.2}KiB", n as f64 / KIB as f64),
            n => write!(f, "{n}B"),
        }
    }
}
