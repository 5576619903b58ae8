//! Client connections
//!
//! - `manager`: the per-pid registry and its task queue
//! - `worker`: the thread that parses and tracks one connection
//! - `transport`: byte-stream sources feeding a worker
//! - `handle`: cross-thread posting and dump reply routing

pub mod handle;
pub mod manager;
pub mod transport;
mod worker;

pub use handle::{ManagerHandle, ManagerTask};
pub use manager::{CompletionReport, ConnectionManager, ConnectionState, ManagerConfig};
pub use transport::{
    MemoryPipe, PipeSink, PipeWriter, StreamPipe, TransportPipe, DEFAULT_READ_CHUNK,
};
