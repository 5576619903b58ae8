//! # memlog - Out-of-Process Heap Tracking
//!
//! memlog receives allocation events from instrumented client processes and
//! keeps an authoritative picture of every client's live heap, outside the
//! client. Heap dumps can be taken on demand or at barriers the client writes
//! into its own event stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Instrumented Client Processes                   │
//! │        ALLOC / FREE / BARRIER records over a byte stream        │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ one stream per process
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  memlog (This Crate)                            │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  Transport   │──▶│    Worker    │──▶│   Tracker    │         │
//! │  │ (tokio I/O)  │   │  (1 thread   │   │ (live allocs │         │
//! │  └──────────────┘   │ per client)  │   │  + barriers) │         │
//! │                     └──────┬───────┘   └──────┬───────┘         │
//! │                            │ parser           │ snapshots       │
//! │                            ▼                  ▼                 │
//! │                     ┌──────────────┐   ┌──────────────┐         │
//! │                     │  Connection  │──▶│    Export    │         │
//! │                     │   Manager    │   │ (heap dumps) │         │
//! │                     └──────────────┘   └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core Pipeline Modules
//!
//! - [`protocol`]: wire records, the streaming parser and the encoder
//!   - `parser`: buffers partial records across chunk boundaries
//!   - `record`: pure `decode_record` over buffered bytes
//!
//! - [`tracker`]: per-process live allocation state
//!   - `allocation_tracker`: alloc/free/barrier application and completion
//!   - `backtrace_storage`: reference-counted backtrace interning
//!
//! - [`connection`]: the connection registry and its threading model
//!   - `manager`: single-threaded owner of every connection
//!   - `transport`: byte sources (sockets, in-memory pipes)
//!
//! ### Output Modules
//!
//! - [`export`]: heap dump JSON (optionally gzipped)
//! - [`analysis`]: top backtraces and per-context totals
//!
//! ### Support Modules
//!
//! - [`cli`]: command-line arguments of the `memlog` daemon
//! - [`domain`]: core domain types (Pid, Address, Frame, BarrierId) and errors
//! - [`preflight`]: socket and dump directory checks
//! - [`process_lookup`]: client process names from `/proc`
//!
//! ## Failure Model
//!
//! A malformed record is fatal to the connection that sent it, and only to
//! that connection. Every outcome, good or bad, reaches the caller through
//! the same `Result<Snapshot, DumpError>` callback; no dump request is ever
//! left waiting.
//!
//! ## Typical Usage
//!
//! ```bash
//! # Accept clients and dump each one when it disconnects
//! ./memlog --socket /tmp/memlog.sock --dump-dir ./dumps
//!
//! # Also dump every live client every 30 seconds, compressed
//! ./memlog --dump-interval 30 --gzip
//! ```

// Expose modules for testing
pub mod analysis;
pub mod cli;
pub mod connection;
pub mod domain;
pub mod export;
pub mod preflight;
pub mod process_lookup;
pub mod protocol;
pub mod tracker;
