//! Structured error types for memlog
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{BarrierId, Pid};
use thiserror::Error;

/// Malformed record stream. Always fatal to the connection that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown record kind {0}")]
    UnknownRecordKind(u8),

    #[error("Payload length varint is malformed")]
    MalformedLength,

    #[error("Record kind {kind} declares {len} payload bytes (limit {max})")]
    PayloadTooLarge { kind: u8, len: u64, max: usize },

    #[error("Record kind {kind} payload is {actual} bytes, expected {expected}")]
    PayloadLengthMismatch { kind: u8, expected: usize, actual: usize },

    #[error("Allocation carries {count} frames (limit {max})")]
    TooManyFrames { count: usize, max: usize },

    #[error("Allocation context is {len} bytes (limit {max})")]
    ContextTooLong { len: usize, max: usize },

    #[error("Allocation context is not valid UTF-8")]
    InvalidContext,

    #[error("Stream ended with {pending} bytes of an incomplete record")]
    Truncated { pending: usize },

    #[error("Parser already failed; no further input is accepted")]
    ParserFailed,
}

/// Why a dump request did not produce a snapshot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DumpError {
    #[error("Process {0} not found")]
    NotFound(Pid),

    #[error("Tracking failed for process {pid}: {reason}")]
    TrackingFailed { pid: Pid, reason: String },

    #[error("Process {pid} stream ended before {barrier} was reached")]
    BarrierNotReached { pid: Pid, barrier: BarrierId },

    #[error("Connection to process {0} closed before the dump completed")]
    ConnectionClosed(Pid),

    #[error("{0} is reserved for manager-issued dumps")]
    InvalidBarrier(BarrierId),
}

/// Rejected manager operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("Process {0} already has an active connection")]
    DuplicateProcess(Pid),

    #[error("Failed to start worker thread for process {pid}: {reason}")]
    WorkerSpawnFailed { pid: Pid, reason: String },
}

/// Heap dump could not be written
#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_error_display() {
        let err = DumpError::NotFound(Pid(1234));
        assert_eq!(err.to_string(), "Process PID:1234 not found");
    }

    #[test]
    fn test_tracking_failed_carries_reason() {
        let err = DumpError::TrackingFailed {
            pid: Pid(7),
            reason: ProtocolError::UnknownRecordKind(9).to_string(),
        };
        assert!(err.to_string().contains("PID:7"));
        assert!(err.to_string().contains("Unknown record kind 9"));
    }

    #[test]
    fn test_payload_too_large_display() {
        let err = ProtocolError::PayloadTooLarge { kind: 1, len: 1 << 40, max: 3096 };
        assert!(err.to_string().contains("limit 3096"));
    }
}
