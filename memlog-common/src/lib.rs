//! # Shared Wire Definitions (client ↔ memlog)
//!
//! Defines the record stream spoken between an instrumented process and the
//! `memlog` receiver. Both the sending side (an allocator shim inside the
//! monitored process) and the receiving parser depend on this crate, so every
//! constant here is part of the wire contract.
//!
//! ## Record Framing
//!
//! ```text
//! ┌────────────┬──────────────────────┬──────────────────────────┐
//! │ kind (u8)  │ payload_len (LEB128) │ payload (kind-specific)  │
//! └────────────┴──────────────────────┴──────────────────────────┘
//! ```
//!
//! ## Payloads (all integers little-endian)
//!
//! - [`RECORD_ALLOC`]: `address u64`, `size u64`, `frame_count u32`,
//!   `frame_count × u64` frames, `context_len u32`, `context_len` UTF-8 bytes
//! - [`RECORD_FREE`]: `address u64`
//! - [`RECORD_BARRIER`]: `barrier_id u32`
//!
//! There are no checksums or record ids: ordering within one stream is the
//! only guarantee the protocol needs.

#![no_std]

// ============================================================================
// Record Kinds
// ============================================================================

/// **Allocation**: a block became live in the monitored process
pub const RECORD_ALLOC: u8 = 1;

/// **Free**: a block was released (may name an address never seen before)
pub const RECORD_FREE: u8 = 2;

/// **Barrier**: every record before this one has been sent
///
/// The receiver uses it to fence snapshots: a snapshot taken at a barrier
/// contains exactly the records that precede it in the stream.
pub const RECORD_BARRIER: u8 = 3;

// ============================================================================
// Connection Handshake
// ============================================================================

/// Length of the process announcement sent before the first record.
///
/// A client writes its pid as a little-endian `u32` immediately after
/// connecting; everything after that is the record stream.
pub const HANDSHAKE_LEN: usize = 4;

// ============================================================================
// Payload Layout
// ============================================================================

/// Bytes of fixed fields in an ALLOC payload (address, size, frame count, context length)
pub const ALLOC_FIXED_LEN: usize = 8 + 8 + 4 + 4;

/// Size of one encoded stack frame
pub const FRAME_LEN: usize = 8;

/// Exact FREE payload size
pub const FREE_PAYLOAD_LEN: usize = 8;

/// Exact BARRIER payload size
pub const BARRIER_PAYLOAD_LEN: usize = 4;

// ============================================================================
// Default Limits
// ============================================================================

/// Maximum number of stack frames accepted in one ALLOC record
pub const DEFAULT_MAX_FRAMES: usize = 256;

/// Maximum context string length in bytes
pub const DEFAULT_MAX_CONTEXT_LEN: usize = 1024;

/// Largest payload a well-formed record can declare under the given limits.
///
/// Anything above this is rejected as soon as the header is decoded, without
/// waiting for the payload bytes to arrive.
#[must_use]
pub const fn max_payload_len(max_frames: usize, max_context_len: usize) -> usize {
    ALLOC_FIXED_LEN + max_frames * FRAME_LEN + max_context_len
}

// ============================================================================
// LEB128 Varint
// ============================================================================

/// A `u64` never needs more than 10 LEB128 bytes
pub const MAX_VARINT_LEN: usize = 10;

/// Varint decoding failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    /// More than [`MAX_VARINT_LEN`] bytes, or the value does not fit in a `u64`
    Overflow,
}

/// Decode an unsigned LEB128 varint from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the varint does (more bytes are
/// needed), otherwise the value and the number of bytes consumed.
///
/// # Errors
/// [`VarintError::Overflow`] if the encoding is longer than 10 bytes or
/// carries bits beyond 64.
pub fn decode_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, VarintError> {
    let mut value: u64 = 0;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(VarintError::Overflow);
        }

        let bits = u64::from(byte & 0x7f);
        // The tenth byte may only carry the single remaining bit
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(VarintError::Overflow);
        }
        value |= bits << (7 * i);

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if buf.len() >= MAX_VARINT_LEN {
        return Err(VarintError::Overflow);
    }
    Ok(None)
}

/// Encode `value` as unsigned LEB128 into `out`, returning the encoded length.
#[must_use]
pub fn encode_varint(mut value: u64, out: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut len = 0;
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out[len] = byte;
            return len + 1;
        }
        out[len] = byte | 0x80;
        len += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_single_byte() {
        let mut out = [0u8; MAX_VARINT_LEN];
        assert_eq!(encode_varint(0x7f, &mut out), 1);
        assert_eq!(out[0], 0x7f);
        assert_eq!(decode_varint(&out[..1]), Ok(Some((0x7f, 1))));
    }

    #[test]
    fn test_varint_multi_byte() {
        // 300 = 0b1_0010_1100 -> [0xac, 0x02]
        assert_eq!(decode_varint(&[0xac, 0x02, 0xff]), Ok(Some((300, 2))));
    }

    #[test]
    fn test_varint_incomplete() {
        assert_eq!(decode_varint(&[0x80, 0x80]), Ok(None));
        assert_eq!(decode_varint(&[]), Ok(None));
    }

    #[test]
    fn test_varint_max_value() {
        let mut out = [0u8; MAX_VARINT_LEN];
        let len = encode_varint(u64::MAX, &mut out);
        assert_eq!(len, MAX_VARINT_LEN);
        assert_eq!(decode_varint(&out), Ok(Some((u64::MAX, MAX_VARINT_LEN))));
    }

    #[test]
    fn test_varint_overflow() {
        // Eleven continuation bytes can never be a u64
        let bytes = [0x80u8; 11];
        assert_eq!(decode_varint(&bytes), Err(VarintError::Overflow));

        // Tenth byte carrying more than one bit
        let mut too_big = [0xffu8; MAX_VARINT_LEN];
        too_big[MAX_VARINT_LEN - 1] = 0x02;
        assert_eq!(decode_varint(&too_big), Err(VarintError::Overflow));
    }

    #[test]
    fn test_default_payload_cap() {
        assert_eq!(max_payload_len(DEFAULT_MAX_FRAMES, DEFAULT_MAX_CONTEXT_LEN), 3096);
    }
}
