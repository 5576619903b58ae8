//! Record stream encoder
//!
//! The sending half of the wire format. Instrumented clients use it to build
//! their stream; tests use it to produce byte-exact input for the parser.

use memlog_common::{encode_varint, MAX_VARINT_LEN};

use crate::domain::{Address, BarrierId, Frame};

/// Appends encoded records to an in-memory buffer
#[derive(Debug, Default, Clone)]
pub struct RecordEncoder {
    buf: Vec<u8>,
}

impl RecordEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an ALLOC record
    pub fn alloc(
        &mut self,
        address: Address,
        size: u64,
        frames: &[Frame],
        context: Option<&str>,
    ) -> &mut Self {
        let context = context.unwrap_or_default().as_bytes();

        let mut payload = Vec::with_capacity(24 + frames.len() * 8 + context.len());
        payload.extend_from_slice(&address.0.to_le_bytes());
        payload.extend_from_slice(&size.to_le_bytes());
        payload.extend_from_slice(&len_u32(frames.len()).to_le_bytes());
        for frame in frames {
            payload.extend_from_slice(&frame.0.to_le_bytes());
        }
        payload.extend_from_slice(&len_u32(context.len()).to_le_bytes());
        payload.extend_from_slice(context);

        self.push_raw(memlog_common::RECORD_ALLOC, &payload)
    }

    /// Append a FREE record
    pub fn free(&mut self, address: Address) -> &mut Self {
        self.push_raw(memlog_common::RECORD_FREE, &address.0.to_le_bytes())
    }

    /// Append a BARRIER record
    pub fn barrier(&mut self, id: BarrierId) -> &mut Self {
        self.push_raw(memlog_common::RECORD_BARRIER, &id.0.to_le_bytes())
    }

    /// Append a record with an arbitrary kind byte and payload.
    ///
    /// No validation is done, which makes it the tool for producing malformed
    /// streams in tests.
    pub fn push_raw(&mut self, kind: u8, payload: &[u8]) -> &mut Self {
        let mut varint = [0u8; MAX_VARINT_LEN];
        let n = encode_varint(payload.len() as u64, &mut varint);

        self.buf.push(kind);
        self.buf.extend_from_slice(&varint[..n]);
        self.buf.extend_from_slice(payload);
        self
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Take the encoded bytes, leaving the encoder empty
    pub fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn len_u32(len: usize) -> u32 {
    len.min(u32::MAX as usize) as u32
}
