//! Record types and the stateless record decoder
//!
//! [`decode_record`] is a pure function of the bytes it is given: it either
//! decodes one complete record from the front of the buffer, reports that more
//! bytes are needed, or rejects the input. All buffering lives in
//! [`StreamParser`](super::StreamParser).

use memlog_common::{
    decode_varint, max_payload_len, ALLOC_FIXED_LEN, BARRIER_PAYLOAD_LEN, DEFAULT_MAX_CONTEXT_LEN,
    DEFAULT_MAX_FRAMES, FRAME_LEN, FREE_PAYLOAD_LEN, RECORD_ALLOC, RECORD_BARRIER, RECORD_FREE,
};

use crate::domain::{Address, BarrierId, Frame, ProtocolError};

/// Upper bounds applied while decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    /// Maximum frames in one allocation backtrace
    pub max_frames: usize,
    /// Maximum context string length in bytes
    pub max_context_len: usize,
}

impl ParserLimits {
    /// Largest payload any record may declare under these limits
    #[must_use]
    pub fn max_payload_len(&self) -> usize {
        max_payload_len(self.max_frames, self.max_context_len)
    }
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self { max_frames: DEFAULT_MAX_FRAMES, max_context_len: DEFAULT_MAX_CONTEXT_LEN }
    }
}

/// Decoded ALLOC record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocRecord {
    pub address: Address,
    pub size: u64,
    /// Backtrace, innermost frame first
    pub frames: Vec<Frame>,
    pub context: Option<String>,
}

/// One decoded stream record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Alloc(AllocRecord),
    Free { address: Address },
    Barrier { id: BarrierId },
}

/// Decode one record from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` holds only part of a record, otherwise the
/// record and the number of bytes it occupied.
///
/// Header problems are reported as soon as the header is visible: an unknown
/// kind or an impossible length fails without waiting for the payload.
///
/// # Errors
/// Any [`ProtocolError`] describing why the bytes can never form a valid record.
pub fn decode_record(
    buf: &[u8],
    limits: &ParserLimits,
) -> Result<Option<(Record, usize)>, ProtocolError> {
    let Some(&kind) = buf.first() else {
        return Ok(None);
    };

    if !matches!(kind, RECORD_ALLOC | RECORD_FREE | RECORD_BARRIER) {
        return Err(ProtocolError::UnknownRecordKind(kind));
    }

    let Some((declared, varint_len)) =
        decode_varint(&buf[1..]).map_err(|_| ProtocolError::MalformedLength)?
    else {
        return Ok(None);
    };

    let max = limits.max_payload_len();
    let len = match usize::try_from(declared) {
        Ok(len) if len <= max => len,
        _ => return Err(ProtocolError::PayloadTooLarge { kind, len: declared, max }),
    };

    check_declared_len(kind, len)?;

    let header_len = 1 + varint_len;
    let total = header_len + len;
    if buf.len() < total {
        return Ok(None);
    }

    let payload = &buf[header_len..total];
    let record = match kind {
        RECORD_ALLOC => Record::Alloc(decode_alloc(payload, limits)?),
        RECORD_FREE => Record::Free { address: Address(read_u64(payload, 0)) },
        _ => Record::Barrier { id: BarrierId(read_u32(payload, 0)) },
    };

    Ok(Some((record, total)))
}

/// Reject lengths that cannot belong to `kind` before buffering the payload
fn check_declared_len(kind: u8, len: usize) -> Result<(), ProtocolError> {
    let expected = match kind {
        RECORD_FREE => FREE_PAYLOAD_LEN,
        RECORD_BARRIER => BARRIER_PAYLOAD_LEN,
        _ => {
            if len < ALLOC_FIXED_LEN {
                return Err(ProtocolError::PayloadLengthMismatch {
                    kind,
                    expected: ALLOC_FIXED_LEN,
                    actual: len,
                });
            }
            return Ok(());
        }
    };

    if len == expected {
        Ok(())
    } else {
        Err(ProtocolError::PayloadLengthMismatch { kind, expected, actual: len })
    }
}

fn decode_alloc(payload: &[u8], limits: &ParserLimits) -> Result<AllocRecord, ProtocolError> {
    let address = Address(read_u64(payload, 0));
    let size = read_u64(payload, 8);

    let frame_count = read_u32(payload, 16) as usize;
    if frame_count > limits.max_frames {
        return Err(ProtocolError::TooManyFrames { count: frame_count, max: limits.max_frames });
    }

    let frames_start = 20;
    let frames_end = frames_start + frame_count * FRAME_LEN;
    if frames_end + 4 > payload.len() {
        return Err(ProtocolError::PayloadLengthMismatch {
            kind: RECORD_ALLOC,
            expected: frames_end + 4,
            actual: payload.len(),
        });
    }

    let frames = (0..frame_count)
        .map(|i| Frame(read_u64(payload, frames_start + i * FRAME_LEN)))
        .collect();

    let context_len = read_u32(payload, frames_end) as usize;
    if context_len > limits.max_context_len {
        return Err(ProtocolError::ContextTooLong {
            len: context_len,
            max: limits.max_context_len,
        });
    }

    let context_start = frames_end + 4;
    let expected = context_start + context_len;
    if expected != payload.len() {
        return Err(ProtocolError::PayloadLengthMismatch {
            kind: RECORD_ALLOC,
            expected,
            actual: payload.len(),
        });
    }

    let context = if context_len == 0 {
        None
    } else {
        let text = std::str::from_utf8(&payload[context_start..expected])
            .map_err(|_| ProtocolError::InvalidContext)?;
        Some(text.to_owned())
    };

    Ok(AllocRecord { address, size, frames, context })
}

// Callers guarantee the slice is long enough; lengths are validated first.
fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RecordEncoder;

    #[test]
    fn test_decode_free() {
        let bytes = RecordEncoder::new().free(Address(0x1000)).take_bytes();
        let (record, used) = decode_record(&bytes, &ParserLimits::default()).unwrap().unwrap();
        assert_eq!(record, Record::Free { address: Address(0x1000) });
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_decode_alloc_with_context() {
        let bytes = RecordEncoder::new()
            .alloc(Address(0x2000), 32, &[Frame(0xf1), Frame(0xf2)], Some("render"))
            .take_bytes();
        let (record, _) = decode_record(&bytes, &ParserLimits::default()).unwrap().unwrap();

        let Record::Alloc(alloc) = record else { panic!("expected alloc, got {record:?}") };
        assert_eq!(alloc.address, Address(0x2000));
        assert_eq!(alloc.size, 32);
        assert_eq!(alloc.frames, vec![Frame(0xf1), Frame(0xf2)]);
        assert_eq!(alloc.context.as_deref(), Some("render"));
    }

    #[test]
    fn test_every_strict_prefix_needs_more_bytes() {
        let bytes = RecordEncoder::new()
            .alloc(Address(0x10), 8, &[Frame(1), Frame(2), Frame(3)], Some("ctx"))
            .take_bytes();
        for end in 0..bytes.len() {
            assert_eq!(decode_record(&bytes[..end], &ParserLimits::default()), Ok(None));
        }
    }

    #[test]
    fn test_unknown_kind_fails_on_first_byte() {
        assert_eq!(
            decode_record(&[0x7f], &ParserLimits::default()),
            Err(ProtocolError::UnknownRecordKind(0x7f))
        );
    }

    #[test]
    fn test_absurd_length_fails_before_payload() {
        // ALLOC header declaring 2^35 bytes, no payload yet
        let bytes = [RECORD_ALLOC, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        let err = decode_record(&bytes, &ParserLimits::default()).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { kind: RECORD_ALLOC, .. }));
    }

    #[test]
    fn test_free_with_wrong_length() {
        let bytes = [RECORD_FREE, 4, 0, 0, 0, 0];
        assert_eq!(
            decode_record(&bytes, &ParserLimits::default()),
            Err(ProtocolError::PayloadLengthMismatch { kind: RECORD_FREE, expected: 8, actual: 4 })
        );
    }

    #[test]
    fn test_frame_count_above_limit() {
        // Payload cap is 24 + 2*8 + 64 = 104, so the 48-byte record passes the header check
        let limits = ParserLimits { max_frames: 2, max_context_len: 64 };
        let bytes = RecordEncoder::new()
            .alloc(Address(1), 1, &[Frame(1), Frame(2), Frame(3)], None)
            .take_bytes();
        let err = decode_record(&bytes, &limits).unwrap_err();
        assert_eq!(err, ProtocolError::TooManyFrames { count: 3, max: 2 });
    }

    #[test]
    fn test_invalid_utf8_context() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u64.to_le_bytes());
        payload.extend_from_slice(&16u64.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(&[0xff, 0xfe]);

        let mut bytes = vec![RECORD_ALLOC, u8::try_from(payload.len()).unwrap()];
        bytes.extend_from_slice(&payload);

        assert_eq!(
            decode_record(&bytes, &ParserLimits::default()),
            Err(ProtocolError::InvalidContext)
        );
    }

    #[test]
    fn test_alloc_trailing_garbage_is_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u64.to_le_bytes());
        payload.extend_from_slice(&16u64.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.push(0xaa);

        let mut bytes = vec![RECORD_ALLOC, u8::try_from(payload.len()).unwrap()];
        bytes.extend_from_slice(&payload);

        assert_eq!(
            decode_record(&bytes, &ParserLimits::default()),
            Err(ProtocolError::PayloadLengthMismatch {
                kind: RECORD_ALLOC,
                expected: ALLOC_FIXED_LEN,
                actual: ALLOC_FIXED_LEN + 1,
            })
        );
    }
}
