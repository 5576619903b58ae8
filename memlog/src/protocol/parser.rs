//! # Incremental Stream Parsing
//!
//! Turns an unbounded byte stream, delivered in arbitrarily sized chunks, into
//! records dispatched one at a time, in arrival order, to a [`RecordSink`].
//!
//! ## Buffering
//!
//! ```text
//! chunk N          chunk N+1
//! ┌──────────┬───┐ ┌─────┬──────────┐
//! │ record A │ B…│ │ …B  │ record C │
//! └──────────┴───┘ └─────┴──────────┘
//!              │      │
//!              └──────┴──▶ pending tail, completed on the next push
//! ```
//!
//! When nothing is pending, records are decoded straight out of the incoming
//! chunk and only the incomplete tail is copied.
//!
//! ## Failure Policy
//!
//! The first malformed record puts the parser into a failed state. There is
//! no attempt to scan forward for a plausible frame boundary: a corrupt header
//! makes every later boundary ambiguous, and a mis-framed record would be
//! attributed silently to the wrong allocation.

use log::debug;

use super::record::{decode_record, ParserLimits, Record};
use crate::domain::ProtocolError;

/// Receiver of decoded records
pub trait RecordSink {
    fn on_record(&mut self, record: Record);
}

impl RecordSink for Vec<Record> {
    fn on_record(&mut self, record: Record) {
        self.push(record);
    }
}

/// Stateful wrapper around [`decode_record`] that carries partial records
/// across chunk boundaries
#[derive(Debug, Default)]
pub struct StreamParser {
    limits: ParserLimits,
    pending: Vec<u8>,
    failed: bool,
    records_decoded: u64,
    bytes_received: u64,
}

impl StreamParser {
    #[must_use]
    pub fn new(limits: ParserLimits) -> Self {
        Self { limits, ..Self::default() }
    }

    /// Feed one chunk, dispatching every record it completes.
    ///
    /// Returns the number of records dispatched from this chunk.
    ///
    /// # Errors
    /// The [`ProtocolError`] that made the stream undecodable. After an error
    /// every later call returns [`ProtocolError::ParserFailed`]; records decoded
    /// from the chunk before the malformed one have already been dispatched.
    pub fn push<S: RecordSink + ?Sized>(
        &mut self,
        chunk: &[u8],
        sink: &mut S,
    ) -> Result<usize, ProtocolError> {
        if self.failed {
            return Err(ProtocolError::ParserFailed);
        }
        self.bytes_received += chunk.len() as u64;

        let result = if self.pending.is_empty() {
            decode_all(chunk, &self.limits, sink).map(|(count, consumed)| {
                self.pending.extend_from_slice(&chunk[consumed..]);
                count
            })
        } else {
            self.pending.extend_from_slice(chunk);
            let buffered = std::mem::take(&mut self.pending);
            decode_all(&buffered, &self.limits, sink).map(|(count, consumed)| {
                self.pending = buffered;
                self.pending.drain(..consumed);
                count
            })
        };

        match result {
            Ok(count) => {
                self.records_decoded += count as u64;
                Ok(count)
            }
            Err(err) => {
                self.fail();
                Err(err)
            }
        }
    }

    /// Signal end of stream.
    ///
    /// # Errors
    /// [`ProtocolError::Truncated`] if a partial record is still buffered: it
    /// can never complete now. [`ProtocolError::ParserFailed`] if the stream
    /// had already failed.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        if self.failed {
            return Err(ProtocolError::ParserFailed);
        }
        if !self.pending.is_empty() {
            let pending = self.pending.len();
            self.fail();
            return Err(ProtocolError::Truncated { pending });
        }
        debug!(
            "Stream complete: {} records from {} bytes",
            self.records_decoded, self.bytes_received
        );
        Ok(())
    }

    /// Bytes of an incomplete record waiting for more input
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    #[must_use]
    pub fn records_decoded(&self) -> u64 {
        self.records_decoded
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    fn fail(&mut self) {
        self.failed = true;
        self.pending = Vec::new();
    }
}

/// Decode every complete record in `buf`.
///
/// Returns (records dispatched, bytes consumed).
fn decode_all<S: RecordSink + ?Sized>(
    buf: &[u8],
    limits: &ParserLimits,
    sink: &mut S,
) -> Result<(usize, usize), ProtocolError> {
    let mut consumed = 0;
    let mut count = 0;

    while let Some((record, used)) = decode_record(&buf[consumed..], limits)? {
        sink.on_record(record);
        consumed += used;
        count += 1;
    }

    Ok((count, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, BarrierId, Frame};
    use crate::protocol::RecordEncoder;

    fn sample_stream() -> (Vec<u8>, Vec<Record>) {
        let mut encoder = RecordEncoder::new();
        encoder
            .alloc(Address(0x1000), 64, &[Frame(0xf1), Frame(0xf2)], None)
            .alloc(Address(0x2000), 32, &[Frame(0xf1)], Some("net"))
            .free(Address(0x1000))
            .barrier(BarrierId(1));
        let bytes = encoder.take_bytes();

        let mut expected = Vec::new();
        decode_all(&bytes, &ParserLimits::default(), &mut expected).unwrap();
        (bytes, expected)
    }

    #[test]
    fn test_whole_stream_in_one_chunk() {
        let (bytes, expected) = sample_stream();
        let mut parser = StreamParser::default();
        let mut records = Vec::new();

        assert_eq!(parser.push(&bytes, &mut records).unwrap(), 4);
        assert_eq!(records, expected);
        assert_eq!(parser.pending_len(), 0);
        assert!(parser.finish().is_ok());
    }

    #[test]
    fn test_byte_at_a_time_matches_single_chunk() {
        let (bytes, expected) = sample_stream();
        let mut parser = StreamParser::default();
        let mut records = Vec::new();

        for byte in &bytes {
            parser.push(std::slice::from_ref(byte), &mut records).unwrap();
        }
        assert_eq!(records, expected);
        assert_eq!(parser.records_decoded(), 4);
        assert_eq!(parser.bytes_received(), bytes.len() as u64);
    }

    #[test]
    fn test_every_two_way_split_matches_single_chunk() {
        let (bytes, expected) = sample_stream();
        for split in 0..=bytes.len() {
            let mut parser = StreamParser::default();
            let mut records = Vec::new();
            parser.push(&bytes[..split], &mut records).unwrap();
            parser.push(&bytes[split..], &mut records).unwrap();
            assert_eq!(records, expected, "split at {split}");
            assert!(parser.finish().is_ok());
        }
    }

    #[test]
    fn test_truncated_stream_fails_on_finish() {
        let (bytes, _) = sample_stream();
        let mut parser = StreamParser::default();
        let mut records = Vec::new();

        parser.push(&bytes[..bytes.len() - 2], &mut records).unwrap();
        assert_eq!(parser.finish(), Err(ProtocolError::Truncated { pending: 4 }));
        assert!(parser.is_failed());
    }

    #[test]
    fn test_malformed_record_stops_parsing() {
        let mut encoder = RecordEncoder::new();
        encoder.free(Address(1)).push_raw(9, &[0; 4]).free(Address(2));
        let bytes = encoder.take_bytes();

        let mut parser = StreamParser::default();
        let mut records = Vec::new();

        assert_eq!(parser.push(&bytes, &mut records), Err(ProtocolError::UnknownRecordKind(9)));
        // The record before the bad one was still delivered, nothing after it
        assert_eq!(records, vec![Record::Free { address: Address(1) }]);

        // No resynchronization: a perfectly valid chunk is still refused
        let valid = RecordEncoder::new().free(Address(3)).take_bytes();
        assert_eq!(parser.push(&valid, &mut records), Err(ProtocolError::ParserFailed));
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_empty_chunks_are_harmless() {
        let mut parser = StreamParser::default();
        let mut records = Vec::new();
        assert_eq!(parser.push(&[], &mut records).unwrap(), 0);
        assert!(parser.finish().is_ok());
    }
}
