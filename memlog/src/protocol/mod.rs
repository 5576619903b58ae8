//! Allocation event wire protocol
//!
//! - `record`: record types and the stateless decoder
//! - `parser`: chunk-tolerant streaming parser
//! - `encoder`: the sending side, for clients and tests
//!
//! Constants that define the format live in the `memlog-common` crate.

pub mod encoder;
pub mod parser;
pub mod record;

pub use encoder::RecordEncoder;
pub use parser::{RecordSink, StreamParser};
pub use record::{decode_record, AllocRecord, ParserLimits, Record};
