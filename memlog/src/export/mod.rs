//! Heap dump export
//!
//! Writes snapshots as JSON heap dumps, optionally gzip-compressed.

pub mod heap_dump;

pub use heap_dump::{HeapDumpExporter, HeapDumpOptions, HEAP_DUMP_VERSION};
