//! Heap dump JSON export
//!
//! One file per snapshot. Backtraces are listed largest first; groups below
//! `min_group_bytes` are folded into a single `other` entry so a dump of a
//! fragmented heap stays readable.
//!
//! ```json
//! {
//!   "version": 1,
//!   "pid": 4242,
//!   "process_name": "renderer",
//!   "barrier": 2147483648,
//!   "total_count": 3,
//!   "total_bytes": 4160,
//!   "contexts": { "0": "net" },
//!   "backtraces": [
//!     { "frames": ["0x55d0c0a1f2e0"], "count": 2, "bytes": 4096,
//!       "allocations": [{ "address": "0x7f00", "size": 2048, "context": 0 }] }
//!   ],
//!   "other": { "count": 1, "bytes": 64 }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use crate::domain::{BarrierId, ContextId, ExportError, Pid};
use crate::tracker::Snapshot;

/// Bumped whenever the JSON layout changes
pub const HEAP_DUMP_VERSION: u32 = 1;

/// Exporter settings
#[derive(Debug, Clone, Copy)]
pub struct HeapDumpOptions {
    /// Backtraces holding fewer live bytes are folded into `other`
    pub min_group_bytes: u64,
    /// Emit individual allocations under each backtrace
    pub include_addresses: bool,
    /// Gzip the output
    pub gzip: bool,
}

impl Default for HeapDumpOptions {
    fn default() -> Self {
        Self { min_group_bytes: 0, include_addresses: true, gzip: false }
    }
}

#[derive(Debug, Serialize)]
struct HeapDump<'a> {
    version: u32,
    pid: Pid,
    #[serde(skip_serializing_if = "Option::is_none")]
    process_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    barrier: Option<BarrierId>,
    total_count: usize,
    total_bytes: u64,
    contexts: &'a BTreeMap<ContextId, String>,
    backtraces: Vec<BacktraceEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    other: Option<OtherEntry>,
}

#[derive(Debug, Serialize)]
struct BacktraceEntry {
    frames: Vec<String>,
    count: usize,
    bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    allocations: Option<Vec<AllocationEntry>>,
}

#[derive(Debug, Serialize)]
struct AllocationEntry {
    address: String,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<ContextId>,
}

#[derive(Debug, Default, Serialize)]
struct OtherEntry {
    count: usize,
    bytes: u64,
}

/// Serializes [`Snapshot`]s as heap dump JSON
#[derive(Debug, Clone, Default)]
pub struct HeapDumpExporter {
    options: HeapDumpOptions,
}

impl HeapDumpExporter {
    #[must_use]
    pub fn new(options: HeapDumpOptions) -> Self {
        Self { options }
    }

    /// File name for the `sequence`-th dump of `pid`
    #[must_use]
    pub fn file_name(&self, pid: Pid, sequence: u64) -> String {
        let ext = if self.options.gzip { "json.gz" } else { "json" };
        format!("memlog-{}-{sequence:04}.{ext}", pid.0)
    }

    /// Write `snapshot` to `writer`, gzipped if configured
    pub fn export<W: Write>(
        &self,
        snapshot: &Snapshot,
        process_name: Option<&str>,
        writer: W,
    ) -> Result<(), ExportError> {
        let dump = self.build(snapshot, process_name);

        if self.options.gzip {
            let mut encoder = GzEncoder::new(writer, Compression::default());
            serde_json::to_writer(&mut encoder, &dump)?;
            encoder.finish()?;
        } else {
            let mut writer = writer;
            serde_json::to_writer(&mut writer, &dump)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Write `snapshot` to a new file at `path`
    pub fn export_to_file(
        &self,
        snapshot: &Snapshot,
        process_name: Option<&str>,
        path: &Path,
    ) -> Result<(), ExportError> {
        let file = File::create(path)?;
        self.export(snapshot, process_name, BufWriter::new(file))
    }

    fn build<'a>(&self, snapshot: &'a Snapshot, process_name: Option<&'a str>) -> HeapDump<'a> {
        let mut backtraces = Vec::new();
        let mut other = OtherEntry::default();

        for group in &snapshot.groups {
            let bytes = group.total_bytes();
            if bytes < self.options.min_group_bytes {
                other.count += group.count();
                other.bytes = other.bytes.saturating_add(bytes);
                continue;
            }

            let allocations = self.options.include_addresses.then(|| {
                group
                    .allocations
                    .iter()
                    .map(|(address, alloc)| AllocationEntry {
                        address: address.to_string(),
                        size: alloc.size,
                        context: alloc.context,
                    })
                    .collect()
            });

            backtraces.push(BacktraceEntry {
                frames: group.frames.iter().map(ToString::to_string).collect(),
                count: group.count(),
                bytes,
                allocations,
            });
        }
        backtraces.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.frames.cmp(&b.frames)));

        HeapDump {
            version: HEAP_DUMP_VERSION,
            pid: snapshot.pid,
            process_name,
            barrier: snapshot.barrier,
            total_count: snapshot.live_count(),
            total_bytes: snapshot.live_bytes(),
            contexts: &snapshot.contexts,
            backtraces,
            other: (other.count > 0).then_some(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, Frame};
    use crate::tracker::AllocationTracker;

    fn export_value(exporter: &HeapDumpExporter, snapshot: &Snapshot) -> serde_json::Value {
        let mut buffer = Vec::new();
        exporter.export(snapshot, Some("test"), &mut buffer).unwrap();
        serde_json::from_slice(&buffer).unwrap()
    }

    #[test]
    fn test_small_groups_fold_into_other() {
        let mut tracker = AllocationTracker::new(Pid(9));
        tracker.on_allocation(Address(0x10), 4096, &[Frame(0xa)], None);
        tracker.on_allocation(Address(0x20), 16, &[Frame(0xb)], None);
        tracker.on_allocation(Address(0x30), 16, &[Frame(0xc)], None);

        let exporter = HeapDumpExporter::new(HeapDumpOptions {
            min_group_bytes: 1024,
            ..HeapDumpOptions::default()
        });
        let json = export_value(&exporter, &tracker.snapshot());

        assert_eq!(json["backtraces"].as_array().unwrap().len(), 1);
        assert_eq!(json["other"]["count"], 2);
        assert_eq!(json["other"]["bytes"], 32);
        assert_eq!(json["total_bytes"], 4128);
    }

    #[test]
    fn test_addresses_can_be_omitted() {
        let mut tracker = AllocationTracker::new(Pid(9));
        tracker.on_allocation(Address(0x10), 8, &[Frame(0xa)], Some("io"));

        let exporter = HeapDumpExporter::new(HeapDumpOptions {
            include_addresses: false,
            ..HeapDumpOptions::default()
        });
        let json = export_value(&exporter, &tracker.snapshot());

        assert!(json["backtraces"][0].get("allocations").is_none());
        assert!(json.get("other").is_none());
        assert_eq!(json["contexts"]["0"], "io");
    }

    #[test]
    fn test_huge_sizes_saturate_totals() {
        let half = u64::MAX / 2 + 1;
        let mut tracker = AllocationTracker::new(Pid(9));
        tracker.on_allocation(Address(0x1000), half, &[Frame(0xa)], None);
        tracker.on_allocation(Address(0x2000), half, &[Frame(0xa)], None);
        tracker.on_allocation(Address(0x3000), half, &[Frame(0xb)], None);
        tracker.on_allocation(Address(0x4000), half, &[Frame(0xc)], None);

        let exporter = HeapDumpExporter::new(HeapDumpOptions {
            min_group_bytes: u64::MAX,
            ..HeapDumpOptions::default()
        });
        let json = export_value(&exporter, &tracker.snapshot());

        assert_eq!(json["total_bytes"], u64::MAX);
        assert_eq!(json["backtraces"].as_array().unwrap().len(), 1);
        assert_eq!(json["backtraces"][0]["bytes"], u64::MAX);
        assert_eq!(json["other"]["count"], 2);
        assert_eq!(json["other"]["bytes"], u64::MAX);
    }

    #[test]
    fn test_file_name() {
        let plain = HeapDumpExporter::default();
        let gz =
            HeapDumpExporter::new(HeapDumpOptions { gzip: true, ..HeapDumpOptions::default() });

        assert_eq!(plain.file_name(Pid(42), 3), "memlog-42-0003.json");
        assert_eq!(gz.file_name(Pid(42), 3), "memlog-42-0003.json.gz");
    }
}
