use std::io::Read;

use flate2::read::GzDecoder;
use memlog::domain::{Address, BarrierId, Frame, Pid};
use memlog::export::{HeapDumpExporter, HeapDumpOptions, HEAP_DUMP_VERSION};
use memlog::tracker::{AllocationTracker, Snapshot};

fn sample_snapshot() -> Snapshot {
    let mut tracker = AllocationTracker::new(Pid(4242));
    tracker.on_allocation(Address(0x7f00_0000), 2048, &[Frame(0x55d0), Frame(0x55e0)], Some("net"));
    tracker.on_allocation(Address(0x7f00_1000), 2048, &[Frame(0x55d0), Frame(0x55e0)], None);
    tracker.on_allocation(Address(0x7f00_2000), 64, &[Frame(0x6000)], None);
    let mut snapshot = tracker.snapshot();
    snapshot.barrier = Some(BarrierId(0x8000_0000));
    snapshot
}

#[test]
fn test_export_creates_valid_json() {
    let exporter = HeapDumpExporter::default();
    let mut buffer = Vec::new();

    exporter.export(&sample_snapshot(), Some("renderer"), &mut buffer).expect("Failed to export");

    // Verify the output is valid JSON
    let json_str = String::from_utf8(buffer).expect("Invalid UTF-8");
    let parsed: serde_json::Value = serde_json::from_str(&json_str).expect("Invalid JSON");

    // Verify it has the expected structure
    assert_eq!(parsed["version"], HEAP_DUMP_VERSION);
    assert_eq!(parsed["pid"], 4242);
    assert_eq!(parsed["process_name"], "renderer");
    assert_eq!(parsed["barrier"], 0x8000_0000u32);
    assert_eq!(parsed["total_count"], 3);
    assert_eq!(parsed["total_bytes"], 4160);

    let backtraces = parsed["backtraces"].as_array().unwrap();
    assert_eq!(backtraces.len(), 2);
    assert_eq!(backtraces[0]["bytes"], 4096);
    assert_eq!(backtraces[0]["frames"][0], "0x55d0");
    assert_eq!(backtraces[0]["allocations"][0]["address"], "0x7f000000");
    assert_eq!(backtraces[0]["allocations"][0]["context"], 0);
    assert!(backtraces[0]["allocations"][1].get("context").is_none());
}

#[test]
fn test_gzip_export_round_trips() {
    let plain = HeapDumpExporter::default();
    let gzip = HeapDumpExporter::new(HeapDumpOptions { gzip: true, ..HeapDumpOptions::default() });
    let snapshot = sample_snapshot();

    let mut expected = Vec::new();
    plain.export(&snapshot, None, &mut expected).unwrap();
    let mut compressed = Vec::new();
    gzip.export(&snapshot, None, &mut compressed).unwrap();

    let mut decompressed = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut decompressed).unwrap();
    assert_eq!(decompressed, expected);
}

#[test]
fn test_export_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let exporter = HeapDumpExporter::new(HeapDumpOptions {
        min_group_bytes: 1024,
        include_addresses: false,
        gzip: false,
    });
    let path = dir.path().join(exporter.file_name(Pid(4242), 0));

    exporter.export_to_file(&sample_snapshot(), None, &path).unwrap();

    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(parsed.get("process_name").is_none());
    assert_eq!(parsed["backtraces"].as_array().unwrap().len(), 1);
    assert_eq!(parsed["other"]["bytes"], 64);
    assert!(path.ends_with("memlog-4242-0000.json"));
}

#[test]
fn test_empty_snapshot_exports() {
    let mut buffer = Vec::new();
    HeapDumpExporter::default().export(&Snapshot::empty(Pid(1)), None, &mut buffer).unwrap();

    let parsed: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
    assert_eq!(parsed["total_bytes"], 0);
    assert!(parsed["backtraces"].as_array().unwrap().is_empty());
    assert!(parsed.get("barrier").is_none());
}
