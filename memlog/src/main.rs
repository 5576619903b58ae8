//! # memlog - Main Entry Point
//!
//! Daemon that accepts instrumented clients on a Unix socket and writes heap
//! dumps:
//! - when a client disconnects (final snapshot)
//! - every `--dump-interval` seconds for every live client
//! - for every live client on Ctrl+C
//!
//! Threads:
//! - **main**: the connection manager and every dump callback
//! - **memlog-io** (tokio): socket accept, pid handshake, stream reads
//! - **memlog-worker-<pid>**: one parser/tracker per client

// Main function is intentionally long for clarity
#![allow(clippy::too_many_lines)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};

use memlog::analysis::{context_breakdown, format_frames, top_backtraces};
use memlog::cli::Args;
use memlog::connection::{ConnectionManager, ManagerConfig, ManagerHandle, StreamPipe};
use memlog::domain::{ByteSize, Pid};
use memlog::export::{HeapDumpExporter, HeapDumpOptions};
use memlog::preflight::run_preflight_checks;
use memlog::process_lookup::lookup_process;
use memlog::protocol::ParserLimits;
use memlog::tracker::{DumpResult, Snapshot};
use memlog_common::HANDSHAKE_LEN;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

/// How long the manager waits for a task before checking timers
const TICK: Duration = Duration::from_millis(100);
/// Clients must announce their pid within this long after connecting
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on waiting for exit-time dumps
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Backtraces logged per dump
const TOP_BACKTRACES: usize = 5;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.to_string().to_lowercase().contains("invalid argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn validate_args(args: &Args) -> Result<()> {
    if args.max_frames == 0 {
        bail!("Invalid argument: --max-frames must be at least 1");
    }
    if u32::try_from(args.max_frames).is_err() || u32::try_from(args.max_context_len).is_err() {
        bail!("Invalid argument: --max-frames and --max-context-len must fit in 32 bits");
    }
    Ok(())
}

// ============================================================================
// Dump writing
// ============================================================================

/// Writes heap dumps; shared by every dump callback
#[derive(Clone)]
struct DumpWriter {
    exporter: HeapDumpExporter,
    dump_dir: PathBuf,
    quiet: bool,
    /// Process names captured at connect time, while the client is alive
    names: Arc<Mutex<HashMap<Pid, String>>>,
    sequence: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
}

impl DumpWriter {
    fn new(exporter: HeapDumpExporter, dump_dir: PathBuf, quiet: bool) -> Self {
        Self {
            exporter,
            dump_dir,
            quiet,
            names: Arc::default(),
            sequence: Arc::default(),
            written: Arc::default(),
            in_flight: Arc::default(),
        }
    }

    fn remember_name(&self, pid: Pid, name: String) {
        if let Ok(mut names) = self.names.lock() {
            names.insert(pid, name);
        }
    }

    fn name_of(&self, pid: Pid) -> Option<String> {
        self.names.lock().ok().and_then(|names| names.get(&pid).cloned())
    }

    fn forget(&self, pid: Pid) {
        if let Ok(mut names) = self.names.lock() {
            names.remove(&pid);
        }
    }

    /// Callback for [`ConnectionManager::dump_process`]
    fn callback(&self, reason: &'static str) -> impl FnOnce(DumpResult) + Send + 'static {
        let writer = self.clone();
        writer.in_flight.fetch_add(1, Ordering::SeqCst);
        move |result| {
            match result {
                Ok(snapshot) => writer.write(&snapshot, reason),
                Err(e) => warn!("Dump ({reason}) failed: {e}"),
            }
            writer.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    fn write(&self, snapshot: &Snapshot, reason: &str) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let path = self.dump_dir.join(self.exporter.file_name(snapshot.pid, sequence));
        let name = self.name_of(snapshot.pid);

        if let Err(e) = self.exporter.export_to_file(snapshot, name.as_deref(), &path) {
            warn!("Failed to write {}: {e}", path.display());
            return;
        }
        self.written.fetch_add(1, Ordering::SeqCst);

        info!(
            "{} dump ({reason}): {} live allocation(s), {} -> {}",
            snapshot.pid,
            snapshot.live_count(),
            ByteSize(snapshot.live_bytes()),
            path.display()
        );
        for summary in top_backtraces(snapshot, TOP_BACKTRACES) {
            info!(
                "  {:5.1}%  {:>10}  ({} allocs)  {}",
                summary.percentage,
                ByteSize(summary.bytes).to_string(),
                summary.count,
                format_frames(&summary.frames, 4)
            );
        }
        for context in context_breakdown(snapshot) {
            info!(
                "  {:5.1}%  {:>10}  ({} allocs)  context {}",
                context.percentage,
                ByteSize(context.bytes).to_string(),
                context.count,
                context.name.as_deref().unwrap_or("-")
            );
        }
        if !self.quiet {
            println!("saved: {}", path.display());
        }
    }
}

fn dump_all(manager: &mut ConnectionManager, writer: &DumpWriter, reason: &'static str) {
    for pid in manager.active_processes() {
        manager.dump_process(pid, writer.callback(reason));
    }
}

// ============================================================================
// Socket side (tokio runtime)
// ============================================================================

async fn accept_clients(listener: UnixListener, manager: ManagerHandle, writer: DumpWriter) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handshake(stream, manager.clone(), writer.clone()));
            }
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(TICK).await;
            }
        }
    }
}

/// Read the client's pid announcement, then hand the stream to the manager
async fn handshake(mut stream: UnixStream, manager: ManagerHandle, writer: DumpWriter) {
    let mut announcement = [0u8; HANDSHAKE_LEN];
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut announcement)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            warn!("Client disconnected before announcing its pid: {e}");
            return;
        }
        Err(_) => {
            warn!("Client did not announce its pid within {HANDSHAKE_TIMEOUT:?}");
            return;
        }
    }

    let pid = Pid(u32::from_le_bytes(announcement));
    let name = match lookup_process(pid) {
        Ok(info) => {
            match &info.exe_path {
                Some(exe) => info!("{pid} is {} ({})", info.command, exe.display()),
                None => info!("{pid} is {}", info.command),
            }
            Some(info.command)
        }
        Err(e) => {
            debug!("No process info for {pid}: {e:#}");
            None
        }
    };

    let posted = manager.post(move |m| {
        match m.on_new_connection(pid, Box::new(StreamPipe::new(stream))) {
            Ok(()) => {
                if let Some(name) = name {
                    writer.remember_name(pid, name);
                }
            }
            Err(e) => debug!("Dropping client stream: {e}"),
        }
    });
    if !posted {
        debug!("Manager gone; dropping {pid}");
    }
}

// ============================================================================
// Main
// ============================================================================

fn run() -> Result<()> {
    let args = Args::parse();
    validate_args(&args)?;
    let quiet = args.quiet;

    run_preflight_checks(&args.socket, &args.dump_dir)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("memlog-io")
        .enable_all()
        .build()
        .context("Failed to start I/O runtime")?;

    let listener = {
        let _guard = runtime.enter();
        UnixListener::bind(&args.socket)
            .with_context(|| format!("Failed to bind {}", args.socket.display()))?
    };

    let limits =
        ParserLimits { max_frames: args.max_frames, max_context_len: args.max_context_len };
    let mut manager = ConnectionManager::new(runtime.handle().clone(), ManagerConfig { limits });

    let exporter = HeapDumpExporter::new(HeapDumpOptions {
        min_group_bytes: args.min_group_bytes,
        include_addresses: !args.no_addresses,
        gzip: args.gzip,
    });
    let writer = DumpWriter::new(exporter, args.dump_dir.clone(), quiet);

    let completed = Arc::new(AtomicU64::new(0));
    {
        let writer = writer.clone();
        let completed = Arc::clone(&completed);
        manager.set_completion_handler(move |report| {
            completed.fetch_add(1, Ordering::SeqCst);
            match &report.outcome {
                Ok(snapshot) => writer.write(snapshot, "final"),
                Err(e) => warn!("{}: no final dump: {e}", report.pid),
            }
            debug!("{}: {:?}", report.pid, report.stats);
            writer.forget(report.pid);
        });
    }

    if !quiet {
        println!("memlog v{}", env!("CARGO_PKG_VERSION"));
        println!("socket: {}", args.socket.display());
        println!("dumps: {}", args.dump_dir.display());
    }

    runtime.spawn(accept_clients(listener, manager.handle(), writer.clone()));

    // Setup Ctrl+C handler
    {
        let handle = manager.handle();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.quit();
            }
        });
    }

    let started = Instant::now();
    let dump_interval =
        if args.dump_interval > 0 { Some(Duration::from_secs(args.dump_interval)) } else { None };
    let mut last_dump = Instant::now();

    // Main loop: manager tasks plus periodic dumps
    while !manager.quit_requested() {
        manager.run_once(TICK);

        if let Some(interval) = dump_interval {
            if last_dump.elapsed() >= interval {
                dump_all(&mut manager, &writer, "periodic");
                last_dump = Instant::now();
            }
        }
    }

    let live = manager.connection_count();
    dump_all(&mut manager, &writer, "exit");
    if !manager.run_until(SHUTDOWN_TIMEOUT, |_| writer.in_flight() == 0) {
        warn!("{} exit dump(s) still pending after {SHUTDOWN_TIMEOUT:?}", writer.in_flight());
    }

    drop(manager);
    runtime.shutdown_timeout(Duration::from_secs(1));
    let _ = std::fs::remove_file(&args.socket);

    if !quiet {
        eprintln!(
            "\ninterrupted: {:.1}s, {} client(s) completed, {} still connected, {} dump(s) written",
            started.elapsed().as_secs_f64(),
            completed.load(Ordering::SeqCst),
            live,
            writer.written(),
        );
    }

    Ok(())
}
