//! CLI argument definitions

use clap::Parser;
use memlog_common::{DEFAULT_MAX_CONTEXT_LEN, DEFAULT_MAX_FRAMES};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "memlog",
    about = "Collect allocation events from instrumented processes and write heap dumps",
    after_help = "\
EXAMPLES:
    memlog                                         Listen on /tmp/memlog.sock
    memlog --socket /run/memlog.sock --gzip        Compressed dumps
    memlog --dump-interval 30 --min-group-bytes 4096
                                                   Dump every 30s, fold small groups

CLIENT PROTOCOL:
    Connect to the socket, send the process id as 4 little-endian bytes,
    then stream ALLOC / FREE / BARRIER records."
)]
pub struct Args {
    /// Unix socket to accept clients on
    #[arg(short, long, value_name = "PATH", default_value = "/tmp/memlog.sock")]
    pub socket: PathBuf,

    /// Directory heap dumps are written to
    #[arg(short, long, value_name = "DIR", default_value = "memlog-dumps")]
    pub dump_dir: PathBuf,

    /// Gzip heap dumps
    #[arg(long)]
    pub gzip: bool,

    /// Dump every live process every N seconds (0 = only at exit)
    #[arg(long, value_name = "SECS", default_value = "0")]
    pub dump_interval: u64,

    /// Fold backtraces holding fewer live bytes into one "other" entry
    #[arg(long, value_name = "BYTES", default_value = "0")]
    pub min_group_bytes: u64,

    /// Omit per-allocation addresses from heap dumps
    #[arg(long)]
    pub no_addresses: bool,

    /// Maximum frames accepted per allocation backtrace
    #[arg(long, default_value_t = DEFAULT_MAX_FRAMES)]
    pub max_frames: usize,

    /// Maximum allocation context length in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_CONTEXT_LEN)]
    pub max_context_len: usize,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
