//! Identify connected client processes from `/proc`.
//!
//! Everything here is best-effort: clients may exit before the lookup, and
//! non-Linux hosts have no `/proc` at all. Heap dumps simply omit what could
//! not be resolved.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::domain::Pid;

/// What `/proc` knows about a client process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub command: String,
    pub exe_path: Option<PathBuf>,
}

/// Look up a client process.
///
/// # Errors
/// Returns error if `/proc/<pid>/stat` is missing or unreadable.
pub fn lookup_process(pid: Pid) -> Result<ProcessInfo> {
    let stat_path = format!("/proc/{}/stat", pid.0);
    let stat = fs::read_to_string(&stat_path).with_context(|| format!("Cannot read {stat_path}"))?;
    let command = extract_comm(&stat)?;

    // Unreadable for other users' processes unless running as root
    let exe_path = fs::read_link(format!("/proc/{}/exe", pid.0)).ok();

    Ok(ProcessInfo { pid, command, exe_path })
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_comm() {
        let stat = "1234 (renderer) S 1 1234 1234 0 -1 4194304";
        assert_eq!(extract_comm(stat).unwrap(), "renderer");
    }

    #[test]
    fn test_extract_comm_with_parens() {
        // Command names can contain parentheses
        let stat = "1234 (app (v2)) S 1 1234";
        assert_eq!(extract_comm(stat).unwrap(), "app (v2)");
    }

    #[test]
    fn test_extract_comm_rejects_garbage() {
        assert!(extract_comm("1234 S 1").is_err());
        assert!(extract_comm("1234 )x( S").is_err());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_lookup_self() {
        let info = lookup_process(Pid(std::process::id())).unwrap();
        assert!(!info.command.is_empty());
    }

    #[test]
    fn test_unknown_process_fails() {
        assert!(lookup_process(Pid(u32::MAX)).is_err());
    }
}
