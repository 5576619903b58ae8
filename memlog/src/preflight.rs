//! Pre-flight checks for memlog
//!
//! Validates the socket and dump locations before the daemon starts
//! accepting clients. Provides clear, actionable error messages when
//! something is wrong.

use anyhow::{bail, Context, Result};
use log::info;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Run all pre-flight checks before binding the socket
pub fn run_preflight_checks(socket_path: &Path, dump_dir: &Path) -> Result<()> {
    check_socket_path(socket_path)?;
    check_dump_dir(dump_dir)?;
    Ok(())
}

/// Make sure `socket_path` can be bound.
///
/// A socket file left behind by a crashed daemon is removed. A live one
/// means another daemon is running.
pub fn check_socket_path(socket_path: &Path) -> Result<()> {
    if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.is_dir() {
            bail!(
                "Socket directory not found: {}\n\n\
                 Create it first or pass a different --socket path.",
                parent.display()
            );
        }
    }

    let Ok(metadata) = fs::symlink_metadata(socket_path) else {
        return Ok(());
    };

    if !metadata.file_type().is_socket() {
        bail!(
            "Not a socket: {}\n\n\
             Refusing to replace an existing file. Pass a different --socket path.",
            socket_path.display()
        );
    }

    if UnixStream::connect(socket_path).is_ok() {
        bail!(
            "Socket {} is in use.\n\n\
             Another memlog daemon is already listening there.",
            socket_path.display()
        );
    }

    fs::remove_file(socket_path)
        .with_context(|| format!("Failed to remove stale socket {}", socket_path.display()))?;
    info!("Removed stale socket {}", socket_path.display());
    Ok(())
}

/// Make sure heap dumps can be written to `dump_dir`, creating it if needed
pub fn check_dump_dir(dump_dir: &Path) -> Result<()> {
    fs::create_dir_all(dump_dir)
        .with_context(|| format!("Failed to create dump directory {}", dump_dir.display()))?;

    let probe = dump_dir.join(".memlog-write-test");
    fs::write(&probe, b"").with_context(|| {
        format!(
            "Cannot write to {}\n\n\
             Check directory permissions or pass a different --dump-dir.",
            dump_dir.display()
        )
    })?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_missing_socket_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_socket_path(&dir.path().join("memlog.sock")).is_ok());
    }

    #[test]
    fn test_socket_directory_not_found() {
        let result = check_socket_path(Path::new("/nonexistent/dir/memlog.sock"));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Socket directory not found"));
    }

    #[test]
    fn test_regular_file_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memlog.sock");
        fs::write(&path, b"data").unwrap();

        let err = check_socket_path(&path).unwrap_err().to_string();
        assert!(err.contains("Not a socket"));
        assert!(path.exists());
    }

    #[test]
    fn test_stale_socket_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memlog.sock");
        drop(UnixListener::bind(&path).unwrap());

        check_socket_path(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_live_socket_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memlog.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        let err = check_socket_path(&path).unwrap_err().to_string();
        assert!(err.contains("in use"));
    }

    #[test]
    fn test_dump_dir_created() {
        let dir = tempfile::tempdir().unwrap();
        let dumps = dir.path().join("a/b");

        check_dump_dir(&dumps).unwrap();
        assert!(dumps.is_dir());
        assert_eq!(fs::read_dir(&dumps).unwrap().count(), 0);
    }
}
