//! Named Unix-domain socket helpers.
//!
//! Every relay endpoint binds a stream socket under the configured socket
//! directory; the upstream side is reached by connecting to a socket in the
//! same directory.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::error::{RelayError, Result};

/// `sun_path` is 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
const MAX_SOCK_PATH: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_SOCK_PATH: usize = 104;

/// Ownership and mode applied to freshly bound socket files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketPerms {
    /// Permission bits, e.g. `0o660`.
    pub mode: u32,
    /// Owning uid, if it should be changed.
    pub owner: Option<u32>,
    /// Owning gid, if it should be changed.
    pub group: Option<u32>,
}

impl Default for SocketPerms {
    fn default() -> Self {
        Self {
            mode: 0o660,
            owner: None,
            group: None,
        }
    }
}

/// Bind a non-blocking listener at `path`.
///
/// Removes any stale socket file, creates the parent directory, then applies
/// `perms` to the new socket file.
pub fn bind_listener(path: &Path, perms: &SocketPerms) -> Result<UnixListener> {
    let path_len = path.as_os_str().len();
    if path_len >= MAX_SOCK_PATH {
        return Err(RelayError::Config(format!(
            "socket path too long ({path_len} bytes, max {}): {}",
            MAX_SOCK_PATH - 1,
            path.display()
        )));
    }

    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("[socket] removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(RelayError::Io(e)),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(perms.mode))?;
    if perms.owner.is_some() || perms.group.is_some() {
        std::os::unix::fs::chown(path, perms.owner, perms.group)?;
    }
    listener.set_nonblocking(true)?;

    log::info!("[socket] listening on {} (mode {:o})", path.display(), perms.mode);
    Ok(listener)
}

/// Connect to the socket at `path` and mark the stream non-blocking.
pub fn connect(path: &Path) -> Result<UnixStream> {
    let stream = UnixStream::connect(path)
        .map_err(|e| RelayError::UpstreamUnavailable(format!("{}: {e}", path.display())))?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Block until `path` exists, re-checking every `retry`.
pub fn wait_for_path(path: &Path, retry: Duration) {
    let mut logged = false;
    while !path.exists() {
        if !logged {
            log::info!("[socket] waiting for {} to appear", path.display());
            logged = true;
        }
        thread::sleep(retry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn test_bind_replaces_stale_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("stale.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        let _listener = bind_listener(&path, &SocketPerms::default()).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o660);
        assert!(UnixStream::connect(&path).is_ok());
    }

    #[test]
    fn test_bind_applies_mode() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("mode.sock");
        let perms = SocketPerms { mode: 0o600, ..SocketPerms::default() };
        let _listener = bind_listener(&path, &perms).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o600);
    }

    #[test]
    fn test_overlong_path_rejected() {
        let long = format!("/tmp/{}.sock", "x".repeat(MAX_SOCK_PATH));
        let err = bind_listener(Path::new(&long), &SocketPerms::default()).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_connect_missing_socket_is_unavailable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = connect(&tmp.path().join("absent.sock")).unwrap_err();
        assert!(matches!(err, RelayError::UpstreamUnavailable(_)));
    }

    #[test]
    fn test_wait_for_path_returns_once_created() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("late");
        let writer_path = path.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            std::fs::write(writer_path, b"").unwrap();
        });
        wait_for_path(&path, Duration::from_millis(10));
        assert!(path.exists());
        handle.join().unwrap();
    }
}
