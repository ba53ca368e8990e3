//! Network namespace entry for the calling thread.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::sched::{setns, CloneFlags};
use tracing::{debug, error};

use crate::NetworkError;

/// Namespace of the calling thread (not the process leader's).
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Moves the calling thread into a network namespace and moves it back on drop.
///
/// Namespace membership is per thread. Callers must not let the runtime
/// migrate work to another thread while the guard is alive.
#[derive(Debug)]
pub struct NamespaceGuard {
    original: File,
    target: PathBuf,
}

impl NamespaceGuard {
    /// Enter the namespace at `path`.
    pub fn enter(path: &Path) -> Result<Self, NetworkError> {
        let target = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => NetworkError::NamespaceNotFound(path.display().to_string()),
            _ => NetworkError::Namespace(format!("failed to open {}: {}", path.display(), e)),
        })?;
        let original = File::open(THREAD_NETNS).map_err(|e| {
            NetworkError::Namespace(format!("failed to open current namespace: {}", e))
        })?;

        setns(&target, CloneFlags::CLONE_NEWNET).map_err(|e| {
            NetworkError::Namespace(format!("setns into {} failed: {}", path.display(), e))
        })?;

        debug!(netns = %path.display(), "entered network namespace");

        Ok(Self {
            original,
            target: path.to_path_buf(),
        })
    }

    /// Path that refers to the namespace the thread came from.
    ///
    /// Child processes spawned while the guard is alive can open it, so it
    /// works as a `netns` argument to `ip link set`.
    pub fn origin_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/proc/{}/fd/{}",
            std::process::id(),
            self.original.as_raw_fd()
        ))
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        match setns(&self.original, CloneFlags::CLONE_NEWNET) {
            Ok(()) => debug!(netns = %self.target.display(), "left network namespace"),
            Err(e) => error!(
                netns = %self.target.display(),
                error = %e,
                "Failed to restore original network namespace"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_namespace_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = NamespaceGuard::enter(&dir.path().join("gone")).unwrap_err();
        assert!(err.is_namespace_not_found());
    }

    #[test]
    fn test_non_namespace_file_is_not_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"").unwrap();

        let err = NamespaceGuard::enter(&path).unwrap_err();
        assert!(matches!(err, NetworkError::Namespace(_)));
    }
}
