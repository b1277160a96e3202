//! PID-based run locks.
//!
//! Two named locks guard a run: `snapshot` (held by the driver for the
//! whole run) and `send` (held around each transfer). A lock is a file
//! containing the owner's PID. A file owned by a live process means
//! another run is active; a file owned by a dead process is reported as
//! stale and left in place for the operator to remove. The guard removes
//! its own file on drop, so every exit path releases.

use crate::error::LockError;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// An acquired lock; dropping it releases the file.
#[derive(Debug)]
pub struct LockFile {
    name: String,
    path: PathBuf,
}

impl LockFile {
    /// Acquire the named lock under `dir`.
    ///
    /// Fails with [`LockError::Held`] when the owning process is still
    /// alive and [`LockError::Stale`] when it is not. Stale files are
    /// never removed here.
    pub fn acquire(dir: &Path, name: &str) -> Result<Self, LockError> {
        let path = dir.join(format!("xync.{name}.lock"));

        if path.exists() {
            let pid = read_pid(&path);
            match pid {
                Some(pid) if is_process_running(pid) => {
                    return Err(LockError::Held {
                        name: name.to_string(),
                        pid,
                        path,
                    });
                }
                pid => {
                    return Err(LockError::Stale {
                        name: name.to_string(),
                        pid: pid.unwrap_or(0),
                        path,
                    });
                }
            }
        }

        let io_err = |source| LockError::Io {
            name: name.to_string(),
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(io_err)?;
        let mut file = File::create(&path).map_err(io_err)?;
        write!(file, "{}", std::process::id()).map_err(io_err)?;

        debug!(lock = name, path = %path.display(), "acquired lock");
        Ok(Self {
            name: name.to_string(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        debug!(lock = %self.name, "releasing lock");
        let _ = fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut contents))
        .ok()?;
    contents.trim().parse().ok()
}

/// Check whether a process with the given PID is still alive.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        std::process::Command::new("ps")
            .args(["-p", &pid.to_string()])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_writes_own_pid() {
        let dir = TempDir::new().unwrap();
        let lock = LockFile::acquire(dir.path(), "snapshot").unwrap();
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn drop_removes_lock_file() {
        let dir = TempDir::new().unwrap();
        let path = {
            let lock = LockFile::acquire(dir.path(), "send").unwrap();
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_reports_held() {
        let dir = TempDir::new().unwrap();
        let _first = LockFile::acquire(dir.path(), "snapshot").unwrap();
        // Same process, so the PID in the file is alive.
        match LockFile::acquire(dir.path(), "snapshot") {
            Err(LockError::Held { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[test]
    fn dead_pid_reports_stale_and_keeps_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("xync.snapshot.lock");
        fs::write(&path, "999999999").unwrap();

        match LockFile::acquire(dir.path(), "snapshot") {
            Err(LockError::Stale { pid, .. }) => assert_eq!(pid, 999_999_999),
            other => panic!("expected Stale, got {other:?}"),
        }
        // Stale files are operator-owned; they must survive the attempt.
        assert!(path.exists());
    }

    #[test]
    fn garbage_lock_file_reports_stale() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("xync.send.lock"), "not-a-pid").unwrap();
        assert!(matches!(
            LockFile::acquire(dir.path(), "send"),
            Err(LockError::Stale { pid: 0, .. })
        ));
    }

    #[test]
    fn distinct_names_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let _snap = LockFile::acquire(dir.path(), "snapshot").unwrap();
        let _send = LockFile::acquire(dir.path(), "send").unwrap();
    }
}
