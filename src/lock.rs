use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::{log_info, log_warn};

pub const LOCK_FILE_NAME: &str = "build-golem.lock";

/// Exclusive claim on a project's trace socket.
///
/// Runs of the same project share one socket path, so only the lock holder
/// may bind it. The holder's PID is stored in the lock file itself. Dropping
/// the lock removes the socket and releases the file lock.
#[must_use = "the run lock is released when RunLock is dropped"]
pub struct RunLock {
    file: fslock::LockFile,
    socket_path: PathBuf,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock")
            .field("socket_path", &self.socket_path)
            .finish()
    }
}

impl RunLock {
    /// Socket path this lock guards.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Claim `socket_path` for this process, with the lock file in `runtime_dir`.
///
/// A socket left on disk while nobody holds the lock belongs to a run that
/// died without cleaning up, and is removed.
pub fn acquire(runtime_dir: &Path, socket_path: &Path) -> Result<RunLock, String> {
    fs::create_dir_all(runtime_dir)
        .map_err(|e| format!("Failed to create {}: {}", runtime_dir.display(), e))?;

    let lock_path = runtime_dir.join(LOCK_FILE_NAME);
    let mut file = fslock::LockFile::open(&lock_path)
        .map_err(|e| format!("Failed to open lock file {}: {}", lock_path.display(), e))?;

    let acquired = file
        .try_lock_with_pid()
        .map_err(|e| format!("Failed to lock {}: {}", lock_path.display(), e))?;
    if !acquired {
        return Err(match holder_pid(&lock_path) {
            Some(pid) => format!("Another build-golem run is in progress (PID {})", pid),
            None => format!(
                "Another build-golem run holds {}",
                lock_path.display()
            ),
        });
    }

    match fs::remove_file(socket_path) {
        Ok(()) => log_info!(
            "[pre] Removed trace socket left by an earlier run: {}",
            socket_path.display()
        ),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(format!(
                "Failed to remove stale trace socket {}: {}",
                socket_path.display(),
                e
            ))
        }
    }

    Ok(RunLock {
        file,
        socket_path: socket_path.to_path_buf(),
    })
}

/// PID recorded by the current holder, if it wrote one.
fn holder_pid(lock_path: &Path) -> Option<u32> {
    fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.socket_path) {
            if e.kind() != ErrorKind::NotFound {
                log_warn!(
                    "Warning: Failed to remove trace socket {}: {}",
                    self.socket_path.display(),
                    e
                );
            }
        }
        if let Err(e) = self.file.unlock() {
            log_warn!("Warning: Failed to release run lock: {}", e);
        }
    }
}
