use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{lock_path_for, open_and_try_lock, TryLock};
use crate::error::{Result, StoreError};

/// Diagnostic metadata written into a held leader lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub pid: u32,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

/// Long-lived exclusive lock electing a single holder (e.g. the staging merger).
///
/// Unlike [`super::with_lock`] sections, a leader lock is held for the lifetime of the value.
/// The OS drops the advisory lock if the holder dies, so no staleness heuristic is needed.
#[derive(Debug)]
pub struct LeaderLock {
    lock_path: PathBuf,
    file: Option<File>,
}

impl LeaderLock {
    /// Attempts to become leader without waiting. Returns `None` if another holder exists.
    pub fn try_acquire(target: &Path) -> Result<Option<Self>> {
        let lock_path = lock_path_for(target);
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        match open_and_try_lock(&lock_path).map_err(|e| StoreError::io(&lock_path, e))? {
            TryLock::Locked(mut file) => {
                let info = LeaderInfo {
                    pid: std::process::id(),
                    acquired_at: chrono::Utc::now(),
                };
                write_info(&mut file, &info).map_err(|e| StoreError::io(&lock_path, e))?;
                info!(path = %lock_path.display(), pid = info.pid, "leader lock acquired");
                Ok(Some(Self {
                    lock_path,
                    file: Some(file),
                }))
            }
            TryLock::Contended => {
                debug!(path = %lock_path.display(), "leader lock held elsewhere");
                Ok(None)
            }
            TryLock::Unsupported => Err(StoreError::io(
                &lock_path,
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    "advisory locks are required for leader election",
                ),
            )),
        }
    }

    /// Waits up to `timeout` to become leader, polling every `poll`.
    pub fn acquire(target: &Path, timeout: Duration, poll: Duration) -> Result<Self> {
        let start = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(target)? {
                return Ok(lock);
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(StoreError::LockTimeout {
                    path: target.to_path_buf(),
                    waited,
                });
            }
            std::thread::sleep(poll.min(timeout - waited));
        }
    }

    /// Reads the diagnostic metadata of the current holder, if any.
    pub fn holder(target: &Path) -> Option<LeaderInfo> {
        let data = fs::read(lock_path_for(target)).ok()?;
        serde_json::from_slice(&data).ok()
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.lock_path.display(), error = %e, "failed to remove leader lock");
            }
        }
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
        debug!(path = %self.lock_path.display(), "leader lock released");
    }
}

fn write_info(file: &mut File, info: &LeaderInfo) -> io::Result<()> {
    let data = serde_json::to_vec(info).map_err(io::Error::other)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&data)?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_one_leader() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("merger");

        let first = LeaderLock::try_acquire(&target)
            .expect("try")
            .expect("first becomes leader");
        assert!(LeaderLock::try_acquire(&target).expect("try").is_none());

        let holder = LeaderLock::holder(&target).expect("holder info");
        assert_eq!(holder.pid, std::process::id());

        drop(first);
        assert!(!lock_path_for(&target).exists());
        assert!(LeaderLock::try_acquire(&target).expect("try").is_some());
    }

    #[test]
    fn test_independent_targets_do_not_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = LeaderLock::try_acquire(&dir.path().join("a")).expect("try");
        let b = LeaderLock::try_acquire(&dir.path().join("b")).expect("try");
        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[test]
    fn test_acquire_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("merger");
        let _held = LeaderLock::try_acquire(&target).expect("try").expect("leader");

        let err = LeaderLock::acquire(&target, Duration::from_millis(50), Duration::from_millis(10))
            .expect_err("must time out");
        assert!(err.is_lock_timeout());
    }
}
