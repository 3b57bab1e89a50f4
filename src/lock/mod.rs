//! Advisory file locking and crash-safe JSON persistence.
//!
//! Every shared file `<target>` is protected by a sibling `<target>.lock`. The lock file only
//! exists for the duration of a critical section and holds the owner pid for diagnostics.
//! Writes always go through a temp file in the target's directory followed by an atomic
//! rename, so readers observe either the previous or the new version of a file.

pub mod leader;

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::{LockConfig, LockStrategy};
use crate::error::{Result, StoreError};

pub use self::leader::LeaderLock;

/// Lock acquisition parameters.
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub timeout: Duration,
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
    pub stale_after: Duration,
    pub strategy: LockStrategy,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(cfg: &LockConfig) -> Self {
        Self {
            timeout: cfg.timeout,
            retry_interval: cfg.retry_interval,
            max_retry_interval: cfg.max_retry_interval,
            stale_after: cfg.stale_after,
            strategy: cfg.strategy,
        }
    }
}

/// Returns the sibling lock path for a protected target.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("store"));
    name.push(".lock");
    target.with_file_name(name)
}

/// Held exclusive lock on a target. Released (and the lock file removed) on drop.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    file: Option<File>,
    strategy: LockStrategy,
}

impl LockGuard {
    /// Path of the lock file backing this guard.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Strategy that actually obtained the lock.
    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Unlink while still holding the lock; waiters on the old inode detect the
        // mismatch and retry against a fresh file.
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.lock_path.display(), error = %e, "failed to remove lock file");
            }
        }
        if let Some(file) = self.file.take() {
            if self.strategy == LockStrategy::Native {
                let _ = FileExt::unlock(&file);
            }
        }
    }
}

enum Attempt {
    Acquired(LockGuard),
    Busy,
    Unsupported,
}

/// Blocks until the lock on `target` is obtained or `opts.timeout` elapses.
pub fn acquire(target: &Path, opts: &LockOptions) -> Result<LockGuard> {
    let lock_path = lock_path_for(target);
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
    }

    let start = Instant::now();
    let mut delay = opts.retry_interval;
    let mut strategy = opts.strategy;

    loop {
        let attempt = match strategy {
            LockStrategy::Native => try_native(&lock_path),
            LockStrategy::CreateExclusive => try_create_exclusive(&lock_path, opts.stale_after),
        }
        .map_err(|e| StoreError::io(&lock_path, e))?;

        match attempt {
            Attempt::Acquired(guard) => {
                debug!(path = %lock_path.display(), waited = ?start.elapsed(), "lock acquired");
                return Ok(guard);
            }
            Attempt::Unsupported => {
                warn!(
                    path = %lock_path.display(),
                    "advisory locks unsupported, falling back to exclusive create",
                );
                strategy = LockStrategy::CreateExclusive;
                continue;
            }
            Attempt::Busy => {}
        }

        let waited = start.elapsed();
        if waited >= opts.timeout {
            warn!(path = %lock_path.display(), ?waited, "lock acquisition timed out");
            return Err(StoreError::LockTimeout {
                path: target.to_path_buf(),
                waited,
            });
        }

        std::thread::sleep(delay.min(opts.timeout - waited));
        delay = (delay * 2).min(opts.max_retry_interval);
    }
}

/// Runs `f` while holding the lock on `target`. The lock is released on every exit path.
pub fn with_lock<T>(
    target: &Path,
    opts: &LockOptions,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let guard = acquire(target, opts)?;
    let result = f();
    drop(guard);
    result
}

fn try_native(lock_path: &Path) -> io::Result<Attempt> {
    match open_and_try_lock(lock_path)? {
        TryLock::Locked(mut file) => {
            write_owner_pid(&mut file)?;
            Ok(Attempt::Acquired(LockGuard {
                lock_path: lock_path.to_path_buf(),
                file: Some(file),
                strategy: LockStrategy::Native,
            }))
        }
        TryLock::Contended => Ok(Attempt::Busy),
        TryLock::Unsupported => Ok(Attempt::Unsupported),
    }
}

fn try_create_exclusive(lock_path: &Path, stale_after: Duration) -> io::Result<Attempt> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(mut file) => {
            write_owner_pid(&mut file)?;
            Ok(Attempt::Acquired(LockGuard {
                lock_path: lock_path.to_path_buf(),
                file: Some(file),
                strategy: LockStrategy::CreateExclusive,
            }))
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if is_stale(lock_path, stale_after) {
                let owner = fs::read_to_string(lock_path).unwrap_or_default();
                warn!(
                    path = %lock_path.display(),
                    owner = owner.trim(),
                    "removing stale lock file",
                );
                // Re-check right before removal to narrow the window against a fresh holder.
                if is_stale(lock_path, stale_after) {
                    match fs::remove_file(lock_path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok(Attempt::Busy)
        }
        Err(e) => Err(e),
    }
}

fn is_stale(lock_path: &Path, stale_after: Duration) -> bool {
    fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .is_some_and(|age| age > stale_after)
}

pub(crate) enum TryLock {
    Locked(File),
    Contended,
    Unsupported,
}

/// Opens (creating if needed) `lock_path` and attempts a non-blocking exclusive lock.
///
/// Verifies that the locked handle is still the file at `lock_path`; a releasing holder
/// unlinks the path, so a stale handle reports `Contended` and the caller retries.
pub(crate) fn open_and_try_lock(lock_path: &Path) -> io::Result<TryLock> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            if same_file(&file, lock_path) {
                Ok(TryLock::Locked(file))
            } else {
                let _ = FileExt::unlock(&file);
                Ok(TryLock::Contended)
            }
        }
        Err(e) if is_contended(&e) => Ok(TryLock::Contended),
        Err(e) if e.kind() == io::ErrorKind::Unsupported => Ok(TryLock::Unsupported),
        Err(e) => Err(e),
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

fn write_owner_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

// --- Atomic persistence ---

/// Replaces `path` with `bytes` via a synced temp file and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(&dir)
        .map_err(|e| StoreError::io(&dir, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Serializes `value` as pretty JSON and atomically replaces `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::json(path, e))?;
    write_atomic(path, &bytes)
}

/// Wall-clock microseconds, strictly increasing within this process.
///
/// Used in producer-private file names (`<prefix>_<pid>_<micros>.json`) so two files written
/// by one process in the same microsecond never collide.
pub fn unique_timestamp_micros() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);

    let now = chrono::Utc::now().timestamp_micros();
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Result of loading a shared JSON file.
#[derive(Debug)]
pub enum Loaded<T> {
    /// The file does not exist yet.
    Missing,
    /// The file parsed successfully.
    Present(T),
    /// The file failed to parse and was renamed aside.
    Quarantined(PathBuf),
}

impl<T> Loaded<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Present(v) => Some(v),
            Self::Missing | Self::Quarantined(_) => None,
        }
    }
}

/// Loads a JSON file without locking. Unparseable files are renamed aside, never discarded.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Loaded<T>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Loaded::Present(value)),
        Err(parse_err) => {
            let quarantined_to = quarantine(path)?;
            // Recovered locally: the caller continues with an empty value.
            let corrupt = StoreError::CorruptStore {
                path: path.to_path_buf(),
                quarantined_to: quarantined_to.clone(),
            };
            error!(error = %corrupt, cause = %parse_err, "starting empty");
            Ok(Loaded::Quarantined(quarantined_to))
        }
    }
}

fn quarantine(path: &Path) -> Result<PathBuf> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%6f");
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("store"));
    name.push(format!(".corrupt-{stamp}"));
    let target = path.with_file_name(name);
    fs::rename(path, &target).map_err(|e| StoreError::io(path, e))?;
    Ok(target)
}

/// Reads a JSON file under its lock.
pub fn read_json_safe<T: DeserializeOwned>(path: &Path, opts: &LockOptions) -> Result<Loaded<T>> {
    with_lock(path, opts, || load_json(path))
}

/// Atomically writes a JSON file under its lock.
pub fn write_json_safe<T: Serialize + ?Sized>(
    path: &Path,
    opts: &LockOptions,
    value: &T,
) -> Result<()> {
    with_lock(path, opts, || write_json_atomic(path, value))
}

/// Read-modify-write of a JSON file inside one critical section.
///
/// `update` receives the current value (`None` if missing or quarantined) and returns the
/// value to persist. Nothing is written if `update` fails.
pub fn update_json_safe<T, F>(path: &Path, opts: &LockOptions, update: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(Option<T>) -> Result<T>,
{
    with_lock(path, opts, || {
        let current = load_json(path)?.into_option();
        let next = update(current)?;
        write_json_atomic(path, &next)?;
        Ok(next)
    })
}
