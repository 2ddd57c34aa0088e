//! Process-level lock guarding the retry queue directory.
//!
//! Only one process may own a queue at a time: the daemon holds the lock for
//! its whole lifetime, and `devtrack-queue` takes it for the duration of a
//! command. Locks are advisory OS file locks (flock) kept under
//! `$XDG_RUNTIME_DIR/devtrack/`, scoped by the queue directory path.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const QUEUE_LOCK_FILE: &str = "devtrack-queue.lock";

/// Held while this process owns the queue directory.
pub struct QueueGuard {
    _lock: ProcessLock,
}

/// Take exclusive ownership of `queue_dir`, failing if another devtrack
/// process already holds it.
pub fn acquire_queue_guard(queue_dir: &Path, holder: &str) -> Result<QueueGuard> {
    match try_acquire_lock(QUEUE_LOCK_FILE, queue_dir)? {
        LockAttempt::Acquired(lock) => Ok(QueueGuard { _lock: lock }),
        LockAttempt::Held { owner_pid } => {
            let owner = owner_pid
                .map(|pid| format!(" (pid {pid})"))
                .unwrap_or_default();
            anyhow::bail!(
                "refusing to start {}: another devtrack process{} owns the queue at {}",
                holder,
                owner,
                queue_dir.display()
            )
        }
    }
}

enum LockAttempt {
    Acquired(ProcessLock),
    Held { owner_pid: Option<u32> },
}

struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

fn try_acquire_lock(filename: &str, queue_dir: &Path) -> Result<LockAttempt> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(filename, queue_dir));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Read back by a refused process for its error message
            if let Err(e) = write_owner_info(&mut file, queue_dir) {
                tracing::debug!(path = %path.display(), error = %e, "Could not record lock owner");
            }

            Ok(LockAttempt::Acquired(ProcessLock { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(LockAttempt::Held {
            owner_pid: read_owner_pid(&path),
        }),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn write_owner_info(file: &mut File, queue_dir: &Path) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "pid={}", std::process::id())?;
    writeln!(file, "queue={}", queue_dir.display())?;
    file.flush()
}

fn read_owner_pid(path: &Path) -> Option<u32> {
    let info = fs::read_to_string(path).ok()?;
    info.lines()
        .find_map(|line| line.strip_prefix("pid="))
        .and_then(|pid| pid.trim().parse().ok())
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("devtrack");
    dir
}

fn scoped_lock_filename(base_filename: &str, queue_dir: &Path) -> String {
    // Relative and absolute spellings of one directory must share a lock.
    let queue_dir = queue_dir
        .canonicalize()
        .unwrap_or_else(|_| queue_dir.to_path_buf());
    let mut hasher = DefaultHasher::new();
    queue_dir.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("devtrack process locks currently require Unix (Linux)");
