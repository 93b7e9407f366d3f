//! Single-instance lock
//!
//! Two assistants would fight over the microphone, so a second process
//! refuses to start while the first holds `hearken.lock`.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::{Error, Result};

/// Lock file name inside the state directory
pub const LOCK_FILE_NAME: &str = "hearken.lock";

/// An unreadable lock younger than this may belong to a starting process
const LOCK_WRITE_GRACE: Duration = Duration::from_secs(5);

/// Held for the lifetime of the process; removes the lock file on drop
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock in `dir`, reclaiming it from a dead holder
    ///
    /// The pid is staged in a temporary file and linked into place, so a lock
    /// file never exists without its content.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if a live process holds the lock, or an IO
    /// error if the lock file cannot be written
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE_NAME);

        let mut staged = tempfile::Builder::new()
            .prefix(".hearken-lock")
            .tempfile_in(dir)?;
        writeln!(staged, "{}", std::process::id())?;
        staged.as_file().sync_all()?;

        // One reclaim attempt; a second collision means a live racer won
        for _ in 0..2 {
            match staged.persist_noclobber(&path) {
                Ok(_) => {
                    tracing::debug!(path = %path.display(), "instance lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                    staged = e.file;
                    reclaim_if_stale(&path)?;
                }
                Err(e) => return Err(e.error.into()),
            }
        }

        Err(Error::AlreadyRunning(format!(
            "lost the race for {}",
            path.display()
        )))
    }

    /// Path of the lock file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove instance lock"
            );
        }
    }
}

/// Remove the lock at `path` unless a live process may own it
fn reclaim_if_stale(path: &Path) -> Result<()> {
    let holder = read_holder(path);
    match holder {
        Some(pid) if pid != std::process::id() && is_process_running(pid) => {
            return Err(Error::AlreadyRunning(format!(
                "pid {pid} holds {}",
                path.display()
            )));
        }
        None if is_fresh(path) => {
            return Err(Error::AlreadyRunning(format!(
                "{} is being written by another process",
                path.display()
            )));
        }
        _ => {}
    }

    tracing::warn!(path = %path.display(), holder = ?holder, "removing stale instance lock");
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_fresh(path: &Path) -> bool {
    let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) else {
        return false;
    };
    // A timestamp in the future counts as fresh
    match modified.elapsed() {
        Ok(age) => age < LOCK_WRITE_GRACE,
        Err(_) => true,
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn is_process_running(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Without a cheap liveness check, any recorded holder counts as live
#[cfg(not(target_os = "linux"))]
fn is_process_running(_pid: u32) -> bool {
    true
}
