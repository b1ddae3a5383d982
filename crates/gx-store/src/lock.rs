//! Exclusive process lock for a cache directory.
//!
//! The lock is a JSON file recording the holder's PID. A stale lock (holder
//! no longer running) is stolen; a malformed lock file is surfaced to the
//! operator rather than silently removed.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{lock_path, Result, StoreError};

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
}

/// A held cache lock. Dropping without `release` leaves the file behind for
/// the stale-lock probe, so callers release explicitly on every exit path.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    payload: Vec<u8>,
}

/// Creates a lock file in `cache_dir`, stealing stale locks.
pub fn acquire_lock(cache_dir: &Path) -> Result<LockFile> {
    if cache_dir.as_os_str().is_empty() {
        return Err(StoreError::CacheDirEmpty);
    }
    let path = lock_path(cache_dir);
    let payload = serde_json::to_vec(&LockInfo {
        pid: std::process::id(),
    })?;

    loop {
        match try_create_lock(&path, &payload)? {
            Some(lock) => return Ok(lock),
            None => handle_existing_lock(&path)?,
        }
    }
}

fn try_create_lock(path: &Path, payload: &[u8]) -> Result<Option<LockFile>> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if let Err(err) = file.write_all(payload).and_then(|()| file.flush()) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(err.into());
    }
    Ok(Some(LockFile {
        path: path.to_path_buf(),
        payload: payload.to_vec(),
    }))
}

fn handle_existing_lock(path: &Path) -> Result<()> {
    let existing = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let info: LockInfo =
        serde_json::from_slice(&existing).map_err(StoreError::InvalidLockFile)?;
    if process_alive(info.pid) {
        return Err(StoreError::AnotherInstanceIsRunning(info.pid));
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl LockFile {
    /// Removes the lock file if it still holds this process's payload.
    pub fn release(self) -> Result<()> {
        let existing = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if existing != self.payload {
            return Ok(());
        }
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Reports whether a PID refers to a running process. A permission error on
/// the zero-signal probe still means the process exists.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
