//! Advisory lock file guarding writer output paths.
//!
//! The lock lives at `<output>.lock`. Acquisition takes an fcntl write lock
//! on the whole file, then re-validates that the locked inode is still the
//! one on disk (a racing writer may have unlinked and recreated the path
//! between our open and lock). On release the lock is dropped and, if no
//! other process is waiting, the lock file is unlinked; otherwise it is
//! left for the next waiter.
//!
//! Waiting is a bounded-interval retry loop; a diagnostic is logged every
//! minute a writer stays blocked.

use ptex_core::{PtexError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;

/// How often the retry loop polls for the lock.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often a blocked writer logs that it is still waiting.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

/// A held advisory lock. Dropping releases it.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
}

impl LockFile {
    /// Acquires the lock for `output`, blocking until it is available.
    pub fn acquire(output: &Path) -> Result<LockFile> {
        let mut name = output.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        let path = output.with_file_name(name);

        let started = Instant::now();
        let mut last_progress = started;
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .mode(0o666)
                .open(&path)
                .map_err(|e| PtexError::LockFailed(format!("{}: {e}", path.display())))?;

            if try_lock(&file, libc::F_WRLCK) {
                // verify the locked file is still the one on the filesystem;
                // a racing writer may have unlinked it after we opened
                let locked = file.metadata().map_err(PtexError::Io)?;
                match std::fs::metadata(&path) {
                    Ok(on_disk)
                        if on_disk.ino() == locked.ino() && on_disk.ctime() == locked.ctime() =>
                    {
                        return Ok(LockFile { path, file: Some(file) });
                    }
                    _ => {
                        // stale handle, retry with a fresh open
                        continue;
                    }
                }
            }

            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                warn!(
                    lock = %path.display(),
                    waited_secs = started.elapsed().as_secs(),
                    "still waiting for ptex lock file"
                );
                last_progress = Instant::now();
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Path of the lock file itself.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock, unlinking the lock file when no one is waiting.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(file) = self.file.take() else { return };
        unlock(&file);
        // if we can immediately re-acquire, nobody is waiting and the file
        // can be removed; otherwise leave it for the next waiter
        if try_lock(&file, libc::F_WRLCK) {
            let _ = std::fs::remove_file(&self.path);
            unlock(&file);
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn whole_file_lock(kind: libc::c_int) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;
    fl
}

fn try_lock(file: &File, kind: libc::c_int) -> bool {
    let mut fl = whole_file_lock(kind);
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut fl) };
    rc == 0
}

fn unlock(file: &File) {
    let mut fl = whole_file_lock(libc::F_UNLCK);
    unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut fl) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("tex.ptx");
        let lock = LockFile::acquire(&out).unwrap();
        let lock_path = lock.path().to_path_buf();
        assert!(lock_path.exists());
        lock.release();
        assert!(!lock_path.exists(), "lock file should be removed when nobody waits");
    }

    #[test]
    fn reacquire_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("tex.ptx");
        let a = LockFile::acquire(&out).unwrap();
        drop(a);
        let b = LockFile::acquire(&out).unwrap();
        b.release();
    }

    #[test]
    fn stale_lock_file_is_taken_over() {
        // a leftover lock file from a crashed writer is simply locked over
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("tex.ptx");
        std::fs::write(dir.path().join("tex.ptx.lock"), b"stale").unwrap();
        let lock = LockFile::acquire(&out).unwrap();
        lock.release();
        assert!(!dir.path().join("tex.ptx.lock").exists());
    }
}
