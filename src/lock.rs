//! Cross-process equipment locks
//!
//! One advisory file lock per equipment, under
//! `<state_dir>/<equipment>/.lock`. Exclusion is enforced by the OS
//! (`flock`), so an abandoned lock is released when its holder dies; the
//! lock file itself persists across restarts. Waiters poll at a fixed
//! interval against a hard deadline, with no fairness ordering.
//!
//! On acquisition the holder writes diagnostic metadata (pid, timestamp,
//! equipment) into the file. That metadata is for operators reading
//! `holder_info()`; the `flock` is the only source of truth.
//!
//! # Example
//!
//! ```rust,ignore
//! use hubcall::lock::EquipmentLock;
//! use std::time::Duration;
//!
//! let lock = EquipmentLock::new("/var/lib/hub/state", "Tank01");
//! let guard = lock.acquire(Duration::from_secs(30)).await?;
//! run_analysis().await?;
//! drop(guard); // released here, and on every other exit path
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ErrorKind, HubError, Result};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Diagnostic metadata written into a held lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: String,
    pub equipment: String,
}

/// Handle for one equipment's lock file
#[derive(Debug, Clone)]
pub struct EquipmentLock {
    equipment: String,
    lock_path: PathBuf,
    poll_interval: Duration,
}

impl EquipmentLock {
    pub fn new(state_dir: impl AsRef<Path>, equipment: impl Into<String>) -> Self {
        let equipment = equipment.into();
        let lock_path = state_dir.as_ref().join(&equipment).join(".lock");
        Self {
            equipment,
            lock_path,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn equipment(&self) -> &str {
        &self.equipment
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Acquire the lock, polling until success or the deadline.
    ///
    /// The timeout is hard: once it elapses the next poll fails with a
    /// `Lock` error rather than stretching to finish an interval.
    pub async fn acquire(&self, timeout: Duration) -> Result<EquipmentLockGuard> {
        let deadline = Instant::now() + timeout;
        let file = self.open_lock_file()?;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    self.write_holder(&file)?;
                    debug!(equipment = %self.equipment, "lock acquired");
                    return Ok(EquipmentLockGuard {
                        equipment: self.equipment.clone(),
                        file: Some(file),
                    });
                }
                Err(_) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        warn!(
                            equipment = %self.equipment,
                            timeout_secs = timeout.as_secs(),
                            "lock acquisition timed out"
                        );
                        return Err(HubError::lock(&self.equipment, timeout.as_secs()));
                    }
                    tokio::time::sleep(self.poll_interval.min(remaining)).await;
                }
            }
        }
    }

    /// Zero-wait probe: a successful try-acquire (released immediately)
    /// means unlocked.
    pub fn is_locked(&self) -> Result<bool> {
        if !self.lock_path.exists() {
            return Ok(false);
        }
        let file = self.open_lock_file()?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = file.unlock();
                Ok(false)
            }
            Err(_) => Ok(true),
        }
    }

    /// Metadata left by the current or most recent holder, if readable
    pub fn holder_info(&self) -> Option<LockHolder> {
        let contents = std::fs::read_to_string(&self.lock_path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    fn open_lock_file(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error("create lock dir", e))?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| self.io_error("open lock file", e))
    }

    fn write_holder(&self, mut file: &File) -> Result<()> {
        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: Utc::now().to_rfc3339(),
            equipment: self.equipment.clone(),
        };
        let body =
            serde_json::to_string(&holder).map_err(|e| self.io_error("serialize holder", e))?;
        file.set_len(0)
            .and_then(|_| file.write_all(body.as_bytes()))
            .and_then(|_| file.flush())
            .map_err(|e| self.io_error("write holder", e))
    }

    /// Filesystem failures are file errors, not contention; `Lock` is
    /// reserved for acquisition timeouts.
    fn io_error(&self, operation: &str, err: impl std::fmt::Display) -> HubError {
        ErrorKind::TempFile {
            message: format!("{operation} failed for '{}': {err}", self.equipment),
            path: self.lock_path.display().to_string(),
            operation: operation.to_string(),
        }
        .into()
    }
}

/// Held lock, released on drop.
///
/// Release is idempotent: an explicit [`release`](Self::release) followed
/// by the drop is fine.
#[derive(Debug)]
pub struct EquipmentLockGuard {
    equipment: String,
    file: Option<File>,
}

impl EquipmentLockGuard {
    pub fn equipment(&self) -> &str {
        &self.equipment
    }

    /// Release the lock now instead of at end of scope
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            // stale metadata would mislead holder_info readers
            let _ = file.set_len(0);
            let _ = file.unlock();
            debug!(equipment = %self.equipment, "lock released");
        }
    }
}

impl Drop for EquipmentLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn short_timeout() -> Duration {
        Duration::from_millis(50)
    }

    fn fast_lock(dir: &TempDir, equipment: &str) -> EquipmentLock {
        EquipmentLock::new(dir.path(), equipment).with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_acquire_creates_lock_file() {
        let dir = TempDir::new().unwrap();
        let lock = fast_lock(&dir, "Tank01");

        let guard = lock.acquire(short_timeout()).await.unwrap();

        assert!(dir.path().join("Tank01").join(".lock").exists());
        assert_eq!(guard.equipment(), "Tank01");
    }

    #[tokio::test]
    async fn test_holder_metadata_written() {
        let dir = TempDir::new().unwrap();
        let lock = fast_lock(&dir, "Tank01");

        let _guard = lock.acquire(short_timeout()).await.unwrap();

        let holder = lock.holder_info().unwrap();
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(holder.equipment, "Tank01");
        assert!(!holder.acquired_at.is_empty());
    }

    #[tokio::test]
    async fn test_filesystem_failure_is_a_file_error() {
        let dir = TempDir::new().unwrap();
        // occupy the equipment directory name with a regular file so
        // creating the lock directory fails
        std::fs::write(dir.path().join("Tank01"), b"not a directory").unwrap();

        let lock = fast_lock(&dir, "Tank01");
        let err = lock.acquire(short_timeout()).await.unwrap_err();

        assert_eq!(err.code(), "HUB-008");
        assert!(err.to_string().contains("create lock dir"));
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let dir = TempDir::new().unwrap();
        let lock = fast_lock(&dir, "Tank01");

        let _guard = lock.acquire(short_timeout()).await.unwrap();

        let contender = fast_lock(&dir, "Tank01");
        let err = contender.acquire(short_timeout()).await.unwrap_err();
        assert_eq!(err.code(), "HUB-005");
        assert_eq!(err.details()["equipment_name"], "Tank01");
    }

    #[tokio::test]
    async fn test_release_allows_reacquisition() {
        let dir = TempDir::new().unwrap();
        let lock = fast_lock(&dir, "Tank01");

        let mut guard = lock.acquire(short_timeout()).await.unwrap();
        guard.release();

        let reacquired = lock.acquire(short_timeout()).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let lock = fast_lock(&dir, "Tank01");

        {
            let _guard = lock.acquire(short_timeout()).await.unwrap();
            assert!(lock.is_locked().unwrap());
        }

        assert!(!lock.is_locked().unwrap());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let lock = fast_lock(&dir, "Tank01");

        let mut guard = lock.acquire(short_timeout()).await.unwrap();
        guard.release();
        guard.release();
        drop(guard);

        assert!(!lock.is_locked().unwrap());
    }

    #[tokio::test]
    async fn test_is_locked_without_file() {
        let dir = TempDir::new().unwrap();
        let lock = fast_lock(&dir, "NeverUsed");
        assert!(!lock.is_locked().unwrap());
    }

    #[tokio::test]
    async fn test_different_equipment_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let tank = fast_lock(&dir, "Tank01");
        let pump = fast_lock(&dir, "Pump07");

        let _tank_guard = tank.acquire(short_timeout()).await.unwrap();
        let pump_guard = pump.acquire(short_timeout()).await;

        assert!(pump_guard.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_holder_releases() {
        let dir = TempDir::new().unwrap();
        let lock = fast_lock(&dir, "Tank01");

        let guard = lock.acquire(short_timeout()).await.unwrap();

        let contender = fast_lock(&dir, "Tank01");
        let waiter = tokio::spawn(async move {
            contender.acquire(Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_release_clears_holder_metadata() {
        let dir = TempDir::new().unwrap();
        let lock = fast_lock(&dir, "Tank01");

        let mut guard = lock.acquire(short_timeout()).await.unwrap();
        assert!(lock.holder_info().is_some());
        guard.release();

        assert!(lock.holder_info().is_none());
    }
}
