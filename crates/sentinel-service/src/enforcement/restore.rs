//! Restore-in-place from the version store.
//!
//! 1. Acquire the per-path lock (a second concurrent restore is rejected)
//! 2. Look up the latest backup through the persistence port
//! 3. Disk space preflight
//! 4. Mark the path as restoring so the change pipeline ignores our write
//! 5. Staged copy + atomic rename, retried on transient I/O failure
//!
//! Restore-loop suppression: a path stays suppressed while the restore runs
//! and for a short quiet period afterwards, because the watcher delivers the
//! resulting events asynchronously.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use sentinel_core::store::PersistencePort;
use sentinel_core::version_store::{VersionStore, VersionStoreError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Minimum free space required before writing a restored file (bytes).
const MIN_FREE_SPACE_BYTES: u64 = 10 * 1024 * 1024;

/// How long after a restore its own file system events are ignored.
pub const RESTORE_QUIET_PERIOD: Duration = Duration::from_secs(2);

const MAX_RETRIES: usize = 3;
const RETRY_DELAYS_MS: [u64; MAX_RETRIES] = [100, 500, 2000];

// ── RestoringSet ────────────────────────────────────────────────────────────

/// Paths being written by a restore, shared with the change pipeline.
#[derive(Debug, Default)]
pub struct RestoringSet {
    /// `None` while in progress, `Some(finished_at)` during the quiet period.
    paths: Mutex<HashMap<PathBuf, Option<Instant>>>,
}

impl RestoringSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, path: &Path) {
        self.paths.lock().insert(path.to_path_buf(), None);
    }

    pub fn finish(&self, path: &Path) {
        self.paths
            .lock()
            .insert(path.to_path_buf(), Some(Instant::now()));
    }

    /// Whether events for `path` should be dropped right now.
    pub fn suppresses(&self, path: &Path) -> bool {
        let mut paths = self.paths.lock();
        let now = Instant::now();
        paths.retain(|_, finished| match finished {
            Some(at) => now.saturating_duration_since(*at) < RESTORE_QUIET_PERIOD,
            None => true,
        });
        paths.contains_key(path)
    }
}

// ── RestoreEngine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { backup: PathBuf },
    AlreadyRestoring,
}

#[derive(Default)]
pub struct RestoreEngine {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    restoring: Arc<RestoringSet>,
}

impl RestoreEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restoring(&self) -> Arc<RestoringSet> {
        self.restoring.clone()
    }

    /// Put the most recent backup of `path` back in place.
    pub fn restore_latest(
        &self,
        path: &Path,
        store: &dyn PersistencePort,
        versions: &VersionStore,
    ) -> Result<RestoreOutcome> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let outcome = match lock.try_lock() {
            Some(_guard) => self.restore_locked(path, store, versions),
            None => Ok(RestoreOutcome::AlreadyRestoring),
        };
        self.release_lock(path, lock);
        outcome
    }

    /// Drop the per-path lock entry once no other caller holds a handle.
    fn release_lock(&self, path: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        // One reference in the map, one in `lock`.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
    }

    fn restore_locked(
        &self,
        path: &Path,
        store: &dyn PersistencePort,
        versions: &VersionStore,
    ) -> Result<RestoreOutcome> {
        let backup = store
            .get_latest_backup(path)?
            .ok_or_else(|| anyhow!("no backup recorded for {}", path.display()))?;

        let needed = std::fs::metadata(&backup).map(|m| m.len()).unwrap_or(0);
        if let Some(parent) = path.parent() {
            let existing = nearest_existing_dir(parent);
            check_disk_space(&existing, needed)?;
        }

        self.restoring.begin(path);
        let result = restore_with_retries(path, &backup, versions);
        self.restoring.finish(path);
        result?;

        info!(
            path = %path.display(),
            backup = %backup.display(),
            "file restored from backup"
        );
        Ok(RestoreOutcome::Restored { backup })
    }
}

fn restore_with_retries(path: &Path, backup: &Path, versions: &VersionStore) -> Result<()> {
    let mut last_err = None;
    for (attempt, delay_ms) in RETRY_DELAYS_MS.iter().enumerate() {
        match versions.restore(backup, path) {
            Ok(()) => return Ok(()),
            Err(e @ VersionStoreError::BackupMissing(_)) => {
                return Err(e).context("backup file is gone from the version store")
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    attempt = attempt + 1,
                    error = %e,
                    "restore attempt failed"
                );
                last_err = Some(e);
                if attempt + 1 < MAX_RETRIES {
                    std::thread::sleep(Duration::from_millis(*delay_ms));
                }
            }
        }
    }
    match last_err {
        Some(e) => Err(e).with_context(|| format!("restore {} failed", path.display())),
        None => bail!("restore {} failed", path.display()),
    }
}

fn nearest_existing_dir(dir: &Path) -> PathBuf {
    dir.ancestors()
        .find(|p| p.is_dir())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

// ── Disk space preflight ────────────────────────────────────────────────────

fn check_disk_space(dir: &Path, needed: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::mem::MaybeUninit;
        let c_path = std::ffi::CString::new(dir.to_string_lossy().as_bytes())
            .map_err(|_| anyhow!("invalid path for statvfs"))?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret == 0 {
            let stat = unsafe { stat.assume_init() };
            let available = stat.f_bavail as u64 * stat.f_frsize as u64;
            let required = needed + MIN_FREE_SPACE_BYTES;
            if available < required {
                bail!(
                    "insufficient disk space: need {} bytes, only {} available in {}",
                    required,
                    available,
                    dir.display()
                );
            }
        } else {
            warn!(dir = %dir.display(), "statvfs failed; skipping space check");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (dir, needed);
    }
    Ok(())
}
