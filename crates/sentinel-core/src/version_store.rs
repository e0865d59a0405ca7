//! Versioned backup store.
//!
//! Every snapshot is a new, immutable copy named `{timestamp}_{file name}`
//! under a mirror of the file's directory relative to the monitored root:
//!
//! ```text
//! {backups}/files/{relative parent}/{YYYYmmdd_HHMMSS_micros}_{file name}
//! ```
//!
//! Copies are staged under `{backups}/.staging` and renamed into place, so a
//! crash never leaves a half-written version behind. The mirror lives under
//! its own `files/` root so a monitored `.staging` directory cannot land in
//! the staging area. Nothing is ever pruned;
//! the history grows until an operator removes it.

use chrono::Utc;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";
const FILES_DIR: &str = "files";
const STAGING_SUFFIX: &str = ".staging";

/// Prefix of in-place restore staging files, left beside the destination.
pub const RESTORE_STAGING_PREFIX: &str = ".sentinel_restore_";

#[derive(Debug, thiserror::Error)]
pub enum VersionStoreError {
    #[error("backup not found: {0}")]
    BackupMissing(PathBuf),
    #[error("access denied: {0}")]
    AccessDenied(PathBuf),
    #[error("{op} failed for {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err<'a>(
    op: &'static str,
    path: &'a Path,
) -> impl FnOnce(io::Error) -> VersionStoreError + 'a {
    move |source| {
        if source.kind() == io::ErrorKind::PermissionDenied {
            VersionStoreError::AccessDenied(path.to_path_buf())
        } else {
            VersionStoreError::Io {
                op,
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

pub struct VersionStore {
    files_root: PathBuf,
    staging_root: PathBuf,
}

impl VersionStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, VersionStoreError> {
        let root = root.as_ref().to_path_buf();
        let staging_root = root.join(STAGING_DIR);
        let files_root = root.join(FILES_DIR);
        fs::create_dir_all(&staging_root).map_err(io_err("create", &staging_root))?;
        fs::create_dir_all(&files_root).map_err(io_err("create", &files_root))?;
        restrict_dir_permissions(&root);
        cleanup_staging_dir(&staging_root);
        Ok(Self {
            files_root,
            staging_root,
        })
    }

    /// Directory holding the mirrored versions.
    pub fn files_root(&self) -> &Path {
        &self.files_root
    }

    /// Copy the current bytes of `path` into a new version.
    ///
    /// Returns `Ok(None)` when the source no longer exists.
    pub fn snapshot(
        &self,
        path: &Path,
        monitored_root: &Path,
    ) -> Result<Option<PathBuf>, VersionStoreError> {
        let mut source = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "snapshot skipped, source gone");
                return Ok(None);
            }
            Err(e) => return Err(io_err("open", path)(e)),
        };
        let metadata = source.metadata().map_err(io_err("stat", path))?;
        if !metadata.is_file() {
            return Ok(None);
        }

        let dest_dir = match path
            .strip_prefix(monitored_root)
            .ok()
            .and_then(|rel| rel.parent())
        {
            Some(rel_parent) => self.files_root.join(rel_parent),
            None => self.files_root.clone(),
        };
        fs::create_dir_all(&dest_dir).map_err(io_err("create", &dest_dir))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let dest = unique_version_path(&dest_dir, &file_name);

        let staging = self
            .staging_root
            .join(format!("{}{}", Uuid::new_v4(), STAGING_SUFFIX));
        let result = (|| {
            let mut out = File::create(&staging).map_err(io_err("create", &staging))?;
            io::copy(&mut source, &mut out).map_err(io_err("copy", path))?;
            copy_metadata(&out, &metadata);
            out.sync_all().map_err(io_err("sync", &staging))?;
            drop(out);
            fs::rename(&staging, &dest).map_err(io_err("rename", &dest))
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }

        debug!(source = %path.display(), backup = %dest.display(), "version stored");
        Ok(Some(dest))
    }

    /// Overwrite `destination` with the bytes of `backup`, keeping the
    /// backup's modification time. The replacement is staged beside the
    /// destination and renamed over it.
    pub fn restore(&self, backup: &Path, destination: &Path) -> Result<(), VersionStoreError> {
        let mut source = match File::open(backup) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(VersionStoreError::BackupMissing(backup.to_path_buf()))
            }
            Err(e) => return Err(io_err("open", backup)(e)),
        };
        let metadata = source.metadata().map_err(io_err("stat", backup))?;

        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(io_err("create", &parent))?;

        let staging = parent.join(format!("{}{}", RESTORE_STAGING_PREFIX, Uuid::new_v4().simple()));
        let result = (|| {
            let mut out = File::create(&staging).map_err(io_err("create", &staging))?;
            io::copy(&mut source, &mut out).map_err(io_err("copy", backup))?;
            copy_metadata(&out, &metadata);
            out.sync_all().map_err(io_err("sync", &staging))?;
            drop(out);
            atomic_replace(&staging, destination).map_err(io_err("replace", destination))
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
        fsync_dir(&parent);
        debug!(backup = %backup.display(), destination = %destination.display(), "version restored");
        Ok(())
    }
}

fn unique_version_path(dir: &Path, file_name: &str) -> PathBuf {
    let ts = Utc::now().format("%Y%m%d_%H%M%S_%6f");
    let candidate = dir.join(format!("{ts}_{file_name}"));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{ts}_{n}_{file_name}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Carry permissions and mtime over to the copy; both are best-effort.
fn copy_metadata(out: &File, source: &fs::Metadata) {
    if let Err(e) = out.set_permissions(source.permissions()) {
        debug!(error = %e, "could not copy permissions");
    }
    if let Ok(modified) = source.modified() {
        if let Err(e) = out.set_modified(modified) {
            debug!(error = %e, "could not copy modification time");
        }
    }
}

fn atomic_replace(from: &Path, to: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        fs::rename(from, to)
    }
    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        let wide_from: Vec<u16> = from.as_os_str().encode_wide().chain(Some(0)).collect();
        let wide_to: Vec<u16> = to.as_os_str().encode_wide().chain(Some(0)).collect();
        let ret = unsafe {
            windows_sys::Win32::Storage::FileSystem::MoveFileExW(
                wide_from.as_ptr(),
                wide_to.as_ptr(),
                windows_sys::Win32::Storage::FileSystem::MOVEFILE_REPLACE_EXISTING
                    | windows_sys::Win32::Storage::FileSystem::MOVEFILE_WRITE_THROUGH,
            )
        };
        if ret == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn fsync_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Ok(dir) = fs::OpenOptions::new().read(true).open(path) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Remove leftover `.staging` files from a previous crash.
fn cleanup_staging_dir(staging_root: &Path) {
    if let Ok(entries) = fs::read_dir(staging_root) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().ends_with(STAGING_SUFFIX) {
                warn!(path = %entry.path().display(), "removing orphaned backup staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    #[test]
    fn snapshot_then_restore_reproduces_bytes() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("watched");
        fs::create_dir_all(root.join("docs")).unwrap();
        let file = root.join("docs").join("plan.txt");
        fs::write(&file, b"original plan").unwrap();

        let store = VersionStore::open(dir.path().join("backups")).unwrap();
        let backup = store.snapshot(&file, &root).unwrap().unwrap();
        assert!(backup.starts_with(store.files_root().join("docs")));
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_plan.txt"));

        fs::write(&file, b"ransomware").unwrap();
        store.restore(&backup, &file).unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"original plan");

        fs::remove_file(&file).unwrap();
        store.restore(&backup, &file).unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"original plan");
    }

    #[test]
    fn repeated_snapshots_keep_history() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"v1").unwrap();
        let store = VersionStore::open(dir.path().join("backups")).unwrap();

        let first = store.snapshot(&file, dir.path()).unwrap().unwrap();
        fs::write(&file, b"v2").unwrap();
        let second = store.snapshot(&file, dir.path()).unwrap().unwrap();

        assert_ne!(first, second);
        assert_eq!(fs::read(&first).unwrap(), b"v1");
        assert_eq!(fs::read(&second).unwrap(), b"v2");
    }

    #[test]
    fn snapshot_of_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let store = VersionStore::open(dir.path().join("backups")).unwrap();
        let got = store
            .snapshot(&dir.path().join("gone.txt"), dir.path())
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn restore_keeps_backup_mtime() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"v1").unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let store = VersionStore::open(dir.path().join("backups")).unwrap();
        let backup = store.snapshot(&file, dir.path()).unwrap().unwrap();
        fs::write(&file, b"v2").unwrap();
        store.restore(&backup, &file).unwrap();

        let restored = fs::metadata(&file).unwrap().modified().unwrap();
        let drift = restored
            .duration_since(past)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(2));
    }

    #[test]
    fn restore_from_missing_backup_fails() {
        let dir = tempdir().unwrap();
        let store = VersionStore::open(dir.path().join("backups")).unwrap();
        let err = store
            .restore(&dir.path().join("nope"), &dir.path().join("a.txt"))
            .unwrap_err();
        assert!(matches!(err, VersionStoreError::BackupMissing(_)));
    }

    #[test]
    fn orphaned_staging_files_are_removed_on_open() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("backups");
        fs::create_dir_all(root.join(STAGING_DIR)).unwrap();
        let orphan = root.join(STAGING_DIR).join("dead.staging");
        fs::write(&orphan, b"partial").unwrap();

        VersionStore::open(&root).unwrap();
        assert!(!orphan.exists());
    }

    #[test]
    fn monitored_staging_directory_survives_reopen() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("watched");
        fs::create_dir_all(root.join(".staging")).unwrap();
        let file = root.join(".staging").join("draft.staging");
        fs::write(&file, b"keep me").unwrap();

        let backups = dir.path().join("backups");
        let backup = {
            let store = VersionStore::open(&backups).unwrap();
            store.snapshot(&file, &root).unwrap().unwrap()
        };
        VersionStore::open(&backups).unwrap();

        assert!(backup.exists());
        assert_eq!(fs::read(&backup).unwrap(), b"keep me");
    }
}
