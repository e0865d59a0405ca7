//! Accepting a live change into the baseline.
//!
//! The baseline is read whole, one key is changed and the whole document is
//! written back. Two acceptances racing each other are last-writer-wins.

use anyhow::{anyhow, Context, Result};
use sentinel_core::baseline::{load_baseline, save_baseline, snapshot_key};
use sentinel_core::fingerprint::Fingerprinter;
use sentinel_core::store::PersistencePort;
use sentinel_core::version_store::VersionStore;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// The file exists; its new digest is now the accepted one.
    Updated {
        key: String,
        digest: String,
        backup: Option<PathBuf>,
    },
    /// The file is gone; its baseline entry was dropped.
    Removed { key: String },
}

pub struct ChangeAcceptor<'a> {
    pub root: &'a Path,
    pub baseline_path: &'a Path,
    pub fingerprinter: Fingerprinter,
    pub versions: &'a VersionStore,
    pub store: &'a dyn PersistencePort,
}

impl ChangeAcceptor<'_> {
    pub fn allow_change(&self, path: &Path) -> Result<AcceptOutcome> {
        let relative = path.strip_prefix(self.root).map_err(|_| {
            anyhow!(
                "{} is outside the monitored root {}",
                path.display(),
                self.root.display()
            )
        })?;
        let key = snapshot_key(relative);

        let mut baseline = load_baseline(self.baseline_path)?
            .ok_or_else(|| anyhow!("no baseline exists; create one first"))?;

        if !path.is_file() {
            baseline.remove(&key);
            save_baseline(self.baseline_path, &baseline)?;
            info!(key = %key, "deleted file removed from baseline");
            return Ok(AcceptOutcome::Removed { key });
        }

        let digest = self
            .fingerprinter
            .fingerprint(path)
            .with_context(|| format!("fingerprint {}", path.display()))?;
        baseline.insert(key.clone(), digest.clone());
        save_baseline(self.baseline_path, &baseline)?;

        // The baseline change stands even if the copy fails.
        let backup = match self.versions.snapshot(path, self.root) {
            Ok(Some(backup)) => {
                self.store.add_backup_record(path, &backup)?;
                Some(backup)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "backup of accepted change failed");
                None
            }
        };

        info!(key = %key, digest = %digest, "change accepted into baseline");
        Ok(AcceptOutcome::Updated {
            key,
            digest,
            backup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::baseline::Snapshot;
    use sentinel_core::database::SqliteStore;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn accepts_modification_and_deletion() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("site");
        fs::create_dir_all(root.join("cfg")).unwrap();
        let kept = root.join("cfg").join("app.toml");
        let dropped = root.join("old.txt");
        fs::write(&kept, b"v2").unwrap();

        let baseline_path = dir.path().join("baseline.json");
        let mut baseline = Snapshot::new();
        baseline.insert("cfg/app.toml".into(), "stale".into());
        baseline.insert("old.txt".into(), "stale".into());
        save_baseline(&baseline_path, &baseline).unwrap();

        let store = SqliteStore::open_in_memory().unwrap();
        let versions = VersionStore::open(dir.path().join("backups")).unwrap();
        let acceptor = ChangeAcceptor {
            root: &root,
            baseline_path: &baseline_path,
            fingerprinter: Fingerprinter::default(),
            versions: &versions,
            store: &store,
        };

        let updated = acceptor.allow_change(&kept).unwrap();
        let AcceptOutcome::Updated { digest, backup, .. } = updated else {
            panic!("expected update");
        };
        assert!(backup.is_some());
        assert_eq!(store.get_latest_backup(&kept).unwrap(), backup);

        assert_eq!(
            acceptor.allow_change(&dropped).unwrap(),
            AcceptOutcome::Removed {
                key: "old.txt".into()
            }
        );

        let saved = load_baseline(&baseline_path).unwrap().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved.get("cfg/app.toml"), Some(&digest));
    }

    #[test]
    fn rejects_paths_outside_root() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open_in_memory().unwrap();
        let versions = VersionStore::open(dir.path().join("backups")).unwrap();
        let root = dir.path().join("site");
        let baseline_path = dir.path().join("baseline.json");
        let acceptor = ChangeAcceptor {
            root: &root,
            baseline_path: &baseline_path,
            fingerprinter: Fingerprinter::default(),
            versions: &versions,
            store: &store,
        };
        assert!(acceptor.allow_change(Path::new("/etc/passwd")).is_err());
    }
}
