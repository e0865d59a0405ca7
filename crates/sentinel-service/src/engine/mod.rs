use anyhow::{anyhow, bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use sentinel_core::baseline::{clear_baseline, load_baseline, save_baseline, Snapshot};
use sentinel_core::database::SqliteStore;
use sentinel_core::exclusions::{ExclusionKind, ExclusionRule, ExclusionSet};
use sentinel_core::fingerprint::Fingerprinter;
use sentinel_core::paths::DataLayout;
use sentinel_core::settings::MonitorSettings;
use sentinel_core::storage::{load_settings, save_settings};
use sentinel_core::store::{AlertRecord, BackupRecord, PersistencePort, StoreError};
use sentinel_core::version_store::VersionStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::enforcement::accept::{AcceptOutcome, ChangeAcceptor};
use crate::enforcement::restore::{RestoreEngine, RestoreOutcome};
use crate::integrity::actor::{platform_resolver, ActorResolver};
use crate::integrity::audit_loop::{spawn_audit_loop, AuditLoopHandle, AuditTarget};
use crate::integrity::comparator::{compare, ChangeRecord};
use crate::integrity::pipeline::{AlertCallback, ChangePipeline, PipelineConfig, PipelineContext};
use crate::integrity::scanner::Scanner;

pub type AuditCallback = Arc<dyn Fn(Vec<ChangeRecord>) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub copied: usize,
    pub skipped: usize,
}

/// The bulk copy started by [`Engine::create_baseline`], running on the
/// blocking pool.
pub struct InitialBackup {
    progress: watch::Receiver<u8>,
    handle: JoinHandle<Result<BackupSummary>>,
}

impl InitialBackup {
    /// Percentage of baselined files processed so far.
    pub fn progress(&self) -> watch::Receiver<u8> {
        self.progress.clone()
    }

    pub async fn wait(self) -> Result<BackupSummary> {
        self.handle.await.context("initial backup task failed")?
    }
}

pub struct BaselineCreated {
    pub root: PathBuf,
    pub entries: usize,
    pub backup: InitialBackup,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub root: PathBuf,
    pub scanned: usize,
    pub changes: Vec<ChangeRecord>,
}

struct Protection {
    root: PathBuf,
    pipeline: ChangePipeline,
    audit: Option<AuditLoopHandle>,
}

pub struct Engine {
    layout: DataLayout,
    store: Arc<dyn PersistencePort>,
    versions: Arc<VersionStore>,
    settings: RwLock<MonitorSettings>,
    restore: RestoreEngine,
    resolver: Arc<dyn ActorResolver>,
    protection: Mutex<Option<Protection>>,
}

impl Engine {
    /// Open the engine over the on-disk store in `layout`.
    pub fn open(layout: DataLayout) -> Result<Self> {
        std::fs::create_dir_all(layout.root())
            .with_context(|| format!("create data dir {}", layout.root().display()))?;
        let store = SqliteStore::open(&layout.db_path())
            .with_context(|| format!("open store {}", layout.db_path().display()))?;
        Self::with_store(layout, Arc::new(store), platform_resolver())
    }

    pub fn with_store(
        layout: DataLayout,
        store: Arc<dyn PersistencePort>,
        resolver: Arc<dyn ActorResolver>,
    ) -> Result<Self> {
        let versions = VersionStore::open(layout.backup_dir())
            .with_context(|| format!("open version store {}", layout.backup_dir().display()))?;
        let settings = load_settings(store.as_ref())?;
        debug!(?settings, "settings loaded");
        Ok(Self {
            layout,
            store,
            versions: Arc::new(versions),
            settings: RwLock::new(settings),
            restore: RestoreEngine::new(),
            resolver,
            protection: Mutex::new(None),
        })
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    // ── Settings ────────────────────────────────────────────────────────

    pub fn settings(&self) -> MonitorSettings {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, new_settings: MonitorSettings) -> Result<()> {
        save_settings(self.store.as_ref(), &new_settings)?;
        *self.settings.write() = new_settings;
        Ok(())
    }

    /// Change one setting by name; returns the resulting settings.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<MonitorSettings> {
        let next = self.settings().apply(key, value)?;
        if next.hash_algorithm != self.settings().hash_algorithm {
            warn!("hash algorithm changed; create a new baseline before the next check");
        }
        self.update_settings(next.clone())?;
        Ok(next)
    }

    /// The monitored root, or `explicit` when given.
    pub fn monitored_root(&self, explicit: Option<&Path>) -> Result<PathBuf> {
        match explicit {
            Some(root) => Ok(root.to_path_buf()),
            None => self
                .settings()
                .monitored_root
                .ok_or_else(|| anyhow!("no monitored directory; create a baseline first")),
        }
    }

    fn fingerprinter(&self) -> Fingerprinter {
        Fingerprinter::new(self.settings().hash_algorithm)
    }

    fn scanner(&self) -> Scanner {
        Scanner::new(self.fingerprinter(), self.settings().effective_workers())
    }

    fn exclusion_set(&self) -> Result<ExclusionSet> {
        Ok(ExclusionSet::new(&self.store.list_exclusions()?))
    }

    // ── Baseline ────────────────────────────────────────────────────────

    /// Scan `root`, persist the result as the baseline, remember `root` as
    /// the monitored directory and start copying every baselined file into
    /// the version store in the background.
    pub async fn create_baseline<P>(&self, root: &Path, on_progress: P) -> Result<BaselineCreated>
    where
        P: Fn(u8) + Send + 'static,
    {
        let root = root
            .canonicalize()
            .with_context(|| format!("resolve {}", root.display()))?;
        let scanner = self.scanner();
        let exclusions = self.exclusion_set()?;
        debug!(root = %root.display(), workers = scanner.workers(), "baseline scan starting");

        let scan_root = root.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            scanner.scan(&scan_root, &exclusions, Some(&on_progress as &dyn Fn(u8)))
        })
        .await
        .context("scan task failed")??;

        save_baseline(&self.layout.baseline_path(), &snapshot)?;
        let mut settings = self.settings();
        settings.monitored_root = Some(root.clone());
        self.update_settings(settings)?;
        info!(root = %root.display(), entries = snapshot.len(), "baseline created");

        let entries = snapshot.len();
        let backup = self.spawn_initial_backup(root.clone(), snapshot);
        Ok(BaselineCreated {
            root,
            entries,
            backup,
        })
    }

    fn spawn_initial_backup(&self, root: PathBuf, snapshot: Snapshot) -> InitialBackup {
        let (progress_tx, progress_rx) = watch::channel(0u8);
        let versions = self.versions.clone();
        let store = self.store.clone();

        let handle = tokio::task::spawn_blocking(move || -> Result<BackupSummary> {
            let mut keys: Vec<String> = snapshot.into_keys().collect();
            keys.sort();
            let total = keys.len();
            let mut summary = BackupSummary::default();

            for (done, key) in keys.iter().enumerate() {
                let path = key.split('/').fold(root.clone(), |acc, seg| acc.join(seg));
                match versions.snapshot(&path, &root) {
                    Ok(Some(backup)) => {
                        store.add_backup_record(&path, &backup)?;
                        summary.copied += 1;
                    }
                    Ok(None) => summary.skipped += 1,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "initial backup skipped file");
                        summary.skipped += 1;
                    }
                }
                let pct = ((done + 1) * 100 / total) as u8;
                progress_tx.send_if_modified(|current| {
                    if *current != pct {
                        *current = pct;
                        true
                    } else {
                        false
                    }
                });
            }
            progress_tx.send_replace(100);
            info!(
                copied = summary.copied,
                skipped = summary.skipped,
                backups = %versions.files_root().display(),
                "initial backup complete"
            );
            Ok(summary)
        });

        InitialBackup {
            progress: progress_rx,
            handle,
        }
    }

    /// Scan the monitored root and diff it against the baseline.
    pub async fn check<P>(&self, root: Option<&Path>, on_progress: P) -> Result<CheckReport>
    where
        P: Fn(u8) + Send + 'static,
    {
        let root = self.monitored_root(root)?;
        let baseline = load_baseline(&self.layout.baseline_path())?
            .ok_or_else(|| anyhow!("no baseline exists; create one first"))?;
        let scanner = self.scanner();
        let exclusions = self.exclusion_set()?;
        debug!(root = %root.display(), workers = scanner.workers(), "check scan starting");

        let scan_root = root.clone();
        let current = tokio::task::spawn_blocking(move || {
            scanner.scan(&scan_root, &exclusions, Some(&on_progress as &dyn Fn(u8)))
        })
        .await
        .context("scan task failed")??;

        let changes = compare(&baseline, &current);
        info!(root = %root.display(), changes = changes.len(), "check complete");
        Ok(CheckReport {
            root,
            scanned: current.len(),
            changes,
        })
    }

    /// Accept the current state of `path` into the baseline.
    pub fn allow_change(&self, path: &Path) -> Result<AcceptOutcome> {
        let root = self.monitored_root(None)?;
        let path = resolve_path(path)?;
        let baseline_path = self.layout.baseline_path();
        ChangeAcceptor {
            root: &root,
            baseline_path: &baseline_path,
            fingerprinter: self.fingerprinter(),
            versions: &self.versions,
            store: self.store.as_ref(),
        }
        .allow_change(&path)
    }

    pub fn clear_baseline(&self) -> Result<bool> {
        clear_baseline(&self.layout.baseline_path())
    }

    pub fn restore_latest(&self, path: &Path) -> Result<RestoreOutcome> {
        let path = resolve_path(path)?;
        self.restore
            .restore_latest(&path, self.store.as_ref(), &self.versions)
    }

    /// Every stored version of `path`, newest first.
    pub fn backup_history(&self, path: &Path) -> Result<Vec<BackupRecord>> {
        let path = resolve_path(path)?;
        Ok(self.store.backup_history(&path)?)
    }

    // ── Exclusions ──────────────────────────────────────────────────────

    pub fn add_exclusion(&self, pattern: &str, kind: ExclusionKind) -> Result<()> {
        if pattern.is_empty() {
            bail!("exclusion pattern must not be empty");
        }
        if !self.store.add_exclusion(&ExclusionRule::new(pattern, kind))? {
            return Err(StoreError::DuplicatePattern(pattern.to_string()).into());
        }
        info!(pattern, kind = %kind, "exclusion added");
        Ok(())
    }

    pub fn remove_exclusion(&self, pattern: &str) -> Result<bool> {
        Ok(self.store.remove_exclusion(pattern)?)
    }

    pub fn list_exclusions(&self) -> Result<Vec<ExclusionRule>> {
        Ok(self.store.list_exclusions()?)
    }

    // ── Alerts ──────────────────────────────────────────────────────────

    pub fn alerts(&self, limit: usize, unread_only: bool) -> Result<Vec<AlertRecord>> {
        Ok(self.store.get_alerts(limit, unread_only)?)
    }

    pub fn mark_all_read(&self) -> Result<usize> {
        Ok(self.store.mark_all_read()?)
    }

    pub fn clear_alerts(&self) -> Result<usize> {
        Ok(self.store.clear_alerts()?)
    }

    // ── Live protection ─────────────────────────────────────────────────

    pub fn is_protecting(&self) -> bool {
        self.protection
            .lock()
            .as_ref()
            .is_some_and(|p| p.pipeline.is_running())
    }

    /// Start watching the monitored root. Fails if protection is already
    /// active; call [`Engine::stop_protection`] first.
    pub fn start_protection(
        &self,
        root: Option<&Path>,
        on_alert: AlertCallback,
        on_audit: Option<AuditCallback>,
    ) -> Result<PathBuf> {
        let mut slot = self.protection.lock();
        if let Some(active) = slot.as_ref() {
            if active.pipeline.is_running() {
                bail!("protection already active for {}", active.root.display());
            }
        }

        let root = self
            .monitored_root(root)?
            .canonicalize()
            .context("resolve monitored directory")?;
        let settings = self.settings();
        let exclusions = self.exclusion_set()?;

        let pipeline = ChangePipeline::watch(
            PipelineContext {
                root: root.clone(),
                exclusions: exclusions.clone(),
                fingerprinter: self.fingerprinter(),
                store: self.store.clone(),
                resolver: self.resolver.clone(),
                restoring: self.restore.restoring(),
                config: PipelineConfig {
                    settle_delay: settings.settle_delay(),
                    cooldown: settings.cooldown(),
                    actor_timeout: settings.actor_timeout(),
                },
            },
            on_alert,
        )?;

        let audit = match (settings.audit_interval(), on_audit) {
            (Some(interval), Some(callback)) => Some(spawn_audit_loop(
                AuditTarget {
                    scanner: self.scanner(),
                    root: root.clone(),
                    baseline_path: self.layout.baseline_path(),
                    exclusions,
                },
                interval,
                move |records| callback(records),
            )),
            _ => None,
        };

        info!(root = %root.display(), audit = audit.is_some(), "protection started");
        *slot = Some(Protection {
            root: root.clone(),
            pipeline,
            audit,
        });
        Ok(root)
    }

    /// Stop live protection; `false` when none was running.
    pub async fn stop_protection(&self) -> bool {
        let taken = self.protection.lock().take();
        let Some(protection) = taken else {
            return false;
        };
        if let Some(audit) = protection.audit {
            audit.stop().await;
        }
        protection.pipeline.stop().await;
        info!(root = %protection.root.display(), "protection stopped");
        true
    }
}

/// Absolute form of `path` with the parent directory canonicalized, so a
/// deleted file still maps to the path its backups were recorded under.
fn resolve_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("read current directory")?
            .join(path)
    };
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => Ok(parent.join(name)),
            Err(_) => Ok(absolute),
        },
        _ => Ok(absolute),
    }
}
