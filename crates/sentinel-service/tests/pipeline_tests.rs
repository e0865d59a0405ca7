//! Integration tests for the live change pipeline.
//!
//! Events are injected straight into the dispatcher so the tests do not
//! depend on OS watcher timing.
//!
//! Tests cover:
//!  1. Duplicate modify events collapse into one alert
//!  2. Noise and excluded directories never alert
//!  3. Deletions alert with the unknown actor
//!  4. Restore-loop suppression, and re-tampering after a restore
//!  5. Independent paths are all reported, with settle delays overlapping
//!  6. Events for one path are handled in arrival order

use parking_lot::Mutex;
use sentinel_core::database::SqliteStore;
use sentinel_core::exclusions::{default_rules, ExclusionSet};
use sentinel_core::fingerprint::Fingerprinter;
use sentinel_core::store::{ChangeStatus, PersistencePort};
use sentinel_service::enforcement::restore::{RestoringSet, RESTORE_QUIET_PERIOD};
use sentinel_service::integrity::actor::{NullResolver, UNKNOWN_ACTOR};
use sentinel_service::integrity::pipeline::{
    spawn_change_pipeline, ChangePipeline, PipelineConfig, PipelineContext,
};
use sentinel_service::integrity::watcher::{RawEvent, RawKind};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

struct Harness {
    dir: TempDir,
    tx: UnboundedSender<RawEvent>,
    store: Arc<SqliteStore>,
    restoring: Arc<RestoringSet>,
    notified: Arc<Mutex<Vec<(String, ChangeStatus)>>>,
    pipeline: ChangePipeline,
}

impl Harness {
    fn start() -> Self {
        Self::with_config(PipelineConfig {
            settle_delay: Duration::from_millis(30),
            cooldown: Duration::from_millis(1500),
            actor_timeout: Duration::from_millis(200),
        })
    }

    fn with_config(config: PipelineConfig) -> Self {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let restoring = Arc::new(RestoringSet::new());
        let notified = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = unbounded_channel();

        let sink = notified.clone();
        let pipeline = spawn_change_pipeline(
            rx,
            PipelineContext {
                root: dir.path().to_path_buf(),
                exclusions: ExclusionSet::new(&default_rules()),
                fingerprinter: Fingerprinter::default(),
                store: store.clone(),
                resolver: Arc::new(NullResolver),
                restoring: restoring.clone(),
                config,
            },
            Arc::new(move |name: &str, status: ChangeStatus| {
                sink.lock().push((name.to_string(), status));
            }),
        );

        Self {
            dir,
            tx,
            store,
            restoring,
            notified,
            pipeline,
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn notified(&self) -> Vec<(String, ChangeStatus)> {
        self.notified.lock().clone()
    }

    fn send(&self, kind: RawKind, rel: &str) {
        self.tx.send(RawEvent::new(kind, self.root().join(rel))).unwrap();
    }

    /// Let the dispatcher pick up queued events, then stop and drain.
    async fn finish(self) -> (Arc<SqliteStore>, Vec<(String, ChangeStatus)>, TempDir) {
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.pipeline.stop().await;
        let notified = self.notified.lock().clone();
        (self.store, notified, self.dir)
    }
}

// ─── Test 1: dedup ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_duplicate_modify_events_produce_one_alert() {
    let h = Harness::start();
    fs::write(h.root().join("report.txt"), b"quarterly numbers").unwrap();

    h.send(RawKind::Modified, "report.txt");
    h.send(RawKind::Modified, "report.txt");

    let (store, notified, _dir) = h.finish().await;
    let alerts = store.get_alerts(10, false).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].file_name, "report.txt");
    assert_eq!(alerts[0].status, ChangeStatus::Modified);
    assert_eq!(notified, vec![("report.txt".to_string(), ChangeStatus::Modified)]);
}

#[tokio::test]
async fn test_content_change_inside_cooldown_is_suppressed() {
    let h = Harness::start();
    let path = h.root().join("app.log.txt");
    fs::write(&path, b"one").unwrap();
    h.send(RawKind::Modified, "app.log.txt");
    tokio::time::sleep(Duration::from_millis(120)).await;

    fs::write(&path, b"two").unwrap();
    h.send(RawKind::Modified, "app.log.txt");

    let (store, _, _dir) = h.finish().await;
    assert_eq!(store.get_alerts(10, false).unwrap().len(), 1);
}

// ─── Test 2: filters ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_noise_files_never_alert() {
    let h = Harness::start();
    fs::write(h.root().join("~tempfile.tmp"), b"scratch").unwrap();
    fs::write(h.root().join(".main.rs.swp"), b"swap").unwrap();

    h.send(RawKind::Created, "~tempfile.tmp");
    h.send(RawKind::Modified, ".main.rs.swp");

    let (store, notified, _dir) = h.finish().await;
    assert!(store.get_alerts(10, false).unwrap().is_empty());
    assert!(notified.is_empty());
}

#[tokio::test]
async fn test_events_inside_excluded_directories_never_alert() {
    let h = Harness::start();
    fs::create_dir_all(h.root().join(".git/refs")).unwrap();
    fs::write(h.root().join(".git/refs/main"), b"abc123").unwrap();

    h.send(RawKind::Modified, ".git/refs/main");

    let (store, _, _dir) = h.finish().await;
    assert!(store.get_alerts(10, false).unwrap().is_empty());
}

// ─── Test 3: deletions ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_deletion_alerts_with_unknown_actor() {
    let h = Harness::start();
    h.send(RawKind::Removed, "invoice.pdf");

    let (store, notified, _dir) = h.finish().await;
    let alerts = store.get_alerts(10, false).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].status, ChangeStatus::Deleted);
    assert_eq!(alerts[0].actor, UNKNOWN_ACTOR);
    assert_eq!(notified, vec![("invoice.pdf".to_string(), ChangeStatus::Deleted)]);
}

// ─── Test 4: restore-loop suppression ───────────────────────────────────────

#[tokio::test]
async fn test_events_for_restoring_paths_are_dropped() {
    let h = Harness::start();
    let path = h.root().join("config.yml");
    fs::write(&path, b"restored: true").unwrap();

    h.restoring.begin(&path);
    h.send(RawKind::Modified, "config.yml");
    h.restoring.finish(&path);

    let (store, _, _dir) = h.finish().await;
    assert!(store.get_alerts(10, false).unwrap().is_empty());
}

#[tokio::test]
async fn test_identical_tampering_after_restore_is_reported_again() {
    let h = Harness::with_config(PipelineConfig {
        settle_delay: Duration::from_millis(30),
        cooldown: Duration::from_millis(200),
        actor_timeout: Duration::from_millis(200),
    });
    let path = h.root().join("index.html");

    fs::write(&path, b"DEFACED").unwrap();
    h.send(RawKind::Modified, "index.html");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.notified().len(), 1);

    h.restoring.begin(&path);
    fs::write(&path, b"good").unwrap();
    h.send(RawKind::Modified, "index.html");
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.restoring.finish(&path);

    tokio::time::sleep(RESTORE_QUIET_PERIOD + Duration::from_millis(300)).await;
    fs::write(&path, b"DEFACED").unwrap();
    h.send(RawKind::Modified, "index.html");

    let (store, notified, _dir) = h.finish().await;
    assert_eq!(store.get_alerts(10, false).unwrap().len(), 2);
    assert_eq!(
        notified,
        vec![
            ("index.html".to_string(), ChangeStatus::Modified),
            ("index.html".to_string(), ChangeStatus::Modified),
        ]
    );
}

// ─── Test 5: independent paths ──────────────────────────────────────────────

#[tokio::test]
async fn test_distinct_paths_are_all_reported() {
    let h = Harness::start();
    for i in 0..5 {
        fs::write(h.root().join(format!("doc{i}.txt")), format!("doc {i}")).unwrap();
        h.send(RawKind::Created, &format!("doc{i}.txt"));
    }

    let (store, notified, _dir) = h.finish().await;
    assert_eq!(store.get_alerts(10, false).unwrap().len(), 5);
    assert_eq!(notified.len(), 5);
    assert!(notified.iter().all(|(_, s)| *s == ChangeStatus::Created));
}

#[tokio::test]
async fn test_settle_delays_for_distinct_paths_overlap() {
    let settle = Duration::from_millis(300);
    let h = Harness::with_config(PipelineConfig {
        settle_delay: settle,
        cooldown: Duration::from_millis(1500),
        actor_timeout: Duration::from_millis(200),
    });
    let count = 8;
    for i in 0..count {
        fs::write(h.root().join(format!("page{i}.html")), format!("page {i}")).unwrap();
    }

    let started = Instant::now();
    for i in 0..count {
        h.send(RawKind::Modified, &format!("page{i}.html"));
    }
    while h.notified().len() < count && started.elapsed() < Duration::from_secs(10) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let elapsed = started.elapsed();

    let (_, notified, _dir) = h.finish().await;
    assert_eq!(notified.len(), count);
    assert!(
        elapsed < settle * (count as u32) / 2,
        "settle delays ran one after another: {elapsed:?}"
    );
}

// ─── Test 6: per-path ordering ──────────────────────────────────────────────

#[tokio::test]
async fn test_same_path_events_are_handled_in_arrival_order() {
    let h = Harness::start();
    let path = h.root().join("ledger.csv");
    fs::write(&path, b"a,b,c").unwrap();
    h.send(RawKind::Modified, "ledger.csv");
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Both events settle together; the removal must wait for the modify.
    h.send(RawKind::Modified, "ledger.csv");
    fs::remove_file(&path).unwrap();
    h.send(RawKind::Removed, "ledger.csv");
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Same bytes inside the cooldown: only reported because the deletion
    // cleared the earlier fingerprint.
    fs::write(&path, b"a,b,c").unwrap();
    h.send(RawKind::Created, "ledger.csv");

    let (_, notified, _dir) = h.finish().await;
    let statuses: Vec<ChangeStatus> = notified.into_iter().map(|(_, s)| s).collect();
    assert_eq!(
        statuses,
        vec![
            ChangeStatus::Modified,
            ChangeStatus::Modified,
            ChangeStatus::Deleted,
            ChangeStatus::Created,
        ]
    );
}
