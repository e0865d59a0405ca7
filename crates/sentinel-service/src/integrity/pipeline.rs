//! Live change pipeline.
//!
//! Receives `RawEvent`s from the `FileWatcher` and turns the ones that matter
//! into alerts:
//!
//! 1. noise filter (editor swap files, lock files, temp downloads)
//! 2. excluded directory segments
//! 3. restore-loop suppression
//! 4. settle delay, then wait for the previous event on the same path
//! 5. dedup and cooldown against the `DebounceMap`
//! 6. bounded actor lookup
//! 7. alert persisted, then the callback
//!
//! Steps 1-3 run on the dispatcher; everything after runs in a task per
//! event. Tasks for different paths never wait on each other. Tasks for the
//! same path chain through a oneshot so they finish in arrival order.

use crate::enforcement::restore::RestoringSet;
use crate::integrity::actor::{resolve_bounded, Actor, ActorResolver};
use crate::integrity::debounce::DebounceMap;
use crate::integrity::watcher::{FileWatcher, RawEvent, RawKind};
use anyhow::Result;
use sentinel_core::exclusions::ExclusionSet;
use sentinel_core::fingerprint::{FingerprintError, Fingerprinter};
use sentinel_core::store::{ChangeStatus, PersistencePort};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// In-flight events get this long to finish once a stop is requested.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Ordering entries are pruned once the map grows past this.
const ORDER_PRUNE_THRESHOLD: usize = 256;

const NOISE_PREFIXES: &[&str] = &["~", ".", "tmp"];

const NOISE_SUFFIXES: &[&str] = &[
    ".tmp", ".temp", ".swp", ".swo", ".swx", ".lock", ".lck", ".part", ".partial",
    ".crdownload", ".journal", "-journal", "-wal", "-shm",
];

/// Invoked on a tokio worker thread with (file name, status) for every
/// alert that was persisted.
pub type AlertCallback = Arc<dyn Fn(&str, ChangeStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub settle_delay: Duration,
    pub cooldown: Duration,
    pub actor_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            cooldown: Duration::from_millis(1500),
            actor_timeout: Duration::from_secs(2),
        }
    }
}

/// Everything an event task needs.
pub struct PipelineContext {
    pub root: PathBuf,
    pub exclusions: ExclusionSet,
    pub fingerprinter: Fingerprinter,
    pub store: Arc<dyn PersistencePort>,
    pub resolver: Arc<dyn ActorResolver>,
    pub restoring: Arc<RestoringSet>,
    pub config: PipelineConfig,
}

struct Shared {
    ctx: PipelineContext,
    debounce: DebounceMap,
    on_alert: AlertCallback,
}

/// A running pipeline. [`ChangePipeline::stop`] waits for in-flight events;
/// dropping the handle also ends the dispatcher but does not wait for it.
pub struct ChangePipeline {
    watcher: Option<FileWatcher>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ChangePipeline {
    /// Watch `ctx.root` and run the pipeline on its events.
    pub fn watch(ctx: PipelineContext, on_alert: AlertCallback) -> Result<Self> {
        let (watcher, raw_rx) = FileWatcher::start(&ctx.root)?;
        let mut pipeline = spawn_change_pipeline(raw_rx, ctx, on_alert);
        pipeline.watcher = Some(watcher);
        Ok(pipeline)
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Close the OS watch, let in-flight events finish (bounded), and wait
    /// for the dispatcher to exit.
    pub async fn stop(mut self) {
        if let Some(watcher) = self.watcher.take() {
            debug!(root = %watcher.root().display(), "closing watch");
        }
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "change pipeline task ended abnormally");
        }
    }
}

/// Spawn the dispatcher over an existing event source.
pub fn spawn_change_pipeline(
    mut raw_rx: mpsc::UnboundedReceiver<RawEvent>,
    ctx: PipelineContext,
    on_alert: AlertCallback,
) -> ChangePipeline {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        ctx,
        debounce: DebounceMap::new(),
        on_alert,
    });

    let handle = tokio::spawn(async move {
        info!(root = %shared.ctx.root.display(), "change pipeline started");
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut order: HashMap<PathBuf, oneshot::Receiver<()>> = HashMap::new();

        loop {
            tokio::select! {
                maybe = raw_rx.recv() => match maybe {
                    Some(event) => dispatch(&shared, event, &mut tasks, &mut order),
                    None => {
                        debug!("event source closed");
                        break;
                    }
                },
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(res) = tasks.join_next(), if !tasks.is_empty() => log_task_result(res),
            }
        }

        let in_flight = tasks.len();
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while let Some(res) = tasks.join_next().await {
                log_task_result(res);
            }
        })
        .await;
        if drained.is_err() {
            warn!(in_flight, "abandoning unfinished change events");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!(tracked = shared.debounce.len(), "change pipeline stopped");
    });

    ChangePipeline {
        watcher: None,
        shutdown_tx,
        handle,
    }
}

fn log_task_result(res: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            error!(error = %e, "change event task panicked");
        }
    }
}

fn dispatch(
    shared: &Arc<Shared>,
    event: RawEvent,
    tasks: &mut JoinSet<()>,
    order: &mut HashMap<PathBuf, oneshot::Receiver<()>>,
) {
    let path = event.path.clone();
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return;
    };
    if is_noise(&name) {
        trace!(path = %path.display(), "noise event dropped");
        return;
    }
    let relative = path
        .strip_prefix(&shared.ctx.root)
        .unwrap_or(path.as_path());
    if shared.ctx.exclusions.has_excluded_dir(relative) {
        trace!(path = %path.display(), "excluded directory event dropped");
        return;
    }
    if shared.ctx.restoring.suppresses(&path) {
        debug!(path = %path.display(), "event from restore suppressed");
        shared.debounce.forget(&path);
        return;
    }

    if order.len() >= ORDER_PRUNE_THRESHOLD {
        order.retain(|_, rx| matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
    let previous = order.remove(&path);
    let (done_tx, done_rx) = oneshot::channel::<()>();
    order.insert(path, done_rx);

    let shared = shared.clone();
    tasks.spawn(async move {
        tokio::time::sleep(shared.ctx.config.settle_delay).await;
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        process(&shared, event, name).await;
        drop(done_tx);
    });
}

async fn process(shared: &Shared, event: RawEvent, name: String) {
    let ctx = &shared.ctx;
    let path = event.path;

    // The restored content is not the last observed state, so the next
    // change to this path must not be compared against it.
    if ctx.restoring.suppresses(&path) {
        debug!(path = %path.display(), "event from restore suppressed");
        shared.debounce.forget(&path);
        return;
    }

    let exists = match std::fs::metadata(&path) {
        Ok(meta) if meta.is_dir() => return,
        Ok(_) => true,
        Err(_) => false,
    };

    if exists {
        match fingerprint_blocking(ctx.fingerprinter, &path).await {
            Ok(digest) => {
                if !shared
                    .debounce
                    .observe(&path, &digest, Instant::now(), ctx.config.cooldown)
                {
                    trace!(path = %path.display(), "duplicate event suppressed");
                    return;
                }
            }
            Err(FingerprintError::NotFound(_)) => shared.debounce.forget(&path),
            Err(e) => debug!(path = %path.display(), error = %e, "no fingerprint, alerting without dedup"),
        }
    } else {
        shared.debounce.forget(&path);
    }

    let actor = if exists {
        resolve_bounded(ctx.resolver.clone(), path.clone(), ctx.config.actor_timeout).await
    } else {
        Actor::Unknown
    };

    let status = match event.kind {
        RawKind::Created => ChangeStatus::Created,
        RawKind::Modified => ChangeStatus::Modified,
        RawKind::Removed => ChangeStatus::Deleted,
    };

    let store = ctx.store.clone();
    let actor_label = actor.to_string();
    let file_name = name.clone();
    let persisted = tokio::task::spawn_blocking(move || {
        store.add_alert(&file_name, status, &actor_label)
    })
    .await;

    match persisted {
        Ok(Ok(())) => {
            info!(path = %path.display(), status = %status, actor = %actor, "change detected");
            (shared.on_alert)(&name, status);
        }
        Ok(Err(e)) => error!(path = %path.display(), error = %e, "failed to record alert"),
        Err(e) => error!(path = %path.display(), error = %e, "alert write task failed"),
    }
}

async fn fingerprint_blocking(
    fingerprinter: Fingerprinter,
    path: &Path,
) -> std::result::Result<String, FingerprintError> {
    let owned = path.to_path_buf();
    match tokio::task::spawn_blocking(move || fingerprinter.fingerprint(&owned)).await {
        Ok(result) => result,
        Err(e) => Err(FingerprintError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        }),
    }
}

/// Transient files written by editors, browsers, package managers and
/// databases.
pub fn is_noise(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    NOISE_PREFIXES.iter().any(|p| lower.starts_with(p))
        || NOISE_SUFFIXES.iter().any(|s| lower.ends_with(s))
        || lower.contains('$')
}
