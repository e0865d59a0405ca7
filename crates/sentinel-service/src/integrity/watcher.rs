//! Recursive file system watcher built on `notify`.
//!
//! `notify` delivers events on its own thread; a bridge thread classifies
//! them and forwards them into a tokio channel consumed by the change
//! pipeline. Dropping the [`FileWatcher`] closes the OS watch handle, which
//! closes the bridge and finally the receiving side of the channel.

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, error, info};

/// Raw change kinds forwarded to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawKind,
    pub path: PathBuf,
}

impl RawEvent {
    pub fn new(kind: RawKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl FileWatcher {
    /// Start watching `root` recursively.
    pub fn start(root: &Path) -> Result<(Self, tokio_mpsc::UnboundedReceiver<RawEvent>)> {
        let (change_tx, change_rx) = tokio_mpsc::unbounded_channel();
        let (sync_tx, sync_rx) = mpsc::channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = sync_tx.send(res);
            },
            Config::default(),
        )
        .context("create file watcher")?;

        std::thread::Builder::new()
            .name("file-watcher-bridge".into())
            .spawn(move || loop {
                match sync_rx.recv() {
                    Ok(Ok(event)) => {
                        for change in classify_event(&event) {
                            if change_tx.send(change).is_err() {
                                debug!("pipeline dropped, stopping watcher bridge");
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => error!("file watcher error: {}", e),
                    Err(_) => {
                        debug!("watcher channel closed");
                        return;
                    }
                }
            })
            .context("spawn watcher bridge")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", root.display()))?;
        info!(root = %root.display(), "watching");

        Ok((
            Self {
                _watcher: watcher,
                root: root.to_path_buf(),
            },
            change_rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Map a notify event to create/modify/remove changes. A rename becomes a
/// removal of the old name and a creation of the new one. Directory-only
/// events are dropped.
fn classify_event(event: &Event) -> Vec<RawEvent> {
    let mut changes = Vec::new();
    match &event.kind {
        EventKind::Create(kind) => {
            if !matches!(kind, notify::event::CreateKind::Folder) {
                for path in &event.paths {
                    changes.push(RawEvent::new(RawKind::Created, path.clone()));
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() >= 2 => {
                changes.push(RawEvent::new(RawKind::Removed, event.paths[0].clone()));
                changes.push(RawEvent::new(RawKind::Created, event.paths[1].clone()));
            }
            RenameMode::From => {
                for path in &event.paths {
                    changes.push(RawEvent::new(RawKind::Removed, path.clone()));
                }
            }
            RenameMode::To => {
                for path in &event.paths {
                    changes.push(RawEvent::new(RawKind::Created, path.clone()));
                }
            }
            _ => {
                for path in &event.paths {
                    let kind = if path.exists() {
                        RawKind::Created
                    } else {
                        RawKind::Removed
                    };
                    changes.push(RawEvent::new(kind, path.clone()));
                }
            }
        },
        // Metadata-only changes do not alter content.
        EventKind::Modify(ModifyKind::Metadata(_)) => {}
        EventKind::Modify(_) => {
            for path in &event.paths {
                changes.push(RawEvent::new(RawKind::Modified, path.clone()));
            }
        }
        EventKind::Remove(kind) => {
            if !matches!(kind, notify::event::RemoveKind::Folder) {
                for path in &event.paths {
                    changes.push(RawEvent::new(RawKind::Removed, path.clone()));
                }
            }
        }
        _ => {}
    }
    changes
}
