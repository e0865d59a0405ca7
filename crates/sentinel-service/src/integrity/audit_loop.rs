//! Periodic integrity audit loop.
//!
//! Rescans the monitored root against the persisted baseline at a fixed
//! interval. It catches what the watcher cannot see: changes made while the
//! service was down, or events lost to watcher overflow.

use crate::integrity::comparator::{compare, ChangeRecord};
use crate::integrity::scanner::Scanner;
use sentinel_core::baseline::load_baseline;
use sentinel_core::exclusions::ExclusionSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct AuditTarget {
    pub scanner: Scanner,
    pub root: PathBuf,
    pub baseline_path: PathBuf,
    pub exclusions: ExclusionSet,
}

/// Control handle for a running audit loop.
pub struct AuditLoopHandle {
    wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AuditLoopHandle {
    /// Run the next audit now instead of waiting for the interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "audit loop ended abnormally");
        }
    }
}

/// Spawn the audit loop. `on_result` receives the drift found by each run
/// (empty when the tree matches the baseline).
pub fn spawn_audit_loop<F>(target: AuditTarget, interval: Duration, on_result: F) -> AuditLoopHandle
where
    F: Fn(Vec<ChangeRecord>) + Send + Sync + 'static,
{
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let wake_clone = wake.clone();
    let target = Arc::new(target);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "audit loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake_clone.notified() => {
                    debug!("audit loop woken early");
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("audit loop shutting down");
                        return;
                    }
                }
            }

            if *shutdown_rx.borrow() {
                return;
            }

            let run = target.clone();
            let outcome = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Vec<ChangeRecord>>> {
                let Some(baseline) = load_baseline(&run.baseline_path)? else {
                    return Ok(None);
                };
                let current = run.scanner.scan(&run.root, &run.exclusions, None)?;
                Ok(Some(compare(&baseline, &current)))
            })
            .await;

            match outcome {
                Ok(Ok(Some(records))) => {
                    info!(changes = records.len(), "audit complete");
                    on_result(records);
                }
                Ok(Ok(None)) => debug!("audit loop: no baseline available, skipping scan"),
                Ok(Err(e)) => warn!(error = %e, "audit scan failed"),
                Err(e) => warn!(error = %e, "audit task failed"),
            }
        }
    });

    AuditLoopHandle {
        wake,
        shutdown_tx,
        handle,
    }
}
