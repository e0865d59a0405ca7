//! Parallel directory scanner.
//!
//! Enumeration walks the tree once, pruning excluded directories before they
//! are opened. Fingerprinting then fans out over a bounded rayon pool while
//! the calling thread drains a completion queue, so the snapshot has a single
//! writer and progress is reported from the caller's thread.

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use sentinel_core::baseline::{snapshot_key, Snapshot};
use sentinel_core::exclusions::ExclusionSet;
use sentinel_core::fingerprint::{FingerprintError, Fingerprinter};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

struct Candidate {
    path: PathBuf,
    key: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Scanner {
    fingerprinter: Fingerprinter,
    workers: usize,
}

impl Scanner {
    pub fn new(fingerprinter: Fingerprinter, workers: usize) -> Self {
        Self {
            fingerprinter,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Fingerprint every non-excluded file under `root`.
    ///
    /// Files that cannot be fingerprinted are left out of the result.
    /// `on_progress` receives whole percentages, at most once per percent
    /// step and always with 100 after the last file.
    pub fn scan(
        &self,
        root: &Path,
        exclusions: &ExclusionSet,
        on_progress: Option<&dyn Fn(u8)>,
    ) -> Result<Snapshot> {
        if !root.is_dir() {
            bail!("scan root is not a directory: {}", root.display());
        }

        let candidates = enumerate(root, exclusions);
        let mut snapshot = Snapshot::with_capacity(candidates.len());
        if candidates.is_empty() {
            debug!(root = %root.display(), "nothing to scan");
            return Ok(snapshot);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("scan-worker-{i}"))
            .build()
            .context("build scan worker pool")?;

        let fingerprinter = self.fingerprinter;
        let mut progress = ProgressThrottle::new(candidates.len());
        let (tx, rx) = mpsc::channel::<(usize, Result<String, FingerprintError>)>();

        std::thread::scope(|scope| {
            let candidates = &candidates;
            let pool = &pool;
            scope.spawn(move || {
                pool.install(|| {
                    candidates
                        .par_iter()
                        .enumerate()
                        .for_each_with(tx, |tx, (idx, candidate)| {
                            let _ = tx.send((idx, fingerprinter.fingerprint(&candidate.path)));
                        });
                });
            });

            for (idx, result) in rx {
                match result {
                    Ok(digest) => {
                        snapshot.insert(candidates[idx].key.clone(), digest);
                    }
                    Err(FingerprintError::NotFound(path)) => {
                        debug!(path = %path.display(), "file vanished during scan");
                    }
                    Err(e) => {
                        warn!(error = %e, "skipping file");
                    }
                }
                if let (Some(report), Some(pct)) = (on_progress, progress.advance()) {
                    report(pct);
                }
            }
        });

        info!(
            root = %root.display(),
            candidates = candidates.len(),
            fingerprinted = snapshot.len(),
            workers = self.workers,
            algorithm = %fingerprinter.algorithm(),
            "scan complete"
        );
        Ok(snapshot)
    }
}

/// Phase 1: list candidate files, never descending into excluded directories.
fn enumerate(root: &Path, exclusions: &ExclusionSet) -> Vec<Candidate> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !exclusions.skips_dir(&entry.file_name().to_string_lossy())
        });

    let mut candidates = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "walk error");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if exclusions.skips_file(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        candidates.push(Candidate {
            key: snapshot_key(relative),
            path: entry.into_path(),
        });
    }
    candidates
}

struct ProgressThrottle {
    total: usize,
    done: usize,
    last: Option<u8>,
}

impl ProgressThrottle {
    fn new(total: usize) -> Self {
        Self {
            total,
            done: 0,
            last: None,
        }
    }

    fn advance(&mut self) -> Option<u8> {
        self.done += 1;
        let pct = (self.done * 100 / self.total) as u8;
        if self.last.map_or(true, |last| pct > last) {
            self.last = Some(pct);
            Some(pct)
        } else {
            None
        }
    }
}
