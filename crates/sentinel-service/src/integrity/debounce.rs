//! Per-path duplicate suppression for live events.
//!
//! The lock is held only for the compare-and-update; settle delays and actor
//! lookups happen outside it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct DebounceEntry {
    fingerprint: String,
    at: Instant,
}

#[derive(Debug, Default)]
pub struct DebounceMap {
    entries: Mutex<HashMap<PathBuf, DebounceEntry>>,
}

impl DebounceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation of an existing file. Returns `false` when the
    /// event is a duplicate: same content as last time, or still inside the
    /// cooldown window of the last recorded event.
    pub fn observe(&self, path: &Path, fingerprint: &str, now: Instant, cooldown: Duration) -> bool {
        let mut entries = self.entries.lock();
        if let Some(prev) = entries.get(path) {
            if prev.fingerprint == fingerprint || now.saturating_duration_since(prev.at) < cooldown {
                return false;
            }
        }
        entries.insert(
            path.to_path_buf(),
            DebounceEntry {
                fingerprint: fingerprint.to_string(),
                at: now,
            },
        );
        true
    }

    /// Drop state for a path observed as deleted.
    pub fn forget(&self, path: &Path) {
        self.entries.lock().remove(path);
    }

    /// Number of paths currently tracked.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
