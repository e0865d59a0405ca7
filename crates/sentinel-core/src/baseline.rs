//! The persisted baseline: the last accepted-good snapshot.
//!
//! The document is a flat JSON object of root-relative path to hex digest.
//! It is only ever read and written whole; callers that change a single key
//! load, mutate and save the full document. Two such updates racing each
//! other resolve as last-writer-wins.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Root-relative path (always `/`-separated) to content digest.
pub type Snapshot = HashMap<String, String>;

/// Load a baseline; `None` when no baseline has been created yet.
pub fn load_baseline(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = fs::read_to_string(path)
        .with_context(|| format!("read baseline {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&json)
        .with_context(|| format!("parse baseline {}", path.display()))?;
    debug!(path = %path.display(), entries = snapshot.len(), "baseline loaded");
    Ok(Some(snapshot))
}

/// Replace the baseline document atomically (temp file in the same
/// directory, then rename over the old one).
pub fn save_baseline(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("create baseline dir {}", parent.display()))?;

    // Sorted keys keep the document diffable.
    let ordered: BTreeMap<&String, &String> = snapshot.iter().collect();
    let json = serde_json::to_string_pretty(&ordered)?;

    let mut staging = tempfile::NamedTempFile::new_in(parent)?;
    staging.write_all(json.as_bytes())?;
    staging.as_file().sync_all()?;
    staging
        .persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("replace baseline {}", path.display()))?;
    debug!(path = %path.display(), entries = snapshot.len(), "baseline saved");
    Ok(())
}

pub fn clear_baseline(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("remove baseline {}", path.display())),
    }
}

/// Normalize a root-relative path into a snapshot key.
pub fn snapshot_key(relative: &Path) -> String {
    let mut key = String::new();
    for component in relative.components() {
        if !key.is_empty() {
            key.push('/');
        }
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    key
}
