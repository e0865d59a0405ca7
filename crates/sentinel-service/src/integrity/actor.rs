//! Best-effort attribution of a change to the process holding the file open.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Label used when no process can be tied to a change.
pub const UNKNOWN_ACTOR: &str = "System / Background";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Process { pid: u32, name: String },
    Unknown,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process { pid, name } => write!(f, "{name} (PID {pid})"),
            Self::Unknown => f.write_str(UNKNOWN_ACTOR),
        }
    }
}

/// Platform capability: which process has `path` open right now.
/// Implementations return [`Actor::Unknown`] instead of failing.
pub trait ActorResolver: Send + Sync {
    fn resolve(&self, path: &Path) -> Actor;
}

/// Resolver for platforms without a supported process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResolver;

impl ActorResolver for NullResolver {
    fn resolve(&self, _path: &Path) -> Actor {
        Actor::Unknown
    }
}

/// Walks `/proc/<pid>/fd` looking for a descriptor that points at the path.
/// Processes whose descriptors cannot be read are skipped.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct ProcfsResolver {
    proc_root: PathBuf,
}

#[cfg(target_os = "linux")]
impl Default for ProcfsResolver {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

#[cfg(target_os = "linux")]
impl ActorResolver for ProcfsResolver {
    fn resolve(&self, path: &Path) -> Actor {
        let target = normalize(path);
        let Ok(entries) = std::fs::read_dir(&self.proc_root) else {
            return Actor::Unknown;
        };
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                trace!(pid, "fd table not readable");
                continue;
            };
            let holds_file = fds
                .flatten()
                .filter_map(|fd| std::fs::read_link(fd.path()).ok())
                .any(|link| link.to_string_lossy().to_lowercase() == target);
            if holds_file {
                let name = std::fs::read_to_string(entry.path().join("comm"))
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                return Actor::Process { pid, name };
            }
        }
        Actor::Unknown
    }
}

/// The resolver for the current platform.
pub fn platform_resolver() -> Arc<dyn ActorResolver> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcfsResolver::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(NullResolver)
    }
}

/// Case-insensitive comparison form of a path.
#[cfg(target_os = "linux")]
fn normalize(path: &Path) -> String {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    canonical.to_string_lossy().to_lowercase()
}

/// Run `resolver` on the blocking pool, giving up after `timeout`.
pub async fn resolve_bounded(
    resolver: Arc<dyn ActorResolver>,
    path: PathBuf,
    timeout: Duration,
) -> Actor {
    let lookup = tokio::task::spawn_blocking(move || resolver.resolve(&path));
    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(actor)) => actor,
        Ok(Err(e)) => {
            debug!(error = %e, "actor lookup task failed");
            Actor::Unknown
        }
        Err(_) => {
            debug!(timeout_ms = timeout.as_millis() as u64, "actor lookup timed out");
            Actor::Unknown
        }
    }
}
