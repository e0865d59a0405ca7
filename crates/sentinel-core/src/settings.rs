use crate::fingerprint::HashAlgorithm;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Directory protected on startup; `None` until a baseline is created.
    pub monitored_root: Option<PathBuf>,
    pub run_on_startup: bool,
    pub hash_algorithm: HashAlgorithm,
    /// Overrides the `min(32, cpus * 4)` scan pool size.
    pub scan_workers: Option<usize>,
    pub settle_delay_ms: u64,
    pub cooldown_ms: u64,
    pub actor_timeout_ms: u64,
    /// Periodic re-audit of the whole tree; `0` disables it.
    pub audit_interval_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            monitored_root: None,
            run_on_startup: true,
            hash_algorithm: HashAlgorithm::Sha256,
            scan_workers: None,
            settle_delay_ms: 500,
            cooldown_ms: 1500,
            actor_timeout_ms: 2000,
            audit_interval_secs: 0,
        }
    }
}

impl MonitorSettings {
    pub fn validate(&self) -> Result<(), StoreError> {
        if let Some(workers) = self.scan_workers {
            if !(1..=64).contains(&workers) {
                return Err(invalid("scan_workers", "must be between 1 and 64"));
            }
        }
        if !(50..=5000).contains(&self.settle_delay_ms) {
            return Err(invalid("settle_delay_ms", "must be between 50 and 5000"));
        }
        if self.cooldown_ms > 60_000 {
            return Err(invalid("cooldown_ms", "must be at most 60000"));
        }
        if !(100..=30_000).contains(&self.actor_timeout_ms) {
            return Err(invalid("actor_timeout_ms", "must be between 100 and 30000"));
        }
        Ok(())
    }

    /// Set one field from its textual form, as typed on the command line.
    /// The result is validated before it is returned.
    pub fn apply(&self, key: &str, value: &str) -> Result<Self, StoreError> {
        let mut next = self.clone();
        match key {
            "monitored_root" => {
                next.monitored_root = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "run_on_startup" => next.run_on_startup = parse_bool(key, value)?,
            "hash_algorithm" => {
                next.hash_algorithm = value
                    .parse()
                    .map_err(|reason: String| invalid(key, &reason))?
            }
            "scan_workers" => {
                next.scan_workers = if value.is_empty() || value == "auto" {
                    None
                } else {
                    Some(parse_num(key, value)?)
                }
            }
            "settle_delay_ms" => next.settle_delay_ms = parse_num(key, value)?,
            "cooldown_ms" => next.cooldown_ms = parse_num(key, value)?,
            "actor_timeout_ms" => next.actor_timeout_ms = parse_num(key, value)?,
            "audit_interval_secs" => next.audit_interval_secs = parse_num(key, value)?,
            _ => return Err(invalid(key, "unknown setting")),
        }
        next.validate()?;
        Ok(next)
    }

    pub fn effective_workers(&self) -> usize {
        self.scan_workers.unwrap_or_else(default_workers)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn actor_timeout(&self) -> Duration {
        Duration::from_millis(self.actor_timeout_ms)
    }

    pub fn audit_interval(&self) -> Option<Duration> {
        (self.audit_interval_secs > 0).then(|| Duration::from_secs(self.audit_interval_secs))
    }
}

/// `min(32, logical cpus * 4)`.
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * 4).min(32)
}

fn invalid(key: &str, reason: &str) -> StoreError {
    StoreError::InvalidSetting {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, StoreError> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, "expected true or false")),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| invalid(key, "expected a non-negative integer"))
}
