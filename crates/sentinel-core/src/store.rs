//! Persistence port consumed by the detection engine.
//!
//! Every method is one atomic unit from the caller's point of view; the
//! implementation is responsible for serializing concurrent writers.
//! `crate::database::SqliteStore` is the production implementation.

use crate::exclusions::ExclusionRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("exclusion pattern already present: {0}")]
    DuplicatePattern(String),

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("corrupt record: {0}")]
    CorruptRecord(String),
}

/// Kind of live change reported in an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeStatus {
    Modified,
    Created,
    Deleted,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Modified => "Modified",
            Self::Created => "Created",
            Self::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Modified" => Ok(Self::Modified),
            "Created" => Ok(Self::Created),
            "Deleted" => Ok(Self::Deleted),
            other => Err(StoreError::CorruptRecord(format!("unknown alert status {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub file_name: String,
    pub status: ChangeStatus,
    pub actor: String,
    pub is_read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

pub trait PersistencePort: Send + Sync {
    fn add_alert(&self, file_name: &str, status: ChangeStatus, actor: &str) -> Result<()>;

    /// Newest first.
    fn get_alerts(&self, limit: usize, unread_only: bool) -> Result<Vec<AlertRecord>>;

    /// Returns the number of alerts flipped to read.
    fn mark_all_read(&self) -> Result<usize>;

    fn clear_alerts(&self) -> Result<usize>;

    fn add_backup_record(&self, original_path: &Path, backup_path: &Path) -> Result<()>;

    fn get_latest_backup(&self, original_path: &Path) -> Result<Option<PathBuf>>;

    /// Full history for one path, newest first.
    fn backup_history(&self, original_path: &Path) -> Result<Vec<BackupRecord>>;

    fn get_setting(&self, key: &str) -> Result<Option<String>>;

    fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    /// `false` when the pattern already exists.
    fn add_exclusion(&self, rule: &ExclusionRule) -> Result<bool>;

    /// `false` when nothing matched.
    fn remove_exclusion(&self, pattern: &str) -> Result<bool>;

    fn list_exclusions(&self) -> Result<Vec<ExclusionRule>>;
}
