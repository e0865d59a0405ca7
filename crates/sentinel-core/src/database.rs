//! SQLite-backed persistence for alerts, backup history, settings and
//! exclusion rules.

use crate::exclusions::{default_rules, ExclusionKind, ExclusionRule};
use crate::store::{
    AlertRecord, BackupRecord, ChangeStatus, PersistencePort, Result, StoreError,
};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

const DEFAULT_SETTINGS: &[(&str, &str)] = &[("run_on_startup", "1"), ("last_directory", "")];

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        debug!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        if current < 1 {
            Self::migrate_v1(&conn)?;
        }
        Ok(())
    }

    /// Schema version 1 plus first-run seed data.
    fn migrate_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS exclusions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                file_name TEXT NOT NULL,
                status TEXT NOT NULL,
                actor TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_timestamp ON alerts(timestamp DESC);

            CREATE TABLE IF NOT EXISTS backups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_path TEXT NOT NULL,
                backup_path TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_backups_original ON backups(original_path, timestamp DESC);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        for (key, value) in DEFAULT_SETTINGS {
            conn.execute(
                "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        for rule in default_rules() {
            conn.execute(
                "INSERT OR IGNORE INTO exclusions (pattern, kind) VALUES (?1, ?2)",
                params![rule.pattern, rule.kind.as_str()],
            )?;
        }
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, String, bool)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get::<_, i64>(5)? != 0,
        ))
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRecord(format!("bad timestamp {raw}: {e}")))
}

/// Fixed-width UTC text so lexical order in SQL is chronological order.
fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl PersistencePort for SqliteStore {
    fn add_alert(&self, file_name: &str, status: ChangeStatus, actor: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO alerts (timestamp, file_name, status, actor, is_read) VALUES (?1, ?2, ?3, ?4, 0)",
            params![now_text(), file_name, status.as_str(), actor],
        )?;
        Ok(())
    }

    fn get_alerts(&self, limit: usize, unread_only: bool) -> Result<Vec<AlertRecord>> {
        let conn = self.conn.lock();
        let sql = if unread_only {
            "SELECT id, timestamp, file_name, status, actor, is_read FROM alerts
             WHERE is_read = 0 ORDER BY timestamp DESC, id DESC LIMIT ?1"
        } else {
            "SELECT id, timestamp, file_name, status, actor, is_read FROM alerts
             ORDER BY timestamp DESC, id DESC LIMIT ?1"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![limit as i64], Self::row_to_alert)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, ts, file_name, status, actor, is_read)| {
                Ok(AlertRecord {
                    id,
                    timestamp: parse_timestamp(&ts)?,
                    file_name,
                    status: status.parse()?,
                    actor,
                    is_read,
                })
            })
            .collect()
    }

    fn mark_all_read(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("UPDATE alerts SET is_read = 1 WHERE is_read = 0", [])?)
    }

    fn clear_alerts(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM alerts", [])?)
    }

    fn add_backup_record(&self, original_path: &Path, backup_path: &Path) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backups (original_path, backup_path, timestamp) VALUES (?1, ?2, ?3)",
            params![
                path_key(original_path),
                path_key(backup_path),
                now_text()
            ],
        )?;
        Ok(())
    }

    fn get_latest_backup(&self, original_path: &Path) -> Result<Option<PathBuf>> {
        let conn = self.conn.lock();
        let found: Option<String> = conn
            .query_row(
                "SELECT backup_path FROM backups WHERE original_path = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT 1",
                params![path_key(original_path)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.map(PathBuf::from))
    }

    fn backup_history(&self, original_path: &Path) -> Result<Vec<BackupRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT original_path, backup_path, timestamp FROM backups
             WHERE original_path = ?1 ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![path_key(original_path)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(original, backup, ts)| {
                Ok(BackupRecord {
                    original_path: PathBuf::from(original),
                    backup_path: PathBuf::from(backup),
                    timestamp: parse_timestamp(&ts)?,
                })
            })
            .collect()
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn add_exclusion(&self, rule: &ExclusionRule) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO exclusions (pattern, kind) VALUES (?1, ?2)",
            params![rule.pattern, rule.kind.as_str()],
        )?;
        Ok(inserted == 1)
    }

    fn remove_exclusion(&self, pattern: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM exclusions WHERE pattern = ?1", params![pattern])?;
        Ok(removed > 0)
    }

    fn list_exclusions(&self) -> Result<Vec<ExclusionRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT pattern, kind FROM exclusions ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(pattern, kind)| {
                let kind = kind
                    .parse::<ExclusionKind>()
                    .map_err(StoreError::CorruptRecord)?;
                Ok(ExclusionRule { pattern, kind })
            })
            .collect()
    }
}
