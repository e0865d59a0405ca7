use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "sentinel";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Where everything the monitor persists lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    /// Use `override_dir` when given, otherwise the per-user data directory.
    pub fn resolve(override_dir: Option<&Path>) -> anyhow::Result<Self> {
        let root = match override_dir {
            Some(dir) => dir.to_path_buf(),
            None => data_dir()?,
        };
        Ok(Self { root })
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("sentinel.db")
    }

    pub fn baseline_path(&self) -> PathBuf {
        self.root.join("baseline.json")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backups")
    }
}
