//! Exclusion rules shared by the scanner and the live change pipeline.
//!
//! Rules are operator data (seeded on first run, then edited through the
//! store); this module only compiles them into fast lookups.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExclusionKind {
    Directory,
    File,
    Extension,
}

impl ExclusionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::File => "file",
            Self::Extension => "extension",
        }
    }
}

impl fmt::Display for ExclusionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ExclusionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "directory" | "dir" => Ok(Self::Directory),
            "file" => Ok(Self::File),
            "extension" | "ext" => Ok(Self::Extension),
            other => Err(format!("unknown exclusion kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub pattern: String,
    pub kind: ExclusionKind,
}

impl ExclusionRule {
    pub fn new(pattern: impl Into<String>, kind: ExclusionKind) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
        }
    }
}

/// Rules inserted into a fresh store: VCS metadata, bytecode caches and
/// Windows executables.
pub fn default_rules() -> Vec<ExclusionRule> {
    vec![
        ExclusionRule::new(".git", ExclusionKind::Directory),
        ExclusionRule::new("__pycache__", ExclusionKind::Directory),
        ExclusionRule::new(".exe", ExclusionKind::Extension),
    ]
}

/// Compiled form of a rule list. Matching is exact on names and
/// suffix-based on extensions.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    directories: HashSet<String>,
    files: HashSet<String>,
    extensions: Vec<String>,
}

impl ExclusionSet {
    pub fn new(rules: &[ExclusionRule]) -> Self {
        let mut set = Self::default();
        for rule in rules {
            match rule.kind {
                ExclusionKind::Directory => {
                    set.directories.insert(rule.pattern.clone());
                }
                ExclusionKind::File => {
                    set.files.insert(rule.pattern.clone());
                }
                ExclusionKind::Extension => set.extensions.push(rule.pattern.clone()),
            }
        }
        set
    }

    /// Whether a directory with this name should be pruned before descending.
    pub fn skips_dir(&self, name: &str) -> bool {
        self.directories.contains(name)
    }

    /// Whether a file with this base name is excluded by name or suffix.
    pub fn skips_file(&self, name: &str) -> bool {
        self.files.contains(name) || self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    /// Whether any segment of `path` names an excluded directory.
    pub fn has_excluded_dir(&self, path: &Path) -> bool {
        if self.directories.is_empty() {
            return false;
        }
        path.components().any(|c| match c {
            Component::Normal(seg) => seg.to_str().is_some_and(|s| self.directories.contains(s)),
            _ => false,
        })
    }
}
