//! Baseline drift classification.

use sentinel_core::baseline::Snapshot;
use serde::Serialize;
use std::fmt;

/// Ordered the way reports list them: baseline-driven kinds first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ChangeKind {
    Modified,
    Deleted,
    New,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Modified => "Modified",
            Self::Deleted => "Deleted",
            Self::New => "New",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub path: String,
    pub kind: ChangeKind,
    pub detail: String,
}

/// Diff `current` against `baseline`.
///
/// Records driven by the baseline (Modified, Deleted) come first, then New
/// ones. Within each group the order follows map iteration and is not
/// stable; callers that need a stable order should sort.
pub fn compare(baseline: &Snapshot, current: &Snapshot) -> Vec<ChangeRecord> {
    let mut records = Vec::new();

    for (path, expected) in baseline {
        match current.get(path) {
            Some(actual) if actual == expected => {}
            Some(_) => records.push(ChangeRecord {
                path: path.clone(),
                kind: ChangeKind::Modified,
                detail: "Hash changed".into(),
            }),
            None => records.push(ChangeRecord {
                path: path.clone(),
                kind: ChangeKind::Deleted,
                detail: "Missing file".into(),
            }),
        }
    }

    for path in current.keys() {
        if !baseline.contains_key(path) {
            records.push(ChangeRecord {
                path: path.clone(),
                kind: ChangeKind::New,
                detail: "New file detected".into(),
            });
        }
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn snap(entries: &[(&str, &str)]) -> Snapshot {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn identical_snapshots_have_no_drift() {
        let s = snap(&[("a.txt", "1"), ("b/c.txt", "2")]);
        assert!(compare(&s, &s).is_empty());
        assert!(compare(&Snapshot::new(), &Snapshot::new()).is_empty());
    }

    #[test]
    fn classifies_every_changed_key_exactly_once() {
        let baseline = snap(&[("same", "1"), ("changed", "2"), ("gone", "3")]);
        let current = snap(&[("same", "1"), ("changed", "9"), ("fresh", "4")]);

        let got: HashSet<(String, ChangeKind)> = compare(&baseline, &current)
            .into_iter()
            .map(|r| (r.path, r.kind))
            .collect();
        let want: HashSet<(String, ChangeKind)> = [
            ("changed".to_string(), ChangeKind::Modified),
            ("gone".to_string(), ChangeKind::Deleted),
            ("fresh".to_string(), ChangeKind::New),
        ]
        .into_iter()
        .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn baseline_driven_records_precede_new_ones() {
        let baseline = snap(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let current = snap(&[("a", "x"), ("n1", "4"), ("n2", "5")]);
        let records = compare(&baseline, &current);
        let first_new = records
            .iter()
            .position(|r| r.kind == ChangeKind::New)
            .unwrap();
        assert!(records[..first_new]
            .iter()
            .all(|r| r.kind != ChangeKind::New));
        assert!(records[first_new..]
            .iter()
            .all(|r| r.kind == ChangeKind::New));
        assert_eq!(records.len(), 5);
    }
}
