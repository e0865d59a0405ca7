//! Integration tests for scanning and drift classification.
//!
//! Tests cover:
//!  1. Excluded directories and extensions never reach the snapshot
//!  2. Baseline vs. current scan end to end
//!  3. Progress reporting finishes at 100
//!  4. Empty trees

use parking_lot::Mutex;
use sentinel_core::exclusions::{default_rules, ExclusionKind, ExclusionRule, ExclusionSet};
use sentinel_core::fingerprint::Fingerprinter;
use sentinel_service::integrity::comparator::{compare, ChangeKind};
use sentinel_service::integrity::scanner::Scanner;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn write(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn scanner() -> Scanner {
    Scanner::new(Fingerprinter::default(), 4)
}

// ─── Test 1: exclusions ─────────────────────────────────────────────────────

#[test]
fn test_scan_skips_excluded_dirs_and_extensions() {
    let dir = tempdir().unwrap();
    write(dir.path(), "a/keep.txt", b"keep");
    write(dir.path(), "a/.git/x", b"vcs");
    write(dir.path(), "b.exe", b"MZ");

    let exclusions = ExclusionSet::new(&[
        ExclusionRule::new(".git", ExclusionKind::Directory),
        ExclusionRule::new(".exe", ExclusionKind::Extension),
    ]);
    let snapshot = scanner().scan(dir.path(), &exclusions, None).unwrap();

    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.contains_key("a/keep.txt"));
    assert_eq!(snapshot["a/keep.txt"].len(), 64);
}

#[test]
fn test_scan_skips_excluded_file_names() {
    let dir = tempdir().unwrap();
    write(dir.path(), "Thumbs.db", b"cache");
    write(dir.path(), "docs/Thumbs.db", b"cache");
    write(dir.path(), "docs/readme.md", b"# hi");

    let mut rules = default_rules();
    rules.push(ExclusionRule::new("Thumbs.db", ExclusionKind::File));
    let snapshot = scanner()
        .scan(dir.path(), &ExclusionSet::new(&rules), None)
        .unwrap();

    assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["docs/readme.md"]);
}

// ─── Test 2: end to end ─────────────────────────────────────────────────────

#[test]
fn test_modified_and_new_files_are_reported() {
    let dir = tempdir().unwrap();
    write(dir.path(), "f.txt", b"version one");
    let exclusions = ExclusionSet::default();

    let baseline = scanner().scan(dir.path(), &exclusions, None).unwrap();

    write(dir.path(), "f.txt", b"version two");
    write(dir.path(), "g.txt", b"brand new");
    let current = scanner().scan(dir.path(), &exclusions, None).unwrap();

    let records = compare(&baseline, &current);
    let summary: Vec<(&str, ChangeKind)> = records
        .iter()
        .map(|r| (r.path.as_str(), r.kind))
        .collect();
    assert_eq!(
        summary,
        vec![("f.txt", ChangeKind::Modified), ("g.txt", ChangeKind::New)]
    );
}

#[test]
fn test_rescan_of_untouched_tree_has_no_drift() {
    let dir = tempdir().unwrap();
    for i in 0..20 {
        write(dir.path(), &format!("dir{}/file{}.txt", i % 3, i), format!("{i}").as_bytes());
    }
    let exclusions = ExclusionSet::default();
    let first = scanner().scan(dir.path(), &exclusions, None).unwrap();
    let second = scanner().scan(dir.path(), &exclusions, None).unwrap();
    assert_eq!(first.len(), 20);
    assert!(compare(&first, &second).is_empty());
}

// ─── Test 3: progress ───────────────────────────────────────────────────────

#[test]
fn test_progress_is_monotonic_and_ends_at_100() {
    let dir = tempdir().unwrap();
    for i in 0..250 {
        write(dir.path(), &format!("f{i}.bin"), &[i as u8; 16]);
    }
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let report = move |pct: u8| sink.lock().push(pct);

    let snapshot = scanner()
        .scan(dir.path(), &ExclusionSet::default(), Some(&report as &dyn Fn(u8)))
        .unwrap();
    assert_eq!(snapshot.len(), 250);

    let seen = seen.lock();
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert!(seen.len() <= 101);
}

// ─── Test 4: empty trees ────────────────────────────────────────────────────

#[test]
fn test_empty_tree_yields_empty_snapshot_without_progress() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
    write(dir.path(), ".git/objects/aa", b"blob");

    let calls = Arc::new(Mutex::new(0usize));
    let counter = calls.clone();
    let report = move |_pct: u8| *counter.lock() += 1;

    let snapshot = scanner()
        .scan(dir.path(), &ExclusionSet::new(&default_rules()), Some(&report as &dyn Fn(u8)))
        .unwrap();
    assert!(snapshot.is_empty());
    assert_eq!(*calls.lock(), 0);
}

#[test]
fn test_scan_of_missing_root_fails() {
    let dir = tempdir().unwrap();
    assert!(scanner()
        .scan(&dir.path().join("nope"), &ExclusionSet::default(), None)
        .is_err());
}
