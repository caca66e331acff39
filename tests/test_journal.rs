//! Journal unit tests

use std::collections::HashMap;
use std::fs::OpenOptions;

use deployd::deployment::{Deployment, DeploymentStatus};
use deployd::journal::{FileJournal, JournalConfig};

fn journal_in(dir: &std::path::Path, overrides: impl FnOnce(&mut JournalConfig)) -> FileJournal {
    let mut config = JournalConfig {
        filepath: dir.to_path_buf(),
        ..Default::default()
    };
    overrides(&mut config);
    FileJournal::new(config).unwrap()
}

fn sample_deployment(n: usize) -> Deployment {
    let mut variables = HashMap::new();
    variables.insert("index".to_string(), n.to_string());
    // Vary payload size across records
    variables.insert("padding".to_string(), "x".repeat(n * 17));
    Deployment::new(format!("pkg-{}", n), variables, false, None)
}

#[test]
fn test_write_then_read_roundtrip_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let journal = journal_in(dir.path(), |_| {});

    let written: Vec<Deployment> = (0..25).map(sample_deployment).collect();
    for entry in &written {
        journal.write_entry(entry).unwrap();
    }

    let read: Vec<Deployment> = journal.read_entries();
    assert_eq!(read.len(), written.len());
    for (got, want) in read.iter().zip(&written) {
        assert_eq!(got.id, want.id);
        assert_eq!(got.package_id, want.package_id);
        assert_eq!(got.variables, want.variables);
        assert_eq!(got.status, DeploymentStatus::NotStarted);
    }
}

#[test]
fn test_truncated_tail_returns_intact_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let journal = journal_in(dir.path(), |_| {});

    for n in 0..3 {
        journal.write_entry(&sample_deployment(n)).unwrap();
    }

    // Chop bytes off the last record
    let path = dir.path().join("deployd.j001");
    let len = std::fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 7).unwrap();

    let read: Vec<Deployment> = journal.read_entries();
    assert_eq!(read.len(), 2);
}

#[test]
fn test_corrupt_record_stops_replay() {
    let dir = tempfile::tempdir().unwrap();
    let journal = journal_in(dir.path(), |_| {});

    journal.write_entry(&sample_deployment(1)).unwrap();

    // Append a record whose payload is not valid JSON
    let path = dir.path().join("deployd.j001");
    let mut raw = std::fs::read(&path).unwrap();
    let garbage = b"this is not json";
    raw.extend_from_slice(&(garbage.len() as u32).to_le_bytes());
    raw.extend_from_slice(garbage);
    std::fs::write(&path, &raw).unwrap();

    journal.write_entry(&sample_deployment(2)).unwrap();

    // Replay stops at the malformed record; the later good one is unreachable
    let read: Vec<Deployment> = journal.read_entries();
    assert_eq!(read.len(), 1);
}

#[test]
fn test_backup_rotation_chain() {
    let dir = tempfile::tempdir().unwrap();
    let journal = journal_in(dir.path(), |config| {
        config.backup_on_write = true;
        config.max_backups = 3;
    });

    for n in 0..5 {
        journal.write_entry(&sample_deployment(n)).unwrap();
    }

    assert!(dir.path().join("deployd.j001").exists());
    assert!(dir.path().join("deployd.j002").exists());
    assert!(dir.path().join("deployd.j003").exists());
    // The chain never grows past max-backups
    assert!(!dir.path().join("deployd.j004").exists());

    // The newest backup trails the primary by exactly one record
    let primary: Vec<Deployment> = journal.read_entries();
    assert_eq!(primary.len(), 5);
}

#[test]
fn test_empty_journal_replays_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let journal = journal_in(dir.path(), |_| {});
    let read: Vec<Deployment> = journal.read_entries();
    assert!(read.is_empty());
}
