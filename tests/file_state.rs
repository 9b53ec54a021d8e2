use std::fs;

use tempfile::TempDir;

use overrun::exec::ProcessHandle;
use overrun::state::{
    FileMemo, FileStateStore, PersistedRecord, RecordStatus, StateStore, TransientMemo,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn sample(pid: u32) -> PersistedRecord {
    PersistedRecord::new(
        "abc123",
        ProcessHandle::new(pid, 42).with_output("/tmp/overrun/logs/db.log"),
        RecordStatus::Running,
    )
}

#[test]
fn records_survive_a_new_store_instance() -> TestResult {
    let dir = TempDir::new()?;

    let store = FileStateStore::new(dir.path());
    store.put("db", &sample(10))?;
    store.put("api", &sample(11).with_status(RecordStatus::Starting))?;

    let reopened = FileStateStore::new(dir.path());
    let records = reopened.load()?;
    assert_eq!(records.len(), 2);
    assert_eq!(records["db"].handle, sample(10).handle);
    assert_eq!(records["db"].fingerprint, "abc123");
    assert_eq!(records["api"].last_known_status, RecordStatus::Starting);
    assert_eq!(reopened.get("db")?, Some(records["db"].clone()));
    Ok(())
}

#[test]
fn put_replaces_and_remove_forgets() -> TestResult {
    let dir = TempDir::new()?;
    let store = FileStateStore::new(dir.path());

    store.put("db", &sample(10))?;
    store.put("db", &sample(20))?;
    assert_eq!(store.get("db")?.map(|r| r.handle.pid), Some(20));

    store.remove("db")?;
    assert_eq!(store.get("db")?, None);
    // Removing twice is fine.
    store.remove("db")?;

    // Only the record file itself was ever written; no temp files remain.
    let leftovers: Vec<_> = fs::read_dir(store.records_dir())?.collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
    Ok(())
}

#[test]
fn missing_directory_loads_as_empty() -> TestResult {
    let dir = TempDir::new()?;
    let store = FileStateStore::new(dir.path().join("never-created"));
    assert!(store.load()?.is_empty());
    assert_eq!(store.get("db")?, None);
    Ok(())
}

#[test]
fn corrupt_record_is_treated_as_absent() -> TestResult {
    let dir = TempDir::new()?;
    let store = FileStateStore::new(dir.path());
    store.put("db", &sample(10))?;
    store.put("api", &sample(11))?;

    fs::write(store.records_dir().join("api.toml"), "pid = [not toml")?;
    fs::write(store.records_dir().join("notes.txt"), "ignored")?;

    let records = store.load()?;
    assert_eq!(records.keys().collect::<Vec<_>>(), vec!["db"]);
    assert_eq!(store.get("api")?, None);
    Ok(())
}

#[test]
fn unusual_task_names_round_trip() -> TestResult {
    let dir = TempDir::new()?;
    let store = FileStateStore::new(dir.path());

    for name in ["web/api", "db:primary", "with space", "..", "ünï"] {
        store.put(name, &sample(1))?;
    }

    let records = store.load()?;
    for name in ["web/api", "db:primary", "with space", "..", "ünï"] {
        assert!(records.contains_key(name), "missing {name}");
    }
    // Everything stays inside the records directory.
    for entry in fs::read_dir(store.records_dir())? {
        let entry = entry?;
        assert!(entry.file_type()?.is_file());
    }
    Ok(())
}

#[test]
fn file_memo_persists_and_prunes() -> TestResult {
    let dir = TempDir::new()?;

    let memo = FileMemo::new(dir.path());
    assert_eq!(memo.load("migrate")?, None);
    memo.save("migrate", "f1")?;
    memo.save("seed", "f2")?;
    memo.save("old", "f3")?;

    let reopened = FileMemo::new(dir.path());
    assert_eq!(reopened.load("migrate")?, Some("f1".to_string()));

    reopened.forget("seed")?;
    reopened.prune(&["migrate", "seed"])?;
    assert_eq!(reopened.load("seed")?, None);
    assert_eq!(reopened.load("old")?, None);
    assert_eq!(reopened.load("migrate")?, Some("f1".to_string()));

    let contents = fs::read_to_string(reopened.path())?;
    assert_eq!(contents, "migrate f1\n");
    Ok(())
}
