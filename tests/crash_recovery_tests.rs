use serde_json::{Value, json};
use statevault::storage::{backup_path, marker_path};
use statevault::{DurableWriter, MaintenanceScheduler, VaultConfig, WriteOptions, recover_directory};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

fn marker(state: &str, has_backup: bool) -> String {
    json!({
        "txn_id": "0b6f3c1e",
        "state": state,
        "has_backup": has_backup,
        "started_at": "2024-02-03T04:05:06Z",
    })
    .to_string()
}

fn names_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_pending_commit_rolls_back_to_backup() {
    let dir = TempDir::new().unwrap();
    let doc = dir.path().join("peer_influence.json");
    std::fs::write(&doc, br#"{"peers": [1, 2"#).unwrap();
    std::fs::write(backup_path(&doc), br#"{"peers": [1]}"#).unwrap();
    std::fs::write(marker_path(&doc), marker("pending", true)).unwrap();
    std::fs::write(dir.path().join(".peer_influence.json.a1b2c3.tmp"), b"{\"pe").unwrap();

    let report = recover_directory(dir.path()).unwrap();

    assert_eq!(report.rolled_back, vec![doc.clone()]);
    assert_eq!(report.temp_files_removed, 1);
    assert!(report.unresolved.is_empty());
    assert_eq!(std::fs::read_to_string(&doc).unwrap(), r#"{"peers": [1]}"#);
    assert_eq!(names_in(dir.path()), vec!["peer_influence.json".to_string()]);
}

#[test]
fn test_committed_marker_keeps_new_contents() {
    let dir = TempDir::new().unwrap();
    let doc = dir.path().join("gossip_mill.json");
    std::fs::write(&doc, br#"{"rumors": ["new"]}"#).unwrap();
    std::fs::write(backup_path(&doc), br#"{"rumors": []}"#).unwrap();
    std::fs::write(marker_path(&doc), marker("committed", true)).unwrap();

    let report = recover_directory(dir.path()).unwrap();

    assert_eq!(report.completed, vec![doc.clone()]);
    assert_eq!(std::fs::read_to_string(&doc).unwrap(), r#"{"rumors": ["new"]}"#);
    assert_eq!(names_in(dir.path()), vec!["gossip_mill.json".to_string()]);
}

#[test]
fn test_unreadable_marker_is_treated_as_pending() {
    let dir = TempDir::new().unwrap();
    let doc = dir.path().join("contradictions.json");
    std::fs::write(&doc, b"garbage").unwrap();
    std::fs::write(backup_path(&doc), br#"[]"#).unwrap();
    std::fs::write(marker_path(&doc), b"{ not a marker").unwrap();

    let report = recover_directory(dir.path()).unwrap();

    assert_eq!(report.rolled_back, vec![doc.clone()]);
    assert_eq!(std::fs::read_to_string(&doc).unwrap(), "[]");
}

#[test]
fn test_orphan_backup_is_reported_and_left_alone() {
    let dir = TempDir::new().unwrap();
    let doc = dir.path().join("cognitive_state.json");
    std::fs::write(&doc, br#"{"ok": true}"#).unwrap();
    std::fs::write(backup_path(&doc), br#"{"ok": false}"#).unwrap();

    let report = recover_directory(dir.path()).unwrap();

    assert_eq!(report.orphan_backups, vec![backup_path(&doc)]);
    assert!(backup_path(&doc).exists());
    assert_eq!(std::fs::read_to_string(&doc).unwrap(), r#"{"ok": true}"#);
}

#[test]
fn test_clean_directory_reports_nothing() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("callback_humor.json"), b"{}").unwrap();
    assert!(recover_directory(dir.path()).unwrap().is_clean());
    assert!(recover_directory(&dir.path().join("missing")).unwrap().is_clean());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recovery_while_writing_never_reverts_acknowledged_writes() {
    let dir = TempDir::new().unwrap();
    let doc = dir.path().join("diary.json");
    let writer = DurableWriter::new();
    let vault = Arc::new(MaintenanceScheduler::with_writer(
        VaultConfig::new(dir.path()).clear_quota_overrides(),
        writer.clone(),
    ));

    let writing = Arc::new(AtomicBool::new(true));
    let recoveries = {
        let vault = Arc::clone(&vault);
        let writing = Arc::clone(&writing);
        tokio::spawn(async move {
            let mut runs = 0;
            while writing.load(Ordering::Relaxed) {
                let report = vault.recover().await.unwrap();
                assert!(report.rolled_back.is_empty(), "rolled back a live commit: {:?}", report);
                assert_eq!(report.temp_files_removed, 0);
                runs += 1;
                tokio::task::yield_now().await;
            }
            runs
        })
    };

    for version in 0..300 {
        let payload = json!({"version": version, "entry": "x".repeat(4_096)}).to_string();
        writer.write(&doc, payload, WriteOptions::default()).await.unwrap();
        let on_disk: Value = serde_json::from_slice(&std::fs::read(&doc).unwrap()).unwrap();
        assert_eq!(on_disk["version"], version);
    }

    writing.store(false, Ordering::Relaxed);
    assert!(recoveries.await.unwrap() > 0);
    assert_eq!(writer.stats().failed_writes, 0);
    assert_eq!(names_in(dir.path()), vec!["diary.json".to_string()]);
}

#[tokio::test]
async fn test_live_recovery_settles_interrupted_commit_and_archive_temp() {
    let dir = TempDir::new().unwrap();
    let doc = dir.path().join("relationships.json");
    std::fs::write(&doc, br#"{"half": "wri"#).unwrap();
    std::fs::write(backup_path(&doc), br#"{"friends": 2}"#).unwrap();
    std::fs::write(marker_path(&doc), marker("pending", true)).unwrap();

    let archive_dir = dir.path().join("archives");
    std::fs::create_dir_all(&archive_dir).unwrap();
    std::fs::write(archive_dir.join(".relationships.json.k9Z0pQ.tmp"), b"\x1f\x8b").unwrap();

    let vault = MaintenanceScheduler::new(VaultConfig::new(dir.path()));
    let report = vault.recover().await.unwrap();

    assert_eq!(report.rolled_back, vec![doc.clone()]);
    assert_eq!(report.temp_files_removed, 1);
    assert_eq!(std::fs::read_to_string(&doc).unwrap(), r#"{"friends": 2}"#);
    assert!(std::fs::read_dir(&archive_dir).unwrap().next().is_none());
    assert!(vault.recover().await.unwrap().is_clean());
}
