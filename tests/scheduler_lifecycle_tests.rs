use serde_json::json;
use statevault::{JobKind, MaintenanceScheduler, ScheduleConfig, VaultConfig, VaultError, WriteOptions};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_initialize_is_idempotent_and_shutdown_stops_jobs() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("state");
    let vault = MaintenanceScheduler::new(VaultConfig::new(&data_dir));

    assert!(!vault.is_running().await);
    assert!(vault.initialize().await.unwrap());
    assert!(data_dir.is_dir());
    assert!(vault.is_running().await);
    assert_eq!(
        vault.job_names().await,
        vec!["quota-audit", "archive-pass", "archive-cleanup", "status-report"]
    );

    assert!(!vault.initialize().await.unwrap());
    assert!(vault.is_running().await);

    vault
        .writer()
        .write(data_dir.join("gossip_mill.json"), json!({"rumors": []}).to_string(), WriteOptions::default())
        .await
        .unwrap();

    assert!(vault.shutdown().await);
    assert!(!vault.is_running().await);
    assert!(vault.job_names().await.is_empty());

    assert!(vault.initialize().await.unwrap());
    assert!(vault.shutdown().await);
}

#[tokio::test]
async fn test_initialize_rejects_bad_schedule() {
    let dir = TempDir::new().unwrap();
    let mut config = VaultConfig::new(dir.path());
    config.schedule.cleanup = "on sundays please".to_string();
    let vault = MaintenanceScheduler::new(config);

    let err = vault.initialize().await.unwrap_err();
    assert!(matches!(err, VaultError::ConfigError(_)));
    assert!(!vault.is_running().await);
}

#[tokio::test]
async fn test_initialize_recovers_interrupted_commit() {
    let dir = TempDir::new().unwrap();
    let doc = dir.path().join("memory_long_term.json");
    std::fs::write(&doc, br#"{"half": "writ"#).unwrap();
    std::fs::write(statevault::storage::backup_path(&doc), br#"{"facts": 3}"#).unwrap();
    std::fs::write(
        statevault::storage::marker_path(&doc),
        json!({"txn_id": "t-1", "state": "pending", "has_backup": true, "started_at": "2024-01-01T00:00:00Z"})
            .to_string(),
    )
    .unwrap();

    let vault = MaintenanceScheduler::new(VaultConfig::new(dir.path()));
    vault.initialize().await.unwrap();

    assert_eq!(std::fs::read_to_string(&doc).unwrap(), r#"{"facts": 3}"#);
    assert!(!statevault::storage::backup_path(&doc).exists());
    assert!(!statevault::storage::marker_path(&doc).exists());
    vault.shutdown().await;
}

#[tokio::test]
async fn test_jobs_can_be_run_on_demand() {
    let dir = TempDir::new().unwrap();
    let vault = MaintenanceScheduler::new(VaultConfig::new(dir.path()).clear_quota_overrides());
    for kind in JobKind::ALL {
        vault.run_job(kind).await.unwrap();
    }
    let results = vault.auto_enforce().await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_global_instance_is_installed_once() {
    let dir = TempDir::new().unwrap();
    assert!(statevault::instance().is_none());

    let first = statevault::start(VaultConfig::new(dir.path().join("one"))).await.unwrap();
    let second = statevault::start(VaultConfig::new(dir.path().join("two"))).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.config().data_dir, dir.path().join("one"));
    assert!(Arc::ptr_eq(&statevault::instance().unwrap(), &first));
    assert!(first.shutdown().await);
}

#[tokio::test]
async fn test_no_job_fires_after_shutdown() {
    let dir = TempDir::new().unwrap();
    let yearly = "0 0 0 1 1 *".to_string();
    let config = VaultConfig::new(dir.path())
        .clear_quota_overrides()
        .archive_targets(["ticks.json"])
        .schedule(ScheduleConfig {
            quota_audit: yearly.clone(),
            archive: "* * * * * *".to_string(),
            cleanup: yearly.clone(),
            status_report: yearly,
        });
    let vault = MaintenanceScheduler::new(config);
    vault.initialize().await.unwrap();

    // Each archive pass over the missing target is one lane task that writes nothing.
    let mut fired = 0;
    for _ in 0..50 {
        fired = vault.writer().stats().passive_tasks;
        if fired > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(fired > 0, "the every-second archive job never ran");

    assert!(vault.shutdown().await);
    let after_shutdown = vault.writer().stats().passive_tasks;
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(vault.writer().stats().passive_tasks, after_shutdown);
    assert_eq!(vault.writer().stats().total_writes, 0);
}
