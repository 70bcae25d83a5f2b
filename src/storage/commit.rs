//! Atomic commit protocol for a single document, and the commit journal that
//! makes an interrupted commit recoverable.
//!
//! Every commit leaves a `<file>.txn` marker next to the target while it is in
//! flight. The marker moves through `pending -> committed` or
//! `pending -> rolled_back` and is deleted once the commit is settled, so a
//! marker seen while no commit of its document is running describes a commit
//! that was cut short.

use crate::core::{Result, VaultError, WriteOptions, display_name};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile};
use tracing::{Level, event};
use uuid::Uuid;

const BACKUP_SUFFIX: &str = "backup";
const MARKER_SUFFIX: &str = "txn";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    Pending,
    Committed,
    RolledBack,
}

/// Contents of a `<file>.txn` marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMarker {
    pub txn_id: String,
    pub state: CommitState,
    pub has_backup: bool,
    pub started_at: DateTime<Utc>,
}

impl CommitMarker {
    fn pending(has_backup: bool) -> Self {
        Self {
            txn_id: Uuid::new_v4().to_string(),
            state: CommitState::Pending,
            has_backup,
            started_at: Utc::now(),
        }
    }
}

/// What `recover_directory` found and did.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RecoveryReport {
    /// Interrupted commits whose target was put back to its pre-write state.
    pub rolled_back: Vec<PathBuf>,
    /// Commits that had reached the rename; only leftovers were removed.
    pub completed: Vec<PathBuf>,
    /// Commits already rolled back before the interruption.
    pub discarded: Vec<PathBuf>,
    /// Pending commits whose backup could not be restored. Files are kept.
    pub unresolved: Vec<PathBuf>,
    pub temp_files_removed: usize,
    /// `.backup` files with no marker next to them. Left untouched.
    pub orphan_backups: Vec<PathBuf>,
}

impl RecoveryReport {
    pub fn merge(&mut self, other: RecoveryReport) {
        self.rolled_back.extend(other.rolled_back);
        self.completed.extend(other.completed);
        self.discarded.extend(other.discarded);
        self.unresolved.extend(other.unresolved);
        self.temp_files_removed += other.temp_files_removed;
        self.orphan_backups.extend(other.orphan_backups);
    }

    pub(crate) fn log(&self) {
        if self.is_clean() {
            return;
        }
        event!(
            Level::INFO,
            rolled_back = self.rolled_back.len(),
            completed = self.completed.len(),
            discarded = self.discarded.len(),
            unresolved = self.unresolved.len(),
            temp_files_removed = self.temp_files_removed,
            orphan_backups = self.orphan_backups.len(),
            "Recovered interrupted commits"
        );
    }

    pub fn is_clean(&self) -> bool {
        self.rolled_back.is_empty()
            && self.completed.is_empty()
            && self.discarded.is_empty()
            && self.unresolved.is_empty()
            && self.temp_files_removed == 0
            && self.orphan_backups.is_empty()
    }
}

pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, BACKUP_SUFFIX)
}

pub fn marker_path(path: &Path) -> PathBuf {
    with_suffix(path, MARKER_SUFFIX)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn parent_dir(path: &Path) -> Result<PathBuf> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.to_path_buf()),
        Some(_) => Ok(PathBuf::from(".")),
        None => Err(VaultError::CommitFailed(format!(
            "'{}' has no parent directory",
            path.display()
        ))),
    }
}

/// Reads a document, returning `None` when it does not exist.
pub fn read_existing(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(VaultError::IoError(format!(
            "Failed to read '{}': {}",
            path.display(),
            err
        ))),
    }
}

/// Commits `payload` as the new contents of `path`.
///
/// Readers of `path` see either the previous contents or `payload`, never a
/// mix. On error the previous contents are left in place.
pub fn commit(path: &Path, payload: &[u8], options: &WriteOptions) -> Result<()> {
    let dir = parent_dir(path)?;
    fs::create_dir_all(&dir).map_err(|err| {
        VaultError::IoError(format!(
            "Failed to create directory '{}': {}",
            dir.display(),
            err
        ))
    })?;

    let backup = backup_path(path);
    let has_backup = if path.exists() {
        match fs::copy(path, &backup) {
            Ok(_) => true,
            Err(err) => {
                warn!(
                    "Backup failed for {}, continuing without one: {}",
                    display_name(path),
                    err
                );
                false
            }
        }
    } else {
        false
    };

    let mut marker = CommitMarker::pending(has_backup);
    if let Err(err) = write_marker(path, &marker) {
        if has_backup {
            remove_quietly(&backup, "backup");
        }
        return Err(err);
    }

    match write_and_rename(path, &dir, payload, options) {
        Ok(()) => {
            marker.state = CommitState::Committed;
            if let Err(err) = write_marker(path, &marker) {
                warn!(
                    "Could not mark commit of {} as committed: {}",
                    display_name(path),
                    err
                );
            }
            if has_backup {
                remove_quietly(&backup, "backup");
            }
            remove_quietly(&marker_path(path), "commit marker");
            Ok(())
        }
        Err(err) => {
            roll_back(path, &mut marker);
            Err(err)
        }
    }
}

fn write_and_rename(path: &Path, dir: &Path, payload: &[u8], options: &WriteOptions) -> Result<()> {
    let mut tmp = temp_file_beside(path, dir)?;
    tmp.write_all(payload).map_err(|err| {
        VaultError::IoError(format!(
            "Failed to write temp file '{}': {}",
            tmp.path().display(),
            err
        ))
    })?;
    tmp.flush()
        .map_err(|err| VaultError::IoError(format!("Failed to flush temp file: {}", err)))?;
    if options.sync {
        tmp.as_file()
            .sync_all()
            .map_err(|err| VaultError::IoError(format!("Failed to sync temp file: {}", err)))?;
    }

    if options.validates(path) {
        validate_json_file(tmp.path())?;
    }

    tmp.persist(path).map_err(|err| {
        VaultError::CommitFailed(format!(
            "Failed to rename temp file onto '{}': {}",
            path.display(),
            err.error
        ))
    })?;

    if options.sync {
        sync_dir(dir);
    }
    Ok(())
}

fn temp_file_beside(path: &Path, dir: &Path) -> Result<NamedTempFile> {
    let prefix = format!(".{}.", display_name(path));
    Builder::new()
        .prefix(&prefix)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|err| {
            VaultError::IoError(format!(
                "Failed to create temp file in '{}': {}",
                dir.display(),
                err
            ))
        })
}

fn validate_json_file(path: &Path) -> Result<()> {
    let bytes = fs::read(path).map_err(|err| {
        VaultError::IoError(format!(
            "Failed to re-read temp file '{}': {}",
            path.display(),
            err
        ))
    })?;
    serde_json::from_slice::<serde::de::IgnoredAny>(&bytes)
        .map_err(|err| VaultError::InvalidJson(err.to_string()))?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = fs::File::open(dir).and_then(|handle| handle.sync_all()) {
        event!(Level::DEBUG, dir = %dir.display(), error = %err, "directory sync skipped");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn roll_back(path: &Path, marker: &mut CommitMarker) {
    let backup = backup_path(path);
    if marker.has_backup {
        if let Err(err) = restore_from_backup(path, &backup) {
            // The pending marker and the backup stay behind for `recover_directory`.
            event!(
                Level::ERROR,
                file = %display_name(path),
                error = %err,
                "Failed to restore from backup"
            );
            return;
        }
        warn!("Restored {} from backup", display_name(path));
    }

    marker.state = CommitState::RolledBack;
    if let Err(err) = write_marker(path, marker) {
        warn!(
            "Could not mark commit of {} as rolled back: {}",
            display_name(path),
            err
        );
    }
    if marker.has_backup {
        remove_quietly(&backup, "backup");
    }
    remove_quietly(&marker_path(path), "commit marker");
}

/// Puts the backup back over the target through a temp file, so the target
/// is never observed half-restored.
fn restore_from_backup(path: &Path, backup: &Path) -> Result<()> {
    let dir = parent_dir(path)?;
    let bytes = fs::read(backup).map_err(|err| {
        VaultError::IoError(format!(
            "Failed to read backup '{}': {}",
            backup.display(),
            err
        ))
    })?;
    write_and_rename(path, &dir, &bytes, &WriteOptions::raw())
}

fn write_marker(path: &Path, marker: &CommitMarker) -> Result<()> {
    let dir = parent_dir(path)?;
    let target = marker_path(path);
    let bytes = serde_json::to_vec(marker)
        .map_err(|err| VaultError::CommitFailed(format!("serialize commit marker: {}", err)))?;

    let mut tmp = temp_file_beside(&target, &dir)?;
    tmp.write_all(&bytes).map_err(|err| {
        VaultError::IoError(format!(
            "Failed to write commit marker '{}': {}",
            target.display(),
            err
        ))
    })?;
    tmp.persist(&target).map_err(|err| {
        VaultError::IoError(format!(
            "Failed to place commit marker '{}': {}",
            target.display(),
            err.error
        ))
    })?;
    Ok(())
}

fn read_marker(path: &Path) -> Result<CommitMarker> {
    let bytes = fs::read(path).map_err(|err| {
        VaultError::IoError(format!(
            "Failed to read commit marker '{}': {}",
            path.display(),
            err
        ))
    })?;
    serde_json::from_slice(&bytes).map_err(|err| {
        VaultError::InvalidJson(format!("commit marker '{}': {}", path.display(), err))
    })
}

fn remove_quietly(path: &Path, what: &str) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("Failed to remove {} '{}': {}", what, path.display(), err),
    }
}

/// Sidecar files that belong to one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sidecars {
    pub marker: bool,
    pub backup: bool,
    /// Temp files of commits, markers or archive artifacts for the document.
    pub temps: Vec<PathBuf>,
}

/// Sidecar files in one directory, grouped by the document they belong to.
///
/// Markers and backups belong to the document beside them. Temp files are
/// named `.<document>.<random>.tmp` and belong to `<owner_dir>/<document>`,
/// which is how archive temp files find their live document.
pub fn plan_recovery(dir: &Path, owner_dir: &Path) -> Result<BTreeMap<PathBuf, Sidecars>> {
    let mut plan: BTreeMap<PathBuf, Sidecars> = BTreeMap::new();
    if !dir.exists() {
        return Ok(plan);
    }

    let entries = fs::read_dir(dir).map_err(|err| {
        VaultError::IoError(format!(
            "Failed to list '{}' for recovery: {}",
            dir.display(),
            err
        ))
    })?;

    for entry in entries {
        let entry = entry.map_err(|err| VaultError::IoError(err.to_string()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = display_name(&path);
        if name.starts_with('.') && name.ends_with(TEMP_SUFFIX) {
            let owner = temp_owner(&name).map_or_else(|| path.clone(), |doc| owner_dir.join(doc));
            plan.entry(owner).or_default().temps.push(path);
        } else if let Some(target) = name.strip_suffix(&format!(".{}", MARKER_SUFFIX)) {
            plan.entry(dir.join(target)).or_default().marker = true;
        } else if let Some(target) = name.strip_suffix(&format!(".{}", BACKUP_SUFFIX)) {
            plan.entry(dir.join(target)).or_default().backup = true;
        }
    }
    Ok(plan)
}

/// `.<document>[.txn].<random>.tmp` to `<document>`.
fn temp_owner(name: &str) -> Option<&str> {
    let inner = name.strip_prefix('.')?.strip_suffix(TEMP_SUFFIX)?;
    let (owner, _random) = inner.rsplit_once('.')?;
    let owner = owner
        .strip_suffix(&format!(".{}", MARKER_SUFFIX))
        .unwrap_or(owner);
    (!owner.is_empty()).then_some(owner)
}

/// Settles whatever an interrupted commit left behind for `target`.
///
/// No commit of `target` may be running; [`DurableWriter::recover_directory`]
/// guarantees that by calling this from the document's lane. The marker is
/// re-read here, so one that vanished since the scan is ignored.
///
/// [`DurableWriter::recover_directory`]: super::DurableWriter::recover_directory
pub fn recover_document(target: &Path, sidecars: &Sidecars, report: &mut RecoveryReport) {
    for temp in &sidecars.temps {
        match fs::remove_file(temp) {
            Ok(()) => report.temp_files_removed += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to remove stale temp file '{}': {}", temp.display(), err),
        }
    }

    let marker_file = marker_path(target);
    let backup = backup_path(target);
    if sidecars.marker && marker_file.exists() {
        let state = match read_marker(&marker_file) {
            Ok(marker) => marker.state,
            Err(err) => {
                warn!("Unreadable commit marker treated as pending: {}", err);
                CommitState::Pending
            }
        };

        match state {
            CommitState::Pending => {
                if backup.exists() {
                    if let Err(err) = restore_from_backup(target, &backup) {
                        event!(
                            Level::ERROR,
                            file = %display_name(target),
                            error = %err,
                            "Recovery could not restore backup"
                        );
                        report.unresolved.push(target.to_path_buf());
                        return;
                    }
                }
                report.rolled_back.push(target.to_path_buf());
            }
            CommitState::Committed => report.completed.push(target.to_path_buf()),
            CommitState::RolledBack => report.discarded.push(target.to_path_buf()),
        }
        remove_quietly(&backup, "backup");
        remove_quietly(&marker_file, "commit marker");
        return;
    }

    if sidecars.backup && backup.exists() {
        report.orphan_backups.push(backup);
    }
}

/// Settles every commit that was interrupted in `dir`.
///
/// Only for a directory nothing is committing to, such as at process start
/// before any writer exists. A running service uses
/// [`DurableWriter::recover_directory`](super::DurableWriter::recover_directory).
pub fn recover_directory(dir: &Path) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    for (target, sidecars) in plan_recovery(dir, dir)? {
        recover_document(&target, &sidecars, &mut report);
    }
    report.log();
    Ok(report)
}
