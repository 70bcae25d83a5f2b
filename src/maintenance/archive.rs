//! Moves aged records out of live documents into gzip artifacts.
//!
//! The read, the partition, the artifact write and the commit of the recent
//! remainder all run as one task in the document's write lane, so no queued
//! write can land between the read and the commit. The artifact is persisted
//! before the remainder is committed; if that commit fails the artifact is
//! removed again.

use super::age::{AgePrecedence, separate_by_age};
use crate::config::VaultConfig;
use crate::core::{Result, VaultError, WriteOptions};
use crate::storage::DurableWriter;
use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::{Level, event};

const ARTIFACT_SUFFIX: &str = ".json.gz";
const STAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

lazy_static! {
    static ref ARTIFACT_NAME: Regex =
        Regex::new(r"^(?P<stem>.+)_(?P<stamp>\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}-\d{3}Z)(?:-\d+)?\.json\.gz$")
            .expect("artifact name pattern");
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveOptions {
    /// Archive even when the document is under the size threshold.
    pub force: bool,
    /// Size threshold for this call instead of the configured one.
    pub threshold_bytes: Option<u64>,
}

impl ArchiveOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            threshold_bytes: None,
        }
    }

    pub fn with_threshold(bytes: u64) -> Self {
        Self {
            force: false,
            threshold_bytes: Some(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveReport {
    pub document: String,
    pub archive_path: PathBuf,
    pub old_entries: usize,
    pub kept_entries: usize,
    pub original_size: u64,
    pub new_size: u64,
    pub compressed_size: u64,
    /// Percentage saved by compression, one decimal.
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Missing,
    UnderLimit { size_bytes: u64 },
    NoOldData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Archived(ArchiveReport),
    Skipped(SkipReason),
}

impl ArchiveOutcome {
    pub fn is_archived(&self) -> bool {
        matches!(self, ArchiveOutcome::Archived(_))
    }

    pub fn bytes_saved(&self) -> u64 {
        match self {
            ArchiveOutcome::Archived(report) => report.original_size.saturating_sub(report.new_size),
            ArchiveOutcome::Skipped(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub freed_bytes: u64,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveEntry {
    pub file_name: String,
    pub document: String,
    pub created: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}

/// Live documents against archived artifacts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveStats {
    pub data_files: usize,
    pub data_size_bytes: u64,
    pub archive_files: usize,
    pub archive_size_bytes: u64,
    pub total_size_bytes: u64,
    pub oldest: Option<String>,
    pub newest: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Archiver {
    writer: DurableWriter,
    data_dir: PathBuf,
    archive_dir: PathBuf,
    threshold_bytes: u64,
    raw_retention_days: u32,
    archive_retention_days: u32,
    precedence: AgePrecedence,
}

impl Archiver {
    pub fn new(writer: DurableWriter, config: &VaultConfig) -> Self {
        Self {
            writer,
            data_dir: config.data_dir.clone(),
            archive_dir: config.archive_root(),
            threshold_bytes: config.retention.archive_threshold_bytes,
            raw_retention_days: config.retention.raw_days,
            archive_retention_days: config.retention.archive_days,
            precedence: config.retention.age_precedence,
        }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Archives records of `name` older than the raw retention window.
    pub async fn archive_file(&self, name: &str, options: ArchiveOptions) -> Result<ArchiveOutcome> {
        let path = self.document_path(name)?;
        let threshold = options.threshold_bytes.unwrap_or(self.threshold_bytes);
        let force = options.force;
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.raw_retention_days));
        let precedence = self.precedence;
        let archive_dir = self.archive_dir.clone();
        let document = name.to_string();

        let written: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));
        let written_in_lane = Arc::clone(&written);

        let result = self
            .writer
            .update(&path, WriteOptions::json(), move |current| {
                let Some(bytes) = current else {
                    return Ok((ArchiveOutcome::Skipped(SkipReason::Missing), None));
                };
                let original_size = bytes.len() as u64;
                if !force && original_size <= threshold {
                    return Ok((
                        ArchiveOutcome::Skipped(SkipReason::UnderLimit {
                            size_bytes: original_size,
                        }),
                        None,
                    ));
                }

                let data: Value = serde_json::from_slice(bytes)
                    .map_err(|err| VaultError::InvalidJson(format!("{}: {}", document, err)))?;
                let partition = separate_by_age(data, cutoff, precedence);
                if !partition.has_old() {
                    return Ok((ArchiveOutcome::Skipped(SkipReason::NoOldData), None));
                }

                let artifact = next_artifact_path(&archive_dir, &document, Utc::now());
                let compressed_size = write_artifact(&archive_dir, &document, &artifact, &partition.old)?;
                *written_in_lane.lock().unwrap_or_else(PoisonError::into_inner) = Some(artifact.clone());

                let remainder = serde_json::to_vec_pretty(&partition.recent)
                    .map_err(|err| VaultError::InvalidJson(format!("{}: {}", document, err)))?;
                let report = ArchiveReport {
                    document,
                    archive_path: artifact,
                    old_entries: partition.old_count,
                    kept_entries: partition.recent_count,
                    original_size,
                    new_size: remainder.len() as u64,
                    compressed_size,
                    compression_ratio: compression_ratio(original_size, compressed_size),
                };
                Ok((ArchiveOutcome::Archived(report), Some(remainder)))
            })
            .await;

        match result {
            Ok(outcome) => {
                match &outcome {
                    ArchiveOutcome::Archived(report) => event!(
                        Level::INFO,
                        document = %report.document,
                        old_entries = report.old_entries,
                        original_kb = report.original_size / 1024,
                        new_kb = report.new_size / 1024,
                        compression_ratio = report.compression_ratio,
                        "Archived old records"
                    ),
                    ArchiveOutcome::Skipped(reason) => {
                        event!(Level::DEBUG, document = name, reason = ?reason, "Archive skipped")
                    }
                }
                Ok(outcome)
            }
            Err(err) => {
                let orphan = written.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(artifact) = orphan {
                    if let Err(remove_err) = std::fs::remove_file(&artifact) {
                        warn!("Failed to remove orphaned archive {}: {}", artifact.display(), remove_err);
                    }
                }
                event!(Level::ERROR, document = name, error = %err, "Archive failed");
                Err(err)
            }
        }
    }

    /// Archives each document in turn. One failure does not stop the rest.
    pub async fn archive_multiple<S: AsRef<str>>(&self, names: &[S]) -> Vec<(String, Result<ArchiveOutcome>)> {
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let outcome = self.archive_file(name, ArchiveOptions::default()).await;
            results.push((name.to_string(), outcome));
        }

        let saved: u64 = results
            .iter()
            .filter_map(|(_, outcome)| outcome.as_ref().ok())
            .map(ArchiveOutcome::bytes_saved)
            .sum();
        let archived = results
            .iter()
            .filter(|(_, outcome)| outcome.as_ref().is_ok_and(ArchiveOutcome::is_archived))
            .count();
        if archived > 0 {
            event!(Level::INFO, archived, saved_kb = saved / 1024, "Archive pass finished");
        }
        results
    }

    /// Deletes artifacts whose modification time is past archive retention.
    pub fn clean_old_archives(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let retention = Duration::from_secs(u64::from(self.archive_retention_days) * 24 * 60 * 60);
        let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
            return report;
        };

        let entries = match std::fs::read_dir(&self.archive_dir) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot list {}: {}", self.archive_dir.display(), err);
                }
                return report;
            }
        };

        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else { continue };
            if modified >= cutoff {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    report.freed_bytes += meta.len();
                    report.deleted.push(name);
                }
                Err(err) => {
                    warn!("Failed to delete archive {}: {}", name, err);
                    report.failed.push(name);
                }
            }
        }

        if !report.deleted.is_empty() {
            event!(
                Level::INFO,
                deleted = report.deleted.len(),
                freed_kb = report.freed_bytes / 1024,
                "Removed expired archives"
            );
        }
        report
    }

    /// Decompresses and parses one artifact. Read-only: nothing is merged back.
    pub fn restore_archive(&self, file_name: &str) -> Result<Value> {
        if !is_plain_file_name(file_name) {
            return Err(VaultError::ArchiveError(format!("'{}' is not an archive file name", file_name)));
        }
        let path = self.archive_dir.join(file_name);
        let compressed = std::fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                VaultError::NotFound(file_name.to_string())
            } else {
                VaultError::IoError(format!("{}: {}", path.display(), err))
            }
        })?;

        let mut raw = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut raw)
            .map_err(|err| VaultError::ArchiveError(format!("{}: {}", file_name, err)))?;
        let value = serde_json::from_slice(&raw)
            .map_err(|err| VaultError::InvalidJson(format!("{}: {}", file_name, err)))?;
        event!(Level::INFO, archive = file_name, "Restored archive");
        Ok(value)
    }

    /// Artifacts in the archive directory, sorted by name.
    pub fn list_archives(&self) -> Result<Vec<ArchiveEntry>> {
        let entries = match std::fs::read_dir(&self.archive_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(VaultError::IoError(format!("{}: {}", self.archive_dir.display(), err))),
        };

        let mut archives: Vec<ArchiveEntry> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name().into_string().ok()?;
                let captures = ARTIFACT_NAME.captures(&file_name)?;
                let document = format!("{}.json", &captures["stem"]);
                let created = NaiveDateTime::parse_from_str(&captures["stamp"], STAMP_FORMAT)
                    .ok()
                    .map(|naive| naive.and_utc());
                let size_bytes = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
                Some(ArchiveEntry {
                    file_name,
                    document,
                    created,
                    size_bytes,
                })
            })
            .collect();
        archives.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(archives)
    }

    /// Sizes of live documents and stored artifacts, or `None` when either
    /// directory cannot be read.
    pub fn stats(&self) -> Option<ArchiveStats> {
        let archives = match self.list_archives() {
            Ok(archives) => archives,
            Err(err) => {
                warn!("Cannot read archive stats: {}", err);
                return None;
            }
        };
        let (data_files, data_size_bytes) = match json_documents(&self.data_dir) {
            Ok(totals) => totals,
            Err(err) => {
                warn!("Cannot read data stats: {}", err);
                return None;
            }
        };
        let archive_size_bytes: u64 = archives.iter().map(|entry| entry.size_bytes).sum();
        let mut by_age: Vec<&ArchiveEntry> = archives.iter().collect();
        by_age.sort_by_key(|entry| entry.created);

        Some(ArchiveStats {
            data_files,
            data_size_bytes,
            archive_files: archives.len(),
            archive_size_bytes,
            total_size_bytes: data_size_bytes + archive_size_bytes,
            oldest: by_age.first().map(|entry| entry.file_name.clone()),
            newest: by_age.last().map(|entry| entry.file_name.clone()),
        })
    }

    fn document_path(&self, name: &str) -> Result<PathBuf> {
        if !is_plain_file_name(name) {
            return Err(VaultError::ArchiveError(format!("'{}' is not a document name", name)));
        }
        Ok(self.data_dir.join(name))
    }
}

/// Count and total size of the `.json` files directly in `dir`.
fn json_documents(dir: &Path) -> Result<(usize, u64)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(err) => return Err(VaultError::IoError(format!("{}: {}", dir.display(), err))),
    };
    let sizes: Vec<u64> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".json"))
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .collect();
    Ok((sizes.len(), sizes.iter().sum()))
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && Path::new(name).file_name().and_then(|f| f.to_str()) == Some(name)
}

fn compression_ratio(original: u64, compressed: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    let ratio = (1.0 - compressed as f64 / original as f64) * 100.0;
    (ratio * 10.0).round() / 10.0
}

/// `<stem>_<timestamp>.json.gz`, with `-N` appended when that name is taken.
fn next_artifact_path(archive_dir: &Path, document: &str, now: DateTime<Utc>) -> PathBuf {
    let stem = document.strip_suffix(".json").unwrap_or(document);
    let base = format!("{}_{}", stem, now.format(STAMP_FORMAT));
    let mut candidate = archive_dir.join(format!("{}{}", base, ARTIFACT_SUFFIX));
    let mut attempt = 1;
    while candidate.exists() {
        candidate = archive_dir.join(format!("{}-{}{}", base, attempt, ARTIFACT_SUFFIX));
        attempt += 1;
    }
    candidate
}

/// The temp file is named after `document` so recovery settles it in the
/// document's lane.
fn write_artifact(archive_dir: &Path, document: &str, artifact: &Path, old: &Value) -> Result<u64> {
    let io_err = |err: std::io::Error| VaultError::ArchiveError(format!("{}: {}", artifact.display(), err));

    std::fs::create_dir_all(archive_dir).map_err(io_err)?;
    let json = serde_json::to_vec_pretty(old)
        .map_err(|err| VaultError::ArchiveError(format!("serialize archive: {}", err)))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).map_err(io_err)?;
    let compressed = encoder.finish().map_err(io_err)?;

    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{}.", document))
        .suffix(".tmp")
        .tempfile_in(archive_dir)
        .map_err(io_err)?;
    temp.write_all(&compressed).map_err(io_err)?;
    temp.as_file().sync_all().map_err(io_err)?;
    temp.persist_noclobber(artifact)
        .map_err(|err| VaultError::ArchiveError(format!("{}: {}", artifact.display(), err.error)))?;
    Ok(compressed.len() as u64)
}
