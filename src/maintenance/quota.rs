//! Per-document size quotas.

use crate::config::QuotaConfig;
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaState {
    Healthy,
    NearQuota,
    OverQuota,
    Missing,
}

/// Size of one document against its quota.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    pub name: String,
    pub path: PathBuf,
    pub exists: bool,
    pub size_bytes: u64,
    pub quota_bytes: u64,
    /// Rounded to the nearest whole percent.
    pub percent_used: u32,
    pub state: QuotaState,
}

impl QuotaStatus {
    pub fn is_over_quota(&self) -> bool {
        self.state == QuotaState::OverQuota
    }

    pub fn is_near_quota(&self) -> bool {
        self.state == QuotaState::NearQuota
    }

    pub fn size_mib(&self) -> f64 {
        self.size_bytes as f64 / MIB
    }

    pub fn quota_mib(&self) -> f64 {
        self.quota_bytes as f64 / MIB
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuotaReport {
    /// Number of documents found on disk.
    pub total: usize,
    pub healthy: Vec<QuotaStatus>,
    pub near_quota: Vec<QuotaStatus>,
    pub over_quota: Vec<QuotaStatus>,
    /// Documents with a configured quota that do not exist.
    pub missing: Vec<QuotaStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TotalUsage {
    pub total_files: usize,
    pub total_size_bytes: u64,
    pub total_quota_bytes: u64,
    pub percent_used: u32,
}

/// Classifies a size against a quota.
///
/// Over quota means strictly larger than the quota. Near quota covers
/// `threshold * quota <= size <= quota`.
pub fn classify(size_bytes: u64, quota_bytes: u64, warning_threshold: f64) -> QuotaState {
    if size_bytes > quota_bytes {
        QuotaState::OverQuota
    } else if size_bytes as f64 >= quota_bytes as f64 * warning_threshold {
        QuotaState::NearQuota
    } else {
        QuotaState::Healthy
    }
}

fn percent(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        return 0;
    }
    (part as f64 / whole as f64 * 100.0).round() as u32
}

/// Measures documents in the data directory against their quotas.
#[derive(Debug)]
pub struct QuotaAuditor {
    data_dir: PathBuf,
    default_quota: u64,
    warning_threshold: f64,
    overrides: RwLock<BTreeMap<String, u64>>,
}

impl QuotaAuditor {
    pub fn new(data_dir: impl Into<PathBuf>, config: &QuotaConfig) -> Self {
        Self {
            data_dir: data_dir.into(),
            default_quota: config.default_quota_bytes,
            warning_threshold: config.warning_threshold,
            overrides: RwLock::new(config.overrides.clone()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn default_quota(&self) -> u64 {
        self.default_quota
    }

    /// Quota that applies to `name`.
    pub fn quota_for(&self, name: &str) -> u64 {
        self.overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(self.default_quota)
    }

    /// Set or replace the quota for one document at runtime.
    pub fn set_quota(&self, name: impl Into<String>, bytes: u64) {
        let name = name.into();
        info!("Quota for {} set to {:.2} MiB", name, bytes as f64 / MIB);
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, bytes);
    }

    /// Configured per-document quotas.
    pub fn quotas(&self) -> BTreeMap<String, u64> {
        self.overrides.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn check_file(&self, name: &str) -> QuotaStatus {
        let path = self.data_dir.join(name);
        let quota_bytes = self.quota_for(name);

        let size = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            Ok(_) => None,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!("Cannot stat {}: {}", path.display(), err);
                None
            }
        };

        match size {
            Some(size_bytes) => QuotaStatus {
                name: name.to_string(),
                path,
                exists: true,
                size_bytes,
                quota_bytes,
                percent_used: percent(size_bytes, quota_bytes),
                state: classify(size_bytes, quota_bytes, self.warning_threshold),
            },
            None => QuotaStatus {
                name: name.to_string(),
                path,
                exists: false,
                size_bytes: 0,
                quota_bytes,
                percent_used: 0,
                state: QuotaState::Missing,
            },
        }
    }

    /// Audits every `.json` document in the data directory plus every
    /// document that has a configured quota.
    pub fn check_all(&self) -> QuotaReport {
        let mut names = self.document_names();
        for name in self.quotas().into_keys() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names.sort();

        let mut report = QuotaReport::default();
        for name in names {
            let status = self.check_file(&name);
            match status.state {
                QuotaState::Healthy => report.healthy.push(status),
                QuotaState::NearQuota => {
                    warn!(
                        "{} is near quota: {:.2}/{:.2} MiB ({}%)",
                        status.name,
                        status.size_mib(),
                        status.quota_mib(),
                        status.percent_used
                    );
                    report.near_quota.push(status);
                }
                QuotaState::OverQuota => {
                    warn!(
                        "{} is over quota: {:.2}/{:.2} MiB ({}%)",
                        status.name,
                        status.size_mib(),
                        status.quota_mib(),
                        status.percent_used
                    );
                    report.over_quota.push(status);
                }
                QuotaState::Missing => {
                    report.missing.push(status);
                    continue;
                }
            }
            report.total += 1;
        }
        report
    }

    /// Aggregate usage across the documents on disk, or `None` when the data
    /// directory cannot be read.
    pub fn total_usage(&self) -> Option<TotalUsage> {
        if !self.data_dir.is_dir() {
            return None;
        }
        let mut usage = TotalUsage {
            total_files: 0,
            total_size_bytes: 0,
            total_quota_bytes: 0,
            percent_used: 0,
        };
        for name in self.document_names() {
            let status = self.check_file(&name);
            if !status.exists {
                continue;
            }
            usage.total_files += 1;
            usage.total_size_bytes += status.size_bytes;
            usage.total_quota_bytes += status.quota_bytes;
        }
        usage.percent_used = percent(usage.total_size_bytes, usage.total_quota_bytes);
        Some(usage)
    }

    fn document_names(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot list {}: {}", self.data_dir.display(), err);
                }
                return Vec::new();
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".json") && !name.starts_with('.'))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn auditor(dir: &Path) -> QuotaAuditor {
        let config = QuotaConfig {
            default_quota_bytes: 1000,
            warning_threshold: 0.8,
            overrides: BTreeMap::new(),
        };
        QuotaAuditor::new(dir, &config)
    }

    #[test]
    fn test_classify_boundaries() {
        assert_eq!(classify(799, 1000, 0.8), QuotaState::Healthy);
        assert_eq!(classify(800, 1000, 0.8), QuotaState::NearQuota);
        assert_eq!(classify(1000, 1000, 0.8), QuotaState::NearQuota);
        assert_eq!(classify(1001, 1000, 0.8), QuotaState::OverQuota);
    }

    #[test]
    fn test_check_all_buckets_documents() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("small.json"), vec![b' '; 100]).unwrap();
        std::fs::write(dir.path().join("near.json"), vec![b' '; 900]).unwrap();
        std::fs::write(dir.path().join("big.json"), vec![b' '; 1500]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), vec![b' '; 5000]).unwrap();

        let auditor = auditor(dir.path());
        auditor.set_quota("expected.json", 10);
        let report = auditor.check_all();

        assert_eq!(report.total, 3);
        assert_eq!(report.healthy[0].name, "small.json");
        assert_eq!(report.near_quota[0].name, "near.json");
        assert_eq!(report.over_quota[0].name, "big.json");
        assert_eq!(report.over_quota[0].percent_used, 150);
        assert_eq!(report.missing[0].name, "expected.json");
    }

    #[test]
    fn test_override_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let auditor = auditor(dir.path());
        auditor.set_quota("big.json", 5000);

        assert_eq!(auditor.quota_for("big.json"), 5000);
        assert_eq!(auditor.quota_for("other.json"), 1000);

        let status = auditor.check_file("big.json");
        assert!(!status.exists);
        assert_eq!(status.state, QuotaState::Missing);
        assert_eq!(status.percent_used, 0);
    }

    #[test]
    fn test_total_usage() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.json"), vec![b' '; 250]).unwrap();
        std::fs::write(dir.path().join("b.json"), vec![b' '; 250]).unwrap();

        let usage = auditor(dir.path()).total_usage().unwrap();
        assert_eq!(usage.total_files, 2);
        assert_eq!(usage.total_size_bytes, 500);
        assert_eq!(usage.total_quota_bytes, 2000);
        assert_eq!(usage.percent_used, 25);

        assert!(auditor(&dir.path().join("absent")).total_usage().is_none());
    }
}
