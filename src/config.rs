use crate::core::{Result, VaultError};
use crate::maintenance::age::AgePrecedence;
use crate::maintenance::scheduler::parse_schedule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Size limits per document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Quota for any document without an override.
    pub default_quota_bytes: u64,
    /// Fraction of the quota at which a document counts as near its limit.
    pub warning_threshold: f64,
    /// Per-document quotas, keyed by exact file name.
    pub overrides: BTreeMap<String, u64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let overrides = [
            ("chat_learning.json", 5),
            ("memory_long_term.json", 2),
            ("peer_influence.json", 3),
            ("memory_metadata.json", 2),
            ("gossip_mill.json", 1),
            ("contradictions.json", 1),
            ("conversation_threads.json", 1),
            ("personality_infection.json", 1),
            ("collective_unconscious.json", 1),
            ("cognitive_state.json", 1),
            ("callback_humor.json", 1),
        ]
        .into_iter()
        .map(|(name, mib)| (name.to_string(), mib * MIB))
        .collect();

        Self {
            default_quota_bytes: 5 * MIB,
            warning_threshold: 0.8,
            overrides,
        }
    }
}

/// How long records and archive artifacts are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Records older than this are moved out of the live document.
    pub raw_days: u32,
    /// Archive artifacts older than this are deleted.
    pub archive_days: u32,
    /// Documents smaller than this are not archived unless forced.
    pub archive_threshold_bytes: u64,
    pub age_precedence: AgePrecedence,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_days: 30,
            archive_days: 365,
            archive_threshold_bytes: 5 * MIB,
            age_precedence: AgePrecedence::default(),
        }
    }
}

/// Cron cadences of the maintenance jobs.
///
/// Expressions are seconds-first (`sec min hour day month weekday`); a
/// five-field expression gets `0` seconds prepended. Use weekday names
/// (`Sun`), not numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub quota_audit: String,
    pub archive: String,
    pub cleanup: String,
    pub status_report: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            quota_audit: "0 0 */6 * * *".to_string(),
            archive: "0 0 3 * * *".to_string(),
            cleanup: "0 0 4 * * Sun".to_string(),
            status_report: "0 0 8 * * *".to_string(),
        }
    }
}

/// Configuration of the whole state layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory holding the live documents.
    pub data_dir: PathBuf,
    /// Directory for archive artifacts. Defaults to `<data_dir>/archives`.
    pub archive_dir: Option<PathBuf>,
    pub quotas: QuotaConfig,
    pub retention: RetentionConfig,
    pub schedule: ScheduleConfig,
    /// Documents visited by the daily archive pass.
    pub archive_targets: Vec<String>,
    pub flush_timeout_ms: u64,
    /// Write lanes idle for this long are dropped from the registry.
    pub lane_idle_eviction_secs: u64,
    /// Queue depth above which the health report warns about load.
    pub high_load_queue_threshold: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            archive_dir: None,
            quotas: QuotaConfig::default(),
            retention: RetentionConfig::default(),
            schedule: ScheduleConfig::default(),
            archive_targets: [
                "chat_learning.json",
                "memory_long_term.json",
                "peer_influence.json",
                "memory_metadata.json",
                "gossip_mill.json",
                "conversation_threads.json",
                "personality_infection.json",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            flush_timeout_ms: 10_000,
            lane_idle_eviction_secs: 600,
            high_load_queue_threshold: 10,
        }
    }
}

impl VaultConfig {
    /// Create a configuration rooted at `data_dir` with default limits
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            VaultError::ConfigError(format!("Failed to read '{}': {}", path.display(), err))
        })?;
        serde_json::from_str(&content).map_err(|err| {
            VaultError::ConfigError(format!("Failed to parse '{}': {}", path.display(), err))
        })
    }

    /// Apply `STATEVAULT_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `STATEVAULT_*` overrides using `lookup` as the environment.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("STATEVAULT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("STATEVAULT_ARCHIVE_DIR") {
            self.archive_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup("STATEVAULT_DEFAULT_QUOTA_BYTES") {
            self.quotas.default_quota_bytes = parse_env("STATEVAULT_DEFAULT_QUOTA_BYTES", &value)?;
        }
        if let Some(value) = lookup("STATEVAULT_RAW_RETENTION_DAYS") {
            self.retention.raw_days = parse_env("STATEVAULT_RAW_RETENTION_DAYS", &value)?;
        }
        if let Some(value) = lookup("STATEVAULT_ARCHIVE_RETENTION_DAYS") {
            self.retention.archive_days = parse_env("STATEVAULT_ARCHIVE_RETENTION_DAYS", &value)?;
        }
        Ok(self)
    }

    /// Set the archive directory
    pub fn archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    /// Set the quota used for documents without an override
    pub fn default_quota(mut self, bytes: u64) -> Self {
        self.quotas.default_quota_bytes = bytes;
        self
    }

    /// Set the quota for one document
    pub fn quota(mut self, name: impl Into<String>, bytes: u64) -> Self {
        self.quotas.overrides.insert(name.into(), bytes);
        self
    }

    /// Drop every per-document quota override
    pub fn clear_quota_overrides(mut self) -> Self {
        self.quotas.overrides.clear();
        self
    }

    pub fn warning_threshold(mut self, fraction: f64) -> Self {
        self.quotas.warning_threshold = fraction;
        self
    }

    pub fn raw_retention_days(mut self, days: u32) -> Self {
        self.retention.raw_days = days;
        self
    }

    pub fn archive_retention_days(mut self, days: u32) -> Self {
        self.retention.archive_days = days;
        self
    }

    pub fn archive_threshold(mut self, bytes: u64) -> Self {
        self.retention.archive_threshold_bytes = bytes;
        self
    }

    pub fn age_precedence(mut self, precedence: AgePrecedence) -> Self {
        self.retention.age_precedence = precedence;
        self
    }

    pub fn archive_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.archive_targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Resolved archive directory.
    pub fn archive_root(&self) -> PathBuf {
        self.archive_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("archives"))
    }

    pub fn flush_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn lane_idle_eviction(&self) -> Duration {
        Duration::from_secs(self.lane_idle_eviction_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let threshold = self.quotas.warning_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(VaultError::ConfigError(format!(
                "warning_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.retention.raw_days == 0 {
            return Err(VaultError::ConfigError("retention.raw_days must be at least 1".to_string()));
        }
        if self.retention.archive_days == 0 {
            return Err(VaultError::ConfigError(
                "retention.archive_days must be at least 1".to_string(),
            ));
        }
        for expr in [
            &self.schedule.quota_audit,
            &self.schedule.archive,
            &self.schedule.cleanup,
            &self.schedule.status_report,
        ] {
            parse_schedule(expr).map_err(|err| VaultError::ConfigError(err.to_string()))?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| VaultError::ConfigError(format!("{}='{}': {}", key, value, err)))
}
