use super::archive::ArchiveStats;
use super::quota::{QuotaReport, TotalUsage};
use crate::core::WriterStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

const MIB: f64 = 1024.0 * 1024.0;

/// Snapshot of quota usage, archives and writer activity.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub quota: QuotaReport,
    pub usage: Option<TotalUsage>,
    pub archives: Option<ArchiveStats>,
    pub writer: WriterStats,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Status at {}", self.generated_at.to_rfc3339())?;
        match &self.usage {
            Some(usage) => writeln!(
                f,
                "  storage: {:.2}/{:.2} MiB ({}%) across {} documents",
                usage.total_size_bytes as f64 / MIB,
                usage.total_quota_bytes as f64 / MIB,
                usage.percent_used,
                usage.total_files
            )?,
            None => writeln!(f, "  storage: unavailable")?,
        }
        writeln!(
            f,
            "  quotas: {} healthy, {} near, {} over, {} missing",
            self.quota.healthy.len(),
            self.quota.near_quota.len(),
            self.quota.over_quota.len(),
            self.quota.missing.len()
        )?;
        for status in self.quota.over_quota.iter().chain(&self.quota.near_quota) {
            writeln!(
                f,
                "    {}: {:.2}/{:.2} MiB ({}%)",
                status.name,
                status.size_mib(),
                status.quota_mib(),
                status.percent_used
            )?;
        }
        match &self.archives {
            Some(stats) => writeln!(
                f,
                "  archives: {} files, {:.2} MiB ({:.2} MiB including live data)",
                stats.archive_files,
                stats.archive_size_bytes as f64 / MIB,
                stats.total_size_bytes as f64 / MIB
            )?,
            None => writeln!(f, "  archives: unavailable")?,
        }
        write!(
            f,
            "  writes: {} total, {} failed, {} queued, avg wait {} ms",
            self.writer.total_writes,
            self.writer.failed_writes,
            self.writer.currently_queued,
            self.writer.average_wait_ms_rounded()
        )
    }
}

/// Issues make the system unhealthy; warnings do not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl HealthReport {
    pub fn from_status(status: &StatusReport, high_load_queue_threshold: usize) -> Self {
        let issues: Vec<String> = status
            .quota
            .over_quota
            .iter()
            .map(|s| format!("{} over quota ({}%)", s.name, s.percent_used))
            .collect();

        let mut warnings: Vec<String> = status
            .quota
            .near_quota
            .iter()
            .map(|s| format!("{} near quota ({}%)", s.name, s.percent_used))
            .collect();
        if status.writer.failed_writes > 0 {
            warnings.push(format!("{} failed writes", status.writer.failed_writes));
        }
        if status.writer.currently_queued > high_load_queue_threshold {
            warnings.push(format!("high write queue: {} pending", status.writer.currently_queued));
        }

        Self {
            healthy: issues.is_empty(),
            issues,
            warnings,
        }
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", if self.healthy { "healthy" } else { "unhealthy" })?;
        for issue in &self.issues {
            write!(f, "\n  issue: {}", issue)?;
        }
        for warning in &self.warnings {
            write!(f, "\n  warning: {}", warning)?;
        }
        Ok(())
    }
}
