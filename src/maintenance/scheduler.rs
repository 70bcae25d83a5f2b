//! Periodic maintenance: quota enforcement, archiving, cleanup, status reports.
//!
//! Each job runs in its own tokio task that sleeps until the next cron tick.
//! A failing or panicking job is logged and the task waits for the next tick.

use super::archive::{ArchiveOptions, ArchiveOutcome, Archiver, CleanupReport};
use super::health::{HealthReport, StatusReport};
use super::quota::QuotaAuditor;
use crate::config::VaultConfig;
use crate::core::{Result, VaultError};
use crate::storage::{DurableWriter, RecoveryReport};
use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use futures::FutureExt;
use lazy_static::lazy_static;
use log::warn;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

lazy_static! {
    static ref GLOBAL_SCHEDULER: RwLock<Option<Arc<MaintenanceScheduler>>> = RwLock::new(None);
}

/// Installs the process-wide scheduler. The first install wins; later calls
/// get the scheduler that is already installed.
pub fn install_global(scheduler: Arc<MaintenanceScheduler>) -> Arc<MaintenanceScheduler> {
    let mut slot = GLOBAL_SCHEDULER.write().unwrap_or_else(PoisonError::into_inner);
    match slot.as_ref() {
        Some(existing) => {
            warn!("A global maintenance scheduler is already installed");
            Arc::clone(existing)
        }
        None => {
            *slot = Some(Arc::clone(&scheduler));
            scheduler
        }
    }
}

pub fn global() -> Option<Arc<MaintenanceScheduler>> {
    GLOBAL_SCHEDULER.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Parses a cron expression. Five-field expressions get `0` seconds prepended.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|err| VaultError::ScheduleError(format!("'{}': {}", expr, err)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    QuotaAudit,
    ArchivePass,
    ArchiveCleanup,
    StatusReport,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::QuotaAudit,
        JobKind::ArchivePass,
        JobKind::ArchiveCleanup,
        JobKind::StatusReport,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::QuotaAudit => "quota-audit",
            JobKind::ArchivePass => "archive-pass",
            JobKind::ArchiveCleanup => "archive-cleanup",
            JobKind::StatusReport => "status-report",
        }
    }

    fn cron_expr(self, config: &VaultConfig) -> &str {
        match self {
            JobKind::QuotaAudit => &config.schedule.quota_audit,
            JobKind::ArchivePass => &config.schedule.archive,
            JobKind::ArchiveCleanup => &config.schedule.cleanup,
            JobKind::StatusReport => &config.schedule.status_report,
        }
    }
}

/// What happened to one over-quota document during enforcement.
#[derive(Debug, Clone, Serialize)]
pub struct EnforcementResult {
    pub name: String,
    pub outcome: Option<ArchiveOutcome>,
    pub error: Option<String>,
    /// Still over quota after archiving. Nothing else is done about it.
    pub still_over_quota: bool,
}

struct Maintenance {
    config: VaultConfig,
    writer: DurableWriter,
    auditor: QuotaAuditor,
    archiver: Archiver,
}

impl Maintenance {
    /// Fails when the job achieved nothing it was asked to: every
    /// enforcement or archive target errored, or an expired archive could
    /// not be deleted.
    async fn run_job(&self, kind: JobKind) -> Result<()> {
        match kind {
            JobKind::QuotaAudit => {
                let results = self.auto_enforce().await;
                let failed = results.iter().filter(|result| result.error.is_some()).count();
                if failed > 0 && failed == results.len() {
                    return Err(VaultError::ArchiveError(format!(
                        "quota enforcement failed for all {} over-quota documents",
                        failed
                    )));
                }
            }
            JobKind::ArchivePass => {
                let results = self.archive_old_data().await;
                let failed = results.iter().filter(|(_, outcome)| outcome.is_err()).count();
                if failed > 0 && failed == results.len() {
                    return Err(VaultError::ArchiveError(format!(
                        "all {} archive targets failed",
                        failed
                    )));
                }
            }
            JobKind::ArchiveCleanup => {
                let report = self.archiver.clean_old_archives();
                if !report.failed.is_empty() {
                    return Err(VaultError::ArchiveError(format!(
                        "could not delete expired archives: {}",
                        report.failed.join(", ")
                    )));
                }
            }
            JobKind::StatusReport => {
                let status = self.check_status();
                event!(Level::INFO, "{}", status);
            }
        }
        Ok(())
    }

    async fn run_guarded(&self, kind: JobKind) {
        let span = info_span!("vault.job", job = kind.name());
        let outcome = AssertUnwindSafe(self.run_job(kind)).catch_unwind().instrument(span).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                event!(Level::ERROR, job = kind.name(), error = %err, "Scheduled job failed");
            }
            Err(_) => {
                event!(Level::ERROR, job = kind.name(), "Scheduled job panicked");
            }
        }
    }

    async fn enforce_quotas(&self) -> Vec<EnforcementResult> {
        let report = self.auditor.check_all();
        let mut results = Vec::with_capacity(report.over_quota.len());

        for status in report.over_quota {
            event!(
                Level::WARN,
                document = %status.name,
                size_mib = status.size_mib(),
                quota_mib = status.quota_mib(),
                "Enforcing quota"
            );
            let options = ArchiveOptions::with_threshold(status.quota_bytes);
            let (outcome, error) = match self.archiver.archive_file(&status.name, options).await {
                Ok(outcome) => (Some(outcome), None),
                Err(err) => (None, Some(err.to_string())),
            };

            let after = self.auditor.check_file(&status.name);
            let still_over_quota = after.is_over_quota();
            if still_over_quota {
                event!(
                    Level::ERROR,
                    document = %after.name,
                    size_mib = after.size_mib(),
                    quota_mib = after.quota_mib(),
                    "Document still over quota after archiving; recent data is never dropped"
                );
            }
            results.push(EnforcementResult {
                name: status.name,
                outcome,
                error,
                still_over_quota,
            });
        }
        results
    }

    async fn auto_enforce(&self) -> Vec<EnforcementResult> {
        let results = self.enforce_quotas().await;
        self.archiver.clean_old_archives();
        let evicted = self.writer.evict_idle_lanes(self.config.lane_idle_eviction());
        if evicted > 0 {
            event!(Level::DEBUG, evicted, "Dropped idle write lanes");
        }
        results
    }

    async fn archive_old_data(&self) -> Vec<(String, Result<ArchiveOutcome>)> {
        let results = self.archiver.archive_multiple(&self.config.archive_targets).await;
        let archived = results
            .iter()
            .filter(|(_, outcome)| outcome.as_ref().is_ok_and(ArchiveOutcome::is_archived))
            .count();
        event!(Level::INFO, archived, targets = results.len(), "Daily archive finished");
        results
    }

    fn check_status(&self) -> StatusReport {
        StatusReport {
            generated_at: Utc::now(),
            quota: self.auditor.check_all(),
            usage: self.auditor.total_usage(),
            archives: self.archiver.stats(),
            writer: self.writer.stats(),
        }
    }

    async fn recover(&self) -> Result<RecoveryReport> {
        let data_dir = &self.config.data_dir;
        let mut report = self.writer.recover_directory(data_dir, data_dir).await?;
        let archive_report = self
            .writer
            .recover_directory(self.config.archive_root(), data_dir)
            .await?;
        report.merge(archive_report);
        if !report.unresolved.is_empty() {
            event!(
                Level::ERROR,
                unresolved = report.unresolved.len(),
                "Some interrupted commits could not be resolved; their files were left as found"
            );
        }
        Ok(report)
    }
}

struct ScheduledJob {
    kind: JobKind,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ScheduledJob {
    async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            if let Err(err) = join_handle.await {
                warn!("Job {} ended abnormally: {}", self.kind.name(), err);
            }
        }
    }
}

impl Drop for ScheduledJob {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

fn spawn_job(tasks: Arc<Maintenance>, kind: JobKind, schedule: Schedule) -> ScheduledJob {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        let mut last_fire: Option<DateTime<Local>> = None;
        loop {
            let next = schedule
                .upcoming(Local)
                .find(|tick| last_fire.is_none_or(|last| *tick > last));
            let Some(next) = next else {
                warn!("Job {} has no upcoming run", kind.name());
                break;
            };
            let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(wait) => {
                    last_fire = Some(next);
                    tasks.run_guarded(kind).await;
                }
            }
        }
    });

    ScheduledJob {
        kind,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

enum SchedulerState {
    Uninitialized,
    Running(Vec<ScheduledJob>),
}

/// Owns the writer, auditor and archiver, and drives the periodic jobs.
pub struct MaintenanceScheduler {
    tasks: Arc<Maintenance>,
    state: Mutex<SchedulerState>,
}

impl MaintenanceScheduler {
    pub fn new(config: VaultConfig) -> Self {
        Self::with_writer(config, DurableWriter::new())
    }

    /// Uses `writer` for every commit, so application writes and archiving
    /// share one set of lanes.
    pub fn with_writer(config: VaultConfig, writer: DurableWriter) -> Self {
        let auditor = QuotaAuditor::new(config.data_dir.clone(), &config.quotas);
        let archiver = Archiver::new(writer.clone(), &config);
        Self {
            tasks: Arc::new(Maintenance {
                config,
                writer,
                auditor,
                archiver,
            }),
            state: Mutex::new(SchedulerState::Uninitialized),
        }
    }

    pub fn config(&self) -> &VaultConfig {
        &self.tasks.config
    }

    pub fn writer(&self) -> &DurableWriter {
        &self.tasks.writer
    }

    pub fn auditor(&self) -> &QuotaAuditor {
        &self.tasks.auditor
    }

    pub fn archiver(&self) -> &Archiver {
        &self.tasks.archiver
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, SchedulerState::Running(_))
    }

    /// Names of the scheduled jobs, empty when not running.
    pub async fn job_names(&self) -> Vec<&'static str> {
        match &*self.state.lock().await {
            SchedulerState::Running(jobs) => jobs.iter().map(|job| job.kind.name()).collect(),
            SchedulerState::Uninitialized => Vec::new(),
        }
    }

    /// Recovers interrupted commits, logs a status report and starts the jobs.
    ///
    /// Returns `Ok(false)` without doing anything when already running.
    pub async fn initialize(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if matches!(*state, SchedulerState::Running(_)) {
            warn!("Maintenance scheduler already initialized");
            return Ok(false);
        }

        let config = &self.tasks.config;
        config.validate()?;
        let schedules = JobKind::ALL
            .iter()
            .map(|kind| parse_schedule(kind.cron_expr(config)).map(|schedule| (*kind, schedule)))
            .collect::<Result<Vec<_>>>()?;

        std::fs::create_dir_all(&config.data_dir).map_err(|err| {
            VaultError::IoError(format!("Failed to create '{}': {}", config.data_dir.display(), err))
        })?;
        self.tasks.recover().await?;

        let status = self.tasks.check_status();
        event!(Level::INFO, "{}", status);

        let jobs = schedules
            .into_iter()
            .map(|(kind, schedule)| spawn_job(Arc::clone(&self.tasks), kind, schedule))
            .collect();
        *state = SchedulerState::Running(jobs);

        event!(Level::INFO, data_dir = %config.data_dir.display(), "Maintenance scheduler started");
        Ok(true)
    }

    /// Runs one job immediately, outside its schedule.
    pub async fn run_job(&self, kind: JobKind) -> Result<()> {
        self.tasks.run_job(kind).await
    }

    /// Archives every over-quota document down towards its quota.
    pub async fn enforce_quotas(&self) -> Vec<EnforcementResult> {
        self.tasks.enforce_quotas().await
    }

    /// Quota enforcement followed by archive cleanup.
    pub async fn auto_enforce(&self) -> Vec<EnforcementResult> {
        self.tasks.auto_enforce().await
    }

    /// Archives the configured target documents.
    pub async fn archive_old_data(&self) -> Vec<(String, Result<ArchiveOutcome>)> {
        self.tasks.archive_old_data().await
    }

    pub fn clean_old_archives(&self) -> CleanupReport {
        self.tasks.archiver.clean_old_archives()
    }

    /// Settles interrupted commits in the data and archive directories.
    ///
    /// Safe while the writer is busy: each document is settled in its lane.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.tasks.recover().await
    }

    pub fn check_status(&self) -> StatusReport {
        self.tasks.check_status()
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::from_status(&self.tasks.check_status(), self.tasks.config.high_load_queue_threshold)
    }

    /// Stops every job, then waits up to the flush timeout for queued writes.
    ///
    /// Returns whether the writer drained in time.
    pub async fn shutdown(&self) -> bool {
        let jobs = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, SchedulerState::Uninitialized) {
                SchedulerState::Running(jobs) => jobs,
                SchedulerState::Uninitialized => Vec::new(),
            }
        };
        let stopped = jobs.len();
        for job in jobs {
            job.stop().await;
        }

        let drained = self.tasks.writer.flush(self.tasks.config.flush_timeout_duration()).await;
        if drained {
            event!(Level::INFO, stopped, "Maintenance scheduler stopped");
        } else {
            event!(
                Level::WARN,
                stopped,
                queued = self.tasks.writer.stats().currently_queued,
                "Shutdown flush timed out with writes still queued"
            );
        }
        drained
    }
}
