// ============================================================================
// StateVault Library
// ============================================================================

pub mod config;
pub mod core;
pub mod maintenance;
pub mod storage;

// Re-export main types for convenience
pub use config::{QuotaConfig, RetentionConfig, ScheduleConfig, VaultConfig};
pub use core::{JsonValidation, Result, VaultError, WriteOptions, WriterStats};
pub use storage::{DurableWriter, RecoveryReport, recover_directory};

// Re-export maintenance API
pub use maintenance::{
    AgePrecedence,
    archive::{ArchiveOptions, ArchiveOutcome, ArchiveReport, Archiver, CleanupReport, SkipReason},
    health::{HealthReport, StatusReport},
    quota::{QuotaAuditor, QuotaReport, QuotaState, QuotaStatus},
    scheduler::{EnforcementResult, JobKind, MaintenanceScheduler},
};

// ============================================================================
// Process-wide instance
// ============================================================================

/// Builds a scheduler from `config`, installs it as the process-wide instance
/// and starts its jobs.
///
/// If an instance is already installed it is returned unchanged and `config`
/// is ignored.
///
/// # Examples
///
/// ```no_run
/// use statevault::{VaultConfig, WriteOptions};
///
/// # #[tokio::main]
/// # async fn main() -> statevault::Result<()> {
/// let vault = statevault::start(VaultConfig::new("data")).await?;
///
/// vault
///     .writer()
///     .write("data/gossip_mill.json", br#"{"rumors": []}"#.to_vec(), WriteOptions::default())
///     .await?;
///
/// println!("{}", vault.health());
/// vault.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub async fn start(config: VaultConfig) -> Result<std::sync::Arc<MaintenanceScheduler>> {
    let scheduler = maintenance::install_global(std::sync::Arc::new(MaintenanceScheduler::new(config)));
    scheduler.initialize().await?;
    Ok(scheduler)
}

/// The process-wide scheduler, if [`start`] has been called.
pub fn instance() -> Option<std::sync::Arc<MaintenanceScheduler>> {
    maintenance::global()
}
