use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Queue cleared: {0}")]
    QueueCleared(String),

    #[error("Writer unavailable: {0}")]
    WriterClosed(String),

    #[error("Archive error: {0}")]
    ArchiveError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Schedule error: {0}")]
    ScheduleError(String),

    #[error("'{0}' not found")]
    NotFound(String),
}

impl VaultError {
    /// Errors that mean a document may not hold what the caller asked for.
    ///
    /// These always reach the caller. Everything else comes from housekeeping
    /// and is logged where it happens.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::IoError(_)
                | Self::InvalidJson(_)
                | Self::CommitFailed(_)
                | Self::QueueCleared(_)
                | Self::WriterClosed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
