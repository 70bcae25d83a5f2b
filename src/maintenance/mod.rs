pub mod age;
pub mod archive;
pub mod health;
pub mod quota;
pub mod scheduler;

pub use age::{AGE_FIELDS, AgePartition, AgePrecedence, extract_record_age, separate_by_age};
pub use archive::{
    ArchiveEntry, ArchiveOptions, ArchiveOutcome, ArchiveReport, ArchiveStats, Archiver, CleanupReport,
    SkipReason,
};
pub use health::{HealthReport, StatusReport};
pub use quota::{QuotaAuditor, QuotaReport, QuotaState, QuotaStatus, TotalUsage, classify};
pub use scheduler::{EnforcementResult, JobKind, MaintenanceScheduler, global, install_global, parse_schedule};
