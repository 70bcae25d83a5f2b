pub mod commit;
pub mod writer;

pub use commit::{CommitMarker, CommitState, RecoveryReport, backup_path, marker_path, recover_directory};
pub use writer::DurableWriter;
