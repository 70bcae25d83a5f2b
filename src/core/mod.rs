pub mod error;
pub mod types;

pub use error::{Result, VaultError};
pub use types::{JsonValidation, WriteOptions, WriterStats, display_name, normalize_path};
