use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// When a payload is parsed as JSON before it is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JsonValidation {
    /// Validate when the target path ends in `.json`.
    #[default]
    Auto,
    Always,
    Never,
}

/// Per-write options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    pub validation: JsonValidation,
    /// fsync the temp file before it is renamed over the target.
    pub sync: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            validation: JsonValidation::Auto,
            sync: true,
        }
    }
}

impl WriteOptions {
    pub fn json() -> Self {
        Self {
            validation: JsonValidation::Always,
            ..Self::default()
        }
    }

    pub fn raw() -> Self {
        Self {
            validation: JsonValidation::Never,
            ..Self::default()
        }
    }

    pub fn without_sync(mut self) -> Self {
        self.sync = false;
        self
    }

    pub fn validates(&self, path: &Path) -> bool {
        match self.validation {
            JsonValidation::Always => true,
            JsonValidation::Never => false,
            JsonValidation::Auto => path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}

/// Snapshot of the writer's counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WriterStats {
    /// Payloads committed.
    pub total_writes: u64,
    /// Tasks ever enqueued.
    pub queued_writes: u64,
    /// Commits that failed, including writes cleared from a queue.
    pub failed_writes: u64,
    /// Lane tasks that committed nothing: consistent reads, updates that
    /// returned no payload, recovery.
    pub passive_tasks: u64,
    /// Exponentially weighted moving average of enqueue-to-commit time.
    pub average_wait_ms: f64,
    /// Tasks still waiting in a queue right now.
    pub currently_queued: usize,
    /// Waiting tasks per file name.
    pub queue_sizes: BTreeMap<String, usize>,
    /// Lanes held in the registry.
    pub active_lanes: usize,
}

impl WriterStats {
    pub fn average_wait_ms_rounded(&self) -> u64 {
        self.average_wait_ms.round().max(0.0) as u64
    }
}

/// Lexically normalises a path so that `a/./b` and `a/c/../b` share a queue.
///
/// Relative paths are anchored at the current directory. Symlinks are not
/// resolved because the target may not exist yet.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component.as_os_str());
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// File name of a path as an owned string, for logs and stats.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
