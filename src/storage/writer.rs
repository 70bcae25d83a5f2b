//! Per-file write serialization.
//!
//! Every normalised path gets a lane: a FIFO of pending tasks plus the flag
//! that says a drainer is working through it. Both live behind the registry
//! mutex and are only changed together, so a drainer that sees an empty queue
//! clears the flag in the same critical section and a concurrent enqueue
//! either lands before that (and is drained) or sees the flag cleared (and
//! starts a new drainer).

use super::commit::{self, RecoveryReport};
use crate::core::{Result, VaultError, WriteOptions, WriterStats, display_name, normalize_path};
use log::warn;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{Level, event, info_span};

const WAIT_TIME_SMOOTHING: f64 = 0.1;
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(20);

type UpdateFn = Box<dyn FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>> + Send>;
type ExclusiveFn = Box<dyn FnOnce() + Send>;

enum TaskOp {
    Replace(Vec<u8>),
    Update(UpdateFn),
    Exclusive(ExclusiveFn),
}

/// Whether a finished task tried to commit a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    Write,
    Passive,
}

struct QueuedTask {
    op: TaskOp,
    options: WriteOptions,
    enqueued_at: Instant,
    done: oneshot::Sender<Result<()>>,
}

struct Lane {
    queue: VecDeque<QueuedTask>,
    processing: bool,
    last_activity: Instant,
}

impl Lane {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            processing: false,
            last_activity: Instant::now(),
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && !self.processing
    }
}

struct WriterInner {
    lanes: Mutex<HashMap<PathBuf, Lane>>,
    total_writes: AtomicU64,
    queued_writes: AtomicU64,
    failed_writes: AtomicU64,
    passive_tasks: AtomicU64,
    average_wait_ms: Mutex<f64>,
}

impl WriterInner {
    fn lanes(&self) -> MutexGuard<'_, HashMap<PathBuf, Lane>> {
        // Critical sections never panic, so a poisoned guard still holds a consistent map.
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_outcome(&self, path: &Path, effect: Effect, outcome: &Result<()>, waited: Duration) {
        match (effect, outcome) {
            (Effect::Write, Ok(())) => {
                self.total_writes.fetch_add(1, Ordering::Relaxed);
                let waited_ms = waited.as_secs_f64() * 1000.0;
                let mut average = self
                    .average_wait_ms
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *average = *average * (1.0 - WAIT_TIME_SMOOTHING) + waited_ms * WAIT_TIME_SMOOTHING;
            }
            (Effect::Write, Err(err)) => {
                self.failed_writes.fetch_add(1, Ordering::Relaxed);
                event!(
                    Level::ERROR,
                    file = %display_name(path),
                    error = %err,
                    "Write failed"
                );
            }
            (Effect::Passive, outcome) => {
                self.passive_tasks.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = outcome {
                    event!(Level::DEBUG, file = %display_name(path), error = %err, "Lane task failed");
                }
            }
        }
    }
}

/// Serializes whole-document writes per file and commits each one atomically.
///
/// Cloning is cheap; clones share the same lanes and counters. Writes to
/// different files run independently.
#[derive(Clone)]
pub struct DurableWriter {
    inner: Arc<WriterInner>,
}

impl fmt::Debug for DurableWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("DurableWriter")
            .field("active_lanes", &stats.active_lanes)
            .field("currently_queued", &stats.currently_queued)
            .field("total_writes", &stats.total_writes)
            .field("failed_writes", &stats.failed_writes)
            .finish()
    }
}

impl Default for DurableWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableWriter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WriterInner {
                lanes: Mutex::new(HashMap::new()),
                total_writes: AtomicU64::new(0),
                queued_writes: AtomicU64::new(0),
                failed_writes: AtomicU64::new(0),
                passive_tasks: AtomicU64::new(0),
                average_wait_ms: Mutex::new(0.0),
            }),
        }
    }

    /// Replaces the whole contents of `path` with `payload`.
    ///
    /// Resolves once the new contents are durable, or with the error that
    /// stopped the commit. Writes to the same path commit in call order.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use statevault::{DurableWriter, WriteOptions};
    ///
    /// # tokio_test::block_on(async {
    /// let writer = DurableWriter::new();
    /// writer
    ///     .write("data/cognitive_state.json", r#"{"mood": "calm"}"#, WriteOptions::default())
    ///     .await
    ///     .unwrap();
    /// # });
    /// ```
    pub async fn write(
        &self,
        path: impl AsRef<Path>,
        payload: impl Into<Vec<u8>>,
        options: WriteOptions,
    ) -> Result<()> {
        let path = normalize_path(path.as_ref());
        self.submit(path, TaskOp::Replace(payload.into()), options).await
    }

    /// Serializes `value` as pretty JSON and writes it.
    pub async fn write_json<T: Serialize + ?Sized>(&self, path: impl AsRef<Path>, value: &T) -> Result<()> {
        let payload = serde_json::to_vec_pretty(value)
            .map_err(|err| VaultError::InvalidJson(format!("serialize document: {}", err)))?;
        self.write(path, payload, WriteOptions::default()).await
    }

    /// Runs `f` against the current contents of `path` inside the path's lane.
    ///
    /// `f` receives `None` when the document does not exist. If it returns a
    /// payload, that payload is committed before the next queued task for the
    /// path runs; if it returns `None`, nothing is written. `f` runs on a
    /// blocking thread and may do its own filesystem work.
    pub async fn update<T, F>(&self, path: impl AsRef<Path>, options: WriteOptions, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Option<&[u8]>) -> Result<(T, Option<Vec<u8>>)> + Send + 'static,
    {
        let path = normalize_path(path.as_ref());
        let (value_tx, value_rx) = oneshot::channel();
        let op: UpdateFn = Box::new(move |current| {
            let (value, payload) = f(current)?;
            let _ = value_tx.send(value);
            Ok(payload)
        });

        self.submit(path, TaskOp::Update(op), options).await?;
        value_rx
            .await
            .map_err(|_| VaultError::WriterClosed("update finished without a result".to_string()))
    }

    /// Runs `f` in the lane of `path`, after every task enqueued before it and
    /// before any enqueued after it. Nothing is read or committed for `f`.
    pub async fn run_exclusive<T, F>(&self, path: impl AsRef<Path>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let path = normalize_path(path.as_ref());
        let (value_tx, value_rx) = oneshot::channel();
        let op: ExclusiveFn = Box::new(move || {
            let _ = value_tx.send(f());
        });

        self.submit(path, TaskOp::Exclusive(op), WriteOptions::raw()).await?;
        value_rx
            .await
            .map_err(|_| VaultError::WriterClosed("exclusive task finished without a result".to_string()))
    }

    /// Settles interrupted commits in `dir` while this writer keeps running.
    ///
    /// Each document is settled in its own lane, so a commit this writer has
    /// in flight is never mistaken for an interrupted one. Temp files in
    /// `dir` are attributed to documents in `owner_dir`.
    pub async fn recover_directory(&self, dir: impl AsRef<Path>, owner_dir: impl AsRef<Path>) -> Result<RecoveryReport> {
        let plan = commit::plan_recovery(dir.as_ref(), owner_dir.as_ref())?;
        let mut report = RecoveryReport::default();
        for (target, sidecars) in plan {
            let lane_target = target.clone();
            let part = self
                .run_exclusive(&target, move || {
                    let mut part = RecoveryReport::default();
                    commit::recover_document(&lane_target, &sidecars, &mut part);
                    part
                })
                .await?;
            report.merge(part);
        }
        report.log();
        Ok(report)
    }

    /// Reads `path` directly from disk.
    ///
    /// Not ordered against queued writes: a read issued right after an
    /// un-awaited `write` may return the old contents. Use
    /// [`DurableWriter::read_consistent`] when that matters.
    pub async fn read(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        tokio::fs::read_to_string(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                VaultError::NotFound(path.display().to_string())
            } else {
                VaultError::IoError(format!("Failed to read '{}': {}", path.display(), err))
            }
        })
    }

    pub async fn read_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> Result<T> {
        let content = self.read(path).await?;
        serde_json::from_str(&content).map_err(|err| VaultError::InvalidJson(err.to_string()))
    }

    /// Reads `path` through its lane, after every write enqueued before it.
    pub async fn read_consistent(&self, path: impl AsRef<Path>) -> Result<String> {
        let display = path.as_ref().display().to_string();
        let bytes = self
            .update(path, WriteOptions::raw(), |current| {
                Ok((current.map(|bytes| bytes.to_vec()), None))
            })
            .await?
            .ok_or(VaultError::NotFound(display))?;
        String::from_utf8(bytes).map_err(|err| VaultError::IoError(format!("document is not UTF-8: {}", err)))
    }

    pub async fn read_json_consistent<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> Result<T> {
        let content = self.read_consistent(path).await?;
        serde_json::from_str(&content).map_err(|err| VaultError::InvalidJson(err.to_string()))
    }

    async fn submit(&self, path: PathBuf, op: TaskOp, options: WriteOptions) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let task = QueuedTask {
            op,
            options,
            enqueued_at: Instant::now(),
            done: done_tx,
        };

        let start_drainer = {
            let mut lanes = self.inner.lanes();
            let lane = lanes.entry(path.clone()).or_insert_with(Lane::new);
            lane.queue.push_back(task);
            lane.last_activity = Instant::now();
            self.inner.queued_writes.fetch_add(1, Ordering::Relaxed);
            !std::mem::replace(&mut lane.processing, true)
        };

        if start_drainer {
            tokio::spawn(drain_lane(self.inner.clone(), path.clone()));
        }

        done_rx.await.unwrap_or_else(|_| {
            Err(VaultError::WriterClosed(format!(
                "write task for '{}' was dropped",
                display_name(&path)
            )))
        })
    }

    /// Waits until every lane is empty and idle, or `timeout` elapses.
    ///
    /// Does not cancel anything; returns whether everything drained in time.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                event!(Level::INFO, "All write queues flushed");
                return true;
            }
            if Instant::now() >= deadline {
                warn!("Write queue flush timed out after {:?}", timeout);
                return false;
            }
            sleep(FLUSH_POLL_INTERVAL).await;
        }
    }

    pub fn is_idle(&self) -> bool {
        self.inner.lanes().values().all(Lane::is_idle)
    }

    /// Rejects every task still waiting for `path`.
    ///
    /// The task currently committing, if any, is not affected. Returns how
    /// many tasks were rejected.
    pub fn clear_queue(&self, path: impl AsRef<Path>) -> usize {
        let path = normalize_path(path.as_ref());
        let cleared: Vec<QueuedTask> = {
            let mut lanes = self.inner.lanes();
            match lanes.get_mut(&path) {
                Some(lane) => lane.queue.drain(..).collect(),
                None => Vec::new(),
            }
        };

        let count = cleared.len();
        for task in cleared {
            self.inner.failed_writes.fetch_add(1, Ordering::Relaxed);
            let _ = task.done.send(Err(VaultError::QueueCleared(display_name(&path))));
        }

        if count > 0 {
            warn!("Cleared {} pending writes for {}", count, display_name(&path));
        }
        count
    }

    /// Drops lanes that have nothing queued, nothing in flight and no
    /// activity for at least `idle_for`.
    pub fn evict_idle_lanes(&self, idle_for: Duration) -> usize {
        let mut lanes = self.inner.lanes();
        let before = lanes.len();
        lanes.retain(|_, lane| !lane.is_idle() || lane.last_activity.elapsed() < idle_for);
        let evicted = before - lanes.len();
        if evicted > 0 {
            event!(Level::DEBUG, evicted, remaining = lanes.len(), "Evicted idle write lanes");
        }
        evicted
    }

    pub fn stats(&self) -> WriterStats {
        let mut stats = WriterStats {
            total_writes: self.inner.total_writes.load(Ordering::Relaxed),
            queued_writes: self.inner.queued_writes.load(Ordering::Relaxed),
            failed_writes: self.inner.failed_writes.load(Ordering::Relaxed),
            passive_tasks: self.inner.passive_tasks.load(Ordering::Relaxed),
            average_wait_ms: *self
                .inner
                .average_wait_ms
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            ..WriterStats::default()
        };

        let lanes = self.inner.lanes();
        stats.active_lanes = lanes.len();
        for (path, lane) in lanes.iter() {
            *stats.queue_sizes.entry(display_name(path)).or_insert(0) += lane.queue.len();
            stats.currently_queued += lane.queue.len();
        }
        stats
    }
}

async fn drain_lane(inner: Arc<WriterInner>, path: PathBuf) {
    loop {
        let task = {
            let mut lanes = inner.lanes();
            let Some(lane) = lanes.get_mut(&path) else {
                return;
            };
            lane.last_activity = Instant::now();
            match lane.queue.pop_front() {
                Some(task) => task,
                None => {
                    lane.processing = false;
                    return;
                }
            }
        };

        let QueuedTask {
            op,
            options,
            enqueued_at,
            done,
        } = task;

        let target = path.clone();
        let span = info_span!("vault.commit", file = %display_name(&path));
        let (effect, outcome) = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            run_task(&target, op, &options)
        })
        .await
        .unwrap_or_else(|err| {
            let aborted = VaultError::CommitFailed(format!(
                "commit task for '{}' aborted: {}",
                display_name(&path),
                err
            ));
            (Effect::Write, Err(aborted))
        });

        inner.record_outcome(&path, effect, &outcome, enqueued_at.elapsed());
        let _ = done.send(outcome);
    }
}

fn run_task(path: &Path, op: TaskOp, options: &WriteOptions) -> (Effect, Result<()>) {
    match op {
        TaskOp::Replace(payload) => (Effect::Write, commit::commit(path, &payload, options)),
        TaskOp::Update(f) => {
            let produced = commit::read_existing(path).and_then(|current| f(current.as_deref()));
            match produced {
                Ok(Some(payload)) => (Effect::Write, commit::commit(path, &payload, options)),
                Ok(None) => (Effect::Passive, Ok(())),
                Err(err) => (Effect::Passive, Err(err)),
            }
        }
        TaskOp::Exclusive(f) => {
            f();
            (Effect::Passive, Ok(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;
    use tempfile::TempDir;

    async fn wait_for_queued(writer: &DurableWriter, expected: usize) {
        for _ in 0..500 {
            if writer.stats().currently_queued == expected {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never reached {} tasks", expected);
    }

    #[tokio::test]
    async fn test_write_json_then_read_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("profile.json");
        let writer = DurableWriter::new();

        writer
            .write_json(&path, &json!({"name": "alice", "trust": 0.4}))
            .await
            .unwrap();
        let value: serde_json::Value = writer.read_json(&path).await.unwrap();

        assert_eq!(value, json!({"name": "alice", "trust": 0.4}));
        let stats = writer.stats();
        assert_eq!(stats.total_writes, 1);
        assert_eq!(stats.failed_writes, 0);
        assert_eq!(stats.currently_queued, 0);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected_and_counted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("grudges.json");
        let writer = DurableWriter::new();

        writer.write(&path, "[1,2,3]", WriteOptions::default()).await.unwrap();
        let err = writer.write(&path, "[1,2,", WriteOptions::default()).await.unwrap_err();

        assert!(matches!(err, VaultError::InvalidJson(_)));
        assert_eq!(writer.read(&path).await.unwrap(), "[1,2,3]");
        assert_eq!(writer.stats().failed_writes, 1);
    }

    #[tokio::test]
    async fn test_read_missing_document_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let writer = DurableWriter::new();
        let err = writer.read(temp_dir.path().join("nope.json")).await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
        let err = writer
            .read_consistent(temp_dir.path().join("nope.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_clear_queue_rejects_only_waiting_tasks() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("diary.json");
        let writer = DurableWriter::new();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocker = {
            let writer = writer.clone();
            let path = path.clone();
            tokio::spawn(async move {
                writer
                    .update(&path, WriteOptions::default(), move |_| {
                        release_rx.recv().ok();
                        Ok(((), Some(b"{\"entry\":0}".to_vec())))
                    })
                    .await
            })
        };

        // The blocker is in flight once the lane is busy with nothing queued.
        while writer.is_idle() || writer.stats().currently_queued > 0 {
            sleep(Duration::from_millis(5)).await;
        }

        let mut waiting = Vec::new();
        for i in 1..=3 {
            let writer = writer.clone();
            let path = path.clone();
            waiting.push(tokio::spawn(async move {
                writer
                    .write(&path, format!("{{\"entry\":{}}}", i), WriteOptions::default())
                    .await
            }));
        }
        wait_for_queued(&writer, 3).await;

        assert_eq!(writer.clear_queue(&path), 3);
        release_tx.send(()).unwrap();

        blocker.await.unwrap().unwrap();
        for handle in waiting {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, VaultError::QueueCleared(_)));
        }
        assert_eq!(writer.read(&path).await.unwrap(), "{\"entry\":0}");
        assert_eq!(writer.stats().failed_writes, 3);
    }

    #[tokio::test]
    async fn test_update_without_payload_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.json");
        let writer = DurableWriter::new();

        let seen = writer
            .update(&path, WriteOptions::default(), |current| Ok((current.is_some(), None)))
            .await
            .unwrap();

        assert!(!seen);
        assert!(!path.exists());
        let stats = writer.stats();
        assert_eq!(stats.total_writes, 0);
        assert_eq!(stats.passive_tasks, 1);
    }

    #[tokio::test]
    async fn test_failed_update_closure_leaves_document() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("moods.json");
        let writer = DurableWriter::new();
        writer.write_json(&path, &json!({"mood": "ok"})).await.unwrap();

        let err = writer
            .update(&path, WriteOptions::default(), |_| -> Result<((), Option<Vec<u8>>)> {
                Err(VaultError::ArchiveError("boom".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, VaultError::ArchiveError(_)));
        let value: serde_json::Value = writer.read_json(&path).await.unwrap();
        assert_eq!(value, json!({"mood": "ok"}));
        assert_eq!(writer.stats().failed_writes, 0);
    }

    #[tokio::test]
    async fn test_idle_lanes_are_evicted() {
        let temp_dir = TempDir::new().unwrap();
        let writer = DurableWriter::new();
        for name in ["a.json", "b.json", "c.json"] {
            writer
                .write_json(temp_dir.path().join(name), &json!([]))
                .await
                .unwrap();
        }
        assert!(writer.flush(Duration::from_secs(2)).await);
        assert_eq!(writer.stats().active_lanes, 3);

        assert_eq!(writer.evict_idle_lanes(Duration::from_secs(3600)), 0);
        assert_eq!(writer.evict_idle_lanes(Duration::ZERO), 3);
        assert_eq!(writer.stats().active_lanes, 0);

        writer
            .write_json(temp_dir.path().join("a.json"), &json!([1]))
            .await
            .unwrap();
        let value: serde_json::Value = writer.read_json(temp_dir.path().join("a.json")).await.unwrap();
        assert_eq!(value, json!([1]));
    }

    #[tokio::test]
    async fn test_flush_on_idle_writer_returns_immediately() {
        let writer = DurableWriter::new();
        assert!(writer.flush(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_flush_times_out_while_a_lane_is_busy() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stuck.json");
        let writer = DurableWriter::new();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocker = {
            let writer = writer.clone();
            tokio::spawn(async move {
                writer
                    .run_exclusive(&path, move || {
                        release_rx.recv().ok();
                    })
                    .await
            })
        };
        while writer.is_idle() {
            sleep(Duration::from_millis(5)).await;
        }

        assert!(!writer.flush(Duration::from_millis(50)).await);
        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        assert!(writer.flush(Duration::from_secs(2)).await);
    }

    #[test]
    fn test_wait_average_is_smoothed() {
        let writer = DurableWriter::new();
        let path = Path::new("smoothing.json");
        let waited = Duration::from_millis(100);

        writer.inner.record_outcome(path, Effect::Write, &Ok(()), waited);
        assert!((writer.stats().average_wait_ms - 10.0).abs() < 1e-9);
        writer.inner.record_outcome(path, Effect::Write, &Ok(()), waited);
        assert!((writer.stats().average_wait_ms - 19.0).abs() < 1e-9);

        writer.inner.record_outcome(path, Effect::Passive, &Ok(()), Duration::from_secs(10));
        assert!((writer.stats().average_wait_ms - 19.0).abs() < 1e-9);
        assert_eq!(writer.stats().total_writes, 2);
        assert_eq!(writer.stats().average_wait_ms_rounded(), 19);
    }

    #[tokio::test]
    async fn test_consistent_reads_are_not_counted_as_writes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("trust.json");
        let writer = DurableWriter::new();
        writer.write_json(&path, &json!({"bob": 0.2})).await.unwrap();

        let value: serde_json::Value = writer.read_json_consistent(&path).await.unwrap();
        assert_eq!(value, json!({"bob": 0.2}));
        let stats = writer.stats();
        assert_eq!(stats.total_writes, 1);
        assert_eq!(stats.passive_tasks, 1);
        assert!(format!("{:?}", writer).contains("total_writes: 1"));
    }
}
