//! Range downloader
//!
//! A shared, internally synchronized HTTP transfer engine. Callers submit
//! tasks (size probes, whole-resource or byte-range transfers into a file
//! or a fixed memory buffer) and poll or block on them by handle.
//!
//! Transfers run on a downloader-owned tokio runtime with at most
//! `max_handles` in flight; the rest stay `Queued`. Failures never panic or
//! propagate: they finish the task with [`TaskError`] filled in, so
//! `wait_task` always returns.
//!
//! Cloning a [`RangeDownloader`] shares the task table, which lets several
//! DLC managers reuse one instance. Identical file transfers (same URL,
//! range and destination) submitted while one is still active resolve to
//! the same task.

pub mod buffer;
mod http;
pub mod task;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub use buffer::MemoryBuffer;
pub use task::{
    Destination, Range, Task, TaskError, TaskInfo, TaskState, TaskStatus, TaskType, TransportError,
};

/// Connection timeout: time to establish TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Downloader tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloaderHints {
    /// Maximum concurrent transfers.
    pub max_handles: usize,
    /// Seconds without data before a transfer fails with a timeout.
    pub timeout_sec: u64,
    /// Tokio worker threads driving transfers.
    pub worker_threads: usize,
}

impl Default for DownloaderHints {
    fn default() -> Self {
        Self {
            max_handles: 8,
            timeout_sec: 30,
            worker_threads: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    url: String,
    range: Range,
    path: PathBuf,
    resume: bool,
}

struct TaskEntry {
    info: TaskInfo,
    status: TaskStatus,
    refs: u32,
    key: Option<DedupKey>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct TaskTable {
    next_id: u64,
    entries: HashMap<u64, TaskEntry>,
}

/// State shared between the public handle and running transfers.
pub(crate) struct Shared {
    client: reqwest::Client,
    limiter: Arc<Semaphore>,
    table: Mutex<TaskTable>,
    changed: Condvar,
    hints: DownloaderHints,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TaskTable> {
        // Entries are replaced whole; a panicking holder can't leave one half-written
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move a task to `InProgress`; false if it was cancelled while queued.
    pub(crate) fn begin(&self, id: u64) -> bool {
        let mut table = self.lock();
        let Some(entry) = table.entries.get_mut(&id) else {
            return false;
        };
        if entry.cancelled.load(Ordering::Acquire) || entry.status.state != TaskState::Queued {
            return false;
        }
        entry.status.state = TaskState::InProgress;
        drop(table);
        self.changed.notify_all();
        true
    }

    pub(crate) fn update(&self, id: u64, f: impl FnOnce(&mut TaskStatus)) {
        if let Some(entry) = self.lock().entries.get_mut(&id) {
            f(&mut entry.status);
        }
    }

    pub(crate) fn finish(&self, id: u64, result: std::result::Result<(), TaskError>) {
        let mut table = self.lock();
        if let Some(entry) = table.entries.get_mut(&id) {
            if let Err(mut error) = result {
                warn!(
                    "{} failed for {}: {} (http {}, errno {})",
                    Task(id),
                    entry.info.src_url,
                    error.err_str,
                    error.http_code,
                    error.file_errno
                );
                if error.http_code == 0 {
                    error.http_code = entry.status.error.http_code;
                }
                error.error_happened = true;
                entry.status.error = error;
            }
            entry.status.state = TaskState::Finished;
        }
        drop(table);
        self.changed.notify_all();
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.hints.timeout_sec.max(1))
    }

    pub(crate) fn limiter(&self) -> Arc<Semaphore> {
        self.limiter.clone()
    }
}

/// Owns the runtime so it is shut down once the last handle goes away.
struct RuntimeHolder {
    runtime: Option<tokio::runtime::Runtime>,
}

impl Drop for RuntimeHolder {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Shared handle to a range downloader.
#[derive(Clone)]
pub struct RangeDownloader {
    shared: Arc<Shared>,
    runtime: Arc<RuntimeHolder>,
}

impl RangeDownloader {
    pub fn new(hints: DownloaderHints) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(hints.worker_threads.max(1))
            .thread_name("superpack-download")
            .enable_all()
            .build()
            .context("Failed to start downloader runtime")?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("superpack/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        debug!(
            "Range downloader started: {} handles, {}s timeout",
            hints.max_handles, hints.timeout_sec
        );

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                limiter: Arc::new(Semaphore::new(hints.max_handles.max(1))),
                table: Mutex::new(TaskTable::default()),
                changed: Condvar::new(),
                hints,
            }),
            runtime: Arc::new(RuntimeHolder {
                runtime: Some(runtime),
            }),
        })
    }

    pub fn hints(&self) -> &DownloaderHints {
        &self.shared.hints
    }

    /// Whether two handles share one task table.
    pub fn same_instance(&self, other: &RangeDownloader) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Probe the content length of `url`.
    ///
    /// On success `size_total` holds the remote length and
    /// `size_downloaded` stays 0.
    pub fn start_get_content_size(&self, url: &str) -> Task {
        self.submit(url, TaskType::Size, None, Range::full(), None, http::Job::Size)
    }

    /// Download `range` of `url` into `destination`.
    pub fn start_task(&self, url: &str, destination: Destination, range: Range) -> Task {
        let task_type = task_type_for(range);
        match destination {
            Destination::File(path) => {
                let key = DedupKey {
                    url: url.to_string(),
                    range,
                    path: path.clone(),
                    resume: false,
                };
                self.submit(
                    url,
                    task_type,
                    Some(path.clone()),
                    range,
                    Some(key),
                    http::Job::File { path, range, resume: false },
                )
            }
            Destination::Memory(buffer) => self.submit(
                url,
                task_type,
                None,
                range,
                None,
                http::Job::Memory { buffer, range },
            ),
        }
    }

    /// Continue downloading `range` of `url` into `path` from its current length.
    pub fn resume_task(&self, url: &str, path: &Path, range: Range) -> Task {
        let key = DedupKey {
            url: url.to_string(),
            range,
            path: path.to_path_buf(),
            resume: true,
        };
        self.submit(
            url,
            task_type_for(range),
            Some(path.to_path_buf()),
            range,
            Some(key),
            http::Job::File {
                path: path.to_path_buf(),
                range,
                resume: true,
            },
        )
    }

    fn submit(
        &self,
        url: &str,
        task_type: TaskType,
        dst_path: Option<PathBuf>,
        range: Range,
        key: Option<DedupKey>,
        job: http::Job,
    ) -> Task {
        let mut table = self.shared.lock();

        if let Some(key) = &key {
            let existing = table
                .entries
                .iter_mut()
                .find(|(_, e)| e.key.as_ref() == Some(key) && !e.status.state.is_done());
            if let Some((&id, entry)) = existing {
                entry.refs += 1;
                debug!("Reusing {} for {}", Task(id), url);
                return Task(id);
            }
        }

        table.next_id += 1;
        let id = table.next_id;
        let mut status = TaskStatus::queued();

        let zero_length = range.len() == Some(0);
        if zero_length {
            status.state = TaskState::Finished;
        }

        table.entries.insert(
            id,
            TaskEntry {
                info: TaskInfo {
                    id: Task(id),
                    task_type,
                    src_url: url.to_string(),
                    dst_path,
                    range_offset: range.offset,
                    range_size: range.size,
                    timeout_sec: self.shared.hints.timeout_sec,
                },
                status,
                refs: 1,
                key,
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        );
        drop(table);

        if zero_length {
            debug!("{} is an empty range, finished immediately", Task(id));
            self.shared.changed.notify_all();
        } else if let Some(runtime) = &self.runtime.runtime {
            debug!("{} queued: {} {:?}", Task(id), url, range);
            runtime.spawn(http::execute(self.shared.clone(), id, url.to_string(), job));
        }

        Task(id)
    }

    /// Block until the task is `Finished` or `Cancelled`.
    pub fn wait_task(&self, task: Task) {
        let mut table = self.shared.lock();
        while is_pending(&table, task) {
            table = self
                .shared
                .changed
                .wait(table)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`wait_task`](Self::wait_task) with a deadline; true if the task is done.
    pub fn wait_task_timeout(&self, task: Task, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut table = self.shared.lock();
        while is_pending(&table, task) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            table = self
                .shared
                .changed
                .wait_timeout(table, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }

    pub fn task_info(&self, task: Task) -> Option<TaskInfo> {
        self.shared.lock().entries.get(&task.0).map(|e| e.info.clone())
    }

    pub fn task_status(&self, task: Task) -> Option<TaskStatus> {
        self.shared.lock().entries.get(&task.0).map(|e| e.status.clone())
    }

    /// Cancel a task that has not started yet.
    ///
    /// Tasks already `InProgress` run to completion; returns whether the
    /// task is now `Cancelled`.
    pub fn cancel_task(&self, task: Task) -> bool {
        let mut table = self.shared.lock();
        let Some(entry) = table.entries.get_mut(&task.0) else {
            return false;
        };
        match entry.status.state {
            TaskState::Queued => {
                entry.cancelled.store(true, Ordering::Release);
                entry.status.state = TaskState::Cancelled;
                drop(table);
                self.shared.changed.notify_all();
                debug!("{} cancelled", task);
                true
            }
            TaskState::Cancelled => true,
            _ => false,
        }
    }

    /// Release one reference to a task.
    ///
    /// Refuses (returning false) while the task is `InProgress`. A queued
    /// task losing its last reference is cancelled.
    pub fn remove_task(&self, task: Task) -> bool {
        let mut table = self.shared.lock();
        let Some(entry) = table.entries.get_mut(&task.0) else {
            return false;
        };
        if entry.status.state == TaskState::InProgress {
            warn!("Refusing to remove {} while in progress", task);
            return false;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            entry.cancelled.store(true, Ordering::Release);
            table.entries.remove(&task.0);
            drop(table);
            self.shared.changed.notify_all();
        }
        true
    }

    /// Number of tasks currently held (any state).
    pub fn task_count(&self) -> usize {
        self.shared.lock().entries.len()
    }
}

impl std::fmt::Debug for RangeDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeDownloader")
            .field("hints", &self.shared.hints)
            .field("tasks", &self.task_count())
            .finish()
    }
}

fn task_type_for(range: Range) -> TaskType {
    if range.is_full() {
        TaskType::Full
    } else {
        TaskType::Range
    }
}

fn is_pending(table: &TaskTable, task: Task) -> bool {
    table
        .entries
        .get(&task.0)
        .is_some_and(|e| !e.status.state.is_done())
}
