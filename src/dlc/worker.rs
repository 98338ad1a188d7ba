//! Manager worker thread
//!
//! One thread per initialized manager. It loads the index (retrying until
//! it succeeds or the manager is deinitialized), scans the local store and
//! then advances the download queue: finished transfers are verified and
//! committed, completed packs are announced in acquisition order and free
//! transfer slots are filled with files of the queued packs.
//!
//! All queue state lives in one [`State`] behind a mutex. Disk work
//! (commits, scans, deletions) and observer callbacks run without it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::config::Hints;
use super::index::PackIndex;
use super::init::{self, Fetcher, InitError};
use super::request::{PackRequest, RequestState};
use super::{scan, store, DlcEvent, InitState, InitStatus, Observer, SubscriptionId};
use crate::archive::ArchiveError;
use crate::downloader::{Range, RangeDownloader, Task, TaskState, TaskStatus};
use crate::logging;
use crate::meta::db::LocalPacksDb;
use crate::meta::MetaError;
use crate::paths::part_path;

/// Queue advancement period while idle.
const TICK: Duration = Duration::from_millis(50);

/// One `initialize` .. `deinitialize` span.
pub(crate) struct Session {
    pub dir: PathBuf,
    pub url: Option<String>,
    pub hints: Hints,
    pub downloader: RangeDownloader,
    pub local_db: Option<LocalPacksDb>,
    pub stop: AtomicBool,
}

impl Session {
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.hints.retry_connect_milliseconds)
    }
}

/// A transfer no longer tracked by the queue but still running.
struct Orphan {
    file: usize,
    task: Task,
    /// Commit the result; otherwise the file is deleted once it finishes.
    keep: bool,
}

#[derive(Default)]
pub(crate) struct State {
    pub status: InitStatus,
    pub init_state: InitState,
    pub last_error: Option<String>,
    pub network_ready: bool,
    pub index: Option<Arc<PackIndex>>,
    pub requests: Vec<Arc<PackRequest>>,
    /// Per file: present in the local store (or shipped locally).
    pub ready: Vec<bool>,
    /// Per pack: the pack and its closure are ready.
    pub pack_done: Vec<bool>,
    active: HashMap<usize, Task>,
    orphans: Vec<Orphan>,
    retry_after: HashMap<usize, Instant>,
}

impl State {
    /// Packs of every live request, in request order.
    pub fn queued_packs(&self, index: &PackIndex) -> Vec<u32> {
        self.requests
            .iter()
            .filter(|r| r.state() != RequestState::Failed)
            .filter_map(|r| index.pack_index(r.requested_pack_name()))
            .collect()
    }

    /// Mark newly completed packs (dependencies first) and settle requests.
    pub fn update_packs(&mut self, index: &PackIndex, events: &mut Vec<DlcEvent>, announce: bool) {
        for &pack in index.acquisition_order() {
            if self.pack_done[pack as usize] {
                continue;
            }
            let deps_done = index
                .graph()
                .direct_dependencies(pack)
                .iter()
                .all(|&d| self.pack_done[d as usize]);
            let files_ready = index.files_of(pack).iter().all(|&f| self.ready[f]);
            if deps_done && files_ready {
                self.pack_done[pack as usize] = true;
                if announce {
                    let name = index.graph().name(pack).to_string();
                    info!("Pack '{}' downloaded", name);
                    events.push(DlcEvent::PackDownloaded { pack: name });
                }
            }
        }
        self.settle_requests(index, events);
    }

    pub fn settle_requests(&mut self, index: &PackIndex, events: &mut Vec<DlcEvent>) {
        for request in &self.requests {
            let name = request.requested_pack_name();
            match index.pack_index(name) {
                None => {
                    if request.fail("unknown pack") {
                        warn!("Requested pack '{}' is not in the index", name);
                        events.push(updated(request));
                    }
                }
                Some(pack) if self.pack_done[pack as usize] => {
                    if request.set_state(RequestState::Downloaded) {
                        events.push(updated(request));
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// Drop queued transfers; running ones become orphans and are kept.
    pub fn reset(&mut self, downloader: &RangeDownloader) {
        let cancelled = self.cancel_queued(downloader);
        for (file, task) in self.active.drain() {
            self.orphans.push(Orphan { file, task, keep: true });
        }
        self.requests.clear();
        self.retry_after.clear();
        debug!("Queue reset, {} transfers cancelled, {} left running", cancelled, self.orphans.len());
    }

    /// Cancel transfers that haven't started. Returns how many were cancelled.
    pub fn cancel_queued(&mut self, downloader: &RangeDownloader) -> usize {
        let before = self.active.len();
        self.active.retain(|_, task| {
            if downloader.cancel_task(*task) {
                downloader.remove_task(*task);
                false
            } else {
                true
            }
        });
        before - self.active.len()
    }

    /// Forget a file: cancel or orphan its transfer and clear its readiness.
    pub fn drop_file(&mut self, file: usize, downloader: &RangeDownloader) {
        if let Some(task) = self.active.remove(&file) {
            if downloader.cancel_task(task) {
                downloader.remove_task(task);
            } else {
                self.orphans.push(Orphan { file, task, keep: false });
            }
        }
        for orphan in self.orphans.iter_mut().filter(|o| o.file == file) {
            orphan.keep = false;
        }
        self.retry_after.remove(&file);
        if let Some(ready) = self.ready.get_mut(file) {
            *ready = false;
        }
    }

    /// Cancel everything on shutdown.
    pub fn shutdown(&mut self, downloader: &RangeDownloader) {
        self.cancel_queued(downloader);
        for (_, task) in self.active.drain() {
            downloader.remove_task(task);
        }
        for orphan in self.orphans.drain(..) {
            downloader.remove_task(orphan.task);
        }
    }

    fn take_finished(&mut self, downloader: &RangeDownloader) -> Vec<Finished> {
        let mut finished = Vec::new();
        let mut done = |file: usize, task: Task, keep: bool| -> bool {
            match downloader.task_status(task) {
                Some(status) if !status.state.is_done() => false,
                status => {
                    finished.push(Finished { file, task, keep, status });
                    true
                }
            }
        };

        self.active.retain(|&file, &mut task| !done(file, task, true));
        self.orphans.retain(|o| !done(o.file, o.task, o.keep));
        finished
    }

    fn start_downloads(&mut self, index: &PackIndex, session: &Session, events: &mut Vec<DlcEvent>) {
        let Some(url) = session.url.as_deref() else {
            return;
        };
        let limit = session.hints.max_parallel_files;
        let now = Instant::now();
        let requests = self.requests.clone();

        for request in requests {
            if !matches!(request.state(), RequestState::Queued | RequestState::Downloading) {
                continue;
            }
            let Some(root) = index.pack_index(request.requested_pack_name()) else {
                continue;
            };

            let mut touched = false;
            for pack in index.graph().closure_indices(&[root]) {
                if self.pack_done[pack as usize] {
                    continue;
                }
                let deps_done = index
                    .graph()
                    .direct_dependencies(pack)
                    .iter()
                    .all(|&d| self.pack_done[d as usize]);
                if !deps_done {
                    continue;
                }

                for &file in index.files_of(pack) {
                    if self.ready[file] {
                        continue;
                    }
                    if self.active.contains_key(&file) || self.orphans.iter().any(|o| o.file == file) {
                        touched = true;
                        continue;
                    }
                    if self.retry_after.get(&file).is_some_and(|&at| at > now) {
                        continue;
                    }
                    if self.active.len() >= limit {
                        break;
                    }

                    let info = index.file(file);
                    let task = session.downloader.resume_task(
                        url,
                        &part_path(&session.dir, &info.relative_file_path),
                        Range::new(info.offset, info.compressed_size as u64),
                    );
                    debug!("{} fetching {}", task, info.relative_file_path);
                    self.active.insert(file, task);
                    touched = true;
                }
            }

            if touched && request.set_state(RequestState::Downloading) {
                events.push(updated(&request));
            }
        }
    }
}

struct Finished {
    file: usize,
    task: Task,
    keep: bool,
    status: Option<TaskStatus>,
}

enum Outcome {
    Stored,
    Retry(String),
    LocalFailure { errno: i32, reason: String },
    Dropped,
}

pub(crate) struct Shared {
    pub state: Mutex<State>,
    pub wake: Condvar,
    pub session: RwLock<Option<Arc<Session>>>,
    pub requesting_enabled: AtomicBool,
    observers: Mutex<Vec<(SubscriptionId, Observer)>>,
    next_observer: AtomicU64,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            session: RwLock::new(None),
            requesting_enabled: AtomicBool::new(true),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn requesting_enabled(&self) -> bool {
        self.requesting_enabled.load(Ordering::Acquire)
    }

    pub fn subscribe(&self, observer: Observer) -> SubscriptionId {
        let id = SubscriptionId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, observer));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = observers.len();
        observers.retain(|(other, _)| *other != id);
        observers.len() != before
    }

    /// Deliver events. Must be called without the state lock held.
    pub fn emit(&self, events: Vec<DlcEvent>) {
        if events.is_empty() {
            return;
        }
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for event in &events {
            for observer in &observers {
                observer(event);
            }
        }
    }

    fn set_init_state(&self, init_state: InitState) {
        debug!("Init state: {:?}", init_state);
        self.lock().init_state = init_state;
    }

    /// Wait up to `duration`; false if the session was stopped meanwhile.
    fn sleep(&self, session: &Session, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.lock();
        loop {
            if session.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            state = self
                .wake
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

/// Worker thread body.
pub(crate) fn run(shared: Arc<Shared>, session: Arc<Session>) {
    let _file_log = session.hints.log_file().and_then(|path| {
        logging::thread_file_logger(&path)
            .map_err(|e| warn!("Failed to open log file {}: {}", path.display(), e))
            .ok()
    });
    info!(
        "DLC manager started: {} from {}",
        session.dir.display(),
        session.url.as_deref().unwrap_or("-")
    );

    let Some((index, status)) = acquire_index(&shared, &session) else {
        debug!("DLC manager stopped without an index");
        return;
    };

    shared.set_init_state(InitState::ScanLocalFiles);
    let mut ready = scan::scan_store(&session.dir, &index).ready;
    mark_local_files(&session, &index, &mut ready);
    install_index(&shared, index, ready, status);

    while !session.stopped() {
        advance(&shared, &session);
        let state = shared.lock();
        if session.stopped() {
            break;
        }
        let _ = shared.wake.wait_timeout(state, TICK);
    }
    info!("DLC manager stopped");
}

fn acquire_index(shared: &Shared, session: &Session) -> Option<(PackIndex, InitStatus)> {
    let url = session.url.as_deref()?;
    let fetcher = Fetcher {
        downloader: &session.downloader,
        url,
        stop: &session.stop,
    };

    let mut attempts = 0u32;
    loop {
        shared.set_init_state(InitState::Starting);
        let result = init::fetch_remote(&fetcher, &session.dir, &mut |s| shared.set_init_state(s))
            .and_then(|remote| {
                shared.set_init_state(InitState::LoadPacksFromMeta);
                PackIndex::from_superpack(&remote.table, &remote.meta, remote.footer).map_err(InitError::from)
            });

        match result {
            Ok(index) => {
                shared.lock().network_ready = true;
                return Some((index, InitStatus::FinishedWithRemoteMeta));
            }
            Err(InitError::Stopped) => return None,
            Err(e) if is_invalid_index(&e) => {
                error!("Server index rejected: {}", e);
                reject_index(shared, e.to_string());
                return None;
            }
            Err(e) => {
                attempts += 1;
                warn!("Index load attempt {} failed: {}", attempts, e);
                {
                    let mut state = shared.lock();
                    state.last_error = Some(e.to_string());
                    state.network_ready = false;
                }

                if attempts >= session.hints.skip_cdn_connect_after_attempts {
                    match init::load_cached(&session.dir) {
                        Ok(Some(cached)) => {
                            match PackIndex::from_superpack(&cached.table, &cached.meta, cached.footer) {
                                Ok(index) => {
                                    info!(
                                        "Server unreachable after {} attempts, using the local index copy",
                                        attempts
                                    );
                                    return Some((index, InitStatus::FinishedWithLocalMeta));
                                }
                                Err(e) => warn!("Local index copy unusable: {}", e),
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Local index copy unusable: {}", e),
                    }
                }

                if !shared.sleep(session, session.retry_delay()) {
                    return None;
                }
            }
        }
    }
}

/// Index errors that survived every CRC check; fetching again returns the same bytes.
fn is_invalid_index(error: &InitError) -> bool {
    matches!(
        error,
        InitError::Archive(ArchiveError::Malformed(_))
            | InitError::Meta(
                MetaError::Graph(_)
                    | MetaError::PackIndexOutOfRange { .. }
                    | MetaError::BadDependency(..)
                    | MetaError::Malformed(_)
            )
    )
}

/// Terminal init failure: fail every queued request and tell subscribers.
fn reject_index(shared: &Shared, reason: String) {
    let mut events = Vec::new();
    {
        let mut state = shared.lock();
        state.status = InitStatus::InvalidRemoteMeta;
        state.init_state = InitState::Failed;
        state.last_error = Some(reason.clone());
        for request in &state.requests {
            if request.fail(&reason) {
                events.push(updated(request));
            }
        }
    }
    events.push(DlcEvent::InitFailed { reason });
    shared.emit(events);
}

/// Files shipped in the local packs database count as present.
pub(crate) fn mark_local_files(session: &Session, index: &PackIndex, ready: &mut [bool]) {
    let Some(db) = &session.local_db else {
        return;
    };
    for (file, info) in index.files().iter().enumerate() {
        if db.contains_file(&info.relative_file_path) {
            ready[file] = true;
        }
    }
}

/// Swap in a freshly loaded index and resolve requests made before it.
pub(crate) fn install_index(shared: &Shared, index: PackIndex, ready: Vec<bool>, status: InitStatus) {
    shared.set_init_state(InitState::MoveDelayedRequests);
    let index = Arc::new(index);
    let mut events = vec![DlcEvent::Initialized { status }];
    {
        let mut state = shared.lock();
        state.pack_done = vec![false; index.pack_count()];
        state.ready = ready;
        state.index = Some(index.clone());
        state.update_packs(&index, &mut events, false);
        state.status = status;
        state.init_state = match status {
            InitStatus::FinishedWithLocalMeta if state.last_error.is_some() => InitState::Offline,
            _ => InitState::Ready,
        };
        info!(
            "Index ready ({:?}): {} packs, {} files, {} requests",
            status,
            index.pack_count(),
            index.files().len(),
            state.requests.len()
        );
    }
    shared.wake.notify_all();
    shared.emit(events);
}

fn advance(shared: &Shared, session: &Session) {
    let Some(index) = shared.lock().index.clone() else {
        return;
    };

    let finished = shared.lock().take_finished(&session.downloader);

    let mut outcomes = Vec::with_capacity(finished.len());
    for done in finished {
        session.downloader.remove_task(done.task);
        let info = index.file(done.file);
        let outcome = match done.status {
            _ if !done.keep => {
                store::remove_file(&session.dir, &info.relative_file_path);
                Outcome::Dropped
            }
            None => Outcome::Retry(format!("{} disappeared", done.task)),
            Some(status) if status.state == TaskState::Cancelled => Outcome::Dropped,
            Some(status) if status.error.error_happened => {
                let error = &status.error;
                let reason = format!(
                    "{}: {} (http {}, errno {})",
                    info.relative_file_path, error.err_str, error.http_code, error.file_errno
                );
                if is_fatal_local_error(error.file_errno) {
                    Outcome::LocalFailure {
                        errno: error.file_errno,
                        reason,
                    }
                } else {
                    Outcome::Retry(reason)
                }
            }
            Some(_) => match store::commit_part(&session.dir, info) {
                Ok(true) => Outcome::Stored,
                Ok(false) => Outcome::Retry(format!("{}: corrupt download", info.relative_file_path)),
                Err(e) => Outcome::Retry(format!("{:#}", e)),
            },
        };
        outcomes.push((done.file, outcome));
    }

    let mut events = Vec::new();
    {
        let mut state = shared.lock();
        if !state.index.as_ref().is_some_and(|current| Arc::ptr_eq(current, &index)) {
            return;
        }

        for (file, outcome) in outcomes {
            match outcome {
                Outcome::Stored => {
                    state.ready[file] = true;
                    state.retry_after.remove(&file);
                    state.network_ready = true;
                }
                Outcome::Retry(reason) => {
                    warn!("Will retry {}", reason);
                    state
                        .retry_after
                        .insert(file, Instant::now() + session.retry_delay());
                    state.last_error = Some(reason);
                }
                Outcome::LocalFailure { errno, reason } => {
                    error!("Local write failed, requesting disabled: {}", reason);
                    shared.requesting_enabled.store(false, Ordering::Release);
                    state.cancel_queued(&session.downloader);
                    state.last_error = Some(reason.clone());

                    let pack = index.file_pack(file);
                    for request in &state.requests {
                        let affected = index
                            .pack_index(request.requested_pack_name())
                            .is_some_and(|root| root == pack || index.graph().has_dependency(root, pack));
                        if affected && request.fail(&reason) {
                            events.push(updated(request));
                        }
                    }
                    events.push(DlcEvent::FileError {
                        path: part_path(&session.dir, &index.file(file).relative_file_path),
                        errno,
                    });
                }
                Outcome::Dropped => {}
            }
        }

        state.update_packs(&index, &mut events, true);
        if shared.requesting_enabled() {
            state.start_downloads(&index, session, &mut events);
        }
    }
    shared.emit(events);
}

/// Errors retrying can't fix: the disk or the file system refuses writes.
fn is_fatal_local_error(errno: i32) -> bool {
    matches!(
        errno,
        libc::ENOSPC | libc::EROFS | libc::ENFILE | libc::EMFILE | libc::ENAMETOOLONG | libc::ENODEV | libc::EACCES
    )
}

pub(crate) fn updated(request: &PackRequest) -> DlcEvent {
    DlcEvent::RequestUpdated {
        pack: request.requested_pack_name().to_string(),
        state: request.state(),
    }
}
