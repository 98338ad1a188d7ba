//! DLC manager
//!
//! Delivers packs from a remote superpack into a local pack store.
//!
//! `initialize` validates the download directory synchronously and then
//! loads the remote index on a worker thread, so [`DlcManager::is_initialized`]
//! may stay false for a while. Requests made before that are kept and
//! serviced once the index is in place. Network failures never surface as
//! errors: the worker retries every `retry_connect_milliseconds` and the
//! progress simply doesn't move.
//!
//! A pack's files are fetched once all of its dependencies are complete,
//! so packs finish in acquisition order.

pub mod config;
pub mod index;
pub mod init;
pub mod progress;
pub mod request;
pub mod scan;
pub mod store;
mod worker;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

pub use config::{ConfigError, Hints};
pub use index::PackIndex;
pub use progress::Progress;
pub use request::{PackRequest, RequestState};

use crate::archive::FileInfo;
use crate::meta::db::LocalPacksDb;
use crate::paths::resource_relative;
use worker::{Session, Shared};

/// Name of the write probe created in the download directory.
const WRITE_PROBE: &str = "tmp.file";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InitStatus {
    #[default]
    Uninitialized,
    /// Loading the index; requests are queued meanwhile.
    Connecting,
    /// Running from a local packs database or the cached remote index.
    FinishedWithLocalMeta,
    FinishedWithRemoteMeta,
    /// The server's index is inconsistent (dependency cycle, dangling pack
    /// index, unsafe names). Requests fail until the manager is reinitialized.
    InvalidRemoteMeta,
}

/// Fine-grained initialization step, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InitState {
    #[default]
    Starting,
    AskFooter,
    GetFooter,
    CompareLocalMeta,
    AskFileTable,
    GetFileTable,
    AskMeta,
    GetMeta,
    UnpackMeta,
    LoadPacksFromMeta,
    ScanLocalFiles,
    MoveDelayedRequests,
    Ready,
    /// Ready, but running from the local index copy.
    Offline,
    /// Gave up on an unusable server index.
    Failed,
}

/// Notifications delivered to subscribers, usually on the worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlcEvent {
    Initialized { status: InitStatus },
    /// The server's index was rejected; every request has failed.
    InitFailed { reason: String },
    RequestUpdated { pack: String, state: RequestState },
    /// A pack and all its dependencies are in the store.
    PackDownloaded { pack: String },
    /// Writing to the store failed; requesting has been disabled.
    FileError { path: PathBuf, errno: i32 },
}

pub type Observer = Arc<dyn Fn(&DlcEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Summary of the loaded index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperpackInfo {
    pub total_files: u32,
    pub files_table_crc32: u32,
    pub meta_crc32: u32,
}

pub struct DlcManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DlcManager {
    pub fn create() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            worker: Mutex::new(None),
        }
    }

    /// Start serving packs from `url` into `download_dir`.
    ///
    /// Fails synchronously for an unusable directory, invalid hints or a
    /// bad local packs database. Without a URL the manager runs from
    /// `hints.local_packs_db` alone and is initialized on return.
    pub fn initialize(&self, download_dir: &Path, url: Option<&str>, hints: Hints) -> Result<(), ConfigError> {
        if self.shared.session().is_some() {
            return Err(ConfigError::AlreadyInitialized);
        }
        hints.validate()?;
        prepare_dir(download_dir)?;

        let local_db = match &hints.local_packs_db {
            Some(path) => Some(LocalPacksDb::open(path).map_err(|source| ConfigError::LocalPacksDb {
                path: path.clone(),
                source,
            })?),
            None => None,
        };
        let url = url.filter(|u| !u.is_empty()).map(str::to_string);

        let local_index = match (&url, &local_db) {
            (None, None) => return Err(ConfigError::NoSource),
            (None, Some(db)) => Some(PackIndex::from_local_db(db).map_err(|source| {
                ConfigError::LocalPacksDb {
                    path: hints.local_packs_db.clone().unwrap_or_default(),
                    source,
                }
            })?),
            (Some(_), _) => None,
        };

        let session = Arc::new(Session {
            dir: download_dir.to_path_buf(),
            url,
            downloader: hints.downloader()?,
            hints,
            local_db,
            stop: Default::default(),
        });

        {
            let mut state = self.shared.lock();
            state.status = InitStatus::Connecting;
            state.init_state = InitState::Starting;
            state.last_error = None;
        }
        *self
            .shared
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session.clone());

        if let Some(index) = local_index {
            info!("Using local packs database only, {} packs", index.pack_count());
            let ready = vec![true; index.files().len()];
            worker::install_index(&self.shared, index, ready, InitStatus::FinishedWithLocalMeta);
            return Ok(());
        }

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name("dlc-manager".into())
            .spawn(move || worker::run(shared, session));
        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.deinitialize();
                Err(ConfigError::Thread(e))
            }
        }
    }

    /// Stop the worker and forget the index and all requests.
    ///
    /// Transfers already running are left to finish in the background.
    pub fn deinitialize(&self) {
        let session = self
            .shared
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(session) = session else {
            return;
        };

        session.stop.store(true, Ordering::Release);
        {
            let _state = self.shared.lock();
            self.shared.wake.notify_all();
        }
        let handle = self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("DLC manager worker panicked");
            }
        }

        let mut state = self.shared.lock();
        state.shutdown(&session.downloader);
        *state = Default::default();
        debug!("DLC manager deinitialized");
    }

    pub fn is_initialized(&self) -> bool {
        matches!(
            self.init_status(),
            InitStatus::FinishedWithLocalMeta | InitStatus::FinishedWithRemoteMeta
        )
    }

    pub fn init_status(&self) -> InitStatus {
        self.shared.lock().status
    }

    pub fn internal_init_state(&self) -> InitState {
        self.shared.lock().init_state
    }

    /// Last index-load or download failure, if any.
    pub fn last_error_message(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Whether the last contact with the server succeeded.
    pub fn is_network_ready(&self) -> bool {
        self.shared.lock().network_ready
    }

    /// Request a pack and its dependencies.
    ///
    /// Returns the existing request if the pack was requested before.
    pub fn request_pack(&self, name: &str) -> Arc<PackRequest> {
        let mut events = Vec::new();
        let request = {
            let mut state = self.shared.lock();
            if let Some(existing) = state.requests.iter().find(|r| r.requested_pack_name() == name) {
                return existing.clone();
            }

            let request = Arc::new(PackRequest::new(name));
            state.requests.push(request.clone());
            if let Some(index) = state.index.clone() {
                state.settle_requests(&index, &mut events);
            } else if state.status == InitStatus::InvalidRemoteMeta {
                let reason = state.last_error.clone().unwrap_or_default();
                if request.fail(&reason) {
                    events.push(worker::updated(&request));
                }
            }
            debug!("Requested pack '{}'", name);
            request
        };
        self.shared.wake.notify_all();
        self.shared.emit(events);
        request
    }

    /// Move a request to the front of the queue.
    pub fn set_request_priority(&self, name: &str) -> bool {
        let mut state = self.shared.lock();
        let Some(position) = state.requests.iter().position(|r| r.requested_pack_name() == name) else {
            return false;
        };
        let request = state.requests.remove(position);
        state.requests.insert(0, request);
        true
    }

    /// Whether `path` names a file of the index.
    ///
    /// Accepts a relative name, a `~res:/` path or an absolute path under
    /// the resource root or the download directory.
    pub fn is_known_file(&self, path: &str) -> bool {
        let Some(session) = self.shared.session() else {
            return false;
        };
        let Some(relative) = resolve(&session, path) else {
            return false;
        };
        let in_index = self
            .shared
            .lock()
            .index
            .as_ref()
            .is_some_and(|index| index.file_index(&relative).is_some());
        in_index || session.local_db.as_ref().is_some_and(|db| db.contains_file(&relative))
    }

    pub fn get_file_info(&self, path: &str) -> Option<FileInfo> {
        let session = self.shared.session()?;
        let relative = resolve(&session, path)?;
        let state = self.shared.lock();
        let index = state.index.as_ref()?;
        index.file_index(&relative).map(|i| index.file(i).clone())
    }

    /// Own uncompressed size of a pack, 0 if unknown.
    pub fn get_pack_size(&self, name: &str) -> u64 {
        let state = self.shared.lock();
        state
            .index
            .as_ref()
            .and_then(|index| index.pack_index(name).map(|p| index.pack_size(p)))
            .unwrap_or(0)
    }

    pub fn get_info(&self) -> Option<SuperpackInfo> {
        let state = self.shared.lock();
        let index = state.index.as_ref()?;
        let (files_table_crc32, meta_crc32) = index
            .footer()
            .map(|f| (f.info.files_table_crc32, f.meta_data_crc32))
            .unwrap_or((0, 0));
        Some(SuperpackInfo {
            total_files: index.files().len() as u32,
            files_table_crc32,
            meta_crc32,
        })
    }

    /// Drop every request and every transfer that hasn't started.
    ///
    /// Running transfers finish and are committed.
    pub fn reset_queue(&self) {
        let downloader = self.shared.session().map(|s| s.downloader.clone());
        let mut state = self.shared.lock();
        match downloader {
            Some(downloader) => state.reset(&downloader),
            None => state.requests.clear(),
        }
        info!("Download queue reset");
    }

    pub fn set_requesting_enabled(&self, enabled: bool) {
        let previous = self.shared.requesting_enabled.swap(enabled, Ordering::AcqRel);
        if previous == enabled {
            return;
        }
        info!("Requesting {}", if enabled { "enabled" } else { "disabled" });

        let mut events = Vec::new();
        {
            let mut state = self.shared.lock();
            if enabled {
                let index = state.index.clone();
                let known = state.requests.iter().filter(|r| {
                    index
                        .as_ref()
                        .map_or(true, |index| index.pack_index(r.requested_pack_name()).is_some())
                });
                for request in known {
                    if request.state() == RequestState::Failed && request.set_state(RequestState::Queued) {
                        events.push(DlcEvent::RequestUpdated {
                            pack: request.requested_pack_name().to_string(),
                            state: RequestState::Queued,
                        });
                    }
                }
            } else if let Some(session) = self.shared.session() {
                state.cancel_queued(&session.downloader);
            }
        }
        self.shared.wake.notify_all();
        self.shared.emit(events);
    }

    pub fn is_requesting_enabled(&self) -> bool {
        self.shared.requesting_enabled()
    }

    pub fn is_pack_downloaded(&self, name: &str) -> bool {
        let state = self.shared.lock();
        state
            .index
            .as_ref()
            .and_then(|index| index.pack_index(name))
            .is_some_and(|pack| state.pack_done[pack as usize])
    }

    /// Whether a request for the pack is waiting or downloading.
    pub fn is_pack_in_queue(&self, name: &str) -> bool {
        self.shared
            .lock()
            .requests
            .iter()
            .any(|r| r.requested_pack_name() == name && is_pending(r))
    }

    pub fn is_any_pack_in_queue(&self) -> bool {
        self.shared.lock().requests.iter().any(|r| is_pending(r))
    }

    /// Progress over the whole catalog.
    pub fn get_progress(&self) -> Progress {
        let enabled = self.is_requesting_enabled();
        let state = self.shared.lock();
        match &state.index {
            Some(index) => progress::overall(index, &state.ready, &state.queued_packs(index), enabled),
            None => Progress {
                is_requesting_enabled: enabled,
                ..Progress::default()
            },
        }
    }

    /// Progress over the closure of the given packs. Unknown names are ignored.
    pub fn get_packs_progress<S: AsRef<str>>(&self, names: &[S]) -> Progress {
        let enabled = self.is_requesting_enabled();
        let state = self.shared.lock();
        let Some(index) = &state.index else {
            return Progress {
                is_requesting_enabled: enabled,
                ..Progress::default()
            };
        };
        let packs: Vec<u32> = names
            .iter()
            .filter_map(|n| index.pack_index(n.as_ref()))
            .collect();
        progress::for_packs(index, &state.ready, &state.queued_packs(index), &packs, enabled)
    }

    /// Delete a downloaded pack from the store.
    ///
    /// Refused for packs shipped in the local packs database and for packs
    /// another request depends on. Direct dependencies that were requested
    /// on their own are removed too when nothing else needs them.
    pub fn remove_pack(&self, name: &str) -> bool {
        let Some(session) = self.shared.session() else {
            return false;
        };
        if session.local_db.as_ref().is_some_and(|db| db.has_pack(name)) {
            warn!("Pack '{}' is shipped locally and can't be removed", name);
            return false;
        }

        let mut doomed = Vec::new();
        {
            let mut state = self.shared.lock();
            let Some(index) = state.index.clone() else {
                return false;
            };
            let Some(root) = index.pack_index(name) else {
                return false;
            };

            let needed_by = |requests: &[Arc<PackRequest>], pack: u32| -> Option<String> {
                requests
                    .iter()
                    .find(|r| {
                        index
                            .pack_index(r.requested_pack_name())
                            .is_some_and(|other| other != pack && index.graph().has_dependency(other, pack))
                    })
                    .map(|r| r.requested_pack_name().to_string())
            };
            if let Some(other) = needed_by(&state.requests, root) {
                warn!("Pack '{}' is needed by requested pack '{}'", name, other);
                return false;
            }

            let mut pending = vec![root];
            while let Some(pack) = pending.pop() {
                state.requests.retain(|r| r.requested_pack_name() != index.graph().name(pack));
                for &file in index.files_of(pack) {
                    state.drop_file(file, &session.downloader);
                    doomed.push(index.file(file).relative_file_path.clone());
                }
                for dependent in 0..index.pack_count() as u32 {
                    if dependent == pack || index.graph().has_dependency(dependent, pack) {
                        state.pack_done[dependent as usize] = false;
                    }
                }

                for &dep in index.graph().direct_dependencies(pack) {
                    let dep_name = index.graph().name(dep);
                    let requested = state.requests.iter().any(|r| r.requested_pack_name() == dep_name);
                    if requested && needed_by(&state.requests, dep).is_none() {
                        pending.push(dep);
                    }
                }
            }
        }

        let removed = doomed
            .iter()
            .filter(|rel| store::remove_file(&session.dir, rel))
            .count();
        info!("Removed pack '{}' ({} files deleted)", name, removed);
        true
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&DlcEvent) + Send + Sync + 'static,
    {
        self.shared.subscribe(Arc::new(observer))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.unsubscribe(id)
    }
}

impl Default for DlcManager {
    fn default() -> Self {
        Self::create()
    }
}

impl Drop for DlcManager {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

/// Application-level holder of an optional default manager.
#[derive(Default)]
pub struct DlcContext {
    default_manager: Option<Arc<DlcManager>>,
}

impl DlcContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default_manager(&mut self, manager: Arc<DlcManager>) -> Option<Arc<DlcManager>> {
        self.default_manager.replace(manager)
    }

    pub fn default_manager(&self) -> Option<&Arc<DlcManager>> {
        self.default_manager.as_ref()
    }

    pub fn take_default_manager(&mut self) -> Option<Arc<DlcManager>> {
        self.default_manager.take()
    }
}

fn is_pending(request: &PackRequest) -> bool {
    matches!(request.state(), RequestState::Queued | RequestState::Downloading)
}

fn resolve(session: &Session, path: &str) -> Option<String> {
    let mut roots: Vec<&Path> = Vec::with_capacity(2);
    if let Some(root) = &session.hints.resource_root {
        roots.push(root);
    }
    roots.push(&session.dir);
    resource_relative(path, &roots)
}

/// Create the download directory if needed and check it takes writes.
fn prepare_dir(dir: &Path) -> Result<(), ConfigError> {
    if dir.exists() && !dir.is_dir() {
        return Err(ConfigError::NotADirectory(dir.to_path_buf()));
    }
    let not_writable = |source| ConfigError::NotWritable {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(not_writable)?;

    let probe = dir.join(WRITE_PROBE);
    let mut file = fs::File::create(&probe).map_err(not_writable)?;
    file.write_all(b"probe").map_err(not_writable)?;
    drop(file);
    fs::remove_file(&probe).map_err(not_writable)?;
    Ok(())
}
