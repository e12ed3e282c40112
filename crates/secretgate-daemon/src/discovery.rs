//! Endpoint discovery.
//!
//! Watches one directory for client endpoints (`<name>.sock`) and runs one
//! proxy per endpoint for as long as the file exists.
//!
//! ```text
//!  inotify thread ──WatchEvent──► DiscoveryManager::run ─► start_proxy / stop_proxy
//!                                        │
//!                             ClientRegistry (path → entry)
//!                                        │
//!                      TaskTracker: connect ─► run ─► deregister generation
//! ```
//!
//! The watch is installed before the initial scan, so an endpoint created in
//! between may be reported twice. The registry's insert-if-absent rejects the
//! duplicate.
//!
//! # Invariants
//!
//! - At most one entry (and one proxy task) per endpoint path.
//! - A proxy task only ever removes the registry entry carrying its own
//!   generation, never a newer proxy for the same path.
//! - Cancelling the manager's token stops every proxy.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use secretgate_core::config::DiscoveryConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::proxy::ProxyError;

const CLIENT_EVENT_CAPACITY: usize = 64;
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of a registered proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyState {
    /// Connecting to the endpoint and the backend.
    Starting,
    /// Serving.
    Running,
}

/// A known client endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Endpoint file name without the suffix.
    pub name: String,
    /// Endpoint socket path.
    pub endpoint_path: PathBuf,
    /// Proxy state.
    pub state: ProxyState,
}

/// Client lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// A proxy started serving.
    Connected(ClientInfo),
    /// A proxy stopped.
    Disconnected(ClientInfo),
}

/// Errors from the discovery manager.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The directory could not be created or read.
    #[error("cannot read discovery directory {}: {source}", directory.display())]
    Directory {
        /// Watched directory.
        directory: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The inotify watch could not be installed.
    #[error("cannot watch {}: {source}", directory.display())]
    Watch {
        /// Watched directory.
        directory: PathBuf,
        /// Underlying error.
        #[source]
        source: nix::Error,
    },
}

/// Creates proxies for endpoints.
#[async_trait]
pub trait ProxyFactory: Send + Sync {
    /// Connects a proxy for `name` at `endpoint`, cancelled by `cancel`.
    async fn connect(
        &self,
        name: &str,
        endpoint: &Path,
        cancel: CancellationToken,
    ) -> Result<Box<dyn ProxyRunner>, ProxyError>;
}

/// A connected proxy.
#[async_trait]
pub trait ProxyRunner: Send {
    /// Serves until the proxy's token is cancelled or a connection ends.
    async fn run(self: Box<Self>);
}

#[derive(Debug)]
struct RegistryEntry {
    info: ClientInfo,
    generation: u64,
    cancel: CancellationToken,
}

/// Registry of endpoints with a proxy, keyed by endpoint path.
#[derive(Debug)]
pub struct ClientRegistry {
    entries: Mutex<HashMap<PathBuf, RegistryEntry>>,
    next_generation: AtomicU64,
    events: broadcast::Sender<ClientEvent>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a `Starting` entry unless `endpoint` is already registered.
    ///
    /// Returns the entry's generation and a child of `parent` that stops the
    /// proxy, or `None` for a duplicate.
    pub fn try_insert_starting(
        &self,
        name: &str,
        endpoint: &Path,
        parent: &CancellationToken,
    ) -> Option<(u64, CancellationToken)> {
        let mut entries = self.lock();
        if entries.contains_key(endpoint) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        entries.insert(
            endpoint.to_path_buf(),
            RegistryEntry {
                info: ClientInfo {
                    name: name.to_string(),
                    endpoint_path: endpoint.to_path_buf(),
                    state: ProxyState::Starting,
                },
                generation,
                cancel: cancel.clone(),
            },
        );
        Some((generation, cancel))
    }

    /// Marks the entry `Running` and announces it.
    ///
    /// Returns `false` if the entry was removed or replaced meanwhile.
    pub fn mark_running(&self, endpoint: &Path, generation: u64) -> bool {
        let info = {
            let mut entries = self.lock();
            match entries.get_mut(endpoint) {
                Some(entry) if entry.generation == generation => {
                    entry.info.state = ProxyState::Running;
                    entry.info.clone()
                },
                _ => return false,
            }
        };
        let _ = self.events.send(ClientEvent::Connected(info));
        true
    }

    /// Removes the entry only if it still carries `generation`.
    pub fn remove_generation(&self, endpoint: &Path, generation: u64) -> bool {
        let mut entries = self.lock();
        let current = entries
            .get(endpoint)
            .is_some_and(|entry| entry.generation == generation);
        if current {
            entries.remove(endpoint);
        }
        current
    }

    /// Removes the entry for `endpoint` and cancels its proxy.
    pub fn remove(&self, endpoint: &Path) -> Option<ClientInfo> {
        let removed = self.lock().remove(endpoint)?;
        removed.cancel.cancel();
        Some(removed.info)
    }

    /// Announces that a proxy stopped.
    pub fn notify_disconnected(&self, info: ClientInfo) {
        let _ = self.events.send(ClientEvent::Disconnected(info));
    }

    /// Registered endpoints, sorted by name.
    #[must_use]
    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self.lock().values().map(|e| e.info.clone()).collect();
        clients.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.endpoint_path.cmp(&b.endpoint_path))
        });
        clients
    }

    /// Returns `true` if `endpoint` is registered.
    #[must_use]
    pub fn contains(&self, endpoint: &Path) -> bool {
        self.lock().contains_key(endpoint)
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to [`ClientEvent`]s.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Change reported by the watch thread.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchEvent {
    Appeared(PathBuf),
    Vanished(PathBuf),
    Rescan,
}

/// Runs one proxy per endpoint in a directory.
pub struct DiscoveryManager {
    directory: PathBuf,
    suffix: String,
    factory: Arc<dyn ProxyFactory>,
    registry: Arc<ClientRegistry>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl DiscoveryManager {
    /// Creates a manager whose proxies are children of `parent`.
    #[must_use]
    pub fn new(
        config: &DiscoveryConfig,
        factory: Arc<dyn ProxyFactory>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            directory: config.directory.clone(),
            suffix: config.suffix.clone(),
            factory,
            registry: Arc::new(ClientRegistry::new()),
            tasks: TaskTracker::new(),
            cancel: parent.child_token(),
        }
    }

    /// Registry of running proxies.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Watched directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Client name for an endpoint path, or `None` if the file name does
    /// not end in the endpoint suffix.
    #[must_use]
    pub fn client_name(&self, endpoint: &Path) -> Option<String> {
        endpoint_name(endpoint.file_name()?, &self.suffix)
    }

    /// Starts a proxy for `endpoint` unless one is already registered.
    ///
    /// Returns `false` for non-endpoints and duplicates.
    pub fn start_proxy(&self, endpoint: &Path) -> bool {
        let Some(name) = self.client_name(endpoint) else {
            return false;
        };
        let Some((generation, cancel)) =
            self.registry.try_insert_starting(&name, endpoint, &self.cancel)
        else {
            debug!(endpoint = %endpoint.display(), "proxy already registered");
            return false;
        };

        info!(client = %name, endpoint = %endpoint.display(), "starting proxy");
        let factory = Arc::clone(&self.factory);
        let registry = Arc::clone(&self.registry);
        let endpoint = endpoint.to_path_buf();

        self.tasks.spawn(async move {
            let runner = match factory.connect(&name, &endpoint, cancel).await {
                Ok(runner) => runner,
                Err(e) => {
                    warn!(client = %name, error = %e, "failed to start proxy");
                    registry.remove_generation(&endpoint, generation);
                    return;
                },
            };
            if !registry.mark_running(&endpoint, generation) {
                debug!(client = %name, "endpoint went away while connecting");
                return;
            }

            runner.run().await;

            registry.remove_generation(&endpoint, generation);
            registry.notify_disconnected(ClientInfo {
                name: name.clone(),
                endpoint_path: endpoint,
                state: ProxyState::Running,
            });
            info!(client = %name, "proxy exited");
        });
        true
    }

    /// Stops the proxy for `endpoint`. Returns `false` if none was running.
    pub fn stop_proxy(&self, endpoint: &Path) -> bool {
        match self.registry.remove(endpoint) {
            Some(info) => {
                info!(client = %info.name, "stopping proxy");
                true
            },
            None => false,
        }
    }

    /// Watches the directory and runs proxies until cancelled.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created, watched or read at startup.
    pub async fn run(self: Arc<Self>) -> Result<(), DiscoveryError> {
        ensure_directory(&self.directory)?;

        let (tx, mut rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        spawn_watch_thread(&self.directory, tx)?;
        self.reconcile()?;
        info!(directory = %self.directory.display(), "watching for endpoints");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = rx.recv() => {
                    match event {
                        Some(WatchEvent::Appeared(path)) => {
                            self.start_proxy(&path);
                        },
                        Some(WatchEvent::Vanished(path)) => {
                            self.stop_proxy(&path);
                        },
                        Some(WatchEvent::Rescan) => {
                            warn!("watch queue overflowed, rescanning");
                            if let Err(e) = self.reconcile() {
                                warn!(error = %e, "rescan failed");
                            }
                        },
                        None => {
                            warn!("endpoint watch stopped");
                            break;
                        },
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Brings the registry in line with the directory contents.
    fn reconcile(&self) -> Result<(), DiscoveryError> {
        let present = self.scan()?;
        for endpoint in &present {
            self.start_proxy(endpoint);
        }
        for client in self.registry.clients() {
            if !present.contains(&client.endpoint_path) {
                self.stop_proxy(&client.endpoint_path);
            }
        }
        Ok(())
    }

    fn scan(&self) -> Result<Vec<PathBuf>, DiscoveryError> {
        let read = std::fs::read_dir(&self.directory).map_err(|source| DiscoveryError::Directory {
            directory: self.directory.clone(),
            source,
        })?;
        let mut endpoints: Vec<PathBuf> = read
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| self.client_name(path).is_some())
            .collect();
        endpoints.sort();
        Ok(endpoints)
    }

    /// Cancels every proxy and waits for their tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!("all proxies stopped");
    }
}

fn endpoint_name(file_name: &OsStr, suffix: &str) -> Option<String> {
    let name = file_name.to_str()?.strip_suffix(suffix)?;
    (!name.is_empty()).then(|| name.to_string())
}

fn ensure_directory(directory: &Path) -> Result<(), DiscoveryError> {
    if directory.is_dir() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(directory)
        .map_err(|source| DiscoveryError::Directory {
            directory: directory.to_path_buf(),
            source,
        })
}

/// Starts a blocking thread that reports endpoint changes in `directory`.
///
/// The thread exits once the receiving side is dropped and the next event
/// arrives, when the watched directory goes away, or when reading fails.
fn spawn_watch_thread(
    directory: &Path,
    tx: mpsc::Sender<WatchEvent>,
) -> Result<std::thread::JoinHandle<()>, DiscoveryError> {
    let watch_mask = AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO;
    let watch_error = |source| DiscoveryError::Watch {
        directory: directory.to_path_buf(),
        source,
    };

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC).map_err(watch_error)?;
    inotify.add_watch(directory, watch_mask).map_err(watch_error)?;
    let directory = directory.to_path_buf();

    Ok(std::thread::spawn(move || {
        let inotify = inotify;
        loop {
            let events = match inotify.read_events() {
                Ok(events) => events,
                Err(error) => {
                    warn!(error = %error, "inotify read failed");
                    return;
                },
            };
            for event in events {
                if event.mask.contains(AddWatchFlags::IN_IGNORED) {
                    debug!(directory = %directory.display(), "endpoint directory watch removed");
                    return;
                }
                let watch_event = if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                    WatchEvent::Rescan
                } else if let Some(name) = event.name {
                    let path = directory.join(name);
                    if event
                        .mask
                        .intersects(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO)
                    {
                        WatchEvent::Appeared(path)
                    } else {
                        WatchEvent::Vanished(path)
                    }
                } else {
                    continue;
                };
                if tx.blocking_send(watch_event).is_err() {
                    return;
                }
            }
        }
    }))
}
