use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::{ChangeKind, FileSystemError, WatchEvent};

/// A debounced change, addressed to the client that registered the watch
#[derive(Debug, Clone)]
pub struct WatchNotification {
    pub client_id: String,
    pub watch_path: PathBuf,
    pub event: WatchEvent,
}

#[derive(Debug, Clone)]
pub(crate) struct RawChange {
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub timestamp: u64,
}

#[derive(Debug)]
pub(crate) enum RawSignal {
    Change(RawChange),
    Failed(String),
}

struct Registration {
    id: u64,
    _watcher: Option<RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        // Cancels any pending debounce timer with the task
        self.task.abort();
    }
}

type Registry = DashMap<String, HashMap<PathBuf, Registration>>;

/// Per-client recursive watches with per-(client, path) debouncing
pub struct FileWatcher {
    registry: Arc<Registry>,
    event_tx: broadcast::Sender<WatchNotification>,
    debounce_ms: AtomicU64,
    max_per_client: AtomicUsize,
    next_id: AtomicU64,
}

impl FileWatcher {
    pub fn new(debounce_ms: u64, max_per_client: usize) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            registry: Arc::new(DashMap::new()),
            event_tx,
            debounce_ms: AtomicU64::new(debounce_ms),
            max_per_client: AtomicUsize::new(max_per_client),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchNotification> {
        self.event_tx.subscribe()
    }

    /// New limits apply to registrations made after the call
    pub fn set_limits(&self, debounce_ms: u64, max_per_client: usize) {
        self.debounce_ms.store(debounce_ms, Ordering::Relaxed);
        self.max_per_client.store(max_per_client, Ordering::Relaxed);
    }

    pub fn max_per_client(&self) -> usize {
        self.max_per_client.load(Ordering::Relaxed)
    }

    /// Start a recursive watch. `Ok(false)` when the client is at its quota.
    pub fn add(&self, client_id: &str, path: &Path) -> Result<bool, FileSystemError> {
        if let Some(existing) = self.registry.get(client_id) {
            if existing.contains_key(path) {
                return Ok(true);
            }
            if existing.len() >= self.max_per_client() {
                return Ok(false);
            }
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let watcher = start_os_watch(path, raw_tx)?;
        Ok(self.register(client_id, path, Some(watcher), raw_rx))
    }

    /// Track a registration fed by `raw_rx` and spawn its debounce task
    pub(crate) fn register(
        &self,
        client_id: &str,
        path: &Path,
        watcher: Option<RecommendedWatcher>,
        raw_rx: mpsc::UnboundedReceiver<RawSignal>,
    ) -> bool {
        let mut client = self.registry.entry(client_id.to_string()).or_default();
        if client.contains_key(path) {
            return true;
        }
        if client.len() >= self.max_per_client() {
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(debounce_loop(
            WatchKey {
                client_id: client_id.to_string(),
                path: path.to_path_buf(),
                id,
            },
            raw_rx,
            Arc::clone(&self.registry),
            self.event_tx.clone(),
            Duration::from_millis(self.debounce_ms.load(Ordering::Relaxed)),
        ));
        client.insert(
            path.to_path_buf(),
            Registration {
                id,
                _watcher: watcher,
                task,
            },
        );
        tracing::info!("Watching {} for client {}", path.display(), client_id);
        true
    }

    pub fn remove(&self, client_id: &str, path: &Path) -> bool {
        let removed = self
            .registry
            .get_mut(client_id)
            .and_then(|mut client| client.remove(path));
        self.registry.remove_if(client_id, |_, paths| paths.is_empty());
        match removed {
            Some(registration) => {
                drop(registration);
                tracing::info!("Stopped watching {} for client {}", path.display(), client_id);
                true
            }
            None => false,
        }
    }

    /// Tear down every watch of a disconnected client
    pub fn remove_all_for_client(&self, client_id: &str) -> usize {
        match self.registry.remove(client_id) {
            Some((_, registrations)) => {
                let count = registrations.len();
                drop(registrations);
                if count > 0 {
                    tracing::info!("Removed {} watch(es) for client {}", count, client_id);
                }
                count
            }
            None => 0,
        }
    }

    pub fn watch_count(&self, client_id: &str) -> usize {
        self.registry
            .get(client_id)
            .map(|client| client.len())
            .unwrap_or(0)
    }

    pub fn is_watching(&self, client_id: &str, path: &Path) -> bool {
        self.registry
            .get(client_id)
            .map(|client| client.contains_key(path))
            .unwrap_or(false)
    }
}

fn start_os_watch(
    path: &Path,
    raw_tx: mpsc::UnboundedSender<RawSignal>,
) -> Result<RecommendedWatcher, FileSystemError> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let Some(kind) = classify_event(&event.kind) else {
                    return;
                };
                let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
                for path in event.paths {
                    let _ = raw_tx.send(RawSignal::Change(RawChange {
                        kind,
                        path,
                        timestamp,
                    }));
                }
            }
            Err(e) => {
                let _ = raw_tx.send(RawSignal::Failed(e.to_string()));
            }
        }
    })
    .map_err(|e| FileSystemError::IoError {
        message: e.to_string(),
    })?;

    watcher
        .watch(path, RecursiveMode::Recursive)
        .map_err(|e| FileSystemError::IoError {
            message: e.to_string(),
        })?;

    Ok(watcher)
}

fn classify_event(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Create),
        EventKind::Remove(_) => Some(ChangeKind::Delete),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Rename),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(ChangeKind::Change),
        EventKind::Access(_) => None,
    }
}

struct WatchKey {
    client_id: String,
    path: PathBuf,
    id: u64,
}

/// Coalesce raw changes: every change resets the timer, only the latest
/// change is emitted once the window passes quietly.
async fn debounce_loop(
    key: WatchKey,
    mut raw_rx: mpsc::UnboundedReceiver<RawSignal>,
    registry: Arc<Registry>,
    event_tx: broadcast::Sender<WatchNotification>,
    debounce: Duration,
) {
    let mut pending: Option<RawChange> = None;
    let timer = tokio::time::sleep(debounce);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            signal = raw_rx.recv() => match signal {
                Some(RawSignal::Change(change)) => {
                    pending = Some(change);
                    timer.as_mut().reset(Instant::now() + debounce);
                }
                Some(RawSignal::Failed(message)) => {
                    tracing::warn!(
                        "Watch on {} failed for client {}: {}",
                        key.path.display(),
                        key.client_id,
                        message
                    );
                    tear_down(&registry, &key);
                    return;
                }
                None => return,
            },
            () = &mut timer, if pending.is_some() => {
                if let Some(change) = pending.take() {
                    emit(&key, change, &registry, &event_tx).await;
                }
            }
        }
    }
}

async fn emit(
    key: &WatchKey,
    change: RawChange,
    registry: &Registry,
    event_tx: &broadcast::Sender<WatchNotification>,
) {
    let meta = tokio::fs::metadata(&change.path).await.ok();
    let event = WatchEvent {
        kind: change.kind,
        path: change.path.display().to_string(),
        timestamp: change.timestamp,
        size: meta.as_ref().map(|m| m.len()),
        is_directory: meta.as_ref().map(|m| m.is_dir()),
    };

    // Holding the shard guard while sending keeps teardown from slipping in
    // between the identity check and delivery.
    let Some(client) = registry.get(&key.client_id) else {
        return;
    };
    if client.get(&key.path).map(|r| r.id) != Some(key.id) {
        return;
    }
    let _ = event_tx.send(WatchNotification {
        client_id: key.client_id.clone(),
        watch_path: key.path.clone(),
        event,
    });
}

fn tear_down(registry: &Registry, key: &WatchKey) {
    let removed = registry.get_mut(&key.client_id).and_then(|mut client| {
        if client.get(&key.path).map(|r| r.id) == Some(key.id) {
            client.remove(&key.path)
        } else {
            None
        }
    });
    registry.remove_if(&key.client_id, |_, paths| paths.is_empty());
    // Dropping aborts this very task; it is already returning.
    drop(removed);
}
