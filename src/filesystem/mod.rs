//! Workspace-scoped filesystem service

pub mod cache;
pub mod config;
pub mod ignore_filter;
pub mod mime;
pub mod operations;
pub mod path_utils;
pub mod platform;
pub mod security;
pub mod watcher;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::protocol::{
    FileReadResult, FileStats, FileSystemError, FsRequest, FsResponse, TreeResult, WatchEvent,
};

use cache::ResultCache;
use config::{ConfigOverrides, FileSystemConfig};
use operations::{CachedValue, CreateOptions, FileOperations, ReadOptions, TreeOptions};
use watcher::{FileWatcher, WatchNotification};

pub struct FileSystemService {
    ops: RwLock<Arc<FileOperations>>,
    watcher: Arc<FileWatcher>,
}

impl FileSystemService {
    pub fn new(config: FileSystemConfig) -> Result<Self, FileSystemError> {
        let ops = build_operations(config)?;
        let watcher = FileWatcher::new(
            ops.config().watcher_debounce_ms,
            ops.config().max_watchers_per_client,
        );
        tracing::info!(
            "Workspace filesystem ready at {}",
            ops.resolver().workspace_root().display()
        );
        Ok(Self {
            ops: RwLock::new(Arc::new(ops)),
            watcher: Arc::new(watcher),
        })
    }

    /// Operations bound to the current configuration
    pub fn ops(&self) -> Arc<FileOperations> {
        let guard = self.ops.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn config(&self) -> FileSystemConfig {
        self.ops().config().clone()
    }

    pub fn watcher(&self) -> &FileWatcher {
        &self.watcher
    }

    /// Apply overrides on top of the current config. The merged config is
    /// validated first; on success path handling is rebuilt, the cache
    /// starts empty and new watcher limits apply to later registrations.
    pub fn update_config(&self, overrides: ConfigOverrides) -> Result<(), FileSystemError> {
        let merged = self.config().merge(overrides);
        let ops = build_operations(merged)?;
        self.watcher.set_limits(
            ops.config().watcher_debounce_ms,
            ops.config().max_watchers_per_client,
        );
        let mut guard = self.ops.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(ops);
        tracing::info!("Configuration updated");
        Ok(())
    }

    pub async fn tree(&self, path: &str, options: TreeOptions) -> Result<TreeResult, FileSystemError> {
        self.ops().tree(path, options).await
    }

    pub async fn open(&self, path: &str, options: ReadOptions) -> Result<FileReadResult, FileSystemError> {
        self.ops().read_file(path, options).await
    }

    pub async fn create(&self, path: &str, options: CreateOptions) -> Result<(), FileSystemError> {
        self.ops().create(path, options).await
    }

    pub async fn delete(&self, path: &str, recursive: Option<bool>) -> Result<(), FileSystemError> {
        self.ops().delete(path, recursive).await
    }

    pub async fn rename(&self, source: &str, destination: &str) -> Result<(), FileSystemError> {
        self.ops().rename(source, destination).await
    }

    pub async fn stats(&self, path: &str, include_dir_size: bool) -> Result<FileStats, FileSystemError> {
        self.ops().stats(path, include_dir_size).await
    }

    /// Start a recursive watch for `client_id`; returns the workspace path watched
    pub async fn watch(&self, client_id: &str, path: &str) -> Result<String, FileSystemError> {
        let ops = self.ops();
        if !ops.config().enable_file_watching {
            return Err(FileSystemError::WatchingDisabled);
        }
        let resolved = ops.resolve_watch_target(path).await?;
        if !self.watcher.add(client_id, &resolved.resolved_path)? {
            tracing::warn!(
                "Client {} hit the watch limit of {}",
                client_id,
                self.watcher.max_per_client()
            );
            return Err(FileSystemError::WatchLimitExceeded {
                limit: self.watcher.max_per_client(),
            });
        }
        Ok(resolved.normalized_path)
    }

    /// Stop a watch; `false` when none was registered
    pub fn unwatch(&self, client_id: &str, path: &str) -> Result<bool, FileSystemError> {
        let resolved = self.ops().resolve(path)?;
        Ok(self.watcher.remove(client_id, &resolved.resolved_path))
    }

    /// Release everything held for a client; returns the number of watches removed
    pub fn disconnect(&self, client_id: &str) -> usize {
        let removed = self.watcher.remove_all_for_client(client_id);
        tracing::debug!("Client {} disconnected", client_id);
        removed
    }

    /// Watch events addressed to `client_id`
    pub fn events(&self, client_id: &str) -> ClientEvents {
        ClientEvents {
            client_id: client_id.to_string(),
            rx: self.watcher.subscribe(),
            ops: self.ops(),
        }
    }

    /// Run one request and wrap the outcome in the response envelope
    pub async fn handle(&self, client_id: &str, request: FsRequest) -> FsResponse {
        let request_id = request.request_id().map(str::to_string);
        let operation = request.operation();
        tracing::debug!("{} request from client {}", operation, client_id);

        let outcome = match request {
            FsRequest::Tree {
                path,
                max_depth,
                show_hidden,
                respect_gitignore,
                ..
            } => {
                let options = TreeOptions {
                    max_depth,
                    show_hidden,
                    respect_gitignore,
                };
                self.tree(path.as_deref().unwrap_or("."), options)
                    .await
                    .and_then(to_value)
            }
            FsRequest::Open {
                path,
                max_length,
                encoding,
                ..
            } => self
                .open(&path, ReadOptions { max_length, encoding })
                .await
                .and_then(to_value),
            FsRequest::Create {
                path,
                content,
                kind,
                encoding,
                overwrite,
                ..
            } => {
                let options = CreateOptions {
                    content,
                    kind,
                    encoding,
                    overwrite,
                };
                self.create(&path, options).await.map(|()| None)
            }
            FsRequest::Delete { path, recursive, .. } => {
                self.delete(&path, recursive).await.map(|()| None)
            }
            FsRequest::Rename {
                path, destination, ..
            } => self.rename(&path, &destination).await.map(|()| None),
            FsRequest::Watch { path, .. } => self
                .watch(client_id, &path)
                .await
                .map(|watched| Some(serde_json::json!({ "path": watched }))),
            FsRequest::Unwatch { path, .. } => self
                .unwatch(client_id, &path)
                .map(|removed| Some(serde_json::json!({ "removed": removed }))),
            FsRequest::Stats {
                path,
                include_dir_size,
                ..
            } => self.stats(&path, include_dir_size).await.and_then(to_value),
        };

        match outcome {
            Ok(result) => FsResponse::success(request_id, result),
            Err(error) => {
                tracing::debug!("{} failed: {}", operation, error);
                FsResponse::failure(request_id, error)
            }
        }
    }
}

fn build_operations(config: FileSystemConfig) -> Result<FileOperations, FileSystemError> {
    let cache = Arc::new(ResultCache::<CachedValue>::new(Duration::from_millis(
        config.cache_ttl_ms,
    )));
    FileOperations::new(Arc::new(config), cache)
}

fn to_value<T: Serialize>(value: T) -> Result<Option<serde_json::Value>, FileSystemError> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| FileSystemError::IoError {
            message: e.to_string(),
        })
}

/// Receiver half of one client's event stream
pub struct ClientEvents {
    client_id: String,
    rx: broadcast::Receiver<WatchNotification>,
    ops: Arc<FileOperations>,
}

impl ClientEvents {
    /// Next event for this client with a workspace-relative path.
    /// `None` once the service is gone.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(notification) if notification.client_id == self.client_id => {
                    let mut event = notification.event;
                    event.path = self
                        .ops
                        .resolver()
                        .to_workspace_relative(Path::new(&event.path));
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Client {} fell behind, {} watch event(s) dropped",
                        self.client_id,
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
