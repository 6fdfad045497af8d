use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::future::{BoxFuture, FutureExt};
use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::protocol::{
    FileEncoding, FileNode, FileReadResult, FileStats, FileSystemError, NodeType, TreeResult,
};

use super::cache::{file_key, tree_key, ResultCache};
use super::config::FileSystemConfig;
use super::ignore_filter::IgnoreFilter;
use super::mime;
use super::path_utils::{create_parent_dirs_safe, io_error, validate_parent_components, PathResolver, ResolvedPath};
use super::platform;
use super::security::{SecurityOperation, SecurityPolicy};

/// What the result cache holds
#[derive(Debug, Clone)]
pub enum CachedValue {
    Tree(TreeResult),
    File(FileReadResult),
}

#[derive(Debug, Clone, Default)]
pub struct TreeOptions {
    pub max_depth: Option<usize>,
    pub show_hidden: Option<bool>,
    pub respect_gitignore: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub max_length: Option<u64>,
    pub encoding: Option<FileEncoding>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub content: Option<String>,
    pub kind: Option<NodeType>,
    pub encoding: Option<FileEncoding>,
    pub overwrite: bool,
}

#[derive(Debug, Clone, Copy)]
struct TreeFilters {
    max_depth: usize,
    show_hidden: bool,
    respect_gitignore: bool,
}

/// Filesystem operations against one configuration snapshot
pub struct FileOperations {
    config: Arc<FileSystemConfig>,
    resolver: PathResolver,
    policy: SecurityPolicy,
    ignore: IgnoreFilter,
    cache: Arc<ResultCache<CachedValue>>,
}

impl FileOperations {
    pub fn new(
        config: Arc<FileSystemConfig>,
        cache: Arc<ResultCache<CachedValue>>,
    ) -> Result<Self, FileSystemError> {
        config.ensure_valid()?;
        let resolver = PathResolver::new(config.clone())?;
        let root = resolver.workspace_root().to_path_buf();
        let policy = SecurityPolicy::new(config.clone(), root.clone());
        let ignore = IgnoreFilter::new(&root, &config.ignore_patterns);
        Ok(Self {
            config,
            resolver,
            policy,
            ignore,
            cache,
        })
    }

    pub fn config(&self) -> &FileSystemConfig {
        &self.config
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn ignore_filter(&self) -> &IgnoreFilter {
        &self.ignore
    }

    pub fn cache(&self) -> &ResultCache<CachedValue> {
        &self.cache
    }

    pub fn resolve(&self, path: &str) -> Result<ResolvedPath, FileSystemError> {
        let resolved = self.resolver.resolve(path);
        if !resolved.is_valid {
            tracing::debug!("Rejected path '{}': {:?}", path, resolved.error);
        }
        resolved.into_result(path)
    }

    /// Directory tree, filtered before recursion. Unreadable subdirectories
    /// are skipped rather than failing the listing.
    pub async fn tree(&self, path: &str, options: TreeOptions) -> Result<TreeResult, FileSystemError> {
        let resolved = self.resolve(path)?;
        let target = resolved.resolved_path.clone();
        self.policy
            .check_file_operation(SecurityOperation::Read, &target, None)
            .into_result(&target)?;

        let meta = fs::metadata(&target).await.map_err(|e| io_error(&target, e))?;
        if !meta.is_dir() {
            return Err(FileSystemError::NotADirectory {
                path: resolved.normalized_path,
            });
        }

        let filters = TreeFilters {
            max_depth: options
                .max_depth
                .unwrap_or(self.config.default_tree_depth)
                .clamp(1, self.config.max_tree_depth),
            show_hidden: self.config.allow_hidden_files && options.show_hidden.unwrap_or(true),
            respect_gitignore: options
                .respect_gitignore
                .unwrap_or(self.config.respect_gitignore),
        };
        let key = tree_key(
            &target,
            &format!(
                "{}{}{}",
                filters.max_depth,
                if filters.show_hidden { "h" } else { "" },
                if filters.respect_gitignore { "g" } else { "" }
            ),
        );

        if self.config.enable_caching {
            if let Some(CachedValue::Tree(hit)) = self.cache.get(&key) {
                tracing::debug!("Tree cache hit for {}", target.display());
                return Ok(hit);
            }
        }

        let children = self.walk(target.clone(), 1, filters).await;
        let result = TreeResult {
            path: resolved.normalized_path,
            children,
        };

        if self.config.enable_caching {
            self.cache.set(key, CachedValue::Tree(result.clone()));
        }
        Ok(result)
    }

    fn walk(&self, dir: PathBuf, depth: usize, filters: TreeFilters) -> BoxFuture<'_, Vec<FileNode>> {
        async move {
            let mut nodes = Vec::new();
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(e) => {
                    tracing::debug!("Skipping unreadable directory {}: {}", dir.display(), e);
                    return nodes;
                }
            };

            loop {
                let entry = match read_dir.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("Stopped listing {}: {}", dir.display(), e);
                        break;
                    }
                };
                if nodes.len() >= self.config.max_files_per_directory {
                    tracing::debug!(
                        "Listing of {} truncated at {} entries",
                        dir.display(),
                        self.config.max_files_per_directory
                    );
                    break;
                }

                let entry_path = entry.path();
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                let follow = file_type.is_symlink() && self.config.allow_symlinks;
                if follow && !self.symlink_target_allowed(&entry_path) {
                    continue;
                }
                let meta = if follow {
                    fs::metadata(&entry_path).await
                } else {
                    fs::symlink_metadata(&entry_path).await
                };
                let Ok(meta) = meta else {
                    continue;
                };
                let is_dir = meta.is_dir();

                if !filters.show_hidden && platform::is_hidden(&entry_path) {
                    continue;
                }
                if filters.respect_gitignore && self.ignore.is_ignored(&entry_path, is_dir) {
                    continue;
                }
                if self.config.enable_path_validation && !self.policy.lists().is_allowed(&entry_path)
                {
                    continue;
                }

                let children = if is_dir && depth < filters.max_depth {
                    Some(self.walk(entry_path.clone(), depth + 1, filters).await)
                } else {
                    None
                };

                nodes.push(FileNode {
                    name: entry.file_name().to_string_lossy().to_string(),
                    path: self.resolver.to_workspace_relative(&entry_path),
                    node_type: if is_dir { NodeType::Directory } else { NodeType::File },
                    size: if is_dir { None } else { Some(meta.len()) },
                    modified_time: platform::modified_millis(&meta),
                    children,
                });
            }

            nodes
        }
        .boxed()
    }

    fn symlink_target_allowed(&self, link: &Path) -> bool {
        match std::fs::canonicalize(link) {
            Ok(target) => {
                !self.config.require_workspace_containment
                    || target.starts_with(self.resolver.workspace_root())
            }
            Err(_) => false,
        }
    }

    /// Read file contents, truncated at the text size limit
    pub async fn read_file(&self, path: &str, options: ReadOptions) -> Result<FileReadResult, FileSystemError> {
        let resolved = self.resolve(path)?;
        let target = resolved.resolved_path.clone();
        self.policy
            .check_file_operation(SecurityOperation::Read, &target, None)
            .into_result(&target)?;

        let cacheable = self.config.enable_caching
            && options.max_length.is_none()
            && options.encoding.is_none();
        let key = file_key(&target);
        if cacheable {
            if let Some(CachedValue::File(hit)) = self.cache.get(&key) {
                tracing::debug!("File cache hit for {}", target.display());
                return Ok(hit);
            }
        }

        let metadata = fs::metadata(&target).await.map_err(|e| io_error(&target, e))?;
        if !metadata.is_file() {
            return Err(FileSystemError::NotAFile {
                path: resolved.normalized_path,
            });
        }

        let size = metadata.len();
        let limit = options
            .max_length
            .unwrap_or(u64::MAX)
            .min(self.config.max_text_file_size);

        let file = fs::File::open(&target).await.map_err(|e| io_error(&target, e))?;
        let mut buffer = Vec::with_capacity(size.min(limit) as usize);
        file.take(limit)
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| io_error(&target, e))?;

        let mime_type = mime::detect_mime_type(&buffer, &target);
        let (content, encoding) = match options.encoding.unwrap_or_default() {
            FileEncoding::Base64 => (BASE64.encode(&buffer), FileEncoding::Base64),
            FileEncoding::Utf8 => {
                if mime::is_text_mime(&mime_type) || mime::is_probably_text(&buffer) {
                    (decode_text_buffer(&buffer), FileEncoding::Utf8)
                } else {
                    (BASE64.encode(&buffer), FileEncoding::Base64)
                }
            }
        };

        let result = FileReadResult {
            path: resolved.normalized_path,
            content,
            encoding,
            mime_type,
            truncated: size > limit,
            size,
        };

        if cacheable {
            self.cache.set(key, CachedValue::File(result.clone()));
        }
        Ok(result)
    }

    /// Create a file (parents included) or a directory tree
    pub async fn create(&self, path: &str, options: CreateOptions) -> Result<(), FileSystemError> {
        let resolved = self.resolve(path)?;
        let target = resolved.resolved_path;
        let kind = options.kind.unwrap_or(NodeType::File);

        let bytes = match kind {
            NodeType::Directory => None,
            NodeType::File => {
                let content = options.content.unwrap_or_default();
                Some(match options.encoding.unwrap_or_default() {
                    FileEncoding::Utf8 => content.into_bytes(),
                    FileEncoding::Base64 => BASE64.decode(content.as_bytes()).map_err(|e| {
                        FileSystemError::IoError {
                            message: format!("Invalid base64 content: {}", e),
                        }
                    })?,
                })
            }
        };

        self.policy
            .assess_write(SecurityOperation::Create, &target, bytes.as_deref())
            .into_result(&target)?;

        match bytes {
            None => {
                if target.exists() {
                    return Err(FileSystemError::AlreadyExists {
                        path: resolved.normalized_path,
                    });
                }
                validate_parent_components(&target)?;
                fs::create_dir_all(&target)
                    .await
                    .map_err(|e| io_error(&target, e))?;
            }
            Some(bytes) => {
                if let Ok(existing) = fs::metadata(&target).await {
                    if existing.is_dir() {
                        return Err(FileSystemError::NotAFile {
                            path: resolved.normalized_path,
                        });
                    }
                    if !options.overwrite {
                        return Err(FileSystemError::AlreadyExists {
                            path: resolved.normalized_path,
                        });
                    }
                }
                create_parent_dirs_safe(&target).await?;
                fs::write(&target, &bytes)
                    .await
                    .map_err(|e| io_error(&target, e))?;
            }
        }

        self.invalidate(&target);
        tracing::info!("Created {} {}", kind_label(kind), target.display());
        Ok(())
    }

    /// Delete a path. Recursive deletes (the default) tolerate a missing target.
    pub async fn delete(&self, path: &str, recursive: Option<bool>) -> Result<(), FileSystemError> {
        let resolved = self.resolve(path)?;
        let target = resolved.resolved_path;
        self.policy
            .check_file_operation(SecurityOperation::Delete, &target, None)
            .into_result(&target)?;

        if recursive != Some(false) {
            let outcome = match fs::symlink_metadata(&target).await {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target).await,
                Ok(_) => fs::remove_file(&target).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!("Delete of missing {} ignored", target.display());
                }
                Err(e) => return Err(io_error(&target, e)),
            }
        } else {
            fs::remove_file(&target)
                .await
                .map_err(|e| io_error(&target, e))?;
        }

        self.invalidate(&target);
        tracing::info!("Deleted {}", target.display());
        Ok(())
    }

    /// Rename or move within the workspace
    pub async fn rename(&self, source: &str, destination: &str) -> Result<(), FileSystemError> {
        let from = self.resolve(source)?.resolved_path;
        let to_resolved = self.resolve(destination)?;
        let to = to_resolved.resolved_path;
        self.policy
            .check_file_operation(SecurityOperation::Rename, &from, Some(&to))
            .into_result(&from)?;

        fs::symlink_metadata(&from)
            .await
            .map_err(|e| io_error(&from, e))?;
        if fs::symlink_metadata(&to).await.is_ok() {
            return Err(FileSystemError::AlreadyExists {
                path: to_resolved.normalized_path,
            });
        }
        if to.starts_with(&from) {
            return Err(FileSystemError::InvalidPath {
                path: destination.to_string(),
                reason: "Cannot move a directory into itself".to_string(),
            });
        }

        create_parent_dirs_safe(&to).await?;
        fs::rename(&from, &to)
            .await
            .map_err(|e| io_error(&from, e))?;

        self.invalidate(&from);
        self.invalidate(&to);
        tracing::info!("Renamed {} -> {}", from.display(), to.display());
        Ok(())
    }

    /// Metadata only; gated by resolution, not by the security policy
    pub async fn stats(&self, path: &str, include_dir_size: bool) -> Result<FileStats, FileSystemError> {
        let resolved = self.resolve(path)?;
        let target = resolved.resolved_path;

        let link_meta = match fs::symlink_metadata(&target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FileStats {
                    path: resolved.normalized_path,
                    exists: false,
                    is_file: false,
                    is_directory: false,
                    is_symlink: false,
                    size: 0,
                    modified_time: None,
                    permissions: None,
                    mode: None,
                    directory_size: None,
                });
            }
            Err(e) => return Err(io_error(&target, e)),
        };

        let is_symlink = link_meta.file_type().is_symlink();
        let meta = if is_symlink {
            fs::metadata(&target).await.unwrap_or(link_meta)
        } else {
            link_meta
        };

        let directory_size = if include_dir_size && meta.is_dir() {
            let dir = target.clone();
            tokio::task::spawn_blocking(move || directory_size(&dir))
                .await
                .ok()
        } else {
            None
        };

        Ok(FileStats {
            path: resolved.normalized_path,
            exists: true,
            is_file: meta.is_file(),
            is_directory: meta.is_dir(),
            is_symlink,
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified_time: platform::modified_millis(&meta),
            permissions: Some(platform::format_permissions(&meta)),
            mode: platform::permission_mode(&meta),
            directory_size,
        })
    }

    /// Resolve a watch target and make sure it exists and can be read
    pub async fn resolve_watch_target(&self, path: &str) -> Result<ResolvedPath, FileSystemError> {
        let resolved = self.resolve(path)?;
        let target = resolved.resolved_path.clone();
        self.policy
            .check_file_operation(SecurityOperation::Read, &target, None)
            .into_result(&target)?;

        let meta = fs::metadata(&target).await.map_err(|e| io_error(&target, e))?;
        if meta.is_dir() {
            fs::read_dir(&target).await.map_err(|e| io_error(&target, e))?;
        } else {
            fs::File::open(&target).await.map_err(|e| io_error(&target, e))?;
        }
        Ok(resolved)
    }

    /// Drop cached results for `path`, its subtree and its ancestors' trees
    pub fn invalidate(&self, path: &Path) {
        self.cache.invalidate(path);
        self.cache.invalidate_ancestors(path);
    }
}

fn kind_label(kind: NodeType) -> &'static str {
    match kind {
        NodeType::File => "file",
        NodeType::Directory => "directory",
    }
}

/// Best-effort recursive size; unreadable entries are skipped
fn directory_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

fn decode_text_buffer(buffer: &[u8]) -> String {
    if let Some(rest) = buffer.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return decode_utf8_prefix(rest);
    }
    if let Some(rest) = buffer.strip_prefix(&[0xFF, 0xFE]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    if let Some(rest) = buffer.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    decode_utf8_prefix(buffer)
}

/// UTF-8 decode that drops a sequence cut off by truncation
fn decode_utf8_prefix(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(e) if e.error_len().is_none() => {
            String::from_utf8_lossy(&bytes[..e.valid_up_to()]).into_owned()
        }
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}
