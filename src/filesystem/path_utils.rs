use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::protocol::FileSystemError;

use super::config::FileSystemConfig;
use super::security::AccessLists;

const MAX_SYMLINK_HOPS: usize = 40;

/// Inputs that always mean "the workspace root"
const ROOT_SENTINELS: &[&str] = &["", "/", "\\", ".", "./"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPath {
    pub resolved_path: PathBuf,
    /// Workspace-relative, forward slashes, "/" for the root
    pub normalized_path: String,
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResolvedPath {
    fn invalid(input: &str, reason: &str) -> Self {
        Self {
            resolved_path: PathBuf::from(input),
            normalized_path: input.replace('\\', "/"),
            is_valid: false,
            error: Some(reason.to_string()),
        }
    }

    /// The resolved path, or `InvalidPath` carrying the failure reason
    pub fn into_result(self, input: &str) -> Result<Self, FileSystemError> {
        if self.is_valid {
            return Ok(self);
        }
        Err(FileSystemError::InvalidPath {
            path: input.to_string(),
            reason: self.error.unwrap_or_else(|| "Invalid path".to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    pub allow_absolute: bool,
    pub allow_relative: bool,
    pub follow_symlinks: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            allow_absolute: true,
            allow_relative: true,
            follow_symlinks: true,
        }
    }
}

/// Turns client-supplied path strings into contained, policy-checked paths
pub struct PathResolver {
    config: Arc<FileSystemConfig>,
    /// Root as configured (lexically normalized, absolute)
    root: PathBuf,
    /// Root with symlinks resolved; all containment checks use this
    canonical_root: PathBuf,
    lists: AccessLists,
}

impl PathResolver {
    pub fn new(config: Arc<FileSystemConfig>) -> Result<Self, FileSystemError> {
        let configured = &config.workspace_root;
        let absolute = if configured.is_absolute() {
            configured.clone()
        } else {
            std::env::current_dir()
                .map_err(|e| FileSystemError::IoError {
                    message: e.to_string(),
                })?
                .join(configured)
        };
        let root = normalize(&absolute);
        let canonical_root = root.canonicalize().map_err(|e| FileSystemError::InvalidPath {
            path: root.display().to_string(),
            reason: format!("Workspace root is not accessible: {}", e),
        })?;
        if !canonical_root.is_dir() {
            return Err(FileSystemError::NotADirectory {
                path: canonical_root.display().to_string(),
            });
        }
        let lists = AccessLists::new(&config, &canonical_root);
        Ok(Self {
            config,
            root,
            canonical_root,
            lists,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.canonical_root
    }

    pub fn resolve(&self, input: &str) -> ResolvedPath {
        self.resolve_with(input, ResolveOptions::default())
    }

    pub fn resolve_with(&self, input: &str, options: ResolveOptions) -> ResolvedPath {
        let trimmed = input.trim();
        if ROOT_SENTINELS.contains(&trimmed) {
            return ResolvedPath {
                resolved_path: self.canonical_root.clone(),
                normalized_path: "/".to_string(),
                is_valid: true,
                error: None,
            };
        }

        let candidate = Path::new(trimmed);
        let joined = if candidate.is_absolute() {
            if !options.allow_absolute {
                return ResolvedPath::invalid(input, "Absolute paths not allowed");
            }
            let lexical = normalize(candidate);
            // Rebase paths given against the configured (non-canonical) root
            match lexical.strip_prefix(&self.root) {
                Ok(rest) if self.root != self.canonical_root => self.canonical_root.join(rest),
                _ => lexical,
            }
        } else {
            if !options.allow_relative {
                return ResolvedPath::invalid(input, "Relative paths not allowed");
            }
            let relative = trimmed.replace('\\', "/");
            let relative = relative.trim_start_matches('/');
            self.canonical_root.join(relative)
        };

        let normalized = normalize(&joined);

        let contained = normalized.starts_with(&self.canonical_root);
        if self.config.require_workspace_containment && !contained {
            return ResolvedPath::invalid(input, "Path outside workspace");
        }

        if self.config.enable_path_validation && !self.lists.is_allowed(&normalized) {
            return ResolvedPath::invalid(input, "Path not allowed by security policy");
        }

        let mut resolved = normalized.clone();
        if self.config.allow_symlinks && options.follow_symlinks {
            resolved = match resolve_symlinks(&normalized) {
                Some(target) => target,
                None => return ResolvedPath::invalid(input, "Too many levels of symbolic links"),
            };
            if self.config.require_workspace_containment
                && !resolved.starts_with(&self.canonical_root)
            {
                return ResolvedPath::invalid(input, "Path outside workspace");
            }
            if self.config.enable_path_validation && !self.lists.is_allowed(&resolved) {
                return ResolvedPath::invalid(input, "Path not allowed by security policy");
            }
        } else if !self.config.allow_symlinks
            && contained
            && contains_symlink_below(&self.canonical_root, &normalized)
        {
            return ResolvedPath::invalid(input, "Symlinked paths are not allowed");
        }

        ResolvedPath {
            normalized_path: self.to_workspace_relative(&normalized),
            resolved_path: resolved,
            is_valid: true,
            error: None,
        }
    }

    /// Inverse mapping: "/" for the root, "/a/b" below it, the raw
    /// slash-normalized path for anything outside.
    pub fn to_workspace_relative(&self, absolute: &Path) -> String {
        let relative = absolute
            .strip_prefix(&self.canonical_root)
            .or_else(|_| absolute.strip_prefix(&self.root));
        match relative {
            Ok(rest) if rest.as_os_str().is_empty() => "/".to_string(),
            Ok(rest) => {
                let parts: Vec<String> = rest
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                format!("/{}", parts.join("/"))
            }
            Err(_) => normalize_for_match(absolute),
        }
    }
}

/// Lexical normalization: drops `.`, folds `..` arithmetically and never
/// climbs above the root. Does not touch the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::ParentDir) | None => out.push(".."),
                _ => {}
            },
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

pub fn normalize_for_match(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Follow every symlink along `path`, dangling ones included, and return
/// the lexically normalized target. `None` on a symlink loop.
fn resolve_symlinks(path: &Path) -> Option<PathBuf> {
    let mut pending: Vec<OsString> = path
        .components()
        .rev()
        .map(|c| c.as_os_str().to_os_string())
        .collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop() {
        resolved = normalize(&resolved.join(&part));
        let is_link = std::fs::symlink_metadata(&resolved)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            continue;
        }
        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return None;
        }
        let target = std::fs::read_link(&resolved).ok()?;
        resolved.pop();
        // An absolute target restarts from its root when joined
        pending.extend(
            target
                .components()
                .rev()
                .map(|c| c.as_os_str().to_os_string()),
        );
    }

    Some(resolved)
}

fn contains_symlink_below(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component.as_os_str());
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
    false
}

/// Check if a path component exists and is a file (not a directory)
/// This helps detect when a path like /path/to/file.txt/newdir is invalid
pub fn validate_parent_components(path: &Path) -> Result<(), FileSystemError> {
    let mut current = PathBuf::new();

    for component in path.components() {
        current.push(component);

        if current.is_file() {
            return Err(FileSystemError::NotADirectory {
                path: current.display().to_string(),
            });
        }
    }

    Ok(())
}

/// Safely create parent directories, checking that no path component is a file
pub async fn create_parent_dirs_safe(path: &Path) -> Result<(), FileSystemError> {
    if let Some(parent) = path.parent() {
        validate_parent_components(parent)?;

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(parent, e))?;
    }

    Ok(())
}

/// Map an OS error onto the service taxonomy, keeping the OS message
pub fn io_error(path: &Path, error: std::io::Error) -> FileSystemError {
    match error.kind() {
        std::io::ErrorKind::NotFound => FileSystemError::NotFound {
            path: path.display().to_string(),
        },
        std::io::ErrorKind::PermissionDenied => FileSystemError::PermissionDenied {
            path: path.display().to_string(),
            reason: error.to_string(),
        },
        std::io::ErrorKind::AlreadyExists => FileSystemError::AlreadyExists {
            path: path.display().to_string(),
        },
        _ => {
            // ENOTDIR
            if error.raw_os_error() == Some(20) {
                return FileSystemError::NotADirectory {
                    path: path.display().to_string(),
                };
            }
            FileSystemError::IoError {
                message: error.to_string(),
            }
        }
    }
}
