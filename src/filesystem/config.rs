use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::protocol::FileSystemError;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Configuration for the workspace filesystem service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileSystemConfig {
    /// Root of the sandbox; every resolved path lives under it
    pub workspace_root: PathBuf,

    /// If non-empty, resolved paths must sit under one of these
    pub allowed_paths: Vec<PathBuf>,

    /// Paths that are never accessible (`~` expands to the home directory)
    pub denied_paths: Vec<PathBuf>,

    /// Denied file patterns (glob, matched against the absolute path)
    pub denied_patterns: Vec<String>,

    /// Extra ignore patterns appended after the built-in defaults
    pub ignore_patterns: Vec<String>,

    pub max_text_file_size: u64,
    pub max_binary_file_size: u64,
    pub max_tree_depth: usize,
    pub default_tree_depth: usize,
    pub max_files_per_directory: usize,

    pub enable_path_validation: bool,
    pub require_workspace_containment: bool,
    pub allow_symlinks: bool,
    pub allow_hidden_files: bool,
    pub enable_file_watching: bool,
    pub enable_caching: bool,
    pub respect_gitignore: bool,

    pub max_watchers_per_client: usize,
    pub watcher_debounce_ms: u64,
    pub cache_ttl_ms: u64,

    pub debug: bool,
    pub log_level: String,
}

impl Default for FileSystemConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            allowed_paths: Vec::new(),
            denied_paths: vec![
                PathBuf::from("~/.ssh"),
                PathBuf::from("~/.gnupg"),
                PathBuf::from("~/.aws"),
                PathBuf::from("~/.kube"),
                PathBuf::from("/etc"),
                PathBuf::from("/proc"),
                PathBuf::from("/sys"),
                PathBuf::from("/dev"),
                PathBuf::from("/boot"),
            ],
            denied_patterns: vec![
                "**/.ssh/*".to_string(),
                "**/*.pem".to_string(),
                "**/*.key".to_string(),
                "**/id_rsa*".to_string(),
                "**/.gnupg/*".to_string(),
                "**/.aws/credentials".to_string(),
                "**/.env".to_string(),
                "**/.env.*".to_string(),
                "**/*.secret".to_string(),
                "**/.npmrc".to_string(),
                "**/.pypirc".to_string(),
            ],
            ignore_patterns: Vec::new(),
            max_text_file_size: 10 * 1024 * 1024,
            max_binary_file_size: 50 * 1024 * 1024,
            max_tree_depth: 10,
            default_tree_depth: 3,
            max_files_per_directory: 1_000,
            enable_path_validation: true,
            require_workspace_containment: true,
            allow_symlinks: false,
            allow_hidden_files: false,
            enable_file_watching: true,
            enable_caching: true,
            respect_gitignore: true,
            max_watchers_per_client: 10,
            watcher_debounce_ms: 100,
            cache_ttl_ms: 5_000,
            debug: false,
            log_level: "info".to_string(),
        }
    }
}

/// Partial configuration: every field optional, applied over a base config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigOverrides {
    pub workspace_root: Option<PathBuf>,
    pub allowed_paths: Option<Vec<PathBuf>>,
    pub denied_paths: Option<Vec<PathBuf>>,
    pub denied_patterns: Option<Vec<String>>,
    pub ignore_patterns: Option<Vec<String>>,
    pub max_text_file_size: Option<u64>,
    pub max_binary_file_size: Option<u64>,
    pub max_tree_depth: Option<usize>,
    pub default_tree_depth: Option<usize>,
    pub max_files_per_directory: Option<usize>,
    pub enable_path_validation: Option<bool>,
    pub require_workspace_containment: Option<bool>,
    pub allow_symlinks: Option<bool>,
    pub allow_hidden_files: Option<bool>,
    pub enable_file_watching: Option<bool>,
    pub enable_caching: Option<bool>,
    pub respect_gitignore: Option<bool>,
    pub max_watchers_per_client: Option<usize>,
    pub watcher_debounce_ms: Option<u64>,
    pub cache_ttl_ms: Option<u64>,
    pub debug: Option<bool>,
    pub log_level: Option<String>,
}

macro_rules! apply {
    ($target:ident, $overrides:ident, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $overrides.$field {
                $target.$field = value;
            }
        )+
    };
}

impl FileSystemConfig {
    /// Defaults with process influences resolved once: the working directory
    /// becomes the workspace root and `WSFS_DEBUG` toggles debug logging.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(cwd) = std::env::current_dir() {
            config.workspace_root = cwd;
        }
        if let Ok(flag) = std::env::var("WSFS_DEBUG") {
            config.debug = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
            if config.debug {
                config.log_level = "debug".to_string();
            }
        }
        config
    }

    /// Load a JSON config file over `base`. A missing or unreadable file is
    /// not fatal: the base config is returned unchanged.
    pub fn load(path: &Path, base: FileSystemConfig) -> FileSystemConfig {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Config file {} not loaded ({}), using defaults", path.display(), e);
                return base;
            }
        };
        match serde_json::from_str::<ConfigOverrides>(&data) {
            Ok(overrides) => base.merge(overrides),
            Err(e) => {
                tracing::warn!("Config file {} is invalid ({}), using defaults", path.display(), e);
                base
            }
        }
    }

    /// Serialize the effective configuration back to JSON
    pub fn save(&self, path: &Path) -> Result<(), FileSystemError> {
        let data = serde_json::to_string_pretty(self).map_err(|e| FileSystemError::IoError {
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| FileSystemError::IoError {
                message: e.to_string(),
            })?;
        }
        std::fs::write(path, data).map_err(|e| FileSystemError::IoError {
            message: e.to_string(),
        })
    }

    /// Apply every field present in `overrides`, keeping the rest
    pub fn merge(mut self, overrides: ConfigOverrides) -> FileSystemConfig {
        apply!(
            self,
            overrides,
            workspace_root,
            allowed_paths,
            denied_paths,
            denied_patterns,
            ignore_patterns,
            max_text_file_size,
            max_binary_file_size,
            max_tree_depth,
            default_tree_depth,
            max_files_per_directory,
            enable_path_validation,
            require_workspace_containment,
            allow_symlinks,
            allow_hidden_files,
            enable_file_watching,
            enable_caching,
            respect_gitignore,
            max_watchers_per_client,
            watcher_debounce_ms,
            cache_ttl_ms,
            debug,
            log_level,
        );
        self
    }

    /// Every violated invariant, empty when the config is usable
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.workspace_root.as_os_str().is_empty() {
            errors.push("Workspace root cannot be empty".to_string());
        }
        if self.max_text_file_size > self.max_binary_file_size {
            errors.push("Max text file size cannot be larger than max binary file size".to_string());
        }
        if self.max_text_file_size == 0 {
            errors.push("Max text file size must be greater than zero".to_string());
        }
        if self.max_tree_depth == 0 {
            errors.push("Max tree depth must be at least 1".to_string());
        }
        if self.default_tree_depth == 0 || self.default_tree_depth > self.max_tree_depth {
            errors.push(format!(
                "Default tree depth must be between 1 and max tree depth ({})",
                self.max_tree_depth
            ));
        }
        if self.max_files_per_directory == 0 {
            errors.push("Max files per directory must be at least 1".to_string());
        }
        if self.max_watchers_per_client == 0 {
            errors.push("Max watchers per client must be at least 1".to_string());
        }
        if self.watcher_debounce_ms == 0 {
            errors.push("Watcher debounce must be greater than zero".to_string());
        }
        if self.enable_caching && self.cache_ttl_ms == 0 {
            errors.push("Cache TTL must be greater than zero when caching is enabled".to_string());
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            errors.push(format!(
                "Unknown log level '{}'; expected one of: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        errors
    }

    pub fn ensure_valid(&self) -> Result<(), FileSystemError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FileSystemError::ValidationError { errors })
        }
    }

    /// Tracing filter directive for this config
    pub fn log_filter(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}

/// Expand `~` and anchor relative entries at the workspace root
pub fn expand_config_path(path: &Path, workspace_root: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest);
        }
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_root.join(path)
    }
}
