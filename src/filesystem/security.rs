use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

use glob_match::glob_match;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::protocol::FileSystemError;

use super::config::{expand_config_path, FileSystemConfig};
use super::path_utils::{normalize, normalize_for_match};
use super::platform;

/// Severity of a policy finding, ordered from harmless to critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RiskLevel::None => "none",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityOperation {
    Read,
    Write,
    Delete,
    Create,
    Rename,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityVerdict {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub risk: RiskLevel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl SecurityVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            risk: RiskLevel::None,
            suggestions: Vec::new(),
        }
    }

    /// A denial; risk is raised to at least `Low`.
    pub fn deny(risk: RiskLevel, reason: impl Into<String>, suggestions: &[&str]) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            risk: risk.max(RiskLevel::Low),
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn into_result(self, path: &Path) -> Result<Self, FileSystemError> {
        if self.allowed {
            return Ok(self);
        }
        Err(FileSystemError::SecurityDenied {
            path: path.display().to_string(),
            reason: self
                .reason
                .unwrap_or_else(|| "Operation not permitted".to_string()),
            risk: self.risk,
            suggestions: self.suggestions,
        })
    }
}

/// Paths outside the sandbox that are never touched, whatever the config says
#[cfg(not(windows))]
const SYSTEM_PATHS: &[&str] = &[
    "/etc/passwd",
    "/etc/shadow",
    "/etc/gshadow",
    "/etc/sudoers",
    "/etc/sudoers.d",
    "/proc",
    "/sys",
    "/dev",
    "/boot",
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/usr/local/bin",
    "/usr/local/sbin",
    "/lib",
    "/lib64",
    "/usr/lib",
    "/var/lib/dpkg",
    "/var/lib/rpm",
    "/System",
    "/private/etc",
];

#[cfg(windows)]
const SYSTEM_PATHS: &[&str] = &[
    "C:\\Windows",
    "C:\\Program Files",
    "C:\\Program Files (x86)",
    "C:\\ProgramData\\Microsoft",
    "C:\\Boot",
];

/// Files that can never be deleted
const PROTECTED_FILES: &[&str] = &[
    "/etc/hosts",
    "/etc/fstab",
    "/etc/resolv.conf",
    "/etc/group",
    "/vmlinuz",
    "/initrd.img",
    "C:\\pagefile.sys",
    "C:\\hiberfil.sys",
    "C:\\Windows\\System32\\config\\SAM",
];

/// Extensions that may not be written by a remote client
const RISKY_WRITE_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "com", "scr", "pif", "msi", "msp", "vbs", "vbe", "wsf", "wsh", "ps1",
    "psm1", "reg", "dll", "sys", "cpl", "hta", "jar", "sh", "bash", "zsh", "csh", "ksh", "fish",
    "command",
];

/// Resolved allow/deny lists shared by path resolution and the policy checks
#[derive(Debug, Clone)]
pub struct AccessLists {
    denied: Vec<PathBuf>,
    allowed: Vec<PathBuf>,
    denied_patterns: Vec<String>,
}

impl AccessLists {
    pub fn new(config: &FileSystemConfig, workspace_root: &Path) -> Self {
        let resolve = |entries: &[PathBuf]| -> Vec<PathBuf> {
            entries
                .iter()
                .map(|entry| {
                    let expanded = expand_config_path(entry, workspace_root);
                    std::fs::canonicalize(&expanded).unwrap_or_else(|_| normalize(&expanded))
                })
                .collect()
        };
        Self {
            denied: resolve(&config.denied_paths),
            allowed: resolve(&config.allowed_paths),
            denied_patterns: config.denied_patterns.clone(),
        }
    }

    /// Path equals or descends from a denied entry, or matches a denied pattern
    pub fn is_denied(&self, path: &Path) -> bool {
        if self.denied.iter().any(|denied| path.starts_with(denied)) {
            return true;
        }
        let normalized = normalize_for_match(path);
        self.denied_patterns
            .iter()
            .any(|pattern| glob_match(pattern, &normalized))
    }

    /// Denylist wins; a non-empty allowlist must then contain the path
    pub fn is_allowed(&self, path: &Path) -> bool {
        if self.is_denied(path) {
            return false;
        }
        self.allowed.is_empty() || self.allowed.iter().any(|allowed| path.starts_with(allowed))
    }
}

/// Risk classification for prospective filesystem operations
pub struct SecurityPolicy {
    config: Arc<FileSystemConfig>,
    lists: AccessLists,
    workspace_root: PathBuf,
}

impl SecurityPolicy {
    pub fn new(config: Arc<FileSystemConfig>, workspace_root: PathBuf) -> Self {
        let lists = AccessLists::new(&config, &workspace_root);
        Self {
            config,
            lists,
            workspace_root,
        }
    }

    pub fn lists(&self) -> &AccessLists {
        &self.lists
    }

    /// Base check, first match wins, most severe first
    pub fn check(&self, path: &Path, operation: SecurityOperation) -> SecurityVerdict {
        if self.lists.is_denied(path) {
            return SecurityVerdict::deny(
                RiskLevel::Critical,
                "Path is in the denied paths list",
                &["Remove the path from deniedPaths if access is really required"],
            );
        }

        if is_system_path(path) {
            return SecurityVerdict::deny(
                RiskLevel::Critical,
                "Access to system paths is not allowed",
                &["Work on files inside the workspace instead"],
            );
        }

        if operation == SecurityOperation::Write && has_risky_extension(path) {
            return SecurityVerdict::deny(
                RiskLevel::High,
                "Writing executable or script files is not allowed",
                &["Use a non-executable file extension"],
            );
        }

        if operation == SecurityOperation::Write {
            if let Ok(meta) = std::fs::metadata(path) {
                if meta.is_file() && meta.len() > self.config.max_binary_file_size {
                    return SecurityVerdict::deny(
                        RiskLevel::Medium,
                        format!(
                            "File size {} exceeds the maximum of {} bytes",
                            meta.len(),
                            self.config.max_binary_file_size
                        ),
                        &["Increase maxBinaryFileSize in configuration"],
                    );
                }
            }
        }

        if !self.config.allow_hidden_files && path != self.workspace_root && platform::is_hidden(path)
        {
            return SecurityVerdict::deny(
                RiskLevel::Low,
                "Hidden files are not accessible",
                &["Enable hidden files in configuration (allowHiddenFiles)"],
            );
        }

        if !self.config.enable_path_validation
            && path.components().any(|c| matches!(c, Component::ParentDir))
        {
            return SecurityVerdict::deny(
                RiskLevel::High,
                "Path contains a parent directory traversal",
                &["Enable path validation in configuration"],
            );
        }

        SecurityVerdict::allow()
    }

    /// Base check plus the refinements specific to each operation
    pub fn check_file_operation(
        &self,
        operation: SecurityOperation,
        path: &Path,
        destination: Option<&Path>,
    ) -> SecurityVerdict {
        let base_operation = match operation {
            SecurityOperation::Read => SecurityOperation::Read,
            _ => SecurityOperation::Write,
        };
        let verdict = self.check(path, base_operation);
        if !verdict.allowed {
            return verdict;
        }

        match operation {
            SecurityOperation::Delete => {
                if path == self.workspace_root {
                    return SecurityVerdict::deny(
                        RiskLevel::Critical,
                        "The workspace root cannot be deleted",
                        &["Delete individual entries inside the workspace instead"],
                    );
                }
                if is_protected_file(path) {
                    return SecurityVerdict::deny(
                        RiskLevel::Critical,
                        "Deleting protected system files is not allowed",
                        &[],
                    );
                }
            }
            SecurityOperation::Create => {
                if let Some(parent) = path.parent() {
                    let parent_verdict = self.check_directory_safety(parent);
                    if !parent_verdict.allowed {
                        return parent_verdict;
                    }
                }
            }
            SecurityOperation::Rename => {
                let Some(destination) = destination else {
                    return SecurityVerdict::deny(
                        RiskLevel::Low,
                        "Rename requires a destination path",
                        &[],
                    );
                };
                if path == self.workspace_root {
                    return SecurityVerdict::deny(
                        RiskLevel::Critical,
                        "The workspace root cannot be renamed",
                        &[],
                    );
                }
                let dest_verdict = self.check(destination, SecurityOperation::Write);
                if !dest_verdict.allowed {
                    return dest_verdict;
                }
                if drive_prefix(path) != drive_prefix(destination) {
                    return SecurityVerdict::deny(
                        RiskLevel::Medium,
                        "Cannot rename across drives",
                        &["Copy the file to the destination drive and delete the original"],
                    );
                }
            }
            SecurityOperation::Read | SecurityOperation::Write => {}
        }

        verdict
    }

    /// Depth and size limits for a directory that will receive new entries.
    /// A missing directory passes; parents are created on demand.
    pub fn check_directory_safety(&self, dir: &Path) -> SecurityVerdict {
        let meta = match std::fs::metadata(dir) {
            Ok(meta) => meta,
            Err(_) => return SecurityVerdict::allow(),
        };
        if !meta.is_dir() {
            return SecurityVerdict::deny(
                RiskLevel::Medium,
                format!("{} is not a directory", dir.display()),
                &[],
            );
        }

        let depth = match dir.strip_prefix(&self.workspace_root) {
            Ok(relative) => segment_count(relative),
            Err(_) => segment_count(dir),
        };
        if depth > self.config.max_tree_depth {
            return SecurityVerdict::deny(
                RiskLevel::Medium,
                format!(
                    "Directory depth {} exceeds the maximum of {}",
                    depth, self.config.max_tree_depth
                ),
                &["Increase maxTreeDepth in configuration"],
            );
        }

        let entries = std::fs::read_dir(dir).map(|rd| rd.count()).unwrap_or(0);
        if entries > self.config.max_files_per_directory {
            return SecurityVerdict::deny(
                RiskLevel::Medium,
                format!(
                    "Directory holds {} entries, more than the maximum of {}",
                    entries, self.config.max_files_per_directory
                ),
                &["Increase maxFilesPerDirectory in configuration"],
            );
        }

        SecurityVerdict::allow()
    }

    /// Single verdict for a write carrying content: operation checks, content
    /// size and the content scan folded into one risk level. Content patterns
    /// are reported, not enforced.
    pub fn assess_write(
        &self,
        operation: SecurityOperation,
        path: &Path,
        content: Option<&[u8]>,
    ) -> SecurityVerdict {
        let mut verdict = self.check_file_operation(operation, path, None);
        let Some(content) = content else {
            return verdict;
        };
        if !verdict.allowed {
            return verdict;
        }

        if content.len() as u64 > self.config.max_binary_file_size {
            return SecurityVerdict::deny(
                RiskLevel::Medium,
                format!(
                    "Content size {} exceeds the maximum of {} bytes",
                    content.len(),
                    self.config.max_binary_file_size
                ),
                &["Increase maxBinaryFileSize in configuration"],
            );
        }

        if let Ok(text) = std::str::from_utf8(content) {
            let scan = validate_file_content(text, self.config.max_text_file_size);
            if scan.risk > RiskLevel::None {
                tracing::warn!(
                    "Content of {} flagged ({} risk): {}",
                    path.display(),
                    scan.risk,
                    scan.issues.join(", ")
                );
                verdict.risk = verdict.risk.max(scan.risk);
                verdict.suggestions.extend(scan.issues);
            }
        }

        verdict
    }
}

fn is_system_path(path: &Path) -> bool {
    SYSTEM_PATHS.iter().any(|system| path.starts_with(system))
}

fn is_protected_file(path: &Path) -> bool {
    PROTECTED_FILES.iter().any(|protected| path == Path::new(protected))
}

fn has_risky_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| RISKY_WRITE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn segment_count(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

fn drive_prefix(path: &Path) -> Option<String> {
    match path.components().next() {
        Some(Component::Prefix(prefix)) => {
            Some(prefix.as_os_str().to_string_lossy().to_ascii_uppercase())
        }
        _ => None,
    }
}

const MAX_FILE_NAME_BYTES: usize = 255;
const PLACEHOLDER_FILE_NAME: &str = "unnamed";

/// Make a single path component safe on common filesystems. Idempotent.
pub fn sanitize_filename(name: &str) -> String {
    let stripped: String = name
        .chars()
        .filter(|ch| !matches!(ch, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|ch| !ch.is_control())
        .collect();

    let truncated = truncate_utf8_to_max_bytes(&stripped, MAX_FILE_NAME_BYTES);
    let mut sanitized = trim_dots_and_spaces(&truncated).to_string();
    if sanitized.is_empty() {
        return PLACEHOLDER_FILE_NAME.to_string();
    }

    let stem = sanitized.split('.').next().unwrap_or("").trim_end_matches(' ');
    if is_windows_reserved_device_name(stem) {
        sanitized.insert(0, '_');
        sanitized = truncate_utf8_to_max_bytes(&sanitized, MAX_FILE_NAME_BYTES)
            .trim_end_matches(['.', ' '])
            .to_string();
    }
    sanitized
}

fn trim_dots_and_spaces(input: &str) -> &str {
    input.trim_matches(|ch| ch == '.' || ch == ' ')
}

fn truncate_utf8_to_max_bytes(input: &str, max_bytes: usize) -> String {
    let mut out = String::new();
    for ch in input.chars() {
        if out.len() + ch.len_utf8() > max_bytes {
            break;
        }
        out.push(ch);
    }
    out
}

fn is_windows_reserved_device_name(name: &str) -> bool {
    let upper = name.trim().to_ascii_uppercase();
    match upper.as_str() {
        "CON" | "PRN" | "AUX" | "NUL" => true,
        _ => {
            let bytes = upper.as_bytes();
            bytes.len() == 4
                && (upper.starts_with("COM") || upper.starts_with("LPT"))
                && (b'1'..=b'9').contains(&bytes[3])
        }
    }
}

/// Outcome of scanning text content for embedded active code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentScan {
    pub valid: bool,
    pub risk: RiskLevel,
    pub issues: Vec<String>,
    pub oversized: bool,
}

struct ContentRule {
    pattern: Regex,
    risk: RiskLevel,
    message: &'static str,
}

fn content_rules() -> &'static [ContentRule] {
    static RULES: OnceLock<Vec<ContentRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"(?i)<script\b", RiskLevel::High, "Embedded script tag"),
            (r"\beval\s*\(", RiskLevel::High, "Dynamic code evaluation (eval)"),
            (r"\bexec\s*\(", RiskLevel::Medium, "Code execution call (exec)"),
            (
                r"\b(?:system|shell_exec|passthru)\s*\(",
                RiskLevel::High,
                "Shell command execution call",
            ),
            (
                r"\b(?:localStorage|sessionStorage)\b",
                RiskLevel::Medium,
                "Browser storage access",
            ),
            (r"\bdocument\.cookie\b", RiskLevel::Medium, "Browser cookie access"),
        ]
        .into_iter()
        .filter_map(|(pattern, risk, message)| {
            Regex::new(pattern).ok().map(|pattern| ContentRule {
                pattern,
                risk,
                message,
            })
        })
        .collect()
    })
}

/// Heuristic scan for scripts, shell calls and browser storage access
pub fn validate_file_content(content: &str, max_size: u64) -> ContentScan {
    let mut risk = RiskLevel::None;
    let mut issues = Vec::new();

    let oversized = content.len() as u64 > max_size;
    if oversized {
        risk = RiskLevel::Medium;
        issues.push(format!(
            "Content size {} exceeds {} bytes",
            content.len(),
            max_size
        ));
    }

    for rule in content_rules() {
        if rule.pattern.is_match(content) {
            risk = risk.max(rule.risk);
            issues.push(rule.message.to_string());
        }
    }

    ContentScan {
        valid: risk < RiskLevel::High,
        risk,
        issues,
        oversized,
    }
}
