//! Request/response messages for the workspace filesystem service
//!
//! Transport-agnostic: whatever frames requests (WebSocket, stdio, RPC) maps
//! them onto [`FsRequest`] and sends back the [`FsResponse`] envelope.

use serde::{Deserialize, Serialize};

use crate::filesystem::security::RiskLevel;

/// Operations a client may issue against the workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum FsRequest {
    Tree {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        max_depth: Option<usize>,
        #[serde(default)]
        show_hidden: Option<bool>,
        #[serde(default)]
        respect_gitignore: Option<bool>,
    },
    Open {
        #[serde(default)]
        request_id: Option<String>,
        path: String,
        #[serde(default)]
        max_length: Option<u64>,
        #[serde(default)]
        encoding: Option<FileEncoding>,
    },
    Create {
        #[serde(default)]
        request_id: Option<String>,
        path: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default, rename = "type")]
        kind: Option<NodeType>,
        #[serde(default)]
        encoding: Option<FileEncoding>,
        #[serde(default)]
        overwrite: bool,
    },
    Delete {
        #[serde(default)]
        request_id: Option<String>,
        path: String,
        #[serde(default)]
        recursive: Option<bool>,
    },
    Rename {
        #[serde(default)]
        request_id: Option<String>,
        path: String,
        destination: String,
    },
    Watch {
        #[serde(default)]
        request_id: Option<String>,
        path: String,
    },
    Unwatch {
        #[serde(default)]
        request_id: Option<String>,
        path: String,
    },
    Stats {
        #[serde(default)]
        request_id: Option<String>,
        path: String,
        #[serde(default)]
        include_dir_size: bool,
    },
}

impl FsRequest {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            FsRequest::Tree { request_id, .. }
            | FsRequest::Open { request_id, .. }
            | FsRequest::Create { request_id, .. }
            | FsRequest::Delete { request_id, .. }
            | FsRequest::Rename { request_id, .. }
            | FsRequest::Watch { request_id, .. }
            | FsRequest::Unwatch { request_id, .. }
            | FsRequest::Stats { request_id, .. } => request_id.as_deref(),
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            FsRequest::Tree { .. } => "tree",
            FsRequest::Open { .. } => "open",
            FsRequest::Create { .. } => "create",
            FsRequest::Delete { .. } => "delete",
            FsRequest::Rename { .. } => "rename",
            FsRequest::Watch { .. } => "watch",
            FsRequest::Unwatch { .. } => "unwatch",
            FsRequest::Stats { .. } => "stats",
        }
    }
}

/// `{ok: true, result?}` or `{ok: false, error}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl FsResponse {
    pub fn success(request_id: Option<String>, result: Option<serde_json::Value>) -> Self {
        Self {
            request_id,
            ok: true,
            result,
            error: None,
        }
    }

    pub fn failure(request_id: Option<String>, error: FileSystemError) -> Self {
        Self {
            request_id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                message: error.to_string(),
                detail: error,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(flatten)]
    pub detail: FileSystemError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEncoding {
    Utf8,
    Base64,
}

impl Default for FileEncoding {
    fn default() -> Self {
        FileEncoding::Utf8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub path: String, // workspace-relative, forward slashes
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<u64>, // Unix timestamp ms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeResult {
    pub path: String,
    pub children: Vec<FileNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReadResult {
    pub path: String,
    pub content: String,
    pub encoding: FileEncoding,
    pub mime_type: String,
    pub truncated: bool,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    pub path: String,
    pub exists: bool,
    pub is_file: bool,
    pub is_directory: bool,
    pub is_symlink: bool,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Change,
    Delete,
    Rename,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
    pub kind: ChangeKind,
    pub path: String,
    pub timestamp: u64, // Unix timestamp ms of the latest raw change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_directory: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileSystemError {
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("Access to '{path}' denied ({risk} risk): {reason}")]
    SecurityDenied {
        path: String,
        reason: String,
        risk: RiskLevel,
        suggestions: Vec<String>,
    },
    #[error("Not found: {path}")]
    NotFound { path: String },
    #[error("Permission denied for '{path}': {reason}")]
    PermissionDenied { path: String, reason: String },
    #[error("Not a directory: {path}")]
    NotADirectory { path: String },
    #[error("Not a file: {path}")]
    NotAFile { path: String },
    #[error("Already exists: {path}")]
    AlreadyExists { path: String },
    #[error("I/O error: {message}")]
    IoError { message: String },
    #[error("Watch limit of {limit} reached for this client")]
    WatchLimitExceeded { limit: usize },
    #[error("File watching is disabled")]
    WatchingDisabled,
    #[error("Invalid configuration: {}", errors.join("; "))]
    ValidationError { errors: Vec<String> },
}
