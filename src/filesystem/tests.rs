use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::protocol::{
    ChangeKind, FileEncoding, FileNode, FileSystemError, FsRequest, NodeType,
};

use super::cache::{file_key, tree_key, ResultCache};
use super::config::{ConfigOverrides, FileSystemConfig};
use super::ignore_filter::IgnoreFilter;
use super::operations::{CreateOptions, ReadOptions, TreeOptions};
use super::path_utils::{normalize, PathResolver};
use super::security::{sanitize_filename, validate_file_content, RiskLevel};
use super::watcher::{FileWatcher, RawChange, RawSignal};
use super::FileSystemService;

fn workspace() -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let root = temp.path().canonicalize().unwrap();
    (temp, root)
}

fn config_for(root: &Path) -> FileSystemConfig {
    FileSystemConfig {
        workspace_root: root.to_path_buf(),
        ..Default::default()
    }
}

fn resolver_for(config: FileSystemConfig) -> PathResolver {
    PathResolver::new(Arc::new(config)).unwrap()
}

fn service_for(root: &Path) -> FileSystemService {
    FileSystemService::new(config_for(root)).unwrap()
}

fn names(nodes: &[FileNode]) -> Vec<&str> {
    let mut names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    names.sort();
    names
}

fn change(path: &Path, kind: ChangeKind, timestamp: u64) -> RawSignal {
    RawSignal::Change(RawChange {
        kind,
        path: path.to_path_buf(),
        timestamp,
    })
}

// Path resolution

#[test]
fn test_root_sentinels_resolve_to_workspace_root() {
    let (_temp, root) = workspace();
    let resolver = resolver_for(config_for(&root));

    for input in ["", "/", "\\", ".", "./"] {
        let resolved = resolver.resolve(input);
        assert!(resolved.is_valid, "sentinel {:?} should be valid", input);
        assert_eq!(resolved.resolved_path, root);
        assert_eq!(resolved.normalized_path, "/");
    }
}

#[test]
fn test_relative_and_rooted_inputs_land_in_workspace() {
    let (_temp, root) = workspace();
    let resolver = resolver_for(config_for(&root));

    let resolved = resolver.resolve("src/main.rs");
    assert!(resolved.is_valid);
    assert_eq!(resolved.resolved_path, root.join("src/main.rs"));
    assert_eq!(resolved.normalized_path, "/src/main.rs");

    let windows_style = resolver.resolve("src\\lib.rs");
    assert_eq!(windows_style.resolved_path, root.join("src/lib.rs"));

    let absolute = resolver.resolve(&root.join("a/./b/../c.txt").to_string_lossy());
    assert!(absolute.is_valid);
    assert_eq!(absolute.resolved_path, root.join("a/c.txt"));
}

#[test]
fn test_traversal_outside_workspace_is_rejected() {
    let (_temp, root) = workspace();
    let resolver = resolver_for(config_for(&root));

    for input in ["../outside.txt", "a/../../outside", "/etc/passwd"] {
        let resolved = resolver.resolve(input);
        assert!(!resolved.is_valid, "{} should be rejected", input);
        assert_eq!(resolved.error.as_deref(), Some("Path outside workspace"));
    }

    // Folding back inside is fine
    assert!(resolver.resolve("a/b/../../c.txt").is_valid);
}

#[test]
fn test_normalize_folds_parent_components() {
    assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
    assert_eq!(normalize(Path::new("../../x")), PathBuf::from("../../x"));
    assert_eq!(normalize(Path::new("/../a")), PathBuf::from("/a"));
}

#[cfg(target_os = "linux")]
#[test]
fn test_denied_system_path_is_invalid_without_containment() {
    let (_temp, root) = workspace();
    let resolver = resolver_for(FileSystemConfig {
        require_workspace_containment: false,
        ..config_for(&root)
    });

    let resolved = resolver.resolve("/etc/passwd");
    assert!(!resolved.is_valid);
    assert_eq!(
        resolved.error.as_deref(),
        Some("Path not allowed by security policy")
    );
}

#[test]
fn test_denied_paths_and_patterns_inside_workspace() {
    let (_temp, root) = workspace();
    let resolver = resolver_for(FileSystemConfig {
        denied_paths: vec![PathBuf::from("private")],
        denied_patterns: vec![format!("{}/*.pem", root.display())],
        ..config_for(&root)
    });

    assert!(!resolver.resolve("private/notes.txt").is_valid);
    assert!(!resolver.resolve("server.pem").is_valid);
    assert!(resolver.resolve("public/notes.txt").is_valid);
}

#[test]
fn test_allowlist_restricts_resolution() {
    let (_temp, root) = workspace();
    let resolver = resolver_for(FileSystemConfig {
        allowed_paths: vec![PathBuf::from("docs")],
        ..config_for(&root)
    });

    assert!(resolver.resolve("docs/guide.md").is_valid);
    assert!(!resolver.resolve("src/main.rs").is_valid);
}

#[cfg(unix)]
#[test]
fn test_symlinks_rejected_when_disabled() {
    let (_temp, root) = workspace();
    let outside = TempDir::new().unwrap();
    std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
    std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

    let resolver = resolver_for(config_for(&root));
    let resolved = resolver.resolve("link/secret.txt");
    assert!(!resolved.is_valid);
    assert_eq!(
        resolved.error.as_deref(),
        Some("Symlinked paths are not allowed")
    );
}

#[cfg(unix)]
#[test]
fn test_followed_symlink_must_stay_in_workspace() {
    let (_temp, root) = workspace();
    let outside = TempDir::new().unwrap();
    std::fs::create_dir(root.join("real")).unwrap();
    std::fs::write(root.join("real/inside.txt"), "inside").unwrap();
    std::os::unix::fs::symlink(outside.path(), root.join("escape")).unwrap();
    std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();

    let resolver = resolver_for(FileSystemConfig {
        allow_symlinks: true,
        ..config_for(&root)
    });

    let escaped = resolver.resolve("escape/anything.txt");
    assert!(!escaped.is_valid);
    assert_eq!(escaped.error.as_deref(), Some("Path outside workspace"));

    let aliased = resolver.resolve("alias/inside.txt");
    assert!(aliased.is_valid);
    assert_eq!(aliased.resolved_path, root.join("real/inside.txt"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_dangling_symlink_cannot_write_outside_workspace() {
    let (_temp, root) = workspace();
    let outside = TempDir::new().unwrap();
    let planted = outside.path().join("planted.txt");
    std::os::unix::fs::symlink(&planted, root.join("dangling")).unwrap();
    std::os::unix::fs::symlink(root.join("later.txt"), root.join("pending")).unwrap();

    let config = FileSystemConfig {
        allow_symlinks: true,
        ..config_for(&root)
    };
    let resolver = resolver_for(config.clone());

    let escaped = resolver.resolve("dangling");
    assert!(!escaped.is_valid);
    assert_eq!(escaped.error.as_deref(), Some("Path outside workspace"));

    // A dangling link that points back inside resolves to its target
    let pending = resolver.resolve("pending");
    assert!(pending.is_valid);
    assert_eq!(pending.resolved_path, root.join("later.txt"));

    let service = FileSystemService::new(config).unwrap();
    let result = service
        .create(
            "dangling",
            CreateOptions {
                content: Some("written".to_string()),
                overwrite: true,
                ..Default::default()
            },
        )
        .await;
    match result.unwrap_err() {
        FileSystemError::InvalidPath { .. } => {}
        e => panic!("Expected InvalidPath, got {:?}", e),
    }
    assert!(!planted.exists());
}

#[cfg(unix)]
#[test]
fn test_symlink_loop_is_rejected() {
    let (_temp, root) = workspace();
    std::os::unix::fs::symlink(root.join("b"), root.join("a")).unwrap();
    std::os::unix::fs::symlink(root.join("a"), root.join("b")).unwrap();

    let resolver = resolver_for(FileSystemConfig {
        allow_symlinks: true,
        ..config_for(&root)
    });

    let looped = resolver.resolve("a/file.txt");
    assert!(!looped.is_valid);
    assert_eq!(
        looped.error.as_deref(),
        Some("Too many levels of symbolic links")
    );
}

// Configuration

#[test]
fn test_config_rejects_text_limit_above_binary_limit() {
    let config = FileSystemConfig {
        max_text_file_size: 100,
        max_binary_file_size: 50,
        ..Default::default()
    };
    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e == "Max text file size cannot be larger than max binary file size"));

    match FileSystemService::new(config) {
        Err(FileSystemError::ValidationError { errors }) => assert!(!errors.is_empty()),
        Err(e) => panic!("Expected ValidationError, got {:?}", e),
        Ok(_) => panic!("Expected ValidationError"),
    }
}

#[test]
fn test_default_config_is_valid() {
    assert!(FileSystemConfig::default().validate().is_empty());
}

#[test]
fn test_config_load_merges_and_tolerates_bad_files() {
    let temp = TempDir::new().unwrap();
    let base = FileSystemConfig::default();

    let good = temp.path().join("good.json");
    std::fs::write(&good, r#"{"maxTreeDepth": 4, "defaultTreeDepth": 2}"#).unwrap();
    let loaded = FileSystemConfig::load(&good, base.clone());
    assert_eq!(loaded.max_tree_depth, 4);
    assert_eq!(loaded.default_tree_depth, 2);
    assert_eq!(loaded.cache_ttl_ms, base.cache_ttl_ms);

    let corrupt = temp.path().join("corrupt.json");
    std::fs::write(&corrupt, "{ not json").unwrap();
    assert_eq!(FileSystemConfig::load(&corrupt, base.clone()), base);

    let missing = temp.path().join("missing.json");
    assert_eq!(FileSystemConfig::load(&missing, base.clone()), base);
}

#[test]
fn test_config_save_writes_camel_case_json() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nested/wsfs.json");
    FileSystemConfig::default().save(&path).unwrap();

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved["maxWatchersPerClient"], 10);
    assert_eq!(saved["allowSymlinks"], false);
}

#[tokio::test]
async fn test_update_config_rejects_invalid_and_applies_valid() {
    let (_temp, root) = workspace();
    let service = service_for(&root);

    let invalid = service.update_config(ConfigOverrides {
        max_text_file_size: Some(u64::MAX),
        ..Default::default()
    });
    assert!(matches!(invalid, Err(FileSystemError::ValidationError { .. })));
    assert_eq!(service.config().max_text_file_size, 10 * 1024 * 1024);

    service
        .update_config(ConfigOverrides {
            allow_hidden_files: Some(true),
            ..Default::default()
        })
        .unwrap();
    assert!(service.config().allow_hidden_files);
}

// Security policy

#[test]
fn test_sanitize_filename_handles_reserved_and_illegal_names() {
    assert_eq!(sanitize_filename("CON"), "_CON");
    assert_eq!(sanitize_filename("lpt1.txt"), "_lpt1.txt");
    assert_eq!(sanitize_filename("a<b>c?.txt"), "abc.txt");
    assert_eq!(sanitize_filename("  ..report.. "), "report");
    assert_eq!(sanitize_filename("..."), "unnamed");
    assert_eq!(sanitize_filename(""), "unnamed");
}

#[test]
fn test_sanitize_filename_is_idempotent() {
    let long = "é".repeat(200);
    let inputs = [
        "CON",
        "com9.log",
        "normal.txt",
        "weird:/\\name|",
        " . nul . ",
        "tab\tname",
        long.as_str(),
        "...",
    ];
    for input in inputs {
        let once = sanitize_filename(input);
        assert_eq!(sanitize_filename(&once), once, "not idempotent for {:?}", input);
        assert!(once.len() <= 255);
    }
}

#[test]
fn test_content_scan_reports_max_risk() {
    let clean = validate_file_content("fn main() {}", 1024);
    assert!(clean.valid);
    assert_eq!(clean.risk, RiskLevel::None);

    let storage = validate_file_content("localStorage.setItem('a', 1)", 1024);
    assert!(storage.valid);
    assert_eq!(storage.risk, RiskLevel::Medium);

    let script = validate_file_content("<script>eval(x)</script>", 1024);
    assert!(!script.valid);
    assert_eq!(script.risk, RiskLevel::High);
    assert_eq!(script.issues.len(), 2);

    let oversized = validate_file_content("plain text", 4);
    assert!(oversized.oversized);
    assert!(oversized.valid);
}

// Cache

#[test]
fn test_cache_entries_expire_after_ttl() {
    let cache = ResultCache::new(Duration::from_millis(100));
    let start = Instant::now();
    cache.set_at("file:/ws/a.txt".to_string(), 1, start);

    assert_eq!(
        cache.get_at("file:/ws/a.txt", start + Duration::from_millis(50)),
        Some(1)
    );
    assert_eq!(
        cache.get_at("file:/ws/a.txt", start + Duration::from_millis(99)),
        Some(1)
    );
    // Absent from exactly one TTL onwards
    assert_eq!(
        cache.get_at("file:/ws/a.txt", start + Duration::from_millis(100)),
        None
    );
    assert!(cache.is_empty());

    cache.set_at("file:/ws/a.txt".to_string(), 2, start);
    assert_eq!(
        cache.get_at("file:/ws/a.txt", start + Duration::from_millis(150)),
        None
    );
}

#[test]
fn test_cache_invalidation_covers_subtree_and_ancestors() {
    let cache = ResultCache::new(Duration::from_secs(60));
    let ws = Path::new("/ws");
    cache.set(tree_key(ws, "3"), "root");
    cache.set(tree_key(&ws.join("sub"), "3"), "sub");
    cache.set(file_key(&ws.join("sub/a.txt")), "a");
    cache.set(file_key(&ws.join("sub/a.txt/child")), "child");
    cache.set(file_key(&ws.join("other.txt")), "other");
    cache.set(tree_key(&ws.join("sibling"), "3"), "sibling");

    let changed = ws.join("sub/a.txt");
    cache.invalidate(&changed);
    cache.invalidate_ancestors(&changed);

    assert_eq!(cache.get(&tree_key(ws, "3")), None);
    assert_eq!(cache.get(&tree_key(&ws.join("sub"), "3")), None);
    assert_eq!(cache.get(&file_key(&changed)), None);
    assert_eq!(cache.get(&file_key(&ws.join("sub/a.txt/child"))), None);
    assert_eq!(cache.get(&file_key(&ws.join("other.txt"))), Some("other"));
    assert_eq!(cache.get(&tree_key(&ws.join("sibling"), "3")), Some("sibling"));
}

// Ignore filter

#[test]
fn test_ignore_filter_later_negation_wins() {
    let (_temp, root) = workspace();
    std::fs::write(root.join(".gitignore"), "*.log\r\n!keep.log\n").unwrap();
    let filter = IgnoreFilter::new(&root, &[]);

    assert!(filter.is_ignored(&root.join("debug.log"), false));
    assert!(!filter.is_ignored(&root.join("keep.log"), false));
    assert!(filter.is_ignored(&root.join("node_modules"), true));
    assert!(filter.is_ignored(&root.join("node_modules/pkg/index.js"), false));
    assert!(!filter.is_ignored(&root.join("src/main.rs"), false));
    assert!(!filter.is_ignored(&root, true));
}

#[test]
fn test_ignore_filter_extra_patterns() {
    let (_temp, root) = workspace();
    let filter = IgnoreFilter::new(&root, &["*.tmp".to_string()]);
    assert!(filter.is_ignored(&root.join("scratch.tmp"), false));
    assert!(!filter.is_ignored(&root.join("scratch.txt"), false));
}

// Tree

#[tokio::test]
async fn test_tree_excludes_hidden_and_ignored_entries() {
    let (_temp, root) = workspace();
    std::fs::write(root.join("a.txt"), "a").unwrap();
    std::fs::write(root.join(".hidden"), "h").unwrap();
    std::fs::write(root.join(".gitignore"), "*.log\n!keep.log\n").unwrap();
    std::fs::write(root.join("debug.log"), "d").unwrap();
    std::fs::write(root.join("keep.log"), "k").unwrap();
    std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
    std::fs::create_dir(root.join("sub")).unwrap();
    std::fs::write(root.join("sub/b.txt"), "bb").unwrap();

    let service = service_for(&root);
    let tree = service.tree(".", TreeOptions::default()).await.unwrap();

    assert_eq!(tree.path, "/");
    assert_eq!(names(&tree.children), vec!["a.txt", "keep.log", "sub"]);

    let sub = tree.children.iter().find(|n| n.name == "sub").unwrap();
    assert_eq!(sub.node_type, NodeType::Directory);
    assert_eq!(sub.path, "/sub");
    let sub_children = sub.children.as_ref().unwrap();
    assert_eq!(names(sub_children), vec!["b.txt"]);
    assert_eq!(sub_children[0].size, Some(2));
}

#[tokio::test]
async fn test_tree_respects_depth_and_gitignore_flag() {
    let (_temp, root) = workspace();
    std::fs::create_dir_all(root.join("one/two")).unwrap();
    std::fs::write(root.join("one/two/three.txt"), "3").unwrap();
    std::fs::create_dir(root.join("build")).unwrap();

    let service = service_for(&root);

    let shallow = service
        .tree(
            ".",
            TreeOptions {
                max_depth: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let one = shallow.children.iter().find(|n| n.name == "one").unwrap();
    assert!(one.children.is_none());
    assert!(!shallow.children.iter().any(|n| n.name == "build"));

    let unfiltered = service
        .tree(
            ".",
            TreeOptions {
                respect_gitignore: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(unfiltered.children.iter().any(|n| n.name == "build"));
}

#[tokio::test]
async fn test_tree_truncates_large_directories() {
    let (_temp, root) = workspace();
    for i in 0..5 {
        std::fs::write(root.join(format!("f{}.txt", i)), "x").unwrap();
    }
    let service = FileSystemService::new(FileSystemConfig {
        max_files_per_directory: 3,
        ..config_for(&root)
    })
    .unwrap();

    let tree = service.tree("/", TreeOptions::default()).await.unwrap();
    assert_eq!(tree.children.len(), 3);
}

#[tokio::test]
async fn test_tree_on_file_is_not_a_directory() {
    let (_temp, root) = workspace();
    std::fs::write(root.join("plain.txt"), "x").unwrap();
    let service = service_for(&root);

    match service.tree("plain.txt", TreeOptions::default()).await.unwrap_err() {
        FileSystemError::NotADirectory { .. } => {}
        e => panic!("Expected NotADirectory, got {:?}", e),
    }
}

// Open

#[tokio::test]
async fn test_open_truncates_at_requested_length() {
    let (_temp, root) = workspace();
    std::fs::write(root.join("hello.txt"), "hello world").unwrap();
    let service = service_for(&root);

    let result = service
        .open(
            "hello.txt",
            ReadOptions {
                max_length: Some(5),
                encoding: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.content, "hello");
    assert!(result.truncated);
    assert_eq!(result.size, 11);
    assert_eq!(result.encoding, FileEncoding::Utf8);
    assert_eq!(result.mime_type, "text/plain");

    let full = service.open("hello.txt", ReadOptions::default()).await.unwrap();
    assert_eq!(full.content, "hello world");
    assert!(!full.truncated);
}

#[tokio::test]
async fn test_open_never_splits_utf8_sequences() {
    let (_temp, root) = workspace();
    std::fs::write(root.join("accent.txt"), "héllo").unwrap();
    let service = service_for(&root);

    let result = service
        .open(
            "accent.txt",
            ReadOptions {
                max_length: Some(2),
                encoding: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.content, "h");
    assert!(result.truncated);
}

#[tokio::test]
async fn test_open_decodes_bom_and_base64_for_binary() {
    let (_temp, root) = workspace();
    let mut utf16 = vec![0xFF, 0xFE];
    for unit in "hi".encode_utf16() {
        utf16.extend_from_slice(&unit.to_le_bytes());
    }
    std::fs::write(root.join("wide.txt"), &utf16).unwrap();
    let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];
    std::fs::write(root.join("image.png"), png).unwrap();

    let service = service_for(&root);

    let wide = service.open("wide.txt", ReadOptions::default()).await.unwrap();
    assert_eq!(wide.content, "hi");

    let image = service.open("image.png", ReadOptions::default()).await.unwrap();
    assert_eq!(image.encoding, FileEncoding::Base64);
    assert_eq!(image.mime_type, "image/png");
}

#[tokio::test]
async fn test_open_rejects_directories_and_hidden_files() {
    let (_temp, root) = workspace();
    std::fs::create_dir(root.join("dir")).unwrap();
    std::fs::write(root.join(".secret"), "x").unwrap();
    let service = service_for(&root);

    match service.open("dir", ReadOptions::default()).await.unwrap_err() {
        FileSystemError::NotAFile { .. } => {}
        e => panic!("Expected NotAFile, got {:?}", e),
    }
    match service.open(".secret", ReadOptions::default()).await.unwrap_err() {
        FileSystemError::SecurityDenied { risk, suggestions, .. } => {
            assert_eq!(risk, RiskLevel::Low);
            assert!(!suggestions.is_empty());
        }
        e => panic!("Expected SecurityDenied, got {:?}", e),
    }
    match service.open("missing.txt", ReadOptions::default()).await.unwrap_err() {
        FileSystemError::NotFound { .. } => {}
        e => panic!("Expected NotFound, got {:?}", e),
    }
}

#[tokio::test]
async fn test_open_outside_workspace_is_invalid_path() {
    let (_temp, root) = workspace();
    let service = service_for(&root);

    match service
        .open("../../etc/passwd", ReadOptions::default())
        .await
        .unwrap_err()
    {
        FileSystemError::InvalidPath { reason, .. } => {
            assert_eq!(reason, "Path outside workspace")
        }
        e => panic!("Expected InvalidPath, got {:?}", e),
    }
}

// Create / delete / rename

#[tokio::test]
async fn test_create_file_builds_parents_and_respects_overwrite() {
    let (_temp, root) = workspace();
    let service = service_for(&root);

    let options = CreateOptions {
        content: Some("first".to_string()),
        ..Default::default()
    };
    service.create("nested/deep/file.txt", options.clone()).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(root.join("nested/deep/file.txt")).unwrap(),
        "first"
    );

    match service.create("nested/deep/file.txt", options).await.unwrap_err() {
        FileSystemError::AlreadyExists { .. } => {}
        e => panic!("Expected AlreadyExists, got {:?}", e),
    }

    service
        .create(
            "nested/deep/file.txt",
            CreateOptions {
                content: Some("second".to_string()),
                overwrite: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(root.join("nested/deep/file.txt")).unwrap(),
        "second"
    );
}

#[tokio::test]
async fn test_create_directory_and_base64_file() {
    let (_temp, root) = workspace();
    let service = service_for(&root);

    service
        .create(
            "a/b/c",
            CreateOptions {
                kind: Some(NodeType::Directory),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(root.join("a/b/c").is_dir());

    service
        .create(
            "blob.bin",
            CreateOptions {
                content: Some("AAEC".to_string()),
                encoding: Some(FileEncoding::Base64),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read(root.join("blob.bin")).unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_create_fails_when_parent_is_file() {
    let (_temp, root) = workspace();
    std::fs::write(root.join("existing.txt"), "x").unwrap();
    let service = service_for(&root);

    let result = service
        .create(
            "existing.txt/child.txt",
            CreateOptions {
                content: Some("y".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(result.is_err());
    assert!(root.join("existing.txt").is_file());
}

#[tokio::test]
async fn test_create_applies_write_assessment() {
    let (_temp, root) = workspace();
    let service = FileSystemService::new(FileSystemConfig {
        max_text_file_size: 8,
        max_binary_file_size: 16,
        ..config_for(&root)
    })
    .unwrap();

    match service
        .create("tool.exe", CreateOptions::default())
        .await
        .unwrap_err()
    {
        FileSystemError::SecurityDenied { risk, .. } => assert_eq!(risk, RiskLevel::High),
        e => panic!("Expected SecurityDenied, got {:?}", e),
    }

    for script in ["deploy.sh", "setup.bash", "init.zsh", "launch.command"] {
        match service
            .create(script, CreateOptions::default())
            .await
            .unwrap_err()
        {
            FileSystemError::SecurityDenied { risk, .. } => assert_eq!(risk, RiskLevel::High),
            e => panic!("Expected SecurityDenied for {}, got {:?}", script, e),
        }
    }

    match service
        .create(
            "big.txt",
            CreateOptions {
                content: Some("x".repeat(32)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err()
    {
        FileSystemError::SecurityDenied { risk, .. } => assert_eq!(risk, RiskLevel::Medium),
        e => panic!("Expected SecurityDenied, got {:?}", e),
    }

    // Content findings are advisory
    service
        .create(
            "page.html",
            CreateOptions {
                content: Some("<script>".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(root.join("page.html").exists());
}

#[tokio::test]
async fn test_delete_recursive_tolerates_missing_and_strict_does_not() {
    let (_temp, root) = workspace();
    std::fs::create_dir_all(root.join("dir/inner")).unwrap();
    std::fs::write(root.join("dir/inner/file.txt"), "x").unwrap();
    let service = service_for(&root);

    service.delete("dir", None).await.unwrap();
    assert!(!root.join("dir").exists());
    service.delete("dir", None).await.unwrap();

    match service.delete("gone.txt", Some(false)).await.unwrap_err() {
        FileSystemError::NotFound { .. } => {}
        e => panic!("Expected NotFound, got {:?}", e),
    }

    std::fs::write(root.join("single.txt"), "x").unwrap();
    service.delete("single.txt", Some(false)).await.unwrap();
    assert!(!root.join("single.txt").exists());
}

#[tokio::test]
async fn test_delete_workspace_root_is_denied() {
    let (_temp, root) = workspace();
    let service = service_for(&root);

    match service.delete(".", None).await.unwrap_err() {
        FileSystemError::SecurityDenied { risk, .. } => assert_eq!(risk, RiskLevel::Critical),
        e => panic!("Expected SecurityDenied, got {:?}", e),
    }
    assert!(root.exists());
}

#[tokio::test]
async fn test_mutations_invalidate_cached_results() {
    let (_temp, root) = workspace();
    std::fs::create_dir(root.join("sub")).unwrap();
    std::fs::write(root.join("sub/a.txt"), "old").unwrap();
    let service = service_for(&root);

    let before = service.tree(".", TreeOptions::default()).await.unwrap();
    let sub = before.children.iter().find(|n| n.name == "sub").unwrap();
    assert_eq!(names(sub.children.as_ref().unwrap()), vec!["a.txt"]);
    let read = service.open("sub/a.txt", ReadOptions::default()).await.unwrap();
    assert_eq!(read.content, "old");

    service.rename("sub/a.txt", "moved/b.txt").await.unwrap();

    let after = service.tree(".", TreeOptions::default()).await.unwrap();
    assert_eq!(names(&after.children), vec!["moved", "sub"]);
    let sub = after.children.iter().find(|n| n.name == "sub").unwrap();
    assert!(sub.children.as_ref().unwrap().is_empty());
    match service.open("sub/a.txt", ReadOptions::default()).await.unwrap_err() {
        FileSystemError::NotFound { .. } => {}
        e => panic!("Expected NotFound, got {:?}", e),
    }

    service
        .create(
            "moved/b.txt",
            CreateOptions {
                content: Some("new".to_string()),
                overwrite: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let reread = service.open("moved/b.txt", ReadOptions::default()).await.unwrap();
    assert_eq!(reread.content, "new");
}

#[tokio::test]
async fn test_rename_refuses_existing_destination_and_root() {
    let (_temp, root) = workspace();
    std::fs::write(root.join("a.txt"), "a").unwrap();
    std::fs::write(root.join("b.txt"), "b").unwrap();
    let service = service_for(&root);

    match service.rename("a.txt", "b.txt").await.unwrap_err() {
        FileSystemError::AlreadyExists { .. } => {}
        e => panic!("Expected AlreadyExists, got {:?}", e),
    }
    match service.rename(".", "elsewhere").await.unwrap_err() {
        FileSystemError::SecurityDenied { .. } => {}
        e => panic!("Expected SecurityDenied, got {:?}", e),
    }
    match service.rename("a.txt", "../escaped.txt").await.unwrap_err() {
        FileSystemError::InvalidPath { .. } => {}
        e => panic!("Expected InvalidPath, got {:?}", e),
    }
    assert_eq!(std::fs::read_to_string(root.join("b.txt")).unwrap(), "b");
}

// Stats

#[tokio::test]
async fn test_stats_reports_metadata_and_missing_paths() {
    let (_temp, root) = workspace();
    std::fs::create_dir(root.join("dir")).unwrap();
    std::fs::write(root.join("dir/one.txt"), "12345").unwrap();
    std::fs::write(root.join("dir/two.txt"), "123").unwrap();
    let service = service_for(&root);

    let missing = service.stats("nope.txt", false).await.unwrap();
    assert!(!missing.exists);
    assert_eq!(missing.path, "/nope.txt");

    let file = service.stats("dir/one.txt", false).await.unwrap();
    assert!(file.exists);
    assert!(file.is_file);
    assert_eq!(file.size, 5);
    assert!(file.modified_time.is_some());
    assert!(file.permissions.is_some());

    let dir = service.stats("dir", true).await.unwrap();
    assert!(dir.is_directory);
    assert_eq!(dir.directory_size, Some(8));
}

// Watching

#[tokio::test]
async fn test_debounce_emits_only_latest_change() {
    let (_temp, root) = workspace();
    let file = root.join("watched.txt");
    std::fs::write(&file, "abc").unwrap();

    let watcher = FileWatcher::new(50, 10);
    let mut rx = watcher.subscribe();
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    assert!(watcher.register("client", &root, None, raw_rx));

    raw_tx.send(change(&file, ChangeKind::Create, 1)).unwrap();
    raw_tx.send(change(&file, ChangeKind::Change, 2)).unwrap();
    raw_tx.send(change(&file, ChangeKind::Change, 3)).unwrap();

    let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.client_id, "client");
    assert_eq!(notification.event.kind, ChangeKind::Change);
    assert_eq!(notification.event.timestamp, 3);
    assert_eq!(notification.event.size, Some(3));
    assert_eq!(notification.event.is_directory, Some(false));

    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "only one event per debounce window");
}

#[tokio::test]
async fn test_event_for_deleted_path_has_no_stat() {
    let (_temp, root) = workspace();
    let watcher = FileWatcher::new(20, 10);
    let mut rx = watcher.subscribe();
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    watcher.register("client", &root, None, raw_rx);

    raw_tx
        .send(change(&root.join("vanished.txt"), ChangeKind::Delete, 7))
        .unwrap();

    let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.event.kind, ChangeKind::Delete);
    assert_eq!(notification.event.size, None);
    assert_eq!(notification.event.is_directory, None);
}

#[tokio::test]
async fn test_no_events_after_disconnect() {
    let (_temp, root) = workspace();
    let watcher = FileWatcher::new(50, 10);
    let mut rx = watcher.subscribe();
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    watcher.register("client", &root, None, raw_rx);

    let _ = raw_tx.send(change(&root, ChangeKind::Change, 1));
    assert_eq!(watcher.remove_all_for_client("client"), 1);
    assert_eq!(watcher.watch_count("client"), 0);

    let received = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(received.is_err(), "torn-down watch must not emit");
}

#[tokio::test]
async fn test_watch_error_tears_down_registration() {
    let (_temp, root) = workspace();
    let watcher = FileWatcher::new(50, 10);
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    watcher.register("client", &root, None, raw_rx);
    assert!(watcher.is_watching("client", &root));

    raw_tx
        .send(RawSignal::Failed("watch handle lost".to_string()))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!watcher.is_watching("client", &root));
}

#[tokio::test]
async fn test_watcher_quota_is_per_client() {
    let (_temp, root) = workspace();
    let watcher = FileWatcher::new(50, 1);
    let (_tx_a, rx_a) = mpsc::unbounded_channel();
    let (_tx_b, rx_b) = mpsc::unbounded_channel();
    let (_tx_c, rx_c) = mpsc::unbounded_channel();

    assert!(watcher.register("one", &root.join("a"), None, rx_a));
    assert!(!watcher.register("one", &root.join("b"), None, rx_b));
    assert!(watcher.register("two", &root.join("b"), None, rx_c));
}

#[tokio::test]
async fn test_service_watch_limits_and_unwatch() {
    let (_temp, root) = workspace();
    std::fs::create_dir(root.join("a")).unwrap();
    std::fs::create_dir(root.join("b")).unwrap();
    let service = FileSystemService::new(FileSystemConfig {
        max_watchers_per_client: 1,
        ..config_for(&root)
    })
    .unwrap();

    assert_eq!(service.watch("client", "a").await.unwrap(), "/a");
    match service.watch("client", "b").await.unwrap_err() {
        FileSystemError::WatchLimitExceeded { limit } => assert_eq!(limit, 1),
        e => panic!("Expected WatchLimitExceeded, got {:?}", e),
    }
    match service.watch("other", "missing").await.unwrap_err() {
        FileSystemError::NotFound { .. } => {}
        e => panic!("Expected NotFound, got {:?}", e),
    }

    assert!(service.unwatch("client", "a").unwrap());
    assert!(!service.unwatch("client", "a").unwrap());
    assert_eq!(service.watch("client", "b").await.unwrap(), "/b");
    assert_eq!(service.disconnect("client"), 1);
}

#[tokio::test]
async fn test_watch_disabled_by_config() {
    let (_temp, root) = workspace();
    let service = FileSystemService::new(FileSystemConfig {
        enable_file_watching: false,
        ..config_for(&root)
    })
    .unwrap();

    assert!(matches!(
        service.watch("client", ".").await,
        Err(FileSystemError::WatchingDisabled)
    ));
}

#[tokio::test]
async fn test_real_file_change_reaches_watching_client() {
    let (_temp, root) = workspace();
    let service = service_for(&root);
    let mut events = service.events("client");

    assert_eq!(service.watch("client", ".").await.unwrap(), "/");
    tokio::fs::write(root.join("new.txt"), "x").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no watch event within 5s")
        .unwrap();
    assert_eq!(event.path, "/new.txt");
    assert!(matches!(event.kind, ChangeKind::Create | ChangeKind::Change));
    assert_eq!(event.is_directory, Some(false));

    assert_eq!(service.disconnect("client"), 1);
}

#[tokio::test]
async fn test_client_events_are_filtered_and_workspace_relative() {
    let (_temp, root) = workspace();
    std::fs::write(root.join("mine.txt"), "m").unwrap();
    let service = service_for(&root);
    let mut events = service.events("me");

    let (other_tx, other_rx) = mpsc::unbounded_channel();
    let (my_tx, my_rx) = mpsc::unbounded_channel();
    service.watcher().register("someone-else", &root, None, other_rx);
    service.watcher().register("me", &root, None, my_rx);

    other_tx
        .send(change(&root.join("theirs.txt"), ChangeKind::Create, 1))
        .unwrap();
    my_tx
        .send(change(&root.join("mine.txt"), ChangeKind::Change, 2))
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.path, "/mine.txt");
    assert_eq!(event.kind, ChangeKind::Change);
}

// Dispatch

#[tokio::test]
async fn test_handle_wraps_results_and_errors() {
    let (_temp, root) = workspace();
    std::fs::write(root.join("note.txt"), "hi").unwrap();
    let service = service_for(&root);

    let request: FsRequest =
        serde_json::from_str(r#"{"op":"open","requestId":"r1","path":"note.txt"}"#).unwrap();
    let response = service.handle("client", request).await;
    assert!(response.ok);
    assert_eq!(response.request_id.as_deref(), Some("r1"));
    assert_eq!(response.result.as_ref().unwrap()["content"], "hi");

    let request: FsRequest =
        serde_json::from_str(r#"{"op":"stats","requestId":"r2","path":"../../etc"}"#).unwrap();
    let response = service.handle("client", request).await;
    assert!(!response.ok);
    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["requestId"], "r2");
    assert_eq!(json["error"]["kind"], "invalid_path");
    assert_eq!(json["error"]["reason"], "Path outside workspace");
    assert!(json["error"]["message"].as_str().unwrap().contains("Invalid path"));

    let request: FsRequest = serde_json::from_str(r#"{"op":"tree"}"#).unwrap();
    let response = service.handle("client", request).await;
    assert!(response.ok);
    assert_eq!(response.result.unwrap()["path"], "/");

    let request: FsRequest =
        serde_json::from_str(r#"{"op":"create","path":"x.txt","content":"1"}"#).unwrap();
    let response = service.handle("client", request).await;
    assert!(response.ok);
    assert!(response.result.is_none());

    let request: FsRequest =
        serde_json::from_str(r#"{"op":"create","path":"made","type":"directory"}"#).unwrap();
    let response = service.handle("client", request).await;
    assert!(response.ok);
    assert!(root.join("made").is_dir());
}

#[tokio::test]
async fn test_handle_reports_security_suggestions() {
    let (_temp, root) = workspace();
    let service = service_for(&root);

    let request: FsRequest =
        serde_json::from_str(r#"{"op":"create","path":"run.bat","content":"echo"}"#).unwrap();
    let json = serde_json::to_value(service.handle("client", request).await).unwrap();
    assert_eq!(json["ok"], false);
    assert_eq!(json["error"]["kind"], "security_denied");
    assert_eq!(json["error"]["risk"], "high");
    assert!(!json["error"]["suggestions"].as_array().unwrap().is_empty());
}
