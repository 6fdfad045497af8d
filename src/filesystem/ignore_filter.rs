use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Always hidden from listings, before any caller or `.gitignore` patterns
const BUILTIN_PATTERNS: &[&str] = &[
    "node_modules/",
    ".git/",
    ".hg/",
    ".svn/",
    ".DS_Store",
    "out/",
    "dist/",
    "build/",
];

/// `.gitignore`-style filtering for directory listings
pub struct IgnoreFilter {
    root: PathBuf,
    matcher: Gitignore,
}

impl IgnoreFilter {
    pub fn new(root: &Path, extra_patterns: &[String]) -> Self {
        let mut builder = GitignoreBuilder::new(root);

        for pattern in BUILTIN_PATTERNS {
            add_pattern(&mut builder, None, pattern);
        }
        for pattern in extra_patterns {
            add_pattern(&mut builder, None, pattern);
        }

        let gitignore_path = root.join(".gitignore");
        match std::fs::read_to_string(&gitignore_path) {
            Ok(contents) => {
                // lines() splits on both \n and \r\n
                for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                    add_pattern(&mut builder, Some(gitignore_path.clone()), line);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("Could not read {}: {}", gitignore_path.display(), e);
            }
        }

        let matcher = builder.build().unwrap_or_else(|e| {
            tracing::warn!("Ignore patterns for {} failed to build: {}", root.display(), e);
            Gitignore::empty()
        });

        Self {
            root: root.to_path_buf(),
            matcher,
        }
    }

    /// Later patterns win; `!` re-includes; the root itself is never ignored
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        if relative.as_os_str().is_empty() {
            return false;
        }
        self.matcher
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }
}

fn add_pattern(builder: &mut GitignoreBuilder, from: Option<PathBuf>, pattern: &str) {
    if let Err(e) = builder.add_line(from, pattern) {
        tracing::warn!("Skipping ignore pattern '{}': {}", pattern, e);
    }
}
