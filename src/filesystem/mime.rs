//! Content type detection for `open` results

use std::path::Path;

const OCTET_STREAM: &str = "application/octet-stream";

/// Extension → MIME type for source and config files `infer` cannot sniff
const EXTENSION_TYPES: &[(&str, &str)] = &[
    ("rs", "text/x-rust"),
    ("py", "text/x-python"),
    ("js", "application/javascript"),
    ("mjs", "application/javascript"),
    ("ts", "text/typescript"),
    ("tsx", "text/typescript-jsx"),
    ("jsx", "text/javascript-jsx"),
    ("go", "text/x-go"),
    ("java", "text/x-java"),
    ("c", "text/x-c"),
    ("h", "text/x-c"),
    ("cpp", "text/x-c++"),
    ("hpp", "text/x-c++"),
    ("rb", "text/x-ruby"),
    ("php", "text/x-php"),
    ("swift", "text/x-swift"),
    ("kt", "text/x-kotlin"),
    ("sh", "text/x-shellscript"),
    ("bash", "text/x-shellscript"),
    ("zsh", "text/x-shellscript"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("scss", "text/x-scss"),
    ("xml", "application/xml"),
    ("json", "application/json"),
    ("yaml", "text/x-yaml"),
    ("yml", "text/x-yaml"),
    ("toml", "text/x-toml"),
    ("md", "text/markdown"),
    ("txt", "text/plain"),
    ("log", "text/x-log"),
    ("csv", "text/csv"),
    ("ini", "text/x-ini"),
    ("cfg", "text/x-ini"),
    ("svg", "image/svg+xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
];

/// Well-known extensionless names
const NAME_TYPES: &[(&str, &str)] = &[
    ("dockerfile", "text/x-dockerfile"),
    ("makefile", "text/x-makefile"),
    ("license", "text/plain"),
    ("readme", "text/plain"),
    (".gitignore", "text/plain"),
    (".editorconfig", "text/plain"),
];

/// Sniff magic bytes first, then fall back to the file name
pub fn detect_mime_type(buffer: &[u8], path: &Path) -> String {
    if let Some(kind) = infer::get(buffer) {
        return kind.mime_type().to_string();
    }
    let guessed = guess_mime_from_name(path);
    if guessed == OCTET_STREAM && is_probably_text(buffer) {
        return "text/plain".to_string();
    }
    guessed.to_string()
}

pub fn guess_mime_from_name(path: &Path) -> &'static str {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if let Some((_, mime)) = NAME_TYPES.iter().find(|(known, _)| *known == name) {
        return mime;
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    EXTENSION_TYPES
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
        .unwrap_or(OCTET_STREAM)
}

/// Heuristic: valid UTF-8 (or UTF-16 with BOM), no NULs, few control bytes.
/// A multi-byte sequence cut off at the end of the buffer still counts.
pub fn is_probably_text(buffer: &[u8]) -> bool {
    if buffer.is_empty() {
        return true;
    }
    if buffer.starts_with(&[0xFF, 0xFE]) || buffer.starts_with(&[0xFE, 0xFF]) {
        return true;
    }
    if buffer.contains(&0) {
        return false;
    }
    let valid = match std::str::from_utf8(buffer) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    };
    if !valid {
        return false;
    }
    let controls = buffer
        .iter()
        .filter(|&&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r'))
        .count();
    controls * 10 <= buffer.len()
}

pub fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/")
        || matches!(
            mime,
            "application/json" | "application/javascript" | "application/xml"
        )
        || mime.ends_with("+xml")
        || mime.ends_with("+json")
}
