use std::fs::Metadata;
use std::path::Path;
use std::time::UNIX_EPOCH;

fn has_dot_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n != "." && n != "..")
        .unwrap_or(false)
}

#[cfg(unix)]
pub fn is_hidden(path: &Path) -> bool {
    has_dot_name(path)
}

#[cfg(windows)]
pub fn is_hidden(path: &Path) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    if let Ok(metadata) = std::fs::symlink_metadata(path) {
        if metadata.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0 {
            return true;
        }
    }
    has_dot_name(path)
}

/// `rwxr-xr-x` style permission string
#[cfg(unix)]
pub fn format_permissions(metadata: &Metadata) -> String {
    let mode = permission_mode(metadata).unwrap_or(0);
    [6, 3, 0]
        .iter()
        .map(|shift| format_rwx((mode >> shift) & 0o7))
        .collect()
}

#[cfg(windows)]
pub fn format_permissions(metadata: &Metadata) -> String {
    if metadata.permissions().readonly() {
        "r--".to_string()
    } else {
        "rw-".to_string()
    }
}

#[cfg(unix)]
pub fn permission_mode(metadata: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(windows)]
pub fn permission_mode(_metadata: &Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn format_rwx(bits: u32) -> String {
    format!(
        "{}{}{}",
        if bits & 4 != 0 { "r" } else { "-" },
        if bits & 2 != 0 { "w" } else { "-" },
        if bits & 1 != 0 { "x" } else { "-" },
    )
}

/// Modification time as Unix milliseconds, if the platform reports one
pub fn modified_millis(metadata: &Metadata) -> Option<u64> {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
}
