//! Portable relative paths.
//!
//! Manifests and archives store paths relative to an install root with `/`
//! separators. Everything read from the wire is validated before it is
//! joined onto a local directory.

use std::path::{Component, Path, PathBuf};

/// Longest relative path accepted from a manifest or archive, in bytes.
pub const MAX_RELATIVE_PATH_LEN: usize = 4096;

/// Check that `rel` is a safe relative path.
///
/// Rejects empty paths, absolute paths, backslashes, drive prefixes, NUL
/// bytes, and `.`/`..`/empty components.
pub fn validate(rel: &str) -> Result<(), String> {
    if rel.is_empty() {
        return Err("empty path".to_string());
    }
    if rel.len() > MAX_RELATIVE_PATH_LEN {
        return Err(format!("path longer than {} bytes", MAX_RELATIVE_PATH_LEN));
    }
    if rel.contains('\\') || rel.contains('\0') {
        return Err(format!("path contains a forbidden character: {:?}", rel));
    }
    if rel.starts_with('/') {
        return Err(format!("path is absolute: {:?}", rel));
    }
    for (index, segment) in rel.split('/').enumerate() {
        match segment {
            "" | "." | ".." => {
                return Err(format!("path has an invalid component: {:?}", rel));
            }
            _ if index == 0 && segment.contains(':') => {
                return Err(format!("path has a drive prefix: {:?}", rel));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Join a validated relative path onto `base`.
pub fn to_native(base: &Path, rel: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    path.extend(rel.split('/'));
    path
}

/// Express `path` relative to `root` with `/` separators.
///
/// Returns `None` if `path` is not under `root` or is not valid UTF-8.
pub fn from_native(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_str()?),
            _ => return None,
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}
