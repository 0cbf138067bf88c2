use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

pub const MAX_PATH_LEN: usize = 512;
const MAX_SEGMENT_LEN: usize = 255;

/// Derive a vault slug from its display name: lowercase, non-[a-z0-9-]
/// replaced with hyphens, runs collapsed, ends trimmed. The slug is frozen
/// at vault creation; renames never touch it.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_hyphen = true;
    for ch in name.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            slug.push(ch);
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Validate a vault-relative document path: UTF-8, forward slashes, no
/// leading slash, no `.`/`..` segments, no NUL or backslash.
pub fn validate_rel_path(path: &str) -> EngineResult<()> {
    if path.is_empty() {
        return Err(EngineError::Validation("path must not be empty".into()));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(EngineError::Validation(format!(
            "path exceeds {MAX_PATH_LEN} bytes"
        )));
    }
    if path.contains('\0') {
        return Err(EngineError::PathTraversal(path.replace('\0', "<NUL>")));
    }
    if path.contains('\\') {
        return Err(EngineError::PathTraversal(path.to_string()));
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(EngineError::Validation(
            "path must be relative with no trailing slash".into(),
        ));
    }
    for segment in path.split('/') {
        if segment.is_empty() {
            return Err(EngineError::Validation(
                "path must not contain empty segments".into(),
            ));
        }
        if segment == "." || segment == ".." {
            return Err(EngineError::PathTraversal(path.to_string()));
        }
        if segment.len() > MAX_SEGMENT_LEN {
            return Err(EngineError::Validation(format!(
                "path segment exceeds {MAX_SEGMENT_LEN} bytes"
            )));
        }
    }
    Ok(())
}

/// Join a validated relative path under a vault root and assert the result
/// stays inside the root. Belt-and-braces on top of `validate_rel_path`:
/// the returned path is the one handed to every filesystem call.
pub fn resolve_under(root: &Path, rel: &str) -> EngineResult<PathBuf> {
    validate_rel_path(rel)?;
    let joined = root.join(rel);
    if joined != root && !joined.starts_with(root) {
        return Err(EngineError::PathTraversal(rel.to_string()));
    }
    Ok(joined)
}

/// Escape LIKE wildcards so a user-supplied prefix matches literally.
/// Callers append their own `%` and pass ESCAPE '\'.
pub fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch == '%' || ch == '_' || ch == '\\' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
