//! Node path helpers.
//!
//! Paths are absolute, `/`-separated, with no empty components and no
//! trailing separator (except the root itself).

use crate::ValidationError;

pub const ROOT_PATH: &str = "/";

/// Canonical form of a node path.
pub fn normalize_path(path: &str) -> Result<String, ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::InvalidPath {
            path: path.to_string(),
            reason: "must be absolute".to_string(),
        });
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(ROOT_PATH.to_string());
    }
    if trimmed[1..].split('/').any(str::is_empty) {
        return Err(ValidationError::InvalidPath {
            path: path.to_string(),
            reason: "empty path component".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

/// Parent of a normalized path; `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == ROOT_PATH {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT_PATH),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last component of a normalized path (empty for the root).
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent == ROOT_PATH {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Every proper ancestor of a normalized path, root first.
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut chain = Vec::new();
    let mut current = parent_path(path);
    while let Some(p) = current {
        chain.push(p);
        current = parent_path(p);
    }
    chain.reverse();
    chain
}
