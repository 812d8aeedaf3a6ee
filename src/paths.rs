use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Normalize a path-ish string for use as a folder or file name.
///
/// Rejects empty strings, `.`, `..`, and bare `/`. Collapses `./` segments
/// and strips redundant separators without touching the filesystem.
pub fn normalize_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." || trimmed == "/" {
        return Err(Error::InvalidPath(raw.to_string()));
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(c) => {
                let Some(c) = c.to_str() else {
                    return Err(Error::InvalidPath(raw.to_string()));
                };
                parts.push(c);
            }
            Component::CurDir => {}
            // Leading `/` or any `..` in a name we hand to the sandbox is a
            // rejection, not something to resolve.
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::InvalidPath(raw.to_string()));
            }
        }
    }

    if parts.is_empty() {
        return Err(Error::InvalidPath(raw.to_string()));
    }
    Ok(parts.join("/"))
}

/// Lexical containment check: `inner` is strictly within `outer`.
///
/// Returns `false` for equal paths and for any relative traversal that
/// escapes `outer` via `..`. Neither path is required to exist.
pub fn is_within(outer: &Path, inner: &Path) -> bool {
    let outer = lexical_resolve(outer);
    let inner = lexical_resolve(inner);
    if outer == inner {
        return false;
    }
    inner.starts_with(&outer)
}

/// Resolve `.`/`..` components lexically, without touching the filesystem.
fn lexical_resolve(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    resolved
}

/// Join `relative` onto `root` and verify the result stays inside the root.
///
/// Every filesystem-touching helper in the crate goes through this so a
/// crafted `../../` name cannot escape the configured document root.
pub fn resolve_sandboxed(root: &Path, relative: &str) -> Result<PathBuf> {
    let normalized = normalize_path(relative)?;
    let joined = root.join(&normalized);
    if !is_within(root, &joined) {
        return Err(Error::InvalidPath(relative.to_string()));
    }
    Ok(joined)
}
