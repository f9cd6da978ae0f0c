//! Pure string path algorithms.
//!
//! Nothing here touches the tree: these helpers only turn user-supplied path
//! arguments into normalized absolute paths and take them apart again.

use std::borrow::Cow;

/// Check whether a path is already absolute and canonical: leading `/`, no
/// empty, `.` or `..` segments, and no trailing `/` unless root.
fn is_canonical(path: &str) -> bool {
    if !path.starts_with('/') {
        return false;
    }
    if path == "/" {
        return true;
    }
    if path.ends_with('/') {
        return false;
    }
    path[1..]
        .split('/')
        .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

/// Canonicalize an absolute path string. Returns the input unchanged
/// (zero-alloc) when already canonical.
///
/// `..` at the root stays at the root.
pub fn normalize(path: &str) -> Cow<'_, str> {
    if is_canonical(path) {
        return Cow::Borrowed(path);
    }
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {},
            ".." => {
                parts.pop();
            },
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        Cow::Borrowed("/")
    } else {
        Cow::Owned(format!("/{}", parts.join("/")))
    }
}

/// Resolve a possibly-relative path argument against `base`.
pub fn resolve(path_arg: &str, base: &str) -> String {
    if path_arg.starts_with('/') {
        return normalize(path_arg).into_owned();
    }
    let joined = if base.is_empty() || base == "/" {
        format!("/{path_arg}")
    } else {
        format!("{base}/{path_arg}")
    };
    normalize(&joined).into_owned()
}

/// Parent of a canonical path. The parent of `/` is `/`.
pub fn parent(path: &str) -> &str {
    if path == "/" {
        return "/";
    }
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Final component of a canonical path (`""` for root).
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Append a child name to a canonical directory path.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Segments of a canonical path, root excluded.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Whether `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path != "/";
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Whether a single path component is acceptable as a node name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}
