//! URL-path to filesystem-path translation.
//!
//! Resolution is purely lexical: the request target is cut at `?`/`#`,
//! percent-decoded, split on `/`, and each surviving segment is appended to
//! the serving root. Segments that are empty, `.`, `..`, or that would carry
//! a separator or NUL byte are dropped instead of applied, so the result can
//! never climb above the root and no error ever reveals anything about the
//! filesystem outside it.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;

/// Resolve a raw request target against `root`.
///
/// The returned path is always `root` itself or a descendant of it.
pub fn resolve(root: &Path, target: &str) -> PathBuf {
    let path = strip_query(target);
    let decoded: Vec<u8> = percent_decode_str(path).collect();

    let mut resolved = root.to_path_buf();
    for segment in decoded.split(|b| *b == b'/') {
        if is_safe_segment(segment) {
            resolved.push(OsStr::from_bytes(segment));
        }
    }
    resolved
}

/// Whether the resolved path names the serving root itself.
pub fn is_root(root: &Path, resolved: &Path) -> bool {
    resolved == root
}

/// Path of `resolved` relative to `root`, for display.
pub fn relative_to<'a>(root: &Path, resolved: &'a Path) -> Option<&'a Path> {
    resolved.strip_prefix(root).ok()
}

fn strip_query(target: &str) -> &str {
    let end = target.find(['?', '#']).unwrap_or(target.len());
    &target[..end]
}

fn is_safe_segment(segment: &[u8]) -> bool {
    !segment.is_empty()
        && segment != b"."
        && segment != b".."
        && !segment.iter().any(|b| *b == b'/' || *b == b'\\' || *b == 0)
}
