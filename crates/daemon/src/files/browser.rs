//! Directory listing pages.
//!
//! This module lists the immediate children of a resolved directory and
//! renders them as a small HTML page. Entries are sorted case-insensitively;
//! a parent link is emitted everywhere except at the serving root.

use std::fmt::Write as _;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;

use super::resolver;

/// Characters left unescaped in listing links, besides ASCII alphanumerics.
const LINK_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Errors that can occur while listing a directory.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The requested path is not a directory.
    #[error("path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The directory could not be read.
    #[error("cannot list directory {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A directory entry with the metadata shown in listings.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Entry name (not full path), lossily decoded for display.
    pub name: String,
    /// Raw entry name bytes, used for links.
    pub raw_name: Vec<u8>,
    /// Whether the entry is (or points to) a directory.
    pub is_dir: bool,
    /// Size in bytes, if the entry could be stat'ed.
    pub size: Option<u64>,
    /// Last modified timestamp, if the entry could be stat'ed.
    pub modified: Option<SystemTime>,
}

impl DirectoryEntry {
    /// Size column text.
    pub fn size_label(&self) -> String {
        if self.is_dir {
            "Directory".to_string()
        } else {
            match self.size {
                Some(size) => format_size(size),
                None => "Unknown size".to_string(),
            }
        }
    }

    /// Modified column text.
    pub fn date_label(&self) -> String {
        match self.modified {
            Some(modified) => format_date(modified),
            None => "Unknown date".to_string(),
        }
    }

    /// Percent-encoded link target, with a trailing slash for directories.
    pub fn href(&self) -> String {
        let mut href = percent_encode(&self.raw_name, LINK_SAFE).to_string();
        if self.is_dir {
            href.push('/');
        }
        href
    }
}

/// Directory lister bound to one serving root.
#[derive(Debug, Clone)]
pub struct DirectoryBrowser {
    /// Serving root; listings never link above it.
    root: PathBuf,
    /// Port shown in the page footer.
    port: u16,
}

impl DirectoryBrowser {
    /// Create a browser for the given serving root and port.
    pub fn new(root: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            root: root.into(),
            port,
        }
    }

    /// Serving root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List the immediate children of `path`, sorted case-insensitively by name.
    pub fn list_directory(&self, path: &Path) -> Result<Vec<DirectoryEntry>, BrowserError> {
        let unreadable = |source| BrowserError::Unreadable {
            path: path.to_path_buf(),
            source,
        };

        let metadata = fs::metadata(path).map_err(unreadable)?;
        if !metadata.is_dir() {
            return Err(BrowserError::NotADirectory(path.to_path_buf()));
        }

        let entries = fs::read_dir(path).map_err(unreadable)?;

        let mut results = Vec::new();
        for entry_result in entries {
            let entry = match entry_result {
                Ok(e) => e,
                Err(_) => continue, // Skip entries we can't read
            };

            let raw_name = entry.file_name().as_bytes().to_vec();
            let name = entry.file_name().to_string_lossy().to_string();

            // Follow symlinks, like the content handler does
            let metadata = fs::metadata(entry.path()).ok();

            results.push(DirectoryEntry {
                name,
                raw_name,
                is_dir: metadata.as_ref().map(|m| m.is_dir()).unwrap_or(false),
                size: metadata.as_ref().map(|m| m.len()),
                modified: metadata.and_then(|m| m.modified().ok()),
            });
        }

        results.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(results)
    }

    /// Render the HTML listing page for `path`.
    pub fn render(&self, path: &Path) -> Result<Vec<u8>, BrowserError> {
        let entries = self.list_directory(path)?;

        let display_path = match resolver::relative_to(&self.root, path) {
            Some(rel) if rel.as_os_str().is_empty() => "Drive Root".to_string(),
            Some(rel) => rel.display().to_string(),
            None => path.display().to_string(),
        };
        let display_path = escape_html(&display_path);
        let base_href = self.base_href(path);

        let mut html = String::with_capacity(2048 + entries.len() * 160);
        html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
        let _ = writeln!(html, "<base href=\"{}\">", base_href);
        let _ = writeln!(html, "<title>Files in {}</title>", display_path);
        html.push_str(STYLE);
        html.push_str("</head>\n<body>\n<div class=\"container\">\n");
        let _ = writeln!(html, "<h2>Files in {}</h2>", display_path);
        html.push_str("<ul class=\"file-list\">\n");

        if !resolver::is_root(&self.root, path) {
            html.push_str(
                "<li class=\"file-item\"><a href=\"..\" class=\"file-link folder\">..</a></li>\n",
            );
        }

        for entry in &entries {
            let mut label = escape_html(&entry.name);
            if entry.is_dir {
                label.push('/');
            }
            let _ = writeln!(
                html,
                "<li class=\"file-item\"><a href=\"{}\" class=\"file-link {}\">{}</a>\
                 <span class=\"file-info\">{} - {}</span></li>",
                entry.href(),
                if entry.is_dir { "folder" } else { "file" },
                label,
                entry.size_label(),
                entry.date_label(),
            );
        }

        html.push_str("</ul>\n");
        let _ = writeln!(
            html,
            "<div class=\"server-info\">Server port: {} - Files served from: {}</div>",
            self.port,
            escape_html(&self.root.display().to_string()),
        );
        html.push_str("</div>\n</body>\n</html>\n");

        Ok(html.into_bytes())
    }

    /// Absolute, percent-encoded URL of `path` with a trailing slash, so
    /// relative entry links work whether or not the request ended in `/`.
    fn base_href(&self, path: &Path) -> String {
        let mut href = String::from("/");
        if let Some(rel) = resolver::relative_to(&self.root, path) {
            for component in rel.iter() {
                href.push_str(&percent_encode(component.as_bytes(), LINK_SAFE).to_string());
                href.push('/');
            }
        }
        href
    }
}

const STYLE: &str = "<style>\
body{font-family:sans-serif;margin:20px;background:#f5f5f5}\
.container{max-width:1000px;margin:0 auto;padding:20px;background:#fff;border-radius:8px}\
.file-list{list-style:none;padding:0}\
.file-item{display:flex;padding:10px 14px;margin:6px 0;background:#f8f9fa;border-radius:6px}\
.file-link{flex-grow:1;color:#0066cc;text-decoration:none}\
.file-info{color:#666;font-size:14px;margin-left:15px;white-space:nowrap}\
.server-info{margin-top:20px;font-size:13px;color:#666}\
</style>\n";

/// Format a byte count as a human-readable size (`1.5 MB`).
pub fn format_size(size: u64) -> String {
    let mut value = size as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1} TB", value)
}

/// Format a timestamp as local `YYYY-MM-DD HH:MM`.
pub fn format_date(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format("%Y-%m-%d %H:%M").to_string()
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}
