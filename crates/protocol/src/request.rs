//! HTTP/1.x request-head parsing.
//!
//! # Head Format
//!
//! A request head is a request line followed by zero or more header lines,
//! terminated by an empty line:
//!
//! ```text
//! GET /photos/a.jpg HTTP/1.1\r\n
//! Host: 192.168.1.20:8000\r\n
//! Range: bytes=0-1023\r\n
//! \r\n
//! ```
//!
//! Bare `\n` line endings are accepted as well. Request bodies are never read;
//! the server only implements safe methods.

use crate::error::{ProtocolError, Result};

/// Maximum size of a request head (16 KB).
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Maximum number of header lines accepted in one request.
pub const MAX_HEADERS: usize = 100;

/// Request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// Fetch a resource.
    Get,
    /// Fetch only the headers of a resource.
    Head,
    /// Any other method token, kept verbatim for diagnostics.
    Other(String),
}

impl Method {
    fn from_token(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            other => Method::Other(other.to_string()),
        }
    }

    /// The method token as sent on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Other(token) => token,
        }
    }
}

/// HTTP protocol version of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// The version token as sent on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// Raw request target (still percent-encoded, query included).
    pub target: String,
    /// Protocol version.
    pub version: Version,
    /// Header fields in arrival order.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Try to parse a request head from the start of `data`.
    ///
    /// Returns `Ok(None)` when the terminating empty line has not arrived yet,
    /// otherwise the head and the number of bytes it occupied.
    pub fn parse(data: &[u8]) -> Result<Option<(Self, usize)>> {
        let end = match find_head_end(data) {
            Some(end) => end,
            None => {
                if data.len() > MAX_HEAD_SIZE {
                    return Err(ProtocolError::HeaderTooLarge {
                        size: data.len(),
                        max: MAX_HEAD_SIZE,
                    });
                }
                return Ok(None);
            }
        };

        if end > MAX_HEAD_SIZE {
            return Err(ProtocolError::HeaderTooLarge {
                size: end,
                max: MAX_HEAD_SIZE,
            });
        }

        let text = std::str::from_utf8(&data[..end])
            .map_err(|_| ProtocolError::MalformedRequest("request head is not UTF-8".to_string()))?;

        let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

        // Tolerate stray empty lines ahead of the request line
        let request_line = lines
            .by_ref()
            .find(|l| !l.is_empty())
            .ok_or_else(|| ProtocolError::MalformedRequest("empty request".to_string()))?;

        let (method, target, version) = parse_request_line(request_line)?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if headers.len() >= MAX_HEADERS {
                return Err(ProtocolError::MalformedRequest(format!(
                    "more than {} header fields",
                    MAX_HEADERS
                )));
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ProtocolError::MalformedRequest(format!("header line without colon: {:?}", line))
            })?;
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(ProtocolError::MalformedRequest(format!(
                    "invalid header name: {:?}",
                    name
                )));
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        Ok(Some((
            Self {
                method,
                target,
                version,
                headers,
            },
            end,
        )))
    }

    /// Look up a header value by name, case-insensitively.
    ///
    /// Returns the first occurrence.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `Range` header value, if present.
    pub fn range(&self) -> Option<&str> {
        self.header("Range")
    }

    /// Whether the client expects the connection to stay open after the response.
    pub fn wants_keep_alive(&self) -> bool {
        let connection = self.header("Connection").map(|v| v.to_ascii_lowercase());
        let has_token = |token: &str| {
            connection
                .as_deref()
                .map(|v| v.split(',').any(|t| t.trim() == token))
                .unwrap_or(false)
        };

        match self.version {
            Version::Http11 => !has_token("close"),
            Version::Http10 => has_token("keep-alive"),
        }
    }
}

/// Find the end of the head: the index just past the blank line.
fn find_head_end(data: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\n' {
            if data.get(i + 1) == Some(&b'\n') {
                return Some(i + 2);
            }
            if data.get(i + 1) == Some(&b'\r') && data.get(i + 2) == Some(&b'\n') {
                return Some(i + 3);
            }
        }
        i += 1;
    }
    None
}

fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let mut parts = line.split_ascii_whitespace();

    let method = parts
        .next()
        .ok_or_else(|| ProtocolError::MalformedRequest("missing method".to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| ProtocolError::MalformedRequest("missing request target".to_string()))?;
    let version = parts
        .next()
        .ok_or_else(|| ProtocolError::MalformedRequest("missing HTTP version".to_string()))?;

    if parts.next().is_some() {
        return Err(ProtocolError::MalformedRequest(format!(
            "unexpected token in request line: {:?}",
            line
        )));
    }

    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        other if other.starts_with("HTTP/") => {
            return Err(ProtocolError::UnsupportedVersion(other.to_string()))
        }
        other => {
            return Err(ProtocolError::MalformedRequest(format!(
                "invalid HTTP version: {:?}",
                other
            )))
        }
    };

    if !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(ProtocolError::MalformedRequest(format!(
            "invalid method: {:?}",
            method
        )));
    }

    Ok((Method::from_token(method), target.to_string(), version))
}
