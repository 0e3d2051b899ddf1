//! Response status codes and response-head encoding.

use crate::range::ByteRange;

/// Caching directive attached to every response.
pub const CACHE_CONTROL: &str = "public, max-age=31536000";

/// Server identification sent with every response.
pub const SERVER_NAME: &str = concat!("driveshare/", env!("CARGO_PKG_VERSION"));

/// Response status codes produced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    PartialContent,
    BadRequest,
    NotFound,
    InternalServerError,
    NotImplemented,
}

impl StatusCode {
    /// Numeric status code.
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::PartialContent => 206,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
        }
    }

    /// Canonical reason phrase.
    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::PartialContent => "Partial Content",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
        }
    }
}

/// A response status line plus headers.
///
/// `Accept-Ranges`, `Cache-Control` and `Server` are always emitted by
/// [`ResponseHead::encode`]; callers add the resource-specific headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Response status.
    pub status: StatusCode,
    /// Additional header fields in emission order.
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Create a head with the given status and no extra headers.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    /// Head for a full `200` response.
    pub fn full(content_type: &str, length: u64) -> Self {
        Self::new(StatusCode::Ok)
            .header("Content-Type", content_type)
            .content_length(length)
    }

    /// Head for a `206` response covering `range` of a `total`-byte resource.
    pub fn partial(content_type: &str, range: ByteRange, total: u64) -> Self {
        Self::new(StatusCode::PartialContent)
            .header("Content-Type", content_type)
            .content_length(range.len())
            .header("Content-Range", range.content_range(total))
    }

    /// Append a header field.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append a `Content-Length` header.
    pub fn content_length(self, length: u64) -> Self {
        self.header("Content-Length", length.to_string())
    }

    /// Set the `Connection` header according to whether the connection stays open.
    pub fn keep_alive(self, keep_alive: bool) -> Self {
        self.header("Connection", if keep_alive { "keep-alive" } else { "close" })
    }

    /// Look up a header previously added to this head, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Build an error response: the head and its short `text/plain` body.
    pub fn error(status: StatusCode, message: &str) -> (Self, Vec<u8>) {
        let body = format!("{} {}: {}\n", status.as_u16(), status.reason(), message).into_bytes();
        let head = Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .content_length(body.len() as u64);
        (head, body)
    }

    /// Encode the head to wire bytes, including the terminating blank line.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        out.push_str("HTTP/1.1 ");
        out.push_str(&self.status.as_u16().to_string());
        out.push(' ');
        out.push_str(self.status.reason());
        out.push_str("\r\n");

        for (name, value) in &self.headers {
            push_header(&mut out, name, value);
        }
        push_header(&mut out, "Server", SERVER_NAME);
        push_header(&mut out, "Accept-Ranges", "bytes");
        push_header(&mut out, "Cache-Control", CACHE_CONTROL);

        out.push_str("\r\n");
        out.into_bytes()
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    // Strip CR/LF so a value can never terminate the head early
    out.extend(value.chars().filter(|c| *c != '\r' && *c != '\n'));
    out.push_str("\r\n");
}
