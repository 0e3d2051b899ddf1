//! # DriveShare Protocol Library
//!
//! This crate provides the HTTP/1.x wire layer for the DriveShare file server.
//! It performs no I/O: the daemon feeds it bytes read from sockets and writes
//! the bytes it produces.
//!
//! ## Overview
//!
//! - **Request Heads**: Incremental parsing of request lines and header fields
//! - **Byte Ranges**: `Range: bytes=a-b` parsing and `Content-Range` math
//! - **Response Heads**: Status codes and head encoding with the headers every
//!   response carries (`Accept-Ranges`, `Cache-Control`)
//! - **Content Types**: Extension-based MIME guessing
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{parse_range, RequestHead, ResponseHead};
//!
//! let raw = b"GET /movie.mp4 HTTP/1.1\r\nRange: bytes=100-199\r\n\r\n";
//! let (head, _consumed) = RequestHead::parse(raw).unwrap().unwrap();
//!
//! let range = parse_range(head.range().unwrap(), 5_000).unwrap();
//! let response = ResponseHead::partial("video/mp4", range, 5_000);
//! assert_eq!(response.get("Content-Range"), Some("bytes 100-199/5000"));
//! ```
//!
//! ## Modules
//!
//! - [`request`]: Request-head parsing
//! - [`range`]: Byte-range parsing
//! - [`response`]: Status codes and response heads
//! - [`mime`]: Content-type guessing
//! - [`error`]: Error types

pub mod error;
pub mod mime;
pub mod range;
pub mod request;
pub mod response;

pub use error::{is_disconnect, ProtocolError, Result};
pub use mime::{guess_content_type, DEFAULT_CONTENT_TYPE};
pub use range::{parse_range, ByteRange};
pub use request::{Method, RequestHead, Version, MAX_HEADERS, MAX_HEAD_SIZE};
pub use response::{ResponseHead, StatusCode, CACHE_CONTROL, SERVER_NAME};
