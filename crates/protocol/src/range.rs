//! `Range` header parsing and byte-range math.
//!
//! Only the single-range `bytes=<start>-<end>` form is understood. Either bound
//! may be omitted: a missing start means offset 0 and a missing end means the
//! last byte of the file. Anything the parser does not understand yields
//! `None`, and the caller serves the full resource instead of failing.

/// An inclusive, zero-indexed byte range within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
}

impl ByteRange {
    /// Create a range; `start` must not exceed `end`.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Number of bytes covered by the range.
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A parsed range always covers at least one byte.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The `Content-Range` value for a resource of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Parse a `Range` header value against a resource of `file_size` bytes.
///
/// An end offset past the last byte is clamped to it. Returns `None` for
/// malformed values, other units, multiple ranges, and ranges that cannot be
/// satisfied (empty file, or a start beyond the clamped end).
pub fn parse_range(value: &str, file_size: u64) -> Option<ByteRange> {
    let (unit, spec) = value.trim().split_once('=')?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return None;
    }

    let spec = spec.trim();
    if spec.contains(',') {
        return None;
    }

    let (start, end) = spec.split_once('-')?;
    if end.contains('-') {
        return None;
    }

    let last = file_size.checked_sub(1)?;

    let start = parse_bound(start)?.unwrap_or(0);
    let end = parse_bound(end)?.unwrap_or(last).min(last);

    if start > end {
        return None;
    }

    Some(ByteRange::new(start, end))
}

/// `Some(None)` for an omitted bound, `None` for garbage.
fn parse_bound(raw: &str) -> Option<Option<u64>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(None);
    }
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_bounds() {
        let range = parse_range("bytes=1000000-1999999", 5_000_000).unwrap();
        assert_eq!(range, ByteRange::new(1_000_000, 1_999_999));
        assert_eq!(range.len(), 1_000_000);
        assert_eq!(range.content_range(5_000_000), "bytes 1000000-1999999/5000000");
    }

    #[test]
    fn test_open_end() {
        let range = parse_range("bytes=100-", 1000).unwrap();
        assert_eq!(range, ByteRange::new(100, 999));
    }

    #[test]
    fn test_missing_start_defaults_to_zero() {
        let range = parse_range("bytes=-499", 1000).unwrap();
        assert_eq!(range, ByteRange::new(0, 499));
    }

    #[test]
    fn test_both_missing_is_whole_file() {
        let range = parse_range("bytes=-", 10).unwrap();
        assert_eq!(range, ByteRange::new(0, 9));
    }

    #[test]
    fn test_single_byte() {
        let range = parse_range("bytes=0-0", 10).unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range.content_range(10), "bytes 0-0/10");
    }

    #[test]
    fn test_end_clamped_to_file() {
        let range = parse_range("bytes=5-5000", 10).unwrap();
        assert_eq!(range, ByteRange::new(5, 9));
    }

    #[test]
    fn test_whitespace_and_case() {
        let range = parse_range("  Bytes = 2 - 4 ", 10).unwrap();
        assert_eq!(range, ByteRange::new(2, 4));
    }

    #[test]
    fn test_malformed_values() {
        for value in [
            "",
            "bytes",
            "bytes=",
            "bytes=abc-def",
            "bytes=1-2-3",
            "bytes=0-1,4-5",
            "items=0-5",
            "bytes=+1-5",
            "bytes=-1-",
            "bytes=0x10-0x20",
        ] {
            assert_eq!(parse_range(value, 100), None, "{value:?}");
        }
    }

    #[test]
    fn test_unsatisfiable_ranges() {
        assert_eq!(parse_range("bytes=10-5", 100), None);
        assert_eq!(parse_range("bytes=100-", 100), None);
        assert_eq!(parse_range("bytes=0-0", 0), None);
    }

    #[test]
    fn test_overflowing_bound() {
        assert_eq!(parse_range("bytes=99999999999999999999999-", 100), None);
    }
}
