//! Content delivery: full, ranged and HEAD responses for resolved paths.
//!
//! Files up to [`SMALL_FILE_THRESHOLD`] are copied through a buffered loop in
//! [`BUFFER_CHUNK`] pieces. Larger files are written straight out of
//! read-only memory maps, [`MMAP_CHUNK`] bytes at a time, and fall back to the
//! buffered loop from the current offset if a mapping cannot be created.
//! Range responses always use the buffered loop after seeking to the start.

use std::ffi::c_void;
use std::io::{self, SeekFrom};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use protocol::{
    guess_content_type, is_disconnect, parse_range, ByteRange, ResponseHead, StatusCode,
};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::browser::DirectoryBrowser;

/// Files at or below this size always use the buffered copy (1 MiB).
pub const SMALL_FILE_THRESHOLD: u64 = 1024 * 1024;

/// Read size of the buffered copy loop (256 KiB).
pub const BUFFER_CHUNK: usize = 256 * 1024;

/// Size of each memory-mapped window (4 MiB, a multiple of the page size).
pub const MMAP_CHUNK: usize = 4 * 1024 * 1024;

/// Errors that can occur while delivering a response.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The file could not be opened; nothing has been sent yet.
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading the file failed after the response head was sent.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    /// Writing to the client failed for a reason other than a disconnect.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// The client went away mid-response.
    #[error("client disconnected")]
    Disconnected,

    /// A memory-mapped window could not be created.
    #[error("memory map at offset {offset} failed: {source}")]
    Map {
        offset: u64,
        #[source]
        source: Errno,
    },
}

/// How a file body is copied to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStrategy {
    /// Read into a reusable buffer, write, repeat.
    Buffered,
    /// Write directly from memory-mapped windows of the file.
    Mapped,
}

impl TransferStrategy {
    /// Pick the strategy for a full-file response of `size` bytes.
    pub fn for_size(size: u64) -> Self {
        if size > SMALL_FILE_THRESHOLD {
            TransferStrategy::Mapped
        } else {
            TransferStrategy::Buffered
        }
    }
}

/// Per-request input to the delivery engine.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Raw request target as received.
    pub target: String,
    /// Filesystem path the target resolved to.
    pub resolved: PathBuf,
    /// Raw `Range` header value, if any.
    pub range_header: Option<String>,
    /// Send headers only (HEAD).
    pub head_only: bool,
    /// Value announced in the `Connection` header.
    pub keep_alive: bool,
}

/// What was sent for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Status of the response head that was written (or attempted).
    pub status: StatusCode,
    /// Range that was served, for `206` responses.
    pub range: Option<ByteRange>,
    /// Body bytes written.
    pub body_bytes: u64,
    /// Whether the full response reached the client; if not, the
    /// connection must not be reused.
    pub complete: bool,
}

impl Delivery {
    fn finished(status: StatusCode, range: Option<ByteRange>, body_bytes: u64, expected: u64) -> Self {
        Self {
            status,
            range,
            body_bytes,
            complete: body_bytes == expected,
        }
    }

    fn aborted(status: StatusCode, range: Option<ByteRange>) -> Self {
        Self {
            status,
            range,
            body_bytes: 0,
            complete: false,
        }
    }
}

/// Opens a file for delivery.
pub(crate) type OpenFn = fn(&Path) -> io::Result<std::fs::File>;

/// Maps `len` bytes of a file starting at `offset`.
type MapFn = fn(&std::fs::File, u64, usize) -> nix::Result<MappedWindow>;

/// How the engine reaches file contents.
#[derive(Clone, Copy)]
struct FileAccess {
    open: OpenFn,
    map: MapFn,
}

impl std::fmt::Debug for FileAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAccess").finish_non_exhaustive()
    }
}

impl Default for FileAccess {
    fn default() -> Self {
        Self {
            open: open_file,
            map: MappedWindow::map,
        }
    }
}

fn open_file(path: &Path) -> io::Result<std::fs::File> {
    std::fs::File::open(path)
}

/// Answers requests for paths under one serving root.
#[derive(Debug, Clone)]
pub struct ContentDelivery {
    browser: DirectoryBrowser,
    access: FileAccess,
}

impl ContentDelivery {
    /// Create an engine that renders directories with `browser`.
    pub fn new(browser: DirectoryBrowser) -> Self {
        Self {
            browser,
            access: FileAccess::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_opener(mut self, open: OpenFn) -> Self {
        self.access.open = open;
        self
    }

    #[cfg(test)]
    fn with_mapper(mut self, map: MapFn) -> Self {
        self.access.map = map;
        self
    }

    /// Serving root.
    pub fn root(&self) -> &Path {
        self.browser.root()
    }

    /// Write the complete response for `ctx` to `out`.
    ///
    /// Never fails: errors before the head is written become `404`/`500`
    /// responses, and errors after it are reported through
    /// [`Delivery::complete`].
    pub async fn respond<W>(&self, ctx: &RequestContext, out: &mut W) -> Delivery
    where
        W: AsyncWrite + Unpin,
    {
        let metadata = match tokio::fs::metadata(&ctx.resolved).await {
            Ok(m) => m,
            Err(_) => {
                return send_error(out, StatusCode::NotFound, "File not found", ctx).await;
            }
        };

        if metadata.is_dir() {
            return self.send_listing(ctx, out).await;
        }
        if !metadata.is_file() {
            return send_error(out, StatusCode::NotFound, "File not found", ctx).await;
        }

        let size = metadata.len();
        let content_type = guess_content_type(&ctx.resolved);
        let range = ctx
            .range_header
            .as_deref()
            .and_then(|value| parse_range(value, size));

        let head = match range {
            Some(range) => ResponseHead::partial(content_type, range, size),
            None => ResponseHead::full(content_type, size),
        }
        .keep_alive(ctx.keep_alive);
        let status = head.status;

        match send_file(self.access, &ctx.resolved, head, range, size, ctx.head_only, out).await {
            Ok(delivery) => delivery,
            Err(DeliveryError::Open { path, source }) => {
                warn!(path = %path.display(), error = %source, "failed to open file");
                let status = if source.kind() == io::ErrorKind::NotFound {
                    StatusCode::NotFound
                } else {
                    StatusCode::InternalServerError
                };
                send_error(out, status, "Error serving file", ctx).await
            }
            Err(DeliveryError::Disconnected) => {
                debug!(request = %ctx.target, "client disconnected mid-transfer");
                Delivery::aborted(status, range)
            }
            Err(e) => {
                warn!(request = %ctx.target, error = %e, "transfer aborted");
                Delivery::aborted(status, range)
            }
        }
    }

    async fn send_listing<W>(&self, ctx: &RequestContext, out: &mut W) -> Delivery
    where
        W: AsyncWrite + Unpin,
    {
        let body = match self.browser.render(&ctx.resolved) {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "directory listing failed");
                return send_error(out, StatusCode::NotFound, "No permission to list directory", ctx)
                    .await;
            }
        };

        let head = ResponseHead::full("text/html; charset=utf-8", body.len() as u64)
            .keep_alive(ctx.keep_alive);
        let body: &[u8] = if ctx.head_only { &[] } else { &body };
        send_buffered(out, head, body).await
    }
}

async fn send_file<W>(
    access: FileAccess,
    path: &Path,
    head: ResponseHead,
    range: Option<ByteRange>,
    size: u64,
    head_only: bool,
    out: &mut W,
) -> Result<Delivery, DeliveryError>
where
    W: AsyncWrite + Unpin,
{
    let open = access.open;
    let owned = path.to_path_buf();
    let std_file = tokio::task::spawn_blocking(move || open(&owned))
        .await
        .map_err(io::Error::other)
        .and_then(|opened| opened)
        .map_err(|source| DeliveryError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    let mut file = File::from_std(std_file);
    let status = head.status;

    write_chunk(out, &head.encode()).await?;
    if head_only {
        flush(out).await?;
        return Ok(Delivery::finished(status, range, 0, 0));
    }

    let (written, expected) = match range {
        Some(range) => {
            file.seek(SeekFrom::Start(range.start))
                .await
                .map_err(DeliveryError::Read)?;
            (copy_buffered(&mut file, out, range.len()).await?, range.len())
        }
        None => (copy_full_with(file, out, size, access.map).await?, size),
    };
    flush(out).await?;

    if written < expected {
        debug!(path = %path.display(), written, expected, "file shorter than announced");
    }
    Ok(Delivery::finished(status, range, written, expected))
}

/// Copy a whole file of `size` bytes using the strategy its size calls for.
pub async fn copy_full<W>(file: File, out: &mut W, size: u64) -> Result<u64, DeliveryError>
where
    W: AsyncWrite + Unpin,
{
    copy_full_with(file, out, size, MappedWindow::map).await
}

async fn copy_full_with<W>(file: File, out: &mut W, size: u64, map: MapFn) -> Result<u64, DeliveryError>
where
    W: AsyncWrite + Unpin,
{
    match TransferStrategy::for_size(size) {
        TransferStrategy::Buffered => {
            let mut file = file;
            copy_buffered(&mut file, out, size).await
        }
        TransferStrategy::Mapped => {
            let std_file = file.into_std().await;
            match copy_mapped_with(&std_file, out, size, map).await {
                Err(DeliveryError::Map { offset, source }) => {
                    debug!(offset, error = %source, "memory map failed, using buffered copy");
                    let mut file = File::from_std(std_file);
                    file.seek(SeekFrom::Start(offset))
                        .await
                        .map_err(DeliveryError::Read)?;
                    let rest = copy_buffered(&mut file, out, size - offset).await?;
                    Ok(offset + rest)
                }
                other => other,
            }
        }
    }
}

/// Copy up to `limit` bytes from `reader` in [`BUFFER_CHUNK`] pieces.
///
/// Stops early, without error, when the reader is exhausted.
pub async fn copy_buffered<R, W>(reader: &mut R, out: &mut W, limit: u64) -> Result<u64, DeliveryError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_CHUNK.min(limit as usize).max(1)];
    let mut remaining = limit;
    let mut written = 0u64;

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader
            .read(&mut buf[..want])
            .await
            .map_err(DeliveryError::Read)?;
        if n == 0 {
            break;
        }
        write_chunk(out, &buf[..n]).await?;
        remaining -= n as u64;
        written += n as u64;
    }

    Ok(written)
}

/// Copy the first `size` bytes of `file` from memory-mapped windows.
///
/// On a mapping failure the error carries the offset reached so far, so the
/// caller can continue with [`copy_buffered`].
///
/// The length check before each window does not stop another process from
/// truncating the file while a window is being written out. Touching the
/// vanished pages raises `SIGBUS`, which ends the whole process; this is an
/// accepted risk of serving from maps.
pub async fn copy_mapped<W>(file: &std::fs::File, out: &mut W, size: u64) -> Result<u64, DeliveryError>
where
    W: AsyncWrite + Unpin,
{
    copy_mapped_with(file, out, size, MappedWindow::map).await
}

async fn copy_mapped_with<W>(
    file: &std::fs::File,
    out: &mut W,
    size: u64,
    map: MapFn,
) -> Result<u64, DeliveryError>
where
    W: AsyncWrite + Unpin,
{
    let mut offset = 0u64;

    while offset < size {
        // Never map past the current end of file; touching such pages faults
        let current_len = file.metadata().map_err(DeliveryError::Read)?.len();
        let end = size.min(current_len);
        if offset >= end {
            break;
        }

        let len = (end - offset).min(MMAP_CHUNK as u64) as usize;
        let window = map(file, offset, len)
            .map_err(|source| DeliveryError::Map { offset, source })?;
        write_chunk(out, window.as_slice()).await?;
        offset += len as u64;
    }

    Ok(offset)
}

/// A read-only private mapping of part of a file, unmapped on drop.
struct MappedWindow {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the mapping is read-only and owned exclusively by this value.
unsafe impl Send for MappedWindow {}
unsafe impl Sync for MappedWindow {}

impl MappedWindow {
    fn map(file: &std::fs::File, offset: u64, len: usize) -> nix::Result<Self> {
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        let offset = nix::libc::off_t::try_from(offset).map_err(|_| Errno::EOVERFLOW)?;

        // SAFETY: a fresh PROT_READ/MAP_PRIVATE mapping aliases no Rust memory;
        // the caller keeps the window within the file's current length.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE,
                file,
                offset,
            )?
        };

        Ok(Self { ptr, len })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len readable bytes until drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }
}

impl Drop for MappedWindow {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!(error = %e, "munmap failed");
        }
    }
}

async fn send_error<W>(out: &mut W, status: StatusCode, message: &str, ctx: &RequestContext) -> Delivery
where
    W: AsyncWrite + Unpin,
{
    let (head, body) = ResponseHead::error(status, message);
    let head = head.keep_alive(ctx.keep_alive);
    let body: &[u8] = if ctx.head_only { &[] } else { &body };
    send_buffered(out, head, body).await
}

async fn send_buffered<W>(out: &mut W, head: ResponseHead, body: &[u8]) -> Delivery
where
    W: AsyncWrite + Unpin,
{
    let status = head.status;
    let mut message = head.encode();
    message.extend_from_slice(body);

    let result = async {
        write_chunk(out, &message).await?;
        flush(out).await
    }
    .await;

    match result {
        Ok(()) => Delivery::finished(status, None, body.len() as u64, body.len() as u64),
        Err(e) => {
            debug!(error = %e, "failed to send response");
            Delivery::aborted(status, None)
        }
    }
}

async fn write_chunk<W>(out: &mut W, data: &[u8]) -> Result<(), DeliveryError>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(data).await.map_err(classify_write)
}

async fn flush<W>(out: &mut W) -> Result<(), DeliveryError>
where
    W: AsyncWrite + Unpin,
{
    out.flush().await.map_err(classify_write)
}

fn classify_write(err: io::Error) -> DeliveryError {
    if is_disconnect(&err) {
        DeliveryError::Disconnected
    } else {
        DeliveryError::Write(err)
    }
}
