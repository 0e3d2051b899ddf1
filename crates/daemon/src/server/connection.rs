//! Per-connection request loop.
//!
//! Each accepted socket is served by one task running [`handle_connection`]:
//! read a request head, answer it, and repeat while the connection may be
//! reused. The loop ends when the client closes, asks for `Connection:
//! close`, sends something unparsable, or a response body was cut short.

use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{Method, ProtocolError, RequestHead, ResponseHead, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::files::{resolver, ContentDelivery, RequestContext};

/// Bytes read from the socket per read call while waiting for a head.
const READ_CHUNK: usize = 8 * 1024;

/// Serve requests on one connection until it can no longer be reused.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, engine: Arc<ContentDelivery>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut served = 0usize;

    loop {
        let head = match read_head(&mut reader, &mut buf).await {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(ProtocolError::ConnectionClosed(reason)) => {
                trace!(%peer, %reason, "connection closed by peer");
                break;
            }
            Err(ProtocolError::Io(e)) => {
                debug!(%peer, error = %e, "read failed");
                break;
            }
            Err(e) => {
                debug!(%peer, error = %e, "bad request");
                send_simple(&mut writer, StatusCode::BadRequest, "Malformed request").await;
                break;
            }
        };

        // Bodies are never read, so a request carrying one ends the connection
        let has_body = head
            .header("Content-Length")
            .map(|v| v.trim() != "0")
            .unwrap_or(false)
            || head.header("Transfer-Encoding").is_some();
        let keep_alive = head.wants_keep_alive() && !has_body;

        let complete = match head.method {
            Method::Get | Method::Head => {
                let ctx = RequestContext {
                    resolved: resolver::resolve(engine.root(), &head.target),
                    range_header: head.range().map(str::to_string),
                    head_only: head.method == Method::Head,
                    keep_alive,
                    target: head.target,
                };
                let delivery = engine.respond(&ctx, &mut writer).await;
                debug!(
                    %peer,
                    method = head.method.as_str(),
                    request = %ctx.target,
                    status = delivery.status.as_u16(),
                    bytes = delivery.body_bytes,
                    complete = delivery.complete,
                    "request served"
                );
                delivery.complete
            }
            Method::Other(ref token) => {
                debug!(%peer, method = %token, "unsupported method");
                let (head, body) = ResponseHead::error(StatusCode::NotImplemented, "Unsupported method");
                write_response(&mut writer, head.keep_alive(keep_alive), &body).await
            }
        };

        served += 1;
        if !complete || !keep_alive {
            break;
        }
    }

    let _ = writer.shutdown().await;
    trace!(%peer, requests = served, "connection finished");
}

/// Read until a complete request head is buffered.
///
/// Returns `Ok(None)` on a clean close between requests. Bytes following the
/// head stay in `buf` for the next call.
async fn read_head<R>(reader: &mut R, buf: &mut Vec<u8>) -> protocol::Result<Option<RequestHead>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if let Some((head, consumed)) = RequestHead::parse(buf)? {
            buf.drain(..consumed);
            return Ok(Some(head));
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.iter().all(|b| b.is_ascii_whitespace()) {
                return Ok(None);
            }
            return Err(ProtocolError::ConnectionClosed(
                "closed in the middle of a request head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn send_simple<W>(writer: &mut W, status: StatusCode, message: &str)
where
    W: AsyncWrite + Unpin,
{
    let (head, body) = ResponseHead::error(status, message);
    write_response(writer, head.keep_alive(false), &body).await;
}

async fn write_response<W>(writer: &mut W, head: ResponseHead, body: &[u8]) -> bool
where
    W: AsyncWrite + Unpin,
{
    let mut message = head.encode();
    message.extend_from_slice(body);
    match writer.write_all(&message).await {
        Ok(()) => writer.flush().await.is_ok(),
        Err(e) => {
            debug!(error = %e, "failed to write response");
            false
        }
    }
}
