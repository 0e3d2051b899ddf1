//! Listening socket setup.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket};

use crate::config::ServerConfig;

/// Socket options applied when an instance binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Pending-connection queue length passed to `listen(2)`.
    pub backlog: u32,
    /// Requested `SO_SNDBUF`/`SO_RCVBUF` size in bytes.
    pub socket_buffer_size: u32,
    /// Enable `SO_KEEPALIVE` (inherited by accepted sockets).
    pub keepalive: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            backlog: 50,
            socket_buffer_size: 4 * 1024 * 1024,
            keepalive: true,
        }
    }
}

impl From<&ServerConfig> for ListenerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            backlog: config.backlog,
            socket_buffer_size: u32::try_from(config.socket_buffer_size).unwrap_or(u32::MAX),
            keepalive: true,
        }
    }
}

/// Bind a listening TCP socket on `addr` with `options` applied.
pub fn bind(addr: SocketAddr, options: &ListenerOptions) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    socket.set_reuseaddr(true)?;
    socket.set_keepalive(options.keepalive)?;
    // The kernel may cap or double these; a refusal is not fatal
    if let Err(e) = socket.set_send_buffer_size(options.socket_buffer_size) {
        tracing::debug!(error = %e, "could not set send buffer size");
    }
    if let Err(e) = socket.set_recv_buffer_size(options.socket_buffer_size) {
        tracing::debug!(error = %e, "could not set receive buffer size");
    }

    socket.bind(addr)?;
    socket.listen(options.backlog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), &ListenerOptions::default()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_port_in_use_fails() {
        let first = bind("127.0.0.1:0".parse().unwrap(), &ListenerOptions::default()).unwrap();
        let addr = first.local_addr().unwrap();

        // SO_REUSEADDR does not allow two listeners on the same port
        assert!(bind(addr, &ListenerOptions::default()).is_err());
    }

    #[test]
    fn test_options_from_config() {
        let config = ServerConfig::default();
        let options = ListenerOptions::from(&config);
        assert_eq!(options.backlog, 50);
        assert_eq!(options.socket_buffer_size, 4 * 1024 * 1024);
        assert!(options.keepalive);
    }
}
