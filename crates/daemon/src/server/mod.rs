//! HTTP serving core.
//!
//! A [`ServerInstance`] owns one listening socket bound to a serving root.
//! Starting it spawns an accept loop on the runtime; every accepted
//! connection gets its own task, detached from the instance, so stopping an
//! instance never waits on a slow client.
//!
//! # Lifecycle
//!
//! ```text
//! new() --start()--> Running --stop()--> Stopped
//!          |                               |
//!          +-- bind failure (not running)  +-- stop() again is a no-op
//! ```

pub mod connection;
pub mod listener;

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::files::{ContentDelivery, DirectoryBrowser};

pub use listener::ListenerOptions;

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors that can occur when starting a server instance.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The serving root does not exist or is not a directory.
    #[error("serving root is not a directory: {0}")]
    InvalidRoot(PathBuf),

    /// The listening socket could not be set up.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// `start()` was called on a running instance.
    #[error("server already running on {0}")]
    AlreadyRunning(SocketAddr),
}

/// Handles held while an instance is running.
struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// One HTTP server bound to a serving root and a port.
pub struct ServerInstance {
    root: PathBuf,
    addr: SocketAddr,
    options: ListenerOptions,
    running: Option<Running>,
}

impl ServerInstance {
    /// Create a stopped instance for `root` that will listen on `addr`.
    pub fn new(root: impl Into<PathBuf>, addr: SocketAddr, options: ListenerOptions) -> Self {
        Self {
            root: root.into(),
            addr,
            options,
            running: None,
        }
    }

    /// Serving root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bound port while running, otherwise the configured one.
    pub fn port(&self) -> u16 {
        self.local_addr().unwrap_or(self.addr).port()
    }

    /// Actual bound address, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind the listening socket and spawn the accept loop.
    ///
    /// Returns once the socket is listening. On error nothing stays bound and
    /// the instance remains stopped.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if let Some(running) = &self.running {
            return Err(ServerError::AlreadyRunning(running.local_addr));
        }

        let is_dir = tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(ServerError::InvalidRoot(self.root.clone()));
        }

        let listener = listener::bind(self.addr, &self.options).map_err(|source| ServerError::Bind {
            addr: self.addr,
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: self.addr,
            source,
        })?;

        let engine = Arc::new(ContentDelivery::new(DirectoryBrowser::new(
            self.root.clone(),
            local_addr.port(),
        )));
        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, engine, shutdown.clone()));

        info!(
            addr = %local_addr,
            root = %self.root.display(),
            "Server started"
        );

        self.running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
        });
        Ok(local_addr)
    }

    /// Stop accepting connections and close the listening socket.
    ///
    /// In-flight connections finish on their own. Calling this on a stopped
    /// instance does nothing.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.shutdown.cancel();
        if let Err(e) = running.accept_task.await {
            warn!(error = %e, "accept loop ended abnormally");
        }

        info!(addr = %running.local_addr, "Server stopped");
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInstance")
            .field("root", &self.root)
            .field("addr", &self.addr)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, engine: Arc<ContentDelivery>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("accept loop cancelled");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move {
                        connection::handle_connection(stream, peer, engine).await;
                    });
                }
                Err(e) => {
                    // Usually descriptor exhaustion; back off instead of spinning
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_start_serves_and_stop_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("hello.txt"), "hello").unwrap();

        let mut server = ServerInstance::new(temp_dir.path(), local(), ListenerOptions::default());
        assert!(!server.is_running());

        let addr = server.start().await.unwrap();
        assert!(server.is_running());
        assert_eq!(server.port(), addr.port());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /hello.txt HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("hello"));

        server.stop().await;
        assert!(!server.is_running());
        server.stop().await;
        assert!(!server.is_running());

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut server = ServerInstance::new(temp_dir.path(), local(), ListenerOptions::default());

        let addr = server.start().await.unwrap();
        match server.start().await {
            Err(ServerError::AlreadyRunning(a)) => assert_eq!(a, addr),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_instance_stopped() {
        let temp_dir = TempDir::new().unwrap();
        let mut first = ServerInstance::new(temp_dir.path(), local(), ListenerOptions::default());
        let addr = first.start().await.unwrap();

        let mut second = ServerInstance::new(temp_dir.path(), addr, ListenerOptions::default());
        assert!(matches!(second.start().await, Err(ServerError::Bind { .. })));
        assert!(!second.is_running());
        assert_eq!(second.local_addr(), None);

        first.stop().await;
    }

    #[tokio::test]
    async fn test_missing_root_is_rejected_before_bind() {
        let temp_dir = TempDir::new().unwrap();
        let mut server = ServerInstance::new(
            temp_dir.path().join("missing"),
            local(),
            ListenerOptions::default(),
        );
        assert!(matches!(server.start().await, Err(ServerError::InvalidRoot(_))));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_open_connections() {
        let temp_dir = TempDir::new().unwrap();
        let mut server = ServerInstance::new(temp_dir.path(), local(), ListenerOptions::default());
        let addr = server.start().await.unwrap();

        // Idle client that never sends a request
        let _idle = TcpStream::connect(addr).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), server.stop())
            .await
            .expect("stop blocked on an idle connection");
    }
}
