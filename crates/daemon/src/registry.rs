//! Registry of running servers and mounts.
//!
//! The [`ShareRegistry`] is the single owner of every [`ServerInstance`] and
//! [`MountRecord`] the process creates. Callers hand it roots or devices; it
//! picks ports, enforces the instance limit before anything is bound, and
//! tears everything down in [`ShareRegistry::shutdown`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::devices::{MountError, MountExecutor, MountManager, MountRecord};
use crate::server::{ListenerOptions, ServerError, ServerInstance};

/// Errors that can occur when sharing a directory or device.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The configured maximum number of servers is already running.
    #[error("maximum number of servers ({max}) already running")]
    LimitReached { max: usize },

    /// No port is left in the configured range.
    #[error("no port available after {base_port} for server #{index}")]
    PortExhausted { base_port: u16, index: usize },

    /// The server could not be started.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The device could not be mounted.
    #[error(transparent)]
    Mount(#[from] MountError),

    /// A blocking mount task panicked or was cancelled.
    #[error("mount task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A started share: where it is served from and where it listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    /// Serving root.
    pub root: PathBuf,
    /// Bound address.
    pub addr: SocketAddr,
    /// Mount backing the root, for device shares.
    pub mount: Option<MountRecord>,
}

/// Owns every server instance and mount record of the process.
pub struct ShareRegistry<E> {
    config: ServerConfig,
    options: ListenerOptions,
    mounts: Arc<MountManager<E>>,
    servers: Vec<ServerInstance>,
    records: Vec<MountRecord>,
    /// Explicit port for the next share, overriding `base_port + count`.
    port_override: Option<u16>,
}

impl<E: MountExecutor + 'static> ShareRegistry<E> {
    pub fn new(config: ServerConfig, mounts: MountManager<E>) -> Self {
        let options = ListenerOptions::from(&config);
        Self {
            config,
            options,
            mounts: Arc::new(mounts),
            servers: Vec::new(),
            records: Vec::new(),
            port_override: None,
        }
    }

    /// Start the next share on `port` instead of the computed one; `0`
    /// lets the OS pick.
    pub fn with_base_port(mut self, port: u16) -> Self {
        self.port_override = Some(port);
        self
    }

    /// Serve `root` on the next free slot.
    ///
    /// Fails before binding anything when the server limit is reached.
    pub async fn share_directory(&mut self, root: impl AsRef<Path>) -> Result<Share, RegistryError> {
        let addr = self.next_addr()?;
        let mut server = ServerInstance::new(root.as_ref(), addr, self.options);
        let local = server.start().await?;

        self.servers.push(server);
        Ok(Share {
            root: root.as_ref().to_path_buf(),
            addr: local,
            mount: None,
        })
    }

    /// Mount `device` (or reuse its mount) and serve it.
    ///
    /// If the server cannot start, a mount created for it is rolled back.
    pub async fn share_device(&mut self, device: &str) -> Result<Share, RegistryError> {
        // Check the limit first so nothing is mounted for a share that cannot start
        self.next_addr()?;

        let mounts = Arc::clone(&self.mounts);
        let name = device.to_string();
        let record = tokio::task::spawn_blocking(move || mounts.mount(&name)).await??;

        match self.share_directory(record.mount_point()).await {
            Ok(mut share) => {
                share.mount = Some(record.clone());
                self.records.push(record);
                Ok(share)
            }
            Err(e) => {
                // Leave a mount alone that an earlier share still serves from
                let in_use = self
                    .records
                    .iter()
                    .any(|r| r.mount_point() == record.mount_point());
                if record.owned() && !in_use {
                    if let Err(rollback) = self.release(record.clone()).await {
                        warn!(
                            mount_point = %record.mount_point().display(),
                            error = %rollback,
                            "failed to roll back mount"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Running server instances.
    pub fn servers(&self) -> &[ServerInstance] {
        &self.servers
    }

    /// Mount records for shared devices.
    pub fn mounts(&self) -> &[MountRecord] {
        &self.records
    }

    /// Mount manager backing device shares.
    pub fn mount_manager(&self) -> &MountManager<E> {
        &self.mounts
    }

    /// Stop every server, then unmount every owned mount.
    ///
    /// Errors are logged, not returned. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        for mut server in self.servers.drain(..) {
            server.stop().await;
        }

        let mut released = Vec::new();
        for record in std::mem::take(&mut self.records) {
            if !record.owned() || released.contains(&record.mount_point().to_path_buf()) {
                continue;
            }
            released.push(record.mount_point().to_path_buf());
            match self.release(record.clone()).await {
                Ok(()) => info!(mount_point = %record.mount_point().display(), "Cleaned up mount"),
                Err(e) => warn!(
                    mount_point = %record.mount_point().display(),
                    error = %e,
                    "failed to unmount"
                ),
            }
        }
    }

    async fn release(&self, record: MountRecord) -> Result<(), RegistryError> {
        let mounts = Arc::clone(&self.mounts);
        tokio::task::spawn_blocking(move || mounts.release(&record)).await??;
        Ok(())
    }

    fn next_addr(&self) -> Result<SocketAddr, RegistryError> {
        let index = self.servers.len();
        if index >= self.config.max_servers {
            return Err(RegistryError::LimitReached {
                max: self.config.max_servers,
            });
        }

        let port = match self.port_override {
            Some(0) => 0,
            Some(base) => offset_port(base, index)?,
            None => offset_port(self.config.base_port, index)?,
        };
        Ok(SocketAddr::new(self.config.bind_address, port))
    }
}

fn offset_port(base_port: u16, index: usize) -> Result<u16, RegistryError> {
    u16::try_from(index)
        .ok()
        .and_then(|i| base_port.checked_add(i))
        .ok_or(RegistryError::PortExhausted { base_port, index })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::fake::FakeExecutor;
    use tempfile::TempDir;

    fn config(max_servers: usize) -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            max_servers,
            ..ServerConfig::default()
        }
    }

    fn registry(temp_dir: &TempDir, max_servers: usize, executor: FakeExecutor) -> ShareRegistry<FakeExecutor> {
        let mounts = MountManager::new(executor, temp_dir.path().join("driveshare_"), "ntfs-3g");
        ShareRegistry::new(config(max_servers), mounts).with_base_port(0)
    }

    #[test]
    fn test_offset_port() {
        assert_eq!(offset_port(8000, 0).unwrap(), 8000);
        assert_eq!(offset_port(8000, 4).unwrap(), 8004);
        assert!(matches!(
            offset_port(65535, 1),
            Err(RegistryError::PortExhausted { .. })
        ));
    }

    #[test]
    fn test_ports_follow_base_port() {
        let temp_dir = TempDir::new().unwrap();
        let mounts = MountManager::new(FakeExecutor::new(), temp_dir.path().join("d_"), "ntfs-3g");
        let registry = ShareRegistry::new(ServerConfig::default(), mounts);
        assert_eq!(registry.next_addr().unwrap().port(), 8000);
    }

    #[tokio::test]
    async fn test_limit_rejected_before_binding() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = registry(&temp_dir, 2, FakeExecutor::new());

        registry.share_directory(temp_dir.path()).await.unwrap();
        registry.share_directory(temp_dir.path()).await.unwrap();
        assert_eq!(registry.servers().len(), 2);

        let result = registry.share_directory(temp_dir.path()).await;
        assert!(matches!(result, Err(RegistryError::LimitReached { max: 2 })));
        assert_eq!(registry.servers().len(), 2);

        registry.shutdown().await;
        assert!(registry.servers().is_empty());
    }

    #[tokio::test]
    async fn test_limit_reached_mounts_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = registry(&temp_dir, 1, FakeExecutor::new());

        registry.share_directory(temp_dir.path()).await.unwrap();
        let result = registry.share_device("sdb1").await;
        assert!(matches!(result, Err(RegistryError::LimitReached { .. })));
        assert!(registry.mount_manager().owned_mount_points().is_empty());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_share_device_and_shutdown_unmounts_owned() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = registry(&temp_dir, 5, FakeExecutor::new().with_filesystem("sdb1", "exfat"));

        let share = registry.share_device("sdb1").await.unwrap();
        let record = share.mount.clone().unwrap();
        assert!(record.owned());
        assert_eq!(share.root, record.mount_point());
        assert_eq!(registry.mounts().len(), 1);

        registry.shutdown().await;
        assert!(!record.mount_point().exists());
        assert!(registry.mounts().is_empty());

        // Idempotent
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_device_shared_twice_unmounts_once() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = registry(&temp_dir, 5, FakeExecutor::new());

        let first = registry.share_device("sdb1").await.unwrap();
        let second = registry.share_device("sdb1").await.unwrap();
        assert_eq!(first.root, second.root);
        assert!(first.mount.unwrap().owned());
        assert!(second.mount.unwrap().owned());
        assert_eq!(registry.mount_manager().owned_mount_points().len(), 1);

        registry.shutdown().await;
        assert!(registry.mount_manager().owned_mount_points().is_empty());
        assert!(!first.root.exists());
    }

    #[tokio::test]
    async fn test_failed_second_share_keeps_mount_in_use() {
        let temp_dir = TempDir::new().unwrap();
        let mounts = MountManager::new(FakeExecutor::new(), temp_dir.path().join("driveshare_"), "ntfs-3g");
        let mut registry = ShareRegistry::new(config(5), mounts);

        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        registry = registry.with_base_port(0);
        let first = registry.share_device("sdb1").await.unwrap();

        // Second share lands on the blocked port
        registry.port_override = Some(port.wrapping_sub(1));
        let result = registry.share_device("sdb1").await;
        assert!(matches!(result, Err(RegistryError::Server(ServerError::Bind { .. }))));
        assert!(first.root.is_dir());
        assert_eq!(registry.mount_manager().owned_mount_points().len(), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_share_existing_mount_is_left_alone() {
        let temp_dir = TempDir::new().unwrap();
        let external = temp_dir.path().join("media");
        std::fs::create_dir(&external).unwrap();
        let executor = FakeExecutor::new().with_existing_mount("sdc1", &external);
        let mut registry = registry(&temp_dir, 5, executor);

        let share = registry.share_device("sdc1").await.unwrap();
        assert!(!share.mount.unwrap().owned());

        registry.shutdown().await;
        assert!(external.is_dir());
    }

    #[tokio::test]
    async fn test_failed_serve_rolls_back_owned_mount() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let mounts = MountManager::new(FakeExecutor::new(), temp_dir.path().join("driveshare_"), "ntfs-3g");
        let mut registry = ShareRegistry::new(config(5), mounts).with_base_port(port);

        let result = registry.share_device("sdb1").await;
        assert!(matches!(result, Err(RegistryError::Server(ServerError::Bind { .. }))));
        assert!(registry.mount_manager().owned_mount_points().is_empty());
        assert!(registry.mounts().is_empty());
        assert_eq!(registry.mount_manager().scratch_prefix(), temp_dir.path().join("driveshare_"));
    }
}
