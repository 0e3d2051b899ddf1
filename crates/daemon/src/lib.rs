//! # DriveShare Daemon Library
//!
//! Shares removable drives (or any directory) over HTTP on the local network
//! for browsing and download from other devices.
//!
//! ## Overview
//!
//! - **Device Discovery**: Find USB/external partitions via `lsblk` and sysfs
//! - **Mount Management**: Mount them on scratch directories with
//!   filesystem-specific options, and only ever unmount those
//! - **Serving Core**: One HTTP listener per shared root, one task per connection
//! - **Content Delivery**: Full, ranged and HEAD responses with a
//!   size-dependent copy strategy (buffered or memory-mapped)
//! - **Directory Listings**: Minimal HTML index pages
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      ShareRegistry                         │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐        ┌──────────────────────────┐  │
//! │  │ DeviceDiscovery │  ───▶  │      MountManager        │  │
//! │  └─────────────────┘        └──────────────────────────┘  │
//! │                                          │ root           │
//! │  ┌───────────────────────────────────────▼──────────────┐ │
//! │  │          ServerInstance (one per port)               │ │
//! │  │  resolver ──▶ ContentDelivery ──▶ DirectoryBrowser   │ │
//! │  └──────────────────────────────────────────────────────┘ │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, MountManager, ShareRegistry, SystemMountExecutor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let executor = SystemMountExecutor::new(config.mount.use_sudo);
//!     let mounts = MountManager::from_config(executor, &config.mount);
//!
//!     let mut registry = ShareRegistry::new(config.server.clone(), mounts);
//!     let share = registry.share_directory("/media/usb").await?;
//!     println!("serving on {}", share.addr);
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`devices`]: Device discovery and mount management
//! - [`files`]: Path resolution, listings and content delivery
//! - [`server`]: Listening sockets and connection handling
//! - [`registry`]: Ownership of running servers and mounts

pub mod config;
pub mod devices;
pub mod files;
pub mod registry;
pub mod server;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use devices::{
    BlockDevice, DeviceDiscovery, DeviceProvider, LsblkProvider, MountError, MountExecutor,
    MountManager, MountRecord, NtfsSupport, SystemMountExecutor, Transport,
};

pub use files::{ContentDelivery, DirectoryBrowser, DirectoryEntry, RequestContext};

pub use registry::{RegistryError, Share, ShareRegistry};

pub use server::{ListenerOptions, ServerError, ServerInstance};
