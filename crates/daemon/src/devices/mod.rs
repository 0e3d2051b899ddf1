//! Removable device discovery and mount management.

pub mod discovery;
pub mod mount;

#[cfg(test)]
pub(crate) mod fake;

pub use discovery::{
    parent_disk, BlockDevice, DeviceDiscovery, DeviceProvider, DiscoveryError, LsblkProvider,
    Transport,
};
pub use mount::{
    MountError, MountExecutor, MountManager, MountPlan, MountRecord, NtfsSupport,
    SystemMountExecutor,
};
