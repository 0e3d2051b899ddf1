//! In-memory device provider and mount executor for tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::discovery::{BlockDevice, DeviceProvider, DiscoveryError};
use super::mount::{MountError, MountExecutor, MountPlan};

/// Provider answering from fixed tables.
#[derive(Debug, Default)]
pub struct FakeProvider {
    pub devices: Vec<BlockDevice>,
    pub usb_disks: HashSet<String>,
    pub removable: HashMap<String, bool>,
    pub by_id_links: Vec<String>,
    pub described: HashMap<String, BlockDevice>,
    pub fail_enumeration: bool,
}

impl FakeProvider {
    pub fn new(devices: Vec<BlockDevice>) -> Self {
        Self {
            devices,
            ..Self::default()
        }
    }
}

impl DeviceProvider for FakeProvider {
    fn block_devices(&self) -> Result<Vec<BlockDevice>, DiscoveryError> {
        if self.fail_enumeration {
            return Err(DiscoveryError::CommandFailed {
                command: "lsblk".to_string(),
                stderr: "simulated failure".to_string(),
            });
        }
        Ok(self.devices.clone())
    }

    fn usb_removable_disks(&self) -> Result<HashSet<String>, DiscoveryError> {
        Ok(self.usb_disks.clone())
    }

    fn removable_attribute(&self, disk: &str) -> Option<bool> {
        self.removable.get(disk).copied()
    }

    fn usb_partition_links(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(self.by_id_links.clone())
    }

    fn describe(&self, name: &str) -> Result<Option<BlockDevice>, DiscoveryError> {
        Ok(self.described.get(name).cloned())
    }
}

#[derive(Debug, Default)]
struct ExecutorState {
    /// device -> current mount point
    mounted: HashMap<String, PathBuf>,
    mounts: Vec<(String, PathBuf, MountPlan)>,
    unmounts: Vec<PathBuf>,
}

/// Executor that records calls instead of mounting anything.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    filesystems: HashMap<String, String>,
    fail_mount: bool,
    fail_unmount: bool,
    state: Mutex<ExecutorState>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filesystem(mut self, device: &str, fs_type: &str) -> Self {
        self.filesystems.insert(device.to_string(), fs_type.to_string());
        self
    }

    pub fn with_existing_mount(self, device: &str, mount_point: impl Into<PathBuf>) -> Self {
        self.state
            .lock()
            .unwrap()
            .mounted
            .insert(device.to_string(), mount_point.into());
        self
    }

    pub fn failing_mounts(mut self) -> Self {
        self.fail_mount = true;
        self
    }

    pub fn failing_unmounts(mut self) -> Self {
        self.fail_unmount = true;
        self
    }

    /// Successful `mount` calls, in order.
    pub fn mounts(&self) -> Vec<(String, PathBuf, MountPlan)> {
        self.state.lock().unwrap().mounts.clone()
    }

    /// Successful `unmount` calls, in order.
    pub fn unmounts(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().unmounts.clone()
    }
}

impl MountExecutor for FakeExecutor {
    fn mount_point_of(&self, device: &str) -> Result<Option<PathBuf>, MountError> {
        Ok(self.state.lock().unwrap().mounted.get(device).cloned())
    }

    fn filesystem_of(&self, device: &str) -> Result<Option<String>, MountError> {
        Ok(self.filesystems.get(device).cloned())
    }

    fn mount(&self, device: &str, target: &Path, plan: &MountPlan) -> Result<(), MountError> {
        if self.fail_mount {
            return Err(MountError::CommandFailed {
                command: "mount".to_string(),
                detail: "simulated failure".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.mounted.insert(device.to_string(), target.to_path_buf());
        state
            .mounts
            .push((device.to_string(), target.to_path_buf(), plan.clone()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        if self.fail_unmount {
            return Err(MountError::CommandFailed {
                command: "umount".to_string(),
                detail: "target is busy".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.mounted.retain(|_, point| point != target);
        state.unmounts.push(target.to_path_buf());
        Ok(())
    }
}
