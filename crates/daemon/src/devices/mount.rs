//! Mount lifecycle for removable devices.
//!
//! The [`MountManager`] mounts a device on a fresh scratch directory under a
//! configured prefix, or reuses the mount point the system already has for
//! it. It only ever unmounts what it mounted itself: a mount point must be
//! recorded as owned *and* lie under the scratch prefix.
//!
//! ```text
//! Unmounted --mount()--> MountedOwned --unmount()--> Unmounted
//!     |
//!     +--mount() on an already-mounted device--> MountedExternal (never unmounted here)
//! ```
//!
//! OS interaction goes through a [`MountExecutor`], so the state handling can
//! be exercised without real hardware.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use nix::unistd::{getgid, getuid, Gid, Uid};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::MountConfig;

/// Attempts at finding an unused scratch directory name.
const SCRATCH_ATTEMPTS: usize = 16;

/// Errors that can occur while mounting or unmounting.
#[derive(Debug, Error)]
pub enum MountError {
    /// The device name is empty or contains a path separator.
    #[error("invalid device name: {0:?}")]
    InvalidDevice(String),

    /// The scratch mount directory could not be created.
    #[error("cannot create mount directory {path}: {source}")]
    ScratchDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An external command could not be started.
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// An external command exited unsuccessfully.
    #[error("{command} failed: {detail}")]
    CommandFailed { command: String, detail: String },

    /// The mount point was not created by this manager.
    #[error("refusing to unmount {0}: not mounted by this process")]
    NotOwned(PathBuf),

    /// The mount point lies outside the scratch prefix.
    #[error("refusing to unmount {0}: outside the scratch mount prefix")]
    OutsideScratch(PathBuf),

    /// A lock was poisoned by a panicking thread.
    #[error("lock poisoned: {context}")]
    LockPoisoned { context: String },
}

/// A mounted device and whether this process owns the mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    mount_point: PathBuf,
    device: String,
    owned: bool,
}

impl MountRecord {
    /// Directory the device is mounted on.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Device name (`sdb1`).
    pub fn device(&self) -> &str {
        &self.device
    }

    /// True iff this manager created the directory and performed the mount.
    pub fn owned(&self) -> bool {
        self.owned
    }
}

/// `mount(8)` arguments for one filesystem type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    /// Value for `-t`, if a type is forced.
    pub fs_type: Option<String>,
    /// Value for `-o`, comma-joined; empty for none.
    pub options: Vec<String>,
}

impl MountPlan {
    /// Choose mount arguments for a detected filesystem.
    pub fn for_filesystem(fs_type: Option<&str>, uid: Uid, gid: Gid, ntfs_driver: &str) -> Self {
        let fs_type = fs_type.map(str::to_ascii_lowercase);
        match fs_type.as_deref() {
            Some("ntfs") | Some("ntfs3") => Self {
                fs_type: Some(ntfs_driver.to_string()),
                options: vec![
                    "permissions".to_string(),
                    "big_writes".to_string(),
                    format!("uid={}", uid),
                    format!("gid={}", gid),
                ],
            },
            Some("vfat") | Some("fat") | Some("fat16") | Some("fat32") | Some("msdos") => Self {
                fs_type: Some("vfat".to_string()),
                options: vec![
                    format!("uid={}", uid),
                    format!("gid={}", gid),
                    "dmask=027".to_string(),
                    "fmask=137".to_string(),
                ],
            },
            Some("exfat") => Self {
                fs_type: Some("exfat".to_string()),
                options: Vec::new(),
            },
            _ => Self {
                fs_type: None,
                options: Vec::new(),
            },
        }
    }

    /// Full argument list for `mount`.
    pub fn args(&self, device: &Path, target: &Path) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(fs_type) = &self.fs_type {
            args.push("-t".into());
            args.push(fs_type.into());
        }
        if !self.options.is_empty() {
            args.push("-o".into());
            args.push(self.options.join(",").into());
        }
        args.push(device.into());
        args.push(target.into());
        args
    }
}

/// OS mount facility.
pub trait MountExecutor: Send + Sync {
    /// Current mount point of `device`, if it is mounted.
    fn mount_point_of(&self, device: &str) -> Result<Option<PathBuf>, MountError>;

    /// Filesystem type on `device`, if detected.
    fn filesystem_of(&self, device: &str) -> Result<Option<String>, MountError>;

    /// Mount `device` on `target` using `plan`.
    fn mount(&self, device: &str, target: &Path, plan: &MountPlan) -> Result<(), MountError>;

    /// Unmount whatever is mounted on `target`.
    fn unmount(&self, target: &Path) -> Result<(), MountError>;
}

/// [`MountExecutor`] that shells out to `lsblk`, `mount` and `umount`.
#[derive(Debug, Clone)]
pub struct SystemMountExecutor {
    use_sudo: bool,
}

impl SystemMountExecutor {
    /// Run privileged commands through `sudo` when `use_sudo` is set and the
    /// process is not already root.
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    fn privileged(&self, program: &str) -> Command {
        privileged_command(self.use_sudo, program)
    }

    fn lsblk_column(&self, device: &str, column: &str) -> Result<Option<String>, MountError> {
        let mut cmd = Command::new("lsblk");
        cmd.args(["-n", "-o", column]).arg(dev_path(device));
        let stdout = run(cmd, "lsblk")?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string))
    }
}

impl MountExecutor for SystemMountExecutor {
    fn mount_point_of(&self, device: &str) -> Result<Option<PathBuf>, MountError> {
        Ok(self.lsblk_column(device, "MOUNTPOINT")?.map(PathBuf::from))
    }

    fn filesystem_of(&self, device: &str) -> Result<Option<String>, MountError> {
        Ok(self
            .lsblk_column(device, "FSTYPE")?
            .map(|fs| fs.to_ascii_lowercase()))
    }

    fn mount(&self, device: &str, target: &Path, plan: &MountPlan) -> Result<(), MountError> {
        let mut cmd = self.privileged("mount");
        cmd.args(plan.args(&dev_path(device), target));
        run(cmd, "mount").map(|_| ())
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        let mut cmd = self.privileged("umount");
        cmd.arg(target);
        run(cmd, "umount").map(|_| ())
    }
}

/// Mounts devices and tracks which mount points it owns.
pub struct MountManager<E> {
    executor: E,
    scratch_prefix: PathBuf,
    ntfs_driver: String,
    uid: Uid,
    gid: Gid,
    /// Owned mount points and the device mounted on each.
    owned: Mutex<HashMap<PathBuf, String>>,
    /// One lock per device; mount/unmount of a device never overlap.
    device_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<E: MountExecutor> MountManager<E> {
    /// Create a manager that creates mount points named `<scratch_prefix><suffix>`.
    pub fn new(executor: E, scratch_prefix: impl Into<PathBuf>, ntfs_driver: impl Into<String>) -> Self {
        Self {
            executor,
            scratch_prefix: scratch_prefix.into(),
            ntfs_driver: ntfs_driver.into(),
            uid: getuid(),
            gid: getgid(),
            owned: Mutex::new(HashMap::new()),
            device_locks: DashMap::new(),
        }
    }

    /// Create a manager from the `[mount]` configuration section.
    pub fn from_config(executor: E, config: &MountConfig) -> Self {
        Self::new(executor, config.scratch_prefix.clone(), config.ntfs_driver.clone())
    }

    /// Scratch prefix owned mount points are created under.
    pub fn scratch_prefix(&self) -> &Path {
        &self.scratch_prefix
    }

    /// Mount `device` (`sdb1` or `/dev/sdb1`), or reuse its existing mount.
    ///
    /// An existing mount point is returned without touching anything; the
    /// record is owned only if this manager made that mount. Otherwise a scratch directory is created and the
    /// device mounted there; if mounting fails the directory is removed
    /// before the error is returned.
    pub fn mount(&self, device: &str) -> Result<MountRecord, MountError> {
        let device = normalize_device(device)?;
        let lock = self.device_lock(&device);
        let _guard = lock.lock().map_err(|_| MountError::LockPoisoned {
            context: format!("device lock for {}", device),
        })?;

        if let Some(existing) = self.executor.mount_point_of(&device)? {
            let owned = self.owned_map()?.contains_key(&existing);
            info!(device = %device, mount_point = %existing.display(), owned, "Using existing mount point");
            return Ok(MountRecord {
                mount_point: existing,
                device,
                owned,
            });
        }

        let target = self.create_scratch_dir()?;
        match self.mount_on(&device, &target) {
            Ok(()) => {
                self.owned_map()?.insert(target.clone(), device.clone());
                info!(device = %device, mount_point = %target.display(), "Mounted device");
                Ok(MountRecord {
                    mount_point: target,
                    device,
                    owned: true,
                })
            }
            Err(e) => {
                if let Err(rm) = fs::remove_dir(&target) {
                    warn!(path = %target.display(), error = %rm, "failed to remove mount directory");
                }
                Err(e)
            }
        }
    }

    /// Unmount an owned mount point and remove its directory.
    ///
    /// Fails without touching anything if the mount point is outside the
    /// scratch prefix or was not mounted by this manager.
    pub fn unmount(&self, mount_point: &Path) -> Result<(), MountError> {
        if !self.is_under_prefix(mount_point) {
            return Err(MountError::OutsideScratch(mount_point.to_path_buf()));
        }

        let device = self
            .owned_map()?
            .get(mount_point)
            .cloned()
            .ok_or_else(|| MountError::NotOwned(mount_point.to_path_buf()))?;

        let lock = self.device_lock(&device);
        let _guard = lock.lock().map_err(|_| MountError::LockPoisoned {
            context: format!("device lock for {}", device),
        })?;

        // Another caller may have finished the unmount while we waited
        if !self.owned_map()?.contains_key(mount_point) {
            return Err(MountError::NotOwned(mount_point.to_path_buf()));
        }

        self.executor.unmount(mount_point)?;
        self.owned_map()?.remove(mount_point);

        if let Err(e) = fs::remove_dir(mount_point) {
            warn!(path = %mount_point.display(), error = %e, "failed to remove mount directory");
        }
        info!(device = %device, mount_point = %mount_point.display(), "Unmounted device");
        Ok(())
    }

    /// Unmount the mount point of `record` if the record is owned.
    ///
    /// External records fail with [`MountError::NotOwned`].
    pub fn release(&self, record: &MountRecord) -> Result<(), MountError> {
        if !record.owned {
            return Err(MountError::NotOwned(record.mount_point.clone()));
        }
        self.unmount(&record.mount_point)
    }

    /// Mount points currently owned by this manager.
    pub fn owned_mount_points(&self) -> Vec<PathBuf> {
        match self.owned.lock() {
            Ok(map) => map.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn mount_on(&self, device: &str, target: &Path) -> Result<(), MountError> {
        let fs_type = self.executor.filesystem_of(device)?;
        debug!(device, fs_type = ?fs_type, "Detected filesystem");
        let plan = MountPlan::for_filesystem(fs_type.as_deref(), self.uid, self.gid, &self.ntfs_driver);
        self.executor.mount(device, target, &plan)
    }

    fn create_scratch_dir(&self) -> Result<PathBuf, MountError> {
        let mut last_err = None;
        for _ in 0..SCRATCH_ATTEMPTS {
            let mut name = self.scratch_prefix.clone().into_os_string();
            name.push(format!("{:08x}", rand::random::<u32>()));
            let path = PathBuf::from(name);

            match DirBuilder::new().mode(0o700).create(&path) {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => last_err = Some(e),
                Err(source) => return Err(MountError::ScratchDir { path, source }),
            }
        }
        Err(MountError::ScratchDir {
            path: self.scratch_prefix.clone(),
            source: last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AlreadyExists)),
        })
    }

    fn is_under_prefix(&self, path: &Path) -> bool {
        path.is_absolute()
            && path
                .components()
                .all(|c| !matches!(c, Component::ParentDir | Component::CurDir))
            && path
                .as_os_str()
                .as_bytes()
                .starts_with(self.scratch_prefix.as_os_str().as_bytes())
            && path != self.scratch_prefix
    }

    fn device_lock(&self, device: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.device_locks.entry(device.to_string()).or_default().value())
    }

    fn owned_map(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PathBuf, String>>, MountError> {
        self.owned.lock().map_err(|_| MountError::LockPoisoned {
            context: "owned mount table".to_string(),
        })
    }
}

/// NTFS userspace driver precheck and installer.
#[derive(Debug, Clone)]
pub struct NtfsSupport {
    driver: String,
    use_sudo: bool,
}

impl NtfsSupport {
    pub fn new(driver: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            driver: driver.into(),
            use_sudo,
        }
    }

    /// Create from the `[mount]` configuration section.
    pub fn from_config(config: &MountConfig) -> Self {
        Self::new(config.ntfs_driver.clone(), config.use_sudo)
    }

    /// Driver binary name.
    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Whether the driver is on `PATH`.
    pub fn check(&self) -> bool {
        which::which(&self.driver).is_ok()
    }

    /// Install the driver with the system package manager.
    pub fn install(&self) -> Result<(), MountError> {
        info!(driver = %self.driver, "Installing NTFS driver");

        let mut update = privileged_command(self.use_sudo, "apt-get");
        update.arg("update");
        run(update, "apt-get update")?;

        let mut install = privileged_command(self.use_sudo, "apt-get");
        install.args(["install", "-y", &self.driver]);
        run(install, "apt-get install")?;
        Ok(())
    }
}

fn normalize_device(device: &str) -> Result<String, MountError> {
    let name = device.trim();
    let name = name.strip_prefix("/dev/").unwrap_or(name);
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(MountError::InvalidDevice(device.to_string()));
    }
    Ok(name.to_string())
}

fn dev_path(device: &str) -> PathBuf {
    Path::new("/dev").join(device)
}

fn privileged_command(use_sudo: bool, program: &str) -> Command {
    if use_sudo && !nix::unistd::geteuid().is_root() {
        let mut cmd = Command::new("sudo");
        cmd.arg(program);
        cmd
    } else {
        Command::new(program)
    }
}

fn run(mut cmd: Command, label: &str) -> Result<String, MountError> {
    let output = cmd.output().map_err(|source| MountError::Spawn {
        command: label.to_string(),
        source,
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(MountError::CommandFailed {
            command: label.to_string(),
            detail: if stderr.is_empty() {
                output.status.to_string()
            } else {
                stderr
            },
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
