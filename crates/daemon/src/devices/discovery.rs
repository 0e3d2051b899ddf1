//! Removable block-device discovery.
//!
//! [`DeviceDiscovery`] holds the classification rules; the raw facts
//! (block devices, sysfs attributes, `/dev/disk/by-id` links) come from a
//! [`DeviceProvider`]. [`LsblkProvider`] is the production provider.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, warn};

/// Columns requested from `lsblk`.
const LSBLK_COLUMNS: &str = "NAME,FSTYPE,SIZE,MOUNTPOINT,LABEL,TYPE,TRAN";

/// Errors from the device provider. They never escape [`DeviceDiscovery`].
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// An external command could not be run.
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// An external command exited unsuccessfully.
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// A directory or attribute could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a disk is attached to the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Transport {
    Usb,
    Sata,
    /// Any other transport reported by the kernel (`nvme`, `mmc`, ...).
    Other(String),
    /// Nothing reported.
    Unknown,
}

impl Transport {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" => Transport::Unknown,
            "usb" => Transport::Usb,
            "sata" => Transport::Sata,
            other => Transport::Other(other.to_string()),
        }
    }

    /// Whether this transport alone marks a partition as external storage.
    pub fn is_external(&self) -> bool {
        matches!(self, Transport::Usb | Transport::Sata)
    }
}

impl Serialize for Transport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Transport::Unknown => serializer.serialize_none(),
            other => serializer.collect_str(other),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Usb => f.write_str("usb"),
            Transport::Sata => f.write_str("sata"),
            Transport::Other(name) => f.write_str(name),
            Transport::Unknown => f.write_str("-"),
        }
    }
}

/// A block device or partition as reported by the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    /// Kernel device name (`sdb1`), without `/dev/`.
    pub name: String,
    /// Device node class (`disk`, `part`, `rom`, ...).
    pub kind: String,
    /// Transport of the device or, for partitions, of its parent disk.
    pub transport: Transport,
    /// Filesystem type, if one was detected.
    pub fs_type: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Where the device is currently mounted, if anywhere.
    pub mount_point: Option<PathBuf>,
    /// Filesystem label.
    pub label: Option<String>,
    /// Classified as removable/external storage.
    pub removable: bool,
}

impl BlockDevice {
    /// Whether this entry is a partition.
    pub fn is_partition(&self) -> bool {
        self.kind == "part"
    }

    /// Path of the device node.
    pub fn dev_path(&self) -> PathBuf {
        Path::new("/dev").join(&self.name)
    }

    /// One-line human-readable summary for operator listings.
    pub fn display_line(&self) -> String {
        format!(
            "{:<10} {:<8} {:>10}  {:<6} {:<16} {}",
            self.name,
            self.fs_type.as_deref().unwrap_or("-"),
            crate::files::browser::format_size(self.size),
            self.transport.to_string(),
            self.label.as_deref().unwrap_or("-"),
            self.mount_point
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(not mounted)".to_string()),
        )
    }
}

/// Source of raw block-device facts.
pub trait DeviceProvider: Send + Sync {
    /// All block devices and partitions.
    fn block_devices(&self) -> Result<Vec<BlockDevice>, DiscoveryError>;

    /// Disks that sit under the kernel's USB device tree with `removable` = 1.
    fn usb_removable_disks(&self) -> Result<HashSet<String>, DiscoveryError>;

    /// The `removable` attribute of a disk, if present and readable.
    fn removable_attribute(&self, disk: &str) -> Option<bool>;

    /// Partition names behind USB-tagged `/dev/disk/by-id` links.
    fn usb_partition_links(&self) -> Result<Vec<String>, DiscoveryError>;

    /// Details of a single device.
    fn describe(&self, name: &str) -> Result<Option<BlockDevice>, DiscoveryError>;
}

/// Lists removable storage candidates.
pub struct DeviceDiscovery<P> {
    provider: P,
}

impl<P: DeviceProvider> DeviceDiscovery<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Removable/external partitions currently attached.
    ///
    /// Never fails: enumeration problems are logged and yield an empty (or
    /// partial) list.
    pub fn list_candidates(&self) -> Vec<BlockDevice> {
        let candidates = match self.primary_candidates() {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "block device enumeration failed");
                Vec::new()
            }
        };

        if !candidates.is_empty() {
            return candidates;
        }

        debug!("no candidates from block device list, trying by-id links");
        match self.fallback_candidates() {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "by-id device scan failed");
                Vec::new()
            }
        }
    }

    fn primary_candidates(&self) -> Result<Vec<BlockDevice>, DiscoveryError> {
        let devices = self.provider.block_devices()?;
        let usb_disks = self.provider.usb_removable_disks().unwrap_or_else(|e| {
            debug!(error = %e, "usb device tree scan failed");
            HashSet::new()
        });

        let mut candidates = Vec::new();
        for mut device in devices.into_iter().filter(BlockDevice::is_partition) {
            let disk = parent_disk(&device.name);
            let external = usb_disks.contains(disk)
                || device.transport.is_external()
                || self.provider.removable_attribute(disk) == Some(true);

            if external {
                device.removable = true;
                candidates.push(device);
            }
        }
        Ok(candidates)
    }

    fn fallback_candidates(&self) -> Result<Vec<BlockDevice>, DiscoveryError> {
        let mut candidates = Vec::new();
        for name in self.provider.usb_partition_links()? {
            match self.provider.describe(&name) {
                Ok(Some(mut device)) => {
                    device.removable = true;
                    if device.transport == Transport::Unknown {
                        device.transport = Transport::Usb;
                    }
                    candidates.push(device);
                }
                Ok(None) => {}
                Err(e) => debug!(device = %name, error = %e, "cannot describe device"),
            }
        }
        Ok(candidates)
    }
}

/// The disk a partition belongs to (`sdb1` → `sdb`, `nvme0n1p2` → `nvme0n1`).
///
/// Names without a trailing partition number are returned unchanged.
pub fn parent_disk(name: &str) -> &str {
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() == name.len() || trimmed.is_empty() {
        return name;
    }
    match trimmed.strip_suffix('p') {
        Some(base) if base.ends_with(|c: char| c.is_ascii_digit()) => base,
        _ => trimmed,
    }
}

/// Parse `lsblk -P` output (`KEY="value"` pairs, one device per line).
///
/// Partitions that report no transport inherit their parent disk's.
pub fn parse_lsblk_pairs(output: &str) -> Vec<BlockDevice> {
    let mut devices: Vec<BlockDevice> = output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields = parse_pairs(line);
            let name = fields.get("NAME")?.clone();
            if name.is_empty() {
                return None;
            }
            let non_empty = |key: &str| fields.get(key).filter(|v| !v.is_empty()).cloned();

            Some(BlockDevice {
                name,
                kind: fields.get("TYPE").cloned().unwrap_or_default(),
                transport: Transport::parse(fields.get("TRAN").map(String::as_str).unwrap_or("")),
                fs_type: non_empty("FSTYPE").map(|v| v.to_ascii_lowercase()),
                size: fields
                    .get("SIZE")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0),
                mount_point: non_empty("MOUNTPOINT").map(PathBuf::from),
                label: non_empty("LABEL"),
                removable: false,
            })
        })
        .collect();

    let disk_transport: HashMap<String, Transport> = devices
        .iter()
        .filter(|d| d.transport != Transport::Unknown)
        .map(|d| (d.name.clone(), d.transport.clone()))
        .collect();

    for device in devices.iter_mut().filter(|d| d.transport == Transport::Unknown) {
        if let Some(transport) = disk_transport.get(parent_disk(&device.name)) {
            device.transport = transport.clone();
        }
    }

    devices
}

fn parse_pairs(line: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut rest = line.trim();

    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim().to_string();
        let after = &rest[eq + 2..];
        let Some(close) = after.find('"') else {
            break;
        };
        fields.insert(key, unescape(&after[..close]));
        rest = after[close + 1..].trim_start();
    }
    fields
}

/// Decode the `\xNN` escapes lsblk uses for spaces and quotes.
fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
            let hi = bytes.get(i + 2).copied().and_then(hex_digit);
            let lo = bytes.get(i + 3).copied().and_then(hex_digit);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push(hi << 4 | lo);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Production provider backed by `lsblk`, `/sys` and `/dev/disk/by-id`.
#[derive(Debug, Clone)]
pub struct LsblkProvider {
    sys_block: PathBuf,
    by_id: PathBuf,
}

impl Default for LsblkProvider {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
            by_id: PathBuf::from("/dev/disk/by-id"),
        }
    }
}

impl LsblkProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn run_lsblk(&self, device: Option<&str>) -> Result<String, DiscoveryError> {
        let mut cmd = Command::new("lsblk");
        cmd.args(["-P", "-b", "-o", LSBLK_COLUMNS]);
        if let Some(device) = device {
            cmd.arg(Path::new("/dev").join(device));
        }

        let output = cmd.output().map_err(|source| DiscoveryError::Spawn {
            command: "lsblk".to_string(),
            source,
        })?;
        if !output.status.success() {
            return Err(DiscoveryError::CommandFailed {
                command: "lsblk".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DeviceProvider for LsblkProvider {
    fn block_devices(&self) -> Result<Vec<BlockDevice>, DiscoveryError> {
        Ok(parse_lsblk_pairs(&self.run_lsblk(None)?))
    }

    fn usb_removable_disks(&self) -> Result<HashSet<String>, DiscoveryError> {
        let entries = fs::read_dir(&self.sys_block).map_err(|source| DiscoveryError::Read {
            path: self.sys_block.clone(),
            source,
        })?;

        let mut disks = HashSet::new();
        for entry in entries.flatten() {
            // /sys/block/<disk> links into /sys/devices; USB disks sit under a usb bus node
            let Ok(real) = fs::canonicalize(entry.path()) else {
                continue;
            };
            let under_usb = real
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with("usb"));
            if under_usb && read_flag(&entry.path().join("removable")) == Some(true) {
                disks.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(disks)
    }

    fn removable_attribute(&self, disk: &str) -> Option<bool> {
        read_flag(&self.sys_block.join(disk).join("removable"))
    }

    fn usb_partition_links(&self) -> Result<Vec<String>, DiscoveryError> {
        let entries = fs::read_dir(&self.by_id).map_err(|source| DiscoveryError::Read {
            path: self.by_id.clone(),
            source,
        })?;

        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.starts_with("usb-") && name.contains("-part")
            })
            .filter_map(|entry| fs::canonicalize(entry.path()).ok())
            .filter_map(|real| real.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn describe(&self, name: &str) -> Result<Option<BlockDevice>, DiscoveryError> {
        let output = self.run_lsblk(Some(name))?;
        Ok(parse_lsblk_pairs(&output)
            .into_iter()
            .find(|device| device.name == name))
    }
}

fn read_flag(path: &Path) -> Option<bool> {
    fs::read_to_string(path).ok().map(|v| v.trim() == "1")
}
