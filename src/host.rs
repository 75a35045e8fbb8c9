//! Live-environment facts read from sysfs, procfs and the timezone database.
//!
//! The roots are held in [`HostPaths`] so every read can be pointed at a
//! fixture tree.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{InstallError, Result};

/// Environment variable that skips the root check (development only).
pub const SKIP_ROOT_CHECK_ENV: &str = "ARCHSTRAP_SKIP_ROOT_CHECK";

/// Block device name prefixes that are never installation targets.
const VIRTUAL_DEVICE_PREFIXES: &[&str] = &["loop", "ram", "zram", "sr", "dm-", "md", "fd", "nbd"];

/// Firmware the live environment booted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareMode {
    Uefi,
    Bios,
}

impl FirmwareMode {
    pub fn is_uefi(self) -> bool {
        matches!(self, Self::Uefi)
    }
}

impl fmt::Display for FirmwareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uefi => write!(f, "UEFI"),
            Self::Bios => write!(f, "BIOS"),
        }
    }
}

/// A whole-disk block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Device node, e.g. `/dev/nvme0n1`
    pub path: PathBuf,
    pub size_bytes: u64,
    pub model: Option<String>,
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.path.display(),
            format_size(self.size_bytes)
        )?;
        if let Some(model) = &self.model {
            write!(f, " {}", model)?;
        }
        Ok(())
    }
}

/// Human-readable size in GiB with one decimal.
pub fn format_size(bytes: u64) -> String {
    format!("{:.1} GiB", bytes as f64 / (1u64 << 30) as f64)
}

/// Filesystem roots for host detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub sys: PathBuf,
    pub proc: PathBuf,
    pub dev: PathBuf,
    pub zoneinfo: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            sys: PathBuf::from("/sys"),
            proc: PathBuf::from("/proc"),
            dev: PathBuf::from("/dev"),
            zoneinfo: PathBuf::from("/usr/share/zoneinfo"),
        }
    }
}

impl HostPaths {
    /// All four roots under one directory (`<root>/sys`, `<root>/proc`, ...).
    pub fn under(root: &Path) -> Self {
        Self {
            sys: root.join("sys"),
            proc: root.join("proc"),
            dev: root.join("dev"),
            zoneinfo: root.join("usr/share/zoneinfo"),
        }
    }

    /// Total memory from `MemTotal` in `meminfo`.
    pub fn ram_bytes(&self) -> Result<u64> {
        let path = self.proc.join("meminfo");
        let content = fs::read_to_string(&path)?;
        content
            .lines()
            .find_map(|line| {
                let rest = line.strip_prefix("MemTotal:")?;
                let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
                Some(kib * 1024)
            })
            .ok_or_else(|| InstallError::preflight(format!("MemTotal missing from {}", path.display())))
    }

    pub fn firmware_mode(&self) -> FirmwareMode {
        if self.sys.join("firmware/efi").exists() {
            FirmwareMode::Uefi
        } else {
            FirmwareMode::Bios
        }
    }

    /// Whole disks that can be installation targets, sorted by name.
    pub fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        let mut devices = Vec::new();
        for entry in fs::read_dir(self.sys.join("block"))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if VIRTUAL_DEVICE_PREFIXES.iter().any(|p| name.starts_with(p)) {
                continue;
            }
            let size_bytes = read_sectors(&entry.path().join("size")).unwrap_or(0);
            if size_bytes == 0 {
                continue;
            }
            let model = fs::read_to_string(entry.path().join("device/model"))
                .ok()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty());
            devices.push(BlockDevice {
                path: PathBuf::from("/dev").join(&name),
                size_bytes,
                model,
            });
        }
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }

    /// Capacity of `disk` in bytes.
    pub fn disk_size_bytes(&self, disk: &Path) -> Result<u64> {
        let name = device_name(disk)?;
        let path = self.sys.join("block").join(name).join("size");
        read_sectors(&path).ok_or_else(|| {
            InstallError::preflight(format!("Cannot read size of {}", disk.display()))
        })
    }

    /// True if `partition` is a partition the kernel knows about.
    pub fn partition_exists(&self, partition: &Path) -> bool {
        device_name(partition)
            .map(|name| self.sys.join("class/block").join(name).join("partition").is_file())
            .unwrap_or(false)
    }

    /// True if the device node for `path` is present.
    pub fn device_node_exists(&self, path: &Path) -> bool {
        device_name(path)
            .map(|name| self.dev.join(name).exists())
            .unwrap_or(false)
    }

    /// Network interfaces with a `wireless` directory, sorted.
    pub fn wireless_interfaces(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.sys.join("class/net")) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join("wireless").is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    /// True if `name` is an entry in the timezone database.
    pub fn timezone_exists(&self, name: &str) -> bool {
        let relative = Path::new(name);
        if name.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return false;
        }
        self.zoneinfo.join(relative).is_file()
    }

    /// sysfs directory of a PCI device.
    pub fn pci_device_dir(&self, address: &str) -> PathBuf {
        self.sys.join("bus/pci/devices").join(address)
    }

    pub fn pci_rescan_path(&self) -> PathBuf {
        self.sys.join("bus/pci/rescan")
    }
}

/// `/dev/nvme0n1p2` -> `nvme0n1p2`
fn device_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| InstallError::config(format!("Invalid device path {}", path.display())))
}

/// sysfs `size` files count 512-byte sectors.
fn read_sectors(path: &Path) -> Option<u64> {
    fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|sectors| sectors * 512)
}

/// Effective UID is 0, or the skip variable is set.
pub fn is_root() -> bool {
    if std::env::var_os(SKIP_ROOT_CHECK_ENV).is_some() {
        tracing::warn!("{} is set, skipping root check", SKIP_ROOT_CHECK_ENV);
        return true;
    }
    nix::unistd::geteuid().is_root()
}
