//! Partition naming and the concrete devices produced by provisioning.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Device path of partition `index` on `disk`.
///
/// Disks whose name ends in a digit (`nvme0n1`, `mmcblk0`, `loop0`) take a `p`
/// separator: `/dev/nvme0n1p1`. Others append the number: `/dev/sda1`.
/// Every partition path in the crate is derived here.
pub fn partition_path(disk: &Path, index: u32) -> PathBuf {
    let disk_str = disk.display().to_string();
    if disk_str.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", disk_str, index))
    } else {
        PathBuf::from(format!("{}{}", disk_str, index))
    }
}

/// Device paths of the four slots, plus the swap UUID needed for resume.
///
/// Created once, right after partitioning and formatting; read-only after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedDevices {
    pub disk: PathBuf,
    pub efi: PathBuf,
    pub swap: PathBuf,
    pub root: PathBuf,
    pub home: PathBuf,
    /// Filesystem UUID of the swap partition (`resume=UUID=...`)
    pub swap_uuid: String,
    /// The home partition was kept as it was
    pub home_preserved: bool,
}

impl ProvisionedDevices {
    /// Paths for the fixed four-slot layout on `disk`; the UUID is filled in
    /// once swap is formatted.
    pub fn for_disk(disk: &Path, home_preserved: bool) -> Self {
        Self {
            disk: disk.to_path_buf(),
            efi: partition_path(disk, 1),
            swap: partition_path(disk, 2),
            root: partition_path(disk, 3),
            home: partition_path(disk, 4),
            swap_uuid: String::new(),
            home_preserved,
        }
    }
}
