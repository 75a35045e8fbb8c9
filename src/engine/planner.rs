//! Disk layout planning.
//!
//! Computes the partition layout for the target disk from its path, the
//! machine's RAM, and the wipe-or-keep decision for an existing home
//! partition. Always exactly four slots, in this order:
//!
//! ```text
//! 1  EFI   configured size (default 1 GiB)   ef00
//! 2  swap  max(8, ceil(RAM in GiB)) GiB      8200
//! 3  root  configured size (default 128 GiB) 8304
//! 4  home  remainder of the disk             8302
//! ```
//!
//! # Design
//!
//! - **Pure logic**: No I/O. Facts about the disk are passed in.
//! - **No capacity check**: an undersized disk fails at `sgdisk` time.
//! - **Preserve**: slots 1-3 are recreated, slot 4 is left alone and must
//!   already exist.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{InstallConfig, SwapSize};
use crate::engine::devices::partition_path;
use crate::error::{InstallError, Result};
use crate::types::{Filesystem, HomeChoice};

pub const GIB: u64 = 1 << 30;
/// Smallest swap partition, in GiB.
pub const MIN_SWAP_GIB: u64 = 8;
/// Space GPT keeps for itself: 1 MiB alignment up front, backup table at the end.
pub const GPT_RESERVED_BYTES: u64 = 2 << 20;

/// What a slot is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRole {
    Efi,
    Swap,
    Root,
    Home,
}

impl PartitionRole {
    /// Slot number on the disk.
    pub fn index(self) -> u32 {
        match self {
            Self::Efi => 1,
            Self::Swap => 2,
            Self::Root => 3,
            Self::Home => 4,
        }
    }

    /// `sgdisk` type code.
    pub fn type_code(self) -> &'static str {
        match self {
            Self::Efi => "ef00",
            Self::Swap => "8200",
            Self::Root => "8304",
            Self::Home => "8302",
        }
    }

    /// GPT partition name.
    pub fn label(self) -> &'static str {
        match self {
            Self::Efi => "EFI",
            Self::Swap => "swap",
            Self::Root => "root",
            Self::Home => "home",
        }
    }
}

/// Requested size of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionSize {
    Gib(u64),
    /// Whatever is left after the fixed-size slots
    Remainder,
}

impl fmt::Display for PartitionSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gib(n) => write!(f, "{} GiB", n),
            Self::Remainder => write!(f, "remainder"),
        }
    }
}

/// One slot of the layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub index: u32,
    pub role: PartitionRole,
    pub size: PartitionSize,
    pub type_code: String,
    pub label: String,
}

impl PartitionSpec {
    fn new(role: PartitionRole, size: PartitionSize) -> Self {
        Self {
            index: role.index(),
            role,
            size,
            type_code: role.type_code().to_string(),
            label: role.label().to_string(),
        }
    }
}

/// The partition table mutation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLayoutPlan {
    pub disk: PathBuf,
    /// Always four entries: EFI, swap, root, home
    pub partitions: Vec<PartitionSpec>,
    /// Slot 4 is excluded from every mutation
    pub preserve_existing: bool,
    /// Filesystem for root (and home when it is recreated)
    pub filesystem: Filesystem,
}

impl DiskLayoutPlan {
    /// Slots that get deleted, recreated and formatted.
    pub fn mutated(&self) -> impl Iterator<Item = &PartitionSpec> {
        self.partitions
            .iter()
            .filter(move |p| !(self.preserve_existing && p.role == PartitionRole::Home))
    }

    pub fn spec(&self, role: PartitionRole) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.role == role)
    }

    pub fn device(&self, role: PartitionRole) -> PathBuf {
        partition_path(&self.disk, role.index())
    }

    /// Bytes claimed by the fixed-size slots.
    pub fn fixed_bytes(&self) -> u64 {
        self.partitions
            .iter()
            .filter_map(|p| match p.size {
                PartitionSize::Gib(n) => Some(n.saturating_mul(GIB)),
                PartitionSize::Remainder => None,
            })
            .fold(0, u64::saturating_add)
    }

    /// Concrete byte size of each slot on a disk of `disk_bytes`. The
    /// remainder slot gets what is left after GPT's own reservation, or 0.
    pub fn resolved_sizes(&self, disk_bytes: u64) -> Vec<u64> {
        let remainder =
            disk_bytes.saturating_sub(self.fixed_bytes().saturating_add(GPT_RESERVED_BYTES));
        self.partitions
            .iter()
            .map(|p| match p.size {
                PartitionSize::Gib(n) => n.saturating_mul(GIB),
                PartitionSize::Remainder => remainder,
            })
            .collect()
    }

    /// Multi-line description for the confirmation summary.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Disk layout for {}:", self.disk.display())];
        for p in &self.partitions {
            let action = if self.preserve_existing && p.role == PartitionRole::Home {
                "keep"
            } else {
                "create"
            };
            lines.push(format!(
                "  {} {:<5} {:<10} {}",
                self.device(p.role).display(),
                p.label,
                p.size.to_string(),
                action
            ));
        }
        lines.join("\n")
    }
}

/// Inputs to [`plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub disk: PathBuf,
    pub ram_bytes: u64,
    pub efi_gib: u64,
    pub root_gib: u64,
    pub swap: SwapSize,
    pub filesystem: Filesystem,
    /// Slot 4 already exists on the disk
    pub existing_partition4: bool,
    /// Resolved wipe-or-keep decision
    pub home: HomeChoice,
}

impl PlanRequest {
    pub fn from_config(
        config: &InstallConfig,
        disk: &Path,
        ram_bytes: u64,
        existing_partition4: bool,
        home: HomeChoice,
    ) -> Self {
        Self {
            disk: disk.to_path_buf(),
            ram_bytes,
            efi_gib: config.efi_size_gib,
            root_gib: config.root_size_gib,
            swap: config.swap_size,
            filesystem: config.filesystem,
            existing_partition4,
            home,
        }
    }
}

/// Swap size in GiB: the override, or RAM rounded up to whole GiB with a
/// floor of [`MIN_SWAP_GIB`].
pub fn swap_size_gib(ram_bytes: u64, swap: SwapSize) -> u64 {
    match swap {
        SwapSize::Gib(n) => n,
        SwapSize::Auto => ram_bytes.div_ceil(GIB).max(MIN_SWAP_GIB),
    }
}

/// Outcome of resolving the wipe-or-keep question before planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomeDecision {
    Resolved(HomeChoice),
    /// A home partition exists and nobody said what to do with it: ask.
    Ask,
}

/// Decide whether the wipe-or-keep question needs asking.
pub fn resolve_home(existing_partition4: bool, choice: Option<HomeChoice>) -> HomeDecision {
    match (choice, existing_partition4) {
        (Some(choice), _) => HomeDecision::Resolved(choice),
        (None, true) => HomeDecision::Ask,
        (None, false) => HomeDecision::Resolved(HomeChoice::Wipe),
    }
}

/// Compute the layout. Keeping a home partition that does not exist is an
/// invalid plan.
pub fn plan(request: &PlanRequest) -> Result<DiskLayoutPlan> {
    if !request.disk.starts_with("/dev/") {
        return Err(InstallError::config(format!(
            "Invalid disk path '{}': must start with /dev/",
            request.disk.display()
        )));
    }
    if request.efi_gib == 0 || request.root_gib == 0 {
        return Err(InstallError::config("Partition sizes must be greater than zero"));
    }

    let preserve_existing = request.home.preserves();
    if preserve_existing && !request.existing_partition4 {
        return Err(InstallError::config(format!(
            "Cannot keep home: {} does not exist",
            partition_path(&request.disk, PartitionRole::Home.index()).display()
        )));
    }

    let swap_gib = swap_size_gib(request.ram_bytes, request.swap);
    let partitions = vec![
        PartitionSpec::new(PartitionRole::Efi, PartitionSize::Gib(request.efi_gib)),
        PartitionSpec::new(PartitionRole::Swap, PartitionSize::Gib(swap_gib)),
        PartitionSpec::new(PartitionRole::Root, PartitionSize::Gib(request.root_gib)),
        PartitionSpec::new(PartitionRole::Home, PartitionSize::Remainder),
    ];

    let plan = DiskLayoutPlan {
        disk: request.disk.clone(),
        partitions,
        preserve_existing,
        filesystem: request.filesystem,
    };
    tracing::debug!(
        disk = %plan.disk.display(),
        swap_gib,
        preserve = preserve_existing,
        "disk layout planned"
    );
    Ok(plan)
}
