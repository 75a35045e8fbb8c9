//! Type-safe configuration types for archstrap
//!
//! Stringly-typed tunables are parsed into these enums once, at the config
//! boundary, so the rest of the installer can match exhaustively.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Filesystem used for the root and home partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Filesystem {
    #[default]
    Ext4,
    Btrfs,
    Xfs,
}

impl Filesystem {
    /// The mkfs program that creates this filesystem.
    pub fn mkfs_program(self) -> &'static str {
        match self {
            Self::Ext4 => "mkfs.ext4",
            Self::Btrfs => "mkfs.btrfs",
            Self::Xfs => "mkfs.xfs",
        }
    }

    /// Flag that makes the mkfs program overwrite an existing signature.
    pub fn force_flag(self) -> &'static str {
        match self {
            Self::Ext4 => "-F",
            Self::Btrfs | Self::Xfs => "-f",
        }
    }

    /// Userspace tools package needed in the installed system.
    pub fn tools_package(self) -> &'static str {
        match self {
            Self::Ext4 => "e2fsprogs",
            Self::Btrfs => "btrfs-progs",
            Self::Xfs => "xfsprogs",
        }
    }
}

/// Bootloader selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(ascii_case_insensitive)]
pub enum Bootloader {
    #[default]
    #[strum(serialize = "grub")]
    Grub,
    #[strum(serialize = "systemd-boot")]
    SystemdBoot,
}

/// GPU driver selection. `Auto` resolves by PCI vendor at package time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum GpuDriver {
    #[default]
    Auto,
    Nvidia,
    Amd,
    Intel,
    None,
}

/// What to do with an existing home partition (slot 4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum HomeChoice {
    /// Recreate and format the home partition
    #[default]
    Wipe,
    /// Keep the existing home partition untouched
    Keep,
}

impl HomeChoice {
    pub fn preserves(self) -> bool {
        matches!(self, Self::Keep)
    }
}
