use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{parse_gib, ConfigLayer, SwapSize};
use crate::types::{Bootloader, Filesystem, GpuDriver, HomeChoice};

/// Credential variable, consulted only for unattended runs.
pub const PASSWORD_ENV: &str = "ARCHSTRAP_PASSWORD";

/// archstrap - Arch Linux workstation installer
///
/// Every flag can also be set through the `ARCHSTRAP_*` variable shown in its
/// help; the flag wins over the variable, the variable over the config file.
#[derive(Parser, Debug)]
#[command(name = "archstrap")]
#[command(about = "Partition, bootstrap and configure an Arch Linux workstation")]
#[command(version)]
pub struct Cli {
    /// Target disk (e.g. /dev/nvme0n1). Asked interactively when unset.
    #[arg(long, global = true, env = "ARCHSTRAP_DISK")]
    pub disk: Option<PathBuf>,

    #[arg(long, global = true, env = "ARCHSTRAP_HOSTNAME")]
    pub hostname: Option<String>,

    #[arg(long, global = true, env = "ARCHSTRAP_USERNAME")]
    pub username: Option<String>,

    /// IANA timezone (e.g. Europe/Berlin). Defaults to the geolocated zone.
    #[arg(long, global = true, env = "ARCHSTRAP_TIMEZONE")]
    pub timezone: Option<String>,

    #[arg(long, global = true, env = "ARCHSTRAP_LOCALE")]
    pub locale: Option<String>,

    #[arg(long, global = true, env = "ARCHSTRAP_KEYMAP")]
    pub keymap: Option<String>,

    /// Root and home filesystem: ext4, btrfs, xfs
    #[arg(long, global = true, env = "ARCHSTRAP_FILESYSTEM")]
    pub filesystem: Option<Filesystem>,

    /// Swap size in GiB, or "auto" (RAM rounded up, at least 8)
    #[arg(long, global = true, env = "ARCHSTRAP_SWAP_SIZE")]
    pub swap_size: Option<SwapSize>,

    /// Root partition size in GiB
    #[arg(long, global = true, env = "ARCHSTRAP_ROOT_SIZE", value_parser = parse_gib)]
    pub root_size: Option<u64>,

    /// EFI system partition size in GiB
    #[arg(long, global = true, env = "ARCHSTRAP_EFI_SIZE", value_parser = parse_gib)]
    pub efi_size: Option<u64>,

    /// Existing home partition: wipe or keep
    #[arg(long, global = true, env = "ARCHSTRAP_HOME")]
    pub home: Option<HomeChoice>,

    /// Two-letter country code for mirror ranking
    #[arg(long, global = true, env = "ARCHSTRAP_MIRROR_COUNTRY")]
    pub mirror_country: Option<String>,

    /// grub or systemd-boot
    #[arg(long, global = true, env = "ARCHSTRAP_BOOTLOADER")]
    pub bootloader: Option<Bootloader>,

    /// auto, nvidia, amd, intel, none
    #[arg(long, global = true, env = "ARCHSTRAP_GPU")]
    pub gpu: Option<GpuDriver>,

    /// Directory with profiles/*.sh and packages/base.txt
    #[arg(long, global = true, env = "ARCHSTRAP_PROFILE_DIR")]
    pub profile_dir: Option<PathBuf>,

    /// Key-value (or .json) configuration file
    #[arg(long, global = true, env = "ARCHSTRAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Never prompt: every input comes from flags, environment or file
    #[arg(long, global = true, env = "ARCHSTRAP_UNATTENDED",
          action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    pub unattended: bool,

    /// Stop after the confirmation summary without touching the disk
    #[arg(long, global = true, env = "ARCHSTRAP_DRY_RUN",
          action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    pub dry_run: bool,

    /// Debug output on stderr
    #[arg(long, global = true, env = "ARCHSTRAP_DEBUG",
          action = ArgAction::SetTrue, value_parser = FalseyValueParser::new())]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the installer (the default)
    Install,
    /// Load, merge and validate a configuration file without side effects
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
    /// Continue inside the installed root (started by the installer itself)
    #[command(hide = true)]
    Resume {
        #[arg(long)]
        envelope: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// The command-line precedence layer. Unset flags stay `None` so lower
    /// layers show through.
    pub fn overrides(&self) -> ConfigLayer {
        ConfigLayer {
            disk: self.disk.clone(),
            hostname: self.hostname.clone(),
            username: self.username.clone(),
            password: None,
            timezone: self.timezone.clone(),
            locale: self.locale.clone(),
            keymap: self.keymap.clone(),
            filesystem: self.filesystem,
            efi_size_gib: self.efi_size,
            swap_size: self.swap_size,
            root_size_gib: self.root_size,
            home: self.home,
            mirror_country: self.mirror_country.clone(),
            bootloader: self.bootloader,
            gpu: self.gpu,
            profile_dir: self.profile_dir.clone(),
            mount_root: None,
            unattended: self.unattended.then_some(true),
            dry_run: self.dry_run.then_some(true),
            debug: self.debug.then_some(true),
        }
    }
}
