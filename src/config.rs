//! Installation configuration: layers, precedence merge and validation.
//!
//! Configuration is assembled from three layers, lowest precedence first:
//! built-in defaults, the config file, command-line flags (which clap already
//! merged with their `ARCHSTRAP_*` environment variables). Each layer is a
//! [`ConfigLayer`] in which every tunable is optional; [`merge`] picks, per
//! field, the value of the highest layer that sets it. A field is never merged
//! partially.
//!
//! The merged [`InstallConfig`] is completed interactively during the
//! configuring phase and is not modified after the confirmation checkpoint.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{InstallError, Result};
use crate::types::{Bootloader, Filesystem, GpuDriver, HomeChoice};

/// Default EFI system partition size in GiB.
pub const DEFAULT_EFI_GIB: u64 = 1;
/// Default root partition size in GiB.
pub const DEFAULT_ROOT_GIB: u64 = 128;
/// Where the target root is mounted in the live environment.
pub const DEFAULT_MOUNT_ROOT: &str = "/mnt";
/// Directory holding profile scripts and package lists.
pub const DEFAULT_PROFILE_DIR: &str = "/usr/share/archstrap";

/// A credential. Never printed by `Debug` or the confirmation summary.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(********)")
    }
}

/// Swap size: computed from RAM, or an explicit override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapSize {
    #[default]
    Auto,
    Gib(u64),
}

impl FromStr for SwapSize {
    type Err = InstallError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            parse_gib(s).map(Self::Gib)
        }
    }
}

impl fmt::Display for SwapSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Gib(n) => write!(f, "{}G", n),
        }
    }
}

/// Parse a size in GiB: `128`, `128G`, `128GiB`, `128gb`.
pub fn parse_gib(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    let digits = trimmed
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .trim();
    let suffix = trimmed[digits.len()..].trim().to_ascii_lowercase();
    if !matches!(suffix.as_str(), "" | "g" | "gb" | "gib") {
        return Err(InstallError::config(format!(
            "Invalid size '{}': only GiB values are accepted (e.g. 128G)",
            s
        )));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| InstallError::config(format!("Invalid size '{}'", s)))?;
    if value == 0 {
        return Err(InstallError::config(format!("Size '{}' must be greater than zero", s)));
    }
    Ok(value)
}

/// One precedence layer. `None` means "this layer does not set the field".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub disk: Option<PathBuf>,
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub timezone: Option<String>,
    pub locale: Option<String>,
    pub keymap: Option<String>,
    pub filesystem: Option<Filesystem>,
    pub efi_size_gib: Option<u64>,
    pub swap_size: Option<SwapSize>,
    pub root_size_gib: Option<u64>,
    pub home: Option<HomeChoice>,
    pub mirror_country: Option<String>,
    pub bootloader: Option<Bootloader>,
    pub gpu: Option<GpuDriver>,
    pub profile_dir: Option<PathBuf>,
    pub mount_root: Option<PathBuf>,
    pub unattended: Option<bool>,
    pub dry_run: Option<bool>,
    pub debug: Option<bool>,
}

impl ConfigLayer {
    /// The built-in defaults layer.
    pub fn defaults() -> Self {
        Self {
            hostname: Some("archstrap".to_string()),
            username: Some("user".to_string()),
            locale: Some("en_US.UTF-8".to_string()),
            keymap: Some("us".to_string()),
            filesystem: Some(Filesystem::Ext4),
            efi_size_gib: Some(DEFAULT_EFI_GIB),
            swap_size: Some(SwapSize::Auto),
            root_size_gib: Some(DEFAULT_ROOT_GIB),
            bootloader: Some(Bootloader::Grub),
            gpu: Some(GpuDriver::Auto),
            profile_dir: Some(PathBuf::from(DEFAULT_PROFILE_DIR)),
            mount_root: Some(PathBuf::from(DEFAULT_MOUNT_ROOT)),
            unattended: Some(false),
            dry_run: Some(false),
            debug: Some(false),
            ..Self::default()
        }
    }

    /// Put `upper` on top of `self`: every field `upper` sets replaces ours.
    pub fn overlay(self, upper: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            disk: upper.disk.or(self.disk),
            hostname: upper.hostname.or(self.hostname),
            username: upper.username.or(self.username),
            password: upper.password.or(self.password),
            timezone: upper.timezone.or(self.timezone),
            locale: upper.locale.or(self.locale),
            keymap: upper.keymap.or(self.keymap),
            filesystem: upper.filesystem.or(self.filesystem),
            efi_size_gib: upper.efi_size_gib.or(self.efi_size_gib),
            swap_size: upper.swap_size.or(self.swap_size),
            root_size_gib: upper.root_size_gib.or(self.root_size_gib),
            home: upper.home.or(self.home),
            mirror_country: upper.mirror_country.or(self.mirror_country),
            bootloader: upper.bootloader.or(self.bootloader),
            gpu: upper.gpu.or(self.gpu),
            profile_dir: upper.profile_dir.or(self.profile_dir),
            mount_root: upper.mount_root.or(self.mount_root),
            unattended: upper.unattended.or(self.unattended),
            dry_run: upper.dry_run.or(self.dry_run),
            debug: upper.debug.or(self.debug),
        }
    }

    /// Load a config file layer. `.json` files are JSON, anything else is the
    /// flat `KEY=value` format.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            InstallError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).map_err(|e| {
                InstallError::config(format!("Failed to parse {}: {}", path.display(), e))
            })
        } else {
            Self::from_kv_str(&content)
                .map_err(|e| InstallError::config(format!("{}: {}", path.display(), e)))
        }
    }

    /// Parse the flat key-value format.
    pub fn from_kv_str(content: &str) -> Result<Self> {
        let mut layer = Self::default();

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line).trim();

            let (key, value) = line.split_once('=').ok_or_else(|| {
                InstallError::config(format!("line {}: expected KEY=value, got '{}'", line_no, raw.trim()))
            })?;
            let key = key.trim().to_ascii_uppercase();
            let key = key.strip_prefix("ARCHSTRAP_").unwrap_or(&key);
            let value = unquote(value.trim());

            layer
                .set(key, value)
                .map_err(|e| InstallError::config(format!("line {}: {}", line_no, e)))?;
        }

        Ok(layer)
    }

    fn set(&mut self, key: &str, value: &str) -> std::result::Result<(), String> {
        fn parse<T: FromStr>(key: &str, value: &str) -> std::result::Result<T, String> {
            value
                .parse()
                .map_err(|_| format!("invalid value '{}' for {}", value, key))
        }

        match key {
            "DISK" => self.disk = Some(PathBuf::from(value)),
            "HOSTNAME" => self.hostname = Some(value.to_string()),
            "USERNAME" => self.username = Some(value.to_string()),
            "PASSWORD" => self.password = Some(Secret::new(value)),
            "TIMEZONE" => self.timezone = Some(value.to_string()),
            "LOCALE" => self.locale = Some(value.to_string()),
            "KEYMAP" => self.keymap = Some(value.to_string()),
            "FILESYSTEM" => self.filesystem = Some(parse(key, value)?),
            "EFI_SIZE" => self.efi_size_gib = Some(parse_gib(value).map_err(|e| e.to_string())?),
            "SWAP_SIZE" => self.swap_size = Some(value.parse().map_err(|e: InstallError| e.to_string())?),
            "ROOT_SIZE" => self.root_size_gib = Some(parse_gib(value).map_err(|e| e.to_string())?),
            "HOME" => self.home = Some(parse(key, value)?),
            "MIRROR_COUNTRY" => self.mirror_country = Some(value.to_string()),
            "BOOTLOADER" => self.bootloader = Some(parse(key, value)?),
            "GPU" => self.gpu = Some(parse(key, value)?),
            "PROFILE_DIR" => self.profile_dir = Some(PathBuf::from(value)),
            "MOUNT_ROOT" => self.mount_root = Some(PathBuf::from(value)),
            "UNATTENDED" => self.unattended = Some(parse_bool(key, value)?),
            "DRY_RUN" => self.dry_run = Some(parse_bool(key, value)?),
            "DEBUG" => self.debug = Some(parse_bool(key, value)?),
            _ => return Err(format!("unknown key '{}'", key)),
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!("invalid boolean '{}' for {}", value, key)),
    }
}

/// Drop a `#` comment that is not inside quotes.
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (None, '#') => return &line[..i],
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            _ => {}
        }
    }
    line
}

fn unquote(value: &str) -> &str {
    for q in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(q) && value.ends_with(q) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Pure three-layer precedence merge: defaults < file < cli.
pub fn merge(defaults: ConfigLayer, file: ConfigLayer, cli: ConfigLayer) -> InstallConfig {
    InstallConfig::from_layer(defaults.overlay(file).overlay(cli))
}

/// The single source of truth for all tunables of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Target disk. Selected interactively when unset.
    pub disk: Option<PathBuf>,
    pub hostname: String,
    pub username: String,
    /// User and root password. Prompted when unset.
    pub password: Option<Secret>,
    /// IANA timezone. Defaults to the geolocated zone when unset.
    pub timezone: Option<String>,
    pub locale: String,
    pub keymap: String,
    pub filesystem: Filesystem,
    pub efi_size_gib: u64,
    pub swap_size: SwapSize,
    pub root_size_gib: u64,
    /// Wipe-or-keep decision for an existing home partition.
    pub home: Option<HomeChoice>,
    /// Two-letter country code used to filter mirrors.
    pub mirror_country: Option<String>,
    pub bootloader: Bootloader,
    pub gpu: GpuDriver,
    pub profile_dir: PathBuf,
    pub mount_root: PathBuf,
    pub unattended: bool,
    pub dry_run: bool,
    pub debug: bool,
}

impl InstallConfig {
    /// Resolve a merged layer, filling anything left unset with built-ins.
    pub fn from_layer(layer: ConfigLayer) -> Self {
        Self {
            disk: layer.disk,
            hostname: layer.hostname.unwrap_or_else(|| "archstrap".to_string()),
            username: layer.username.unwrap_or_else(|| "user".to_string()),
            password: layer.password.filter(|p| !p.is_empty()),
            timezone: layer.timezone.filter(|t| !t.is_empty()),
            locale: layer.locale.unwrap_or_else(|| "en_US.UTF-8".to_string()),
            keymap: layer.keymap.unwrap_or_else(|| "us".to_string()),
            filesystem: layer.filesystem.unwrap_or_default(),
            efi_size_gib: layer.efi_size_gib.unwrap_or(DEFAULT_EFI_GIB),
            swap_size: layer.swap_size.unwrap_or_default(),
            root_size_gib: layer.root_size_gib.unwrap_or(DEFAULT_ROOT_GIB),
            home: layer.home,
            mirror_country: layer
                .mirror_country
                .map(|c| c.trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty()),
            bootloader: layer.bootloader.unwrap_or_default(),
            gpu: layer.gpu.unwrap_or_default(),
            profile_dir: layer
                .profile_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROFILE_DIR)),
            mount_root: layer
                .mount_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNT_ROOT)),
            unattended: layer.unattended.unwrap_or(false),
            dry_run: layer.dry_run.unwrap_or(false),
            debug: layer.debug.unwrap_or(false),
        }
    }

    /// Validate the configuration values that are already set.
    ///
    /// Fields still unset (disk, password, timezone) are completed during the
    /// configuring phase and checked by [`InstallConfig::validate_complete`].
    pub fn validate(&self) -> Result<()> {
        if let Some(disk) = &self.disk {
            if !disk.starts_with("/dev/") {
                return Err(InstallError::config(format!(
                    "Invalid disk path '{}': must start with /dev/",
                    disk.display()
                )));
            }
        }

        validate_name("Hostname", &self.hostname, |c| {
            c.is_ascii_alphanumeric() || c == '-' || c == '_'
        })?;
        validate_name("Username", &self.username, |c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'
        })?;

        if let Some(password) = &self.password {
            if password.expose().contains(char::is_whitespace) {
                return Err(InstallError::config("Password cannot contain whitespace"));
            }
        }

        if self.locale.trim().is_empty() {
            return Err(InstallError::config("Locale must be specified"));
        }
        if self.keymap.trim().is_empty() {
            return Err(InstallError::config("Keymap must be specified"));
        }
        if self.efi_size_gib == 0 || self.root_size_gib == 0 {
            return Err(InstallError::config("Partition sizes must be greater than zero"));
        }
        if let Some(country) = &self.mirror_country {
            if !is_country_code(country) {
                return Err(InstallError::config(format!(
                    "Mirror country '{}' must be a two-letter code",
                    country
                )));
            }
        }

        Ok(())
    }

    /// Validate that every value required for an installation is present.
    pub fn validate_complete(&self) -> Result<()> {
        self.validate()?;
        if self.disk.is_none() {
            return Err(InstallError::config("Install disk must be specified"));
        }
        if self.password.is_none() {
            return Err(InstallError::config("Password must be specified"));
        }
        if self.timezone.is_none() {
            return Err(InstallError::config("Timezone must be specified"));
        }
        Ok(())
    }

    /// Environment handed to profile scripts and feature modules.
    ///
    /// The password is deliberately absent.
    pub fn to_env_vars(&self) -> Vec<(String, String)> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        vec![
            (
                "ARCHSTRAP_DISK".to_string(),
                self.disk.as_ref().map(|d| d.display().to_string()).unwrap_or_default(),
            ),
            ("ARCHSTRAP_HOSTNAME".to_string(), self.hostname.clone()),
            ("ARCHSTRAP_USERNAME".to_string(), self.username.clone()),
            ("ARCHSTRAP_TIMEZONE".to_string(), opt(&self.timezone)),
            ("ARCHSTRAP_LOCALE".to_string(), self.locale.clone()),
            ("ARCHSTRAP_KEYMAP".to_string(), self.keymap.clone()),
            ("ARCHSTRAP_FILESYSTEM".to_string(), self.filesystem.to_string()),
            ("ARCHSTRAP_SWAP_SIZE".to_string(), self.swap_size.to_string()),
            ("ARCHSTRAP_ROOT_SIZE".to_string(), format!("{}G", self.root_size_gib)),
            ("ARCHSTRAP_MIRROR_COUNTRY".to_string(), opt(&self.mirror_country)),
            ("ARCHSTRAP_BOOTLOADER".to_string(), self.bootloader.to_string()),
            ("ARCHSTRAP_GPU".to_string(), self.gpu.to_string()),
            (
                "ARCHSTRAP_UNATTENDED".to_string(),
                if self.unattended { "1" } else { "0" }.to_string(),
            ),
        ]
    }
}

/// Exactly two ASCII uppercase letters.
pub fn is_country_code(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_uppercase())
}

fn validate_name(label: &str, value: &str, allowed: impl Fn(char) -> bool) -> Result<()> {
    let value = value.trim();
    if value.is_empty() {
        return Err(InstallError::config(format!("{} must be specified", label)));
    }
    if value.len() < 3 || value.len() > 32 {
        return Err(InstallError::config(format!("{} must be 3-32 characters long", label)));
    }
    if !value.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return Err(InstallError::config(format!("{} must start with a letter", label)));
    }
    if !value.chars().all(allowed) {
        return Err(InstallError::config(format!("{} contains invalid characters", label)));
    }
    Ok(())
}
