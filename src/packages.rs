//! Package resolution for the base install.
//!
//! Translates configuration choices into the package set handed to
//! `pacstrap`. Output is deduplicated and sorted so the install command is
//! deterministic.

use std::fs;
use std::path::Path;

use crate::config::InstallConfig;
use crate::error::{InstallError, Result};
use crate::runner::{Invocation, Runner};
use crate::types::{Bootloader, GpuDriver};

/// Always installed.
pub const BASE_PACKAGES: &[&str] = &[
    "base",
    "base-devel",
    "linux",
    "linux-headers",
    "linux-firmware",
    "networkmanager",
    "iwd",
    "sudo",
    "vim",
    "git",
];

pub mod gpu_packages {
    pub const NVIDIA: &[&str] = &["nvidia", "nvidia-utils", "nvidia-settings"];
    pub const AMD: &[&str] = &["mesa", "xf86-video-amdgpu", "vulkan-radeon"];
    pub const INTEL: &[&str] = &["mesa", "vulkan-intel", "intel-media-driver"];
    /// No recognised GPU
    pub const GENERIC: &[&str] = &["mesa"];
}

pub mod bootloader_packages {
    pub const GRUB: &[&str] = &["grub", "efibootmgr", "os-prober"];
    /// Part of systemd
    pub const SYSTEMD_BOOT: &[&str] = &[];
}

/// Split a package-list file: one identifier per line, `#` comments
/// (full-line or inline) and blank lines dropped.
pub fn parse_package_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn load_package_list(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|e| {
        InstallError::config(format!("Failed to read package list {}: {}", path.display(), e))
    })?;
    Ok(parse_package_list(&text))
}

/// GPU vendor from `lspci` display controller lines.
pub fn detect_gpu(lspci: &str) -> GpuDriver {
    let display_lines = lspci.lines().filter(|l| {
        l.contains("VGA compatible controller") || l.contains("3D controller") || l.contains("Display controller")
    });
    let mut found = GpuDriver::None;
    for line in display_lines {
        let line = line.to_ascii_lowercase();
        // A discrete NVIDIA card wins over an integrated GPU
        if line.contains("nvidia") {
            return GpuDriver::Nvidia;
        }
        if line.contains("amd") || line.contains("ati technologies") || line.contains("radeon") {
            found = GpuDriver::Amd;
        } else if line.contains("intel") && found == GpuDriver::None {
            found = GpuDriver::Intel;
        }
    }
    found
}

/// Resolve `Auto` by scanning the PCI bus. A failed scan means no GPU packages.
pub fn resolve_gpu(choice: GpuDriver, runner: &dyn Runner) -> GpuDriver {
    if choice != GpuDriver::Auto {
        return choice;
    }
    let detected = match runner.run(&Invocation::new("lspci")) {
        Ok(out) if out.success() => detect_gpu(&out.stdout),
        _ => GpuDriver::None,
    };
    tracing::info!(gpu = %detected, "GPU detected");
    detected
}

fn gpu_package_set(gpu: GpuDriver) -> &'static [&'static str] {
    match gpu {
        GpuDriver::Nvidia => gpu_packages::NVIDIA,
        GpuDriver::Amd => gpu_packages::AMD,
        GpuDriver::Intel => gpu_packages::INTEL,
        GpuDriver::Auto | GpuDriver::None => gpu_packages::GENERIC,
    }
}

/// Everything `pacstrap` installs.
///
/// `gpu` must already be resolved (see [`resolve_gpu`]); `extra` is the
/// content of the profile's `packages/base.txt`, if any.
pub fn resolve_packages(config: &InstallConfig, gpu: GpuDriver, extra: &[String]) -> Vec<String> {
    let mut packages: Vec<String> = BASE_PACKAGES.iter().map(|s| s.to_string()).collect();

    packages.extend(gpu_package_set(gpu).iter().map(|s| s.to_string()));

    let boot = match config.bootloader {
        Bootloader::Grub => bootloader_packages::GRUB,
        Bootloader::SystemdBoot => bootloader_packages::SYSTEMD_BOOT,
    };
    packages.extend(boot.iter().map(|s| s.to_string()));
    packages.push(config.filesystem.tools_package().to_string());
    packages.push("dosfstools".to_string());
    packages.extend(extra.iter().cloned());

    packages.sort();
    packages.dedup();
    packages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{merge, ConfigLayer};
    use crate::runner::{CommandOutput, RecordingRunner};
    use crate::types::Filesystem;

    fn config() -> InstallConfig {
        merge(ConfigLayer::defaults(), ConfigLayer::default(), ConfigLayer::default())
    }

    #[test]
    fn test_parse_package_list() {
        let text = "\
# editors
neovim
  htop   # monitor

firefox#browser
   # indented comment
";
        assert_eq!(parse_package_list(text), vec!["neovim", "htop", "firefox"]);
    }

    #[test]
    fn test_load_package_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.txt");
        fs::write(&path, "tmux\n").unwrap();
        assert_eq!(load_package_list(&path).unwrap(), vec!["tmux"]);
        assert!(load_package_list(&dir.path().join("missing.txt")).is_err());
    }

    #[test]
    fn test_detect_gpu() {
        let hybrid = "\
00:02.0 VGA compatible controller: Intel Corporation UHD Graphics 630
01:00.0 3D controller: NVIDIA Corporation TU117M [GeForce GTX 1650 Mobile]
";
        assert_eq!(detect_gpu(hybrid), GpuDriver::Nvidia);
        assert_eq!(
            detect_gpu("06:00.0 VGA compatible controller: Advanced Micro Devices, Inc. [AMD/ATI] Navi 22"),
            GpuDriver::Amd
        );
        assert_eq!(
            detect_gpu("00:02.0 VGA compatible controller: Intel Corporation Iris Xe"),
            GpuDriver::Intel
        );
        assert_eq!(detect_gpu("00:02.0 Network controller: Intel Corporation AX200"), GpuDriver::None);
    }

    #[test]
    fn test_resolve_gpu_auto_scans() {
        let runner = RecordingRunner::new();
        runner.respond(
            "lspci",
            None,
            CommandOutput::ok("00:02.0 VGA compatible controller: Intel Corporation Iris Xe\n"),
        );
        assert_eq!(resolve_gpu(GpuDriver::Auto, &runner), GpuDriver::Intel);
        assert_eq!(resolve_gpu(GpuDriver::Amd, &runner), GpuDriver::Amd);
        assert_eq!(runner.calls_to("lspci").len(), 1);
    }

    #[test]
    fn test_resolve_packages() {
        let mut config = config();
        config.filesystem = Filesystem::Btrfs;
        let packages = resolve_packages(&config, GpuDriver::Nvidia, &["tmux".to_string(), "git".to_string()]);

        for expected in ["base", "linux", "grub", "nvidia", "btrfs-progs", "tmux"] {
            assert!(packages.contains(&expected.to_string()), "missing {}", expected);
        }
        assert_eq!(packages.iter().filter(|p| *p == "git").count(), 1);
        let mut sorted = packages.clone();
        sorted.sort();
        assert_eq!(packages, sorted);
    }

    #[test]
    fn test_systemd_boot_has_no_grub() {
        let mut config = config();
        config.bootloader = Bootloader::SystemdBoot;
        let packages = resolve_packages(&config, GpuDriver::None, &[]);
        assert!(!packages.contains(&"grub".to_string()));
        assert!(packages.contains(&"mesa".to_string()));
    }
}
