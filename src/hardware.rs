//! Preflight checks of the live environment.
//!
//! Checks run in a fixed order and each depends on the ones before it (the
//! keyring refresh needs the network, the network needs root to reset
//! drivers). The probe therefore stops at the first fatal result.
//!
//! | Check          | How |
//! |----------------|-----|
//! | privilege      | effective UID 0 |
//! | firmware       | `/sys/firmware/efi` present |
//! | network        | TCP probe, then the recovery chain in [`crate::network`] |
//! | storage        | at least one target disk; the configured one exists |
//! | clock          | `timedatectl set-ntp true` |
//! | keymap         | `loadkeys <keymap>` |
//! | signing keys   | `pacman-key --init`, `--populate`, keyring refresh |

use std::fmt;
use std::path::PathBuf;

use crate::error::{InstallError, Result};
use crate::host::{self, FirmwareMode, HostPaths};
use crate::network::NetworkRecovery;
use crate::prompt::Prompter;
use crate::runner::{Invocation, Runner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Pass,
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub outcome: CheckOutcome,
}

impl CheckResult {
    fn pass(name: &'static str) -> Self {
        Self { name, outcome: CheckOutcome::Pass }
    }

    fn fatal(name: &'static str, reason: impl Into<String>) -> Self {
        Self { name, outcome: CheckOutcome::Fatal(reason.into()) }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.outcome, CheckOutcome::Fatal(_))
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            CheckOutcome::Pass => write!(f, "[ OK ] {}", self.name),
            CheckOutcome::Fatal(reason) => write!(f, "[FAIL] {}: {}", self.name, reason),
        }
    }
}

/// The first fatal result as a preflight error.
pub fn first_failure(results: &[CheckResult]) -> Result<()> {
    match results.iter().find(|r| r.is_fatal()) {
        Some(CheckResult { name, outcome: CheckOutcome::Fatal(reason) }) => {
            Err(InstallError::preflight(format!("{}: {}", name, reason)))
        }
        _ => Ok(()),
    }
}

pub struct EnvironmentProbe<'a> {
    runner: &'a dyn Runner,
    host: &'a HostPaths,
    network: NetworkRecovery<'a>,
    keymap: String,
    disk: Option<PathBuf>,
    privileged: bool,
}

impl<'a> EnvironmentProbe<'a> {
    pub fn new(
        runner: &'a dyn Runner,
        host: &'a HostPaths,
        network: NetworkRecovery<'a>,
        keymap: impl Into<String>,
        disk: Option<PathBuf>,
    ) -> Self {
        Self {
            runner,
            host,
            network,
            keymap: keymap.into(),
            disk,
            privileged: host::is_root(),
        }
    }

    /// Override the detected privilege level.
    pub fn with_privilege(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Run the checks in order, stopping after the first fatal one.
    pub fn check(&self, prompter: &mut Prompter) -> Vec<CheckResult> {
        let mut results = Vec::new();

        let checks: [(&'static str, &dyn Fn(&mut Prompter) -> Result<()>); 7] = [
            ("privilege", &|_: &mut Prompter| self.check_privilege()),
            ("firmware", &|_: &mut Prompter| self.check_firmware()),
            ("network", &|p: &mut Prompter| self.network.ensure_online(p)),
            ("storage", &|_: &mut Prompter| self.check_storage()),
            ("clock", &|_: &mut Prompter| self.check_clock()),
            ("keymap", &|_: &mut Prompter| self.check_keymap()),
            ("signing keys", &|_: &mut Prompter| self.check_keyring()),
        ];

        for (name, check) in checks {
            let result = match check(prompter) {
                Ok(()) => CheckResult::pass(name),
                Err(e) => CheckResult::fatal(name, error_reason(e)),
            };
            tracing::info!("{}", result);
            let fatal = result.is_fatal();
            results.push(result);
            if fatal {
                break;
            }
        }
        results
    }

    fn check_privilege(&self) -> Result<()> {
        if self.privileged {
            Ok(())
        } else {
            Err(InstallError::preflight("must run as root"))
        }
    }

    fn check_firmware(&self) -> Result<()> {
        match self.host.firmware_mode() {
            FirmwareMode::Uefi => Ok(()),
            FirmwareMode::Bios => Err(InstallError::preflight(
                "system booted in BIOS mode; UEFI is required",
            )),
        }
    }

    fn check_storage(&self) -> Result<()> {
        let devices = self.host.block_devices()?;
        if devices.is_empty() {
            return Err(InstallError::preflight("no installable disks found"));
        }
        if let Some(disk) = &self.disk {
            if !devices.iter().any(|d| &d.path == disk) {
                return Err(InstallError::preflight(format!(
                    "configured disk {} not found",
                    disk.display()
                )));
            }
        }
        Ok(())
    }

    fn check_clock(&self) -> Result<()> {
        self.runner
            .run_checked(&Invocation::new("timedatectl").args(["set-ntp", "true"]))?;
        Ok(())
    }

    fn check_keymap(&self) -> Result<()> {
        self.runner
            .run_checked(&Invocation::new("loadkeys").arg(self.keymap.as_str()))?;
        Ok(())
    }

    fn check_keyring(&self) -> Result<()> {
        self.runner.run_checked(&Invocation::new("pacman-key").arg("--init"))?;
        self.runner
            .run_checked(&Invocation::new("pacman-key").args(["--populate", "archlinux"]))?;
        self.runner.run_checked(
            &Invocation::new("pacman").args(["-Sy", "--noconfirm", "archlinux-keyring"]),
        )?;
        Ok(())
    }
}

/// Strip the "Preflight check failed:" prefix so results read cleanly.
fn error_reason(err: InstallError) -> String {
    match err {
        InstallError::Preflight(reason) => reason,
        other => other.to_string(),
    }
}
