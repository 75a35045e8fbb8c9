//! Network reachability and the wireless recovery chain.
//!
//! Recovery escalates only as each cheaper step fails:
//!
//! 1. probe a well-known host
//! 2. unblock soft-blocked radios
//! 3. wireless hardware on the PCI bus but no interface: reload the driver,
//!    then reset the device on the bus and reload again
//! 4. an interface exists: offer to join a network through `iwctl`
//! 5. poll reachability (bounded); the user may go back to step 4
//!
//! Recovery is interactive only. In unattended mode an unreachable network is
//! immediately fatal.

use std::fs;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{InstallError, Result};
use crate::host::HostPaths;
use crate::prompt::Prompter;
use crate::retry::{poll_until, RetryPolicy, Sleeper};
use crate::runner::{Invocation, Runner};

/// Reachability probe seam.
pub trait Connectivity {
    fn is_reachable(&self) -> bool;
}

/// TCP connect to a well-known HTTPS endpoint.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub host: String,
    /// Used when name resolution fails
    pub fallback: SocketAddr,
    pub timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            host: "archlinux.org:443".to_string(),
            fallback: SocketAddr::from(([147, 75, 81, 97], 443)),
            timeout: Duration::from_secs(5),
        }
    }
}

impl Connectivity for TcpProbe {
    fn is_reachable(&self) -> bool {
        let mut addrs: Vec<SocketAddr> = self
            .host
            .to_socket_addrs()
            .map(|a| a.collect())
            .unwrap_or_default();
        addrs.push(self.fallback);

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => {
                    tracing::debug!(%addr, "network reachable");
                    return true;
                }
                Err(e) => tracing::debug!(%addr, error = %e, "connect failed"),
            }
        }
        false
    }
}

/// A wireless controller found on the PCI bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirelessAdapter {
    /// PCI address, e.g. `0000:02:00.0`
    pub address: String,
    pub description: String,
    /// Kernel module expected to drive it
    pub driver: Option<&'static str>,
}

/// Kernel module for a wireless controller, guessed from its vendor.
pub fn driver_for(description: &str) -> Option<&'static str> {
    let d = description.to_ascii_lowercase();
    if d.contains("intel") || d.contains("[8086:") {
        Some("iwlwifi")
    } else if d.contains("realtek") || d.contains("[10ec:") {
        if d.contains("8821ce") {
            Some("rtw88_8821ce")
        } else {
            Some("rtw88_pci")
        }
    } else if d.contains("broadcom") || d.contains("[14e4:") {
        Some("brcmfmac")
    } else if d.contains("atheros") || d.contains("qualcomm") || d.contains("[168c:") || d.contains("[17cb:") {
        Some("ath10k_pci")
    } else if d.contains("mediatek") || d.contains("[14c3:") {
        Some("mt7921e")
    } else {
        None
    }
}

/// Wireless controllers in `lspci -Dnn` output (class 0280 or a
/// "Network controller" / "Wireless" description).
pub fn parse_wireless_adapters(lspci: &str) -> Vec<WirelessAdapter> {
    lspci
        .lines()
        .filter(|line| {
            line.contains("[0280]") || line.contains("Network controller") || line.contains("Wireless")
        })
        .filter_map(|line| {
            let (address, description) = line.split_once(' ')?;
            Some(WirelessAdapter {
                address: address.to_string(),
                description: description.trim().to_string(),
                driver: driver_for(description),
            })
        })
        .collect()
}

/// Drives the recovery chain.
pub struct NetworkRecovery<'a> {
    runner: &'a dyn Runner,
    host: &'a HostPaths,
    sleeper: &'a dyn Sleeper,
    connectivity: &'a dyn Connectivity,
    pub reachability: RetryPolicy,
    pub interface_wait: RetryPolicy,
}

impl<'a> NetworkRecovery<'a> {
    pub fn new(
        runner: &'a dyn Runner,
        host: &'a HostPaths,
        sleeper: &'a dyn Sleeper,
        connectivity: &'a dyn Connectivity,
    ) -> Self {
        Self {
            runner,
            host,
            sleeper,
            connectivity,
            reachability: RetryPolicy::REACHABILITY,
            interface_wait: RetryPolicy::WIFI_INTERFACE,
        }
    }

    /// Ok once the network is reachable; a preflight error otherwise.
    pub fn ensure_online(&self, prompter: &mut Prompter) -> Result<()> {
        if self.connectivity.is_reachable() {
            return Ok(());
        }
        if prompter.is_unattended() {
            return Err(InstallError::preflight(
                "No network connectivity (recovery is not attempted in unattended mode)",
            ));
        }

        tracing::warn!("network unreachable, starting recovery");
        prompter.say("Network unreachable. Attempting recovery...")?;

        self.unblock_radios();
        if self.connectivity.is_reachable() {
            return Ok(());
        }

        let adapters = self.wireless_adapters();
        if !adapters.is_empty() && self.host.wireless_interfaces().is_empty() {
            self.recover_drivers(&adapters);
        }

        loop {
            if !self.host.wireless_interfaces().is_empty()
                && prompter.confirm("Configure a wireless network now?", true)?
            {
                if let Err(e) = self.join_network(prompter) {
                    tracing::warn!(error = %e, "wireless connection attempt failed");
                    prompter.say(&format!("Connection attempt failed: {}", e))?;
                }
            }

            if poll_until(self.reachability, self.sleeper, || self.connectivity.is_reachable()) {
                tracing::info!("network recovered");
                return Ok(());
            }

            if !prompter.confirm("Network is still unreachable. Retry?", false)? {
                return Err(InstallError::preflight(format!(
                    "No network connectivity\n{}",
                    self.diagnostics()
                )));
            }
        }
    }

    fn unblock_radios(&self) {
        if !self.runner.succeeds(&Invocation::new("rfkill").args(["unblock", "wifi"])) {
            tracing::debug!("rfkill unblock failed");
        }
    }

    pub fn wireless_adapters(&self) -> Vec<WirelessAdapter> {
        match self.runner.run(&Invocation::new("lspci").arg("-Dnn")) {
            Ok(out) if out.success() => parse_wireless_adapters(&out.stdout),
            _ => Vec::new(),
        }
    }

    /// Driver reload, then bus reset, for each adapter with a known driver.
    fn recover_drivers(&self, adapters: &[WirelessAdapter]) {
        for adapter in adapters {
            let Some(driver) = adapter.driver else {
                tracing::warn!(adapter = %adapter.description, "no known driver for adapter");
                continue;
            };

            tracing::info!(driver, address = %adapter.address, "reloading wireless driver");
            self.reload_driver(driver);
            if self.wait_for_interface() {
                return;
            }

            tracing::info!(address = %adapter.address, "resetting wireless device on the PCI bus");
            if let Err(e) = self.reset_device(&adapter.address) {
                tracing::warn!(error = %e, "PCI reset failed");
            }
            self.reload_driver(driver);
            if self.wait_for_interface() {
                return;
            }
        }
    }

    fn reload_driver(&self, driver: &str) {
        // Unloading fails when the module was never loaded
        if !self.runner.succeeds(&Invocation::new("modprobe").args(["-r", driver])) {
            tracing::debug!(driver, "modprobe -r failed");
        }
        if !self.runner.succeeds(&Invocation::new("modprobe").arg(driver)) {
            tracing::warn!(driver, "modprobe failed");
        }
    }

    fn reset_device(&self, address: &str) -> Result<()> {
        fs::write(self.host.pci_device_dir(address).join("remove"), "1")?;
        self.sleeper.sleep(Duration::from_secs(1));
        fs::write(self.host.pci_rescan_path(), "1")?;
        Ok(())
    }

    fn wait_for_interface(&self) -> bool {
        poll_until(self.interface_wait, self.sleeper, || {
            !self.host.wireless_interfaces().is_empty()
        })
    }

    fn join_network(&self, prompter: &mut Prompter) -> Result<()> {
        let interfaces = self.host.wireless_interfaces();
        let device = if interfaces.len() > 1 {
            let index = prompter.select("Wireless device", &interfaces, 0)?;
            interfaces[index].clone()
        } else {
            interfaces
                .first()
                .cloned()
                .ok_or_else(|| InstallError::preflight("No wireless interface"))?
        };

        self.runner
            .run_checked(&Invocation::new("iwctl").args(["station", device.as_str(), "scan"]))?;
        self.sleeper.sleep(Duration::from_secs(2));
        let networks = self.runner.run_checked(
            &Invocation::new("iwctl").args(["station", device.as_str(), "get-networks"]),
        )?;
        for line in networks.stdout.lines() {
            prompter.say(line)?;
        }

        let ssid = prompter.text_validated("Network name (SSID)", "", |v| {
            if v.is_empty() {
                Err("SSID cannot be empty".to_string())
            } else {
                Ok(())
            }
        })?;
        let passphrase = prompter.optional_secret("Passphrase")?;

        let mut connect = Invocation::new("iwctl");
        if let Some(passphrase) = &passphrase {
            connect = connect.args(["--passphrase", passphrase.expose()]).redact();
        }
        connect = connect.args(["station", device.as_str(), "connect", ssid.as_str()]);
        self.runner.run_checked(&connect)?;
        Ok(())
    }

    /// PCI listing and radio block state for the final error message.
    pub fn diagnostics(&self) -> String {
        let capture = |inv: Invocation| {
            self.runner
                .run(&inv)
                .map(|o| o.stdout.trim().to_string())
                .unwrap_or_else(|e| e.to_string())
        };
        format!(
            "PCI devices:\n{}\nRadio block status:\n{}",
            capture(Invocation::new("lspci").arg("-Dnn")),
            capture(Invocation::new("rfkill").arg("list"))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{PromptMode, ScriptedConsole};
    use crate::retry::NoSleep;
    use crate::runner::{CommandOutput, RecordingRunner};
    use std::cell::Cell;

    const LSPCI: &str = "\
0000:00:02.0 VGA compatible controller [0300]: Intel Corporation UHD Graphics [8086:9b41]
0000:02:00.0 Network controller [0280]: Intel Corporation Wi-Fi 6 AX200 [8086:2723] (rev 1a)
0000:03:00.0 Ethernet controller [0200]: Realtek Semiconductor RTL8111 [10ec:8168]
";

    /// Unreachable until `up_after` probes have been made.
    struct Flaky {
        probes: Cell<u32>,
        up_after: u32,
    }

    impl Connectivity for Flaky {
        fn is_reachable(&self) -> bool {
            self.probes.set(self.probes.get() + 1);
            self.probes.get() > self.up_after
        }
    }

    fn never() -> Flaky {
        Flaky { probes: Cell::new(0), up_after: u32::MAX }
    }

    fn prompter(mode: PromptMode, answers: &[&str]) -> (Prompter, ScriptedConsole) {
        let console = ScriptedConsole::new(answers.iter().copied());
        (Prompter::new(Box::new(console.clone()), mode), console)
    }

    fn fast(recovery: &mut NetworkRecovery<'_>) {
        recovery.reachability = RetryPolicy::new(2, Duration::ZERO);
        recovery.interface_wait = RetryPolicy::new(2, Duration::ZERO);
    }

    #[test]
    fn test_parse_wireless_adapters() {
        let adapters = parse_wireless_adapters(LSPCI);
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].address, "0000:02:00.0");
        assert_eq!(adapters[0].driver, Some("iwlwifi"));
    }

    #[test]
    fn test_driver_map() {
        assert_eq!(driver_for("Broadcom Inc. BCM4360 802.11ac"), Some("brcmfmac"));
        assert_eq!(driver_for("Realtek RTL8821CE 802.11ac [10ec:c821]"), Some("rtw88_8821ce"));
        assert_eq!(driver_for("Realtek RTL8822BE"), Some("rtw88_pci"));
        assert_eq!(driver_for("Qualcomm Atheros QCA6174"), Some("ath10k_pci"));
        assert_eq!(driver_for("MEDIATEK Corp. MT7921"), Some("mt7921e"));
        assert_eq!(driver_for("Unknown Vendor [1234:5678]"), None);
    }

    #[test]
    fn test_reachable_runs_nothing() {
        let runner = RecordingRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let host = HostPaths::under(dir.path());
        let up = Flaky { probes: Cell::new(0), up_after: 0 };
        let (mut p, _) = prompter(PromptMode::Interactive, &[]);

        NetworkRecovery::new(&runner, &host, &NoSleep, &up)
            .ensure_online(&mut p)
            .unwrap();
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_unattended_failure_is_immediately_fatal() {
        let runner = RecordingRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let host = HostPaths::under(dir.path());
        let down = never();
        let (mut p, _) = prompter(PromptMode::Unattended, &[]);

        let err = NetworkRecovery::new(&runner, &host, &NoSleep, &down)
            .ensure_online(&mut p)
            .unwrap_err();
        assert!(matches!(err, InstallError::Preflight(_)));
        assert!(!runner.ran("rfkill"));
        assert_eq!(down.probes.get(), 1);
    }

    #[test]
    fn test_unblock_alone_recovers() {
        let runner = RecordingRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let host = HostPaths::under(dir.path());
        let flaky = Flaky { probes: Cell::new(0), up_after: 1 };
        let (mut p, console) = prompter(PromptMode::Interactive, &[]);

        NetworkRecovery::new(&runner, &host, &NoSleep, &flaky)
            .ensure_online(&mut p)
            .unwrap();
        assert!(runner.ran("rfkill"));
        assert!(!runner.ran("modprobe"));
        assert_eq!(console.reads(), 0);
    }

    #[test]
    fn test_driver_reload_then_bus_reset() {
        let runner = RecordingRunner::new();
        runner.respond("lspci", None, CommandOutput::ok(LSPCI));
        let dir = tempfile::tempdir().unwrap();
        let host = HostPaths::under(dir.path());
        let device_dir = host.pci_device_dir("0000:02:00.0");
        fs::create_dir_all(&device_dir).unwrap();
        fs::create_dir_all(host.pci_rescan_path().parent().unwrap()).unwrap();
        let down = never();
        // Decline retry at the end
        let (mut p, _) = prompter(PromptMode::Interactive, &["n"]);

        let mut recovery = NetworkRecovery::new(&runner, &host, &NoSleep, &down);
        fast(&mut recovery);
        let err = recovery.ensure_online(&mut p).unwrap_err();

        let lines = runner.command_lines();
        let reloads = lines.iter().filter(|l| *l == "modprobe iwlwifi").count();
        assert_eq!(reloads, 2);
        assert!(lines.contains(&"modprobe -r iwlwifi".to_string()));
        assert_eq!(fs::read_to_string(device_dir.join("remove")).unwrap(), "1");
        assert_eq!(fs::read_to_string(host.pci_rescan_path()).unwrap(), "1");

        let msg = err.to_string();
        assert!(msg.contains("PCI devices"), "{}", msg);
        assert!(msg.contains("AX200"), "{}", msg);
    }

    #[test]
    fn test_failed_unload_still_loads_driver() {
        let runner = RecordingRunner::new();
        runner.respond("modprobe", Some("-r"), CommandOutput::failed(1, "not currently loaded"));
        let dir = tempfile::tempdir().unwrap();
        let host = HostPaths::under(dir.path());
        let down = never();
        let recovery = NetworkRecovery::new(&runner, &host, &NoSleep, &down);

        recovery.reload_driver("iwlwifi");
        assert_eq!(runner.command_lines(), vec!["modprobe -r iwlwifi", "modprobe iwlwifi"]);
    }

    #[test]
    fn test_join_network_then_reachable() {
        let runner = RecordingRunner::new();
        runner.respond("iwctl", Some("get-networks"), CommandOutput::ok("  homenet  psk  ****\n"));
        let dir = tempfile::tempdir().unwrap();
        let host = HostPaths::under(dir.path());
        fs::create_dir_all(host.sys.join("class/net/wlan0/wireless")).unwrap();
        // initial, after unblock, then up on the first poll
        let flaky = Flaky { probes: Cell::new(0), up_after: 2 };
        let (mut p, console) = prompter(PromptMode::Interactive, &["y", "homenet", "secretpw"]);

        let mut recovery = NetworkRecovery::new(&runner, &host, &NoSleep, &flaky);
        fast(&mut recovery);
        recovery.ensure_online(&mut p).unwrap();

        let connect = runner
            .calls_to("iwctl")
            .into_iter()
            .find(|c| c.has_arg("connect"))
            .unwrap();
        assert!(connect.redacted);
        assert_eq!(
            connect.args,
            vec!["--passphrase", "secretpw", "station", "wlan0", "connect", "homenet"]
        );
        assert!(console.transcript().iter().any(|l| l.contains("homenet")));
        assert!(!runner.ran("modprobe"));
    }

    #[test]
    fn test_retry_loop_until_user_gives_up() {
        let runner = RecordingRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let host = HostPaths::under(dir.path());
        let down = never();
        let (mut p, console) = prompter(PromptMode::Interactive, &["y", "y", "n"]);

        let mut recovery = NetworkRecovery::new(&runner, &host, &NoSleep, &down);
        fast(&mut recovery);
        assert!(recovery.ensure_online(&mut p).is_err());
        assert_eq!(console.reads(), 3);
        // 1 initial + 1 after unblock + 3 rounds of 2 polls
        assert_eq!(down.probes.get(), 8);
    }
}
