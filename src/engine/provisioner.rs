//! Disk provisioning: executes a [`DiskLayoutPlan`].
//!
//! Steps, in order, each fatal on failure:
//!
//! 1. Zap the partition table, or delete only slots 1-3 when home is kept
//! 2. Create partitions EFI -> swap -> root (-> home)
//! 3. Re-read the table and wait (bounded) for the device nodes
//! 4. Format every recreated partition; a kept home is never formatted
//! 5. Mount root, then EFI at `/boot`, then home, then enable swap
//!
//! There is no rollback. A failure leaves the disk in whatever state the last
//! successful step produced.

use std::path::{Path, PathBuf};

use crate::engine::devices::{partition_path, ProvisionedDevices};
use crate::engine::planner::{DiskLayoutPlan, PartitionRole, PartitionSize, PartitionSpec};
use crate::error::{InstallError, Result};
use crate::host::HostPaths;
use crate::retry::{poll_until, RetryPolicy, Sleeper};
use crate::runner::{Invocation, Runner};
use crate::types::Filesystem;

/// Mount options for the root and home filesystems.
fn mount_options(fs: Filesystem) -> Option<&'static str> {
    match fs {
        Filesystem::Btrfs => Some("compress=zstd,noatime"),
        Filesystem::Ext4 | Filesystem::Xfs => None,
    }
}

pub struct DiskProvisioner<'a> {
    runner: &'a dyn Runner,
    host: &'a HostPaths,
    sleeper: &'a dyn Sleeper,
    mount_root: PathBuf,
    device_wait: RetryPolicy,
}

impl<'a> DiskProvisioner<'a> {
    pub fn new(
        runner: &'a dyn Runner,
        host: &'a HostPaths,
        sleeper: &'a dyn Sleeper,
        mount_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            host,
            sleeper,
            mount_root: mount_root.into(),
            device_wait: RetryPolicy::DEVICE_NODES,
        }
    }

    pub fn with_device_wait(mut self, policy: RetryPolicy) -> Self {
        self.device_wait = policy;
        self
    }

    /// Run the plan. Every failure is reported as a destructive-phase error.
    pub fn execute(&self, plan: &DiskLayoutPlan) -> Result<ProvisionedDevices> {
        self.execute_steps(plan).map_err(InstallError::into_destructive)
    }

    fn execute_steps(&self, plan: &DiskLayoutPlan) -> Result<ProvisionedDevices> {
        let disk = plan.disk.as_path();
        tracing::info!(disk = %disk.display(), preserve = plan.preserve_existing, "provisioning disk");

        self.clear_table(plan)?;
        for spec in plan.mutated() {
            self.create_partition(disk, spec)?;
        }
        self.wait_for_devices(disk)?;

        let mut devices = ProvisionedDevices::for_disk(disk, plan.preserve_existing);
        self.format(plan, &devices)?;
        devices.swap_uuid = self.swap_uuid(&devices.swap)?;
        self.mount(plan, &devices)?;

        tracing::info!(
            root = %devices.root.display(),
            swap_uuid = %devices.swap_uuid,
            "disk provisioned"
        );
        Ok(devices)
    }

    fn run(&self, invocation: Invocation) -> Result<String> {
        Ok(self.runner.run_checked(&invocation)?.stdout)
    }

    fn clear_table(&self, plan: &DiskLayoutPlan) -> Result<()> {
        let disk = plan.disk.display().to_string();
        if plan.preserve_existing {
            let mut inv = Invocation::new("sgdisk");
            for spec in plan.mutated() {
                inv = inv.arg(format!("--delete={}", spec.index));
            }
            // sgdisk exits non-zero when a slot is already empty; a real
            // problem surfaces in the create step.
            let output = self.runner.run(&inv.arg(&disk))?;
            if !output.success() {
                tracing::warn!(stderr = %output.stderr.trim(), "partition delete reported errors");
            }
            Ok(())
        } else {
            self.run(Invocation::new("wipefs").args(["--all", disk.as_str()]))?;
            self.run(Invocation::new("sgdisk").args(["--zap-all", disk.as_str()]))?;
            Ok(())
        }
    }

    fn create_partition(&self, disk: &Path, spec: &PartitionSpec) -> Result<()> {
        let end = match spec.size {
            PartitionSize::Gib(n) => format!("+{}G", n),
            PartitionSize::Remainder => "0".to_string(),
        };
        self.run(Invocation::new("sgdisk").args([
            format!("--new={}:0:{}", spec.index, end),
            format!("--typecode={}:{}", spec.index, spec.type_code),
            format!("--change-name={}:{}", spec.index, spec.label),
            disk.display().to_string(),
        ]))?;
        Ok(())
    }

    fn wait_for_devices(&self, disk: &Path) -> Result<()> {
        self.run(Invocation::new("partprobe").arg(disk.display().to_string()))?;

        let nodes: Vec<PathBuf> = (1..=4).map(|i| partition_path(disk, i)).collect();
        let ready = poll_until(self.device_wait, self.sleeper, || {
            nodes.iter().all(|n| self.host.device_node_exists(n))
        });
        if !ready {
            let missing: Vec<String> = nodes
                .iter()
                .filter(|n| !self.host.device_node_exists(n))
                .map(|n| n.display().to_string())
                .collect();
            return Err(InstallError::destructive(format!(
                "Device nodes did not appear after {} checks: {}",
                self.device_wait.attempts,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    fn format(&self, plan: &DiskLayoutPlan, devices: &ProvisionedDevices) -> Result<()> {
        let fs = plan.filesystem;
        for spec in plan.mutated() {
            let invocation = match spec.role {
                PartitionRole::Efi => Invocation::new("mkfs.fat")
                    .args(["-F", "32", "-n", "EFI"])
                    .arg(devices.efi.display().to_string()),
                PartitionRole::Swap => Invocation::new("mkswap")
                    .args(["-L", "swap"])
                    .arg(devices.swap.display().to_string()),
                PartitionRole::Root => mkfs(fs, "root", &devices.root),
                PartitionRole::Home => mkfs(fs, "home", &devices.home),
            };
            self.run(invocation)?;
        }
        Ok(())
    }

    fn swap_uuid(&self, swap: &Path) -> Result<String> {
        let uuid = self.run(
            Invocation::new("blkid")
                .args(["-s", "UUID", "-o", "value"])
                .arg(swap.display().to_string()),
        )?;
        let uuid = uuid.trim().to_string();
        if uuid.is_empty() {
            return Err(InstallError::destructive(format!(
                "No filesystem UUID for swap device {}",
                swap.display()
            )));
        }
        Ok(uuid)
    }

    fn mount(&self, plan: &DiskLayoutPlan, devices: &ProvisionedDevices) -> Result<()> {
        let root = self.mount_root.display().to_string();
        let options = mount_options(plan.filesystem);

        self.run(mount_invocation(&devices.root, &root, options))?;

        let boot = self.mount_root.join("boot").display().to_string();
        self.run(Invocation::new("mkdir").args(["-p", boot.as_str()]))?;
        self.run(mount_invocation(&devices.efi, &boot, None))?;

        let home = self.mount_root.join("home").display().to_string();
        self.run(Invocation::new("mkdir").args(["-p", home.as_str()]))?;
        // A kept home still carries its old filesystem
        let home_options = if devices.home_preserved { None } else { options };
        self.run(mount_invocation(&devices.home, &home, home_options))?;

        self.run(Invocation::new("swapon").arg(devices.swap.display().to_string()))?;
        Ok(())
    }

    /// Unmount the target tree and disable swap.
    pub fn release(&self, devices: &ProvisionedDevices) -> Result<()> {
        self.run(Invocation::new("swapoff").arg(devices.swap.display().to_string()))?;
        self.run(Invocation::new("umount").args(["-R".to_string(), self.mount_root.display().to_string()]))?;
        Ok(())
    }
}

fn mkfs(fs: Filesystem, label: &str, device: &Path) -> Invocation {
    Invocation::new(fs.mkfs_program())
        .arg(fs.force_flag())
        .args(["-L", label])
        .arg(device.display().to_string())
}

fn mount_invocation(device: &Path, target: &str, options: Option<&str>) -> Invocation {
    let mut inv = Invocation::new("mount");
    if let Some(options) = options {
        inv = inv.args(["-o", options]);
    }
    inv.arg(device.display().to_string()).arg(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwapSize;
    use crate::engine::planner::{plan, PlanRequest, GIB};
    use crate::retry::NoSleep;
    use crate::runner::{CommandOutput, RecordingRunner};
    use crate::types::HomeChoice;
    use std::fs;

    fn host_with_nodes(disk: &str) -> (tempfile::TempDir, HostPaths) {
        let dir = tempfile::tempdir().unwrap();
        let host = HostPaths::under(dir.path());
        fs::create_dir_all(&host.dev).unwrap();
        for i in 1..=4 {
            let node = partition_path(Path::new(disk), i);
            fs::write(host.dev.join(node.file_name().unwrap()), b"").unwrap();
        }
        (dir, host)
    }

    fn layout(disk: &str, home: HomeChoice) -> DiskLayoutPlan {
        plan(&PlanRequest {
            disk: PathBuf::from(disk),
            ram_bytes: 16 * GIB,
            efi_gib: 1,
            root_gib: 64,
            swap: SwapSize::Auto,
            filesystem: Filesystem::Ext4,
            existing_partition4: home.preserves(),
            home,
        })
        .unwrap()
    }

    fn runner_with_uuid() -> RecordingRunner {
        let runner = RecordingRunner::new();
        runner.respond("blkid", None, CommandOutput::ok("1111-2222\n"));
        runner
    }

    #[test]
    fn test_wipe_creates_and_formats_all_four() {
        let (_dir, host) = host_with_nodes("/dev/sda");
        let runner = runner_with_uuid();
        let provisioner = DiskProvisioner::new(&runner, &host, &NoSleep, "/mnt");

        let devices = provisioner.execute(&layout("/dev/sda", HomeChoice::Wipe)).unwrap();
        assert_eq!(devices.swap_uuid, "1111-2222");
        assert_eq!(devices.home, PathBuf::from("/dev/sda4"));
        assert!(!devices.home_preserved);

        let lines = runner.command_lines();
        assert_eq!(lines[0], "wipefs --all /dev/sda");
        assert_eq!(lines[1], "sgdisk --zap-all /dev/sda");
        assert!(lines[2].starts_with("sgdisk --new=1:0:+1G --typecode=1:ef00"));
        assert!(lines[3].starts_with("sgdisk --new=2:0:+16G --typecode=2:8200"));
        assert!(lines[4].starts_with("sgdisk --new=3:0:+64G"));
        assert!(lines[5].starts_with("sgdisk --new=4:0:0"));
        assert!(lines.contains(&"mkfs.ext4 -F -L home /dev/sda4".to_string()));
    }

    #[test]
    fn test_preserve_never_touches_home() {
        let (_dir, host) = host_with_nodes("/dev/nvme0n1");
        let runner = runner_with_uuid();
        let provisioner = DiskProvisioner::new(&runner, &host, &NoSleep, "/mnt");

        let devices = provisioner
            .execute(&layout("/dev/nvme0n1", HomeChoice::Keep))
            .unwrap();
        assert!(devices.home_preserved);

        let lines = runner.command_lines();
        assert_eq!(lines[0], "sgdisk --delete=1 --delete=2 --delete=3 /dev/nvme0n1");
        assert!(!runner.ran("wipefs"));
        assert!(!lines.iter().any(|l| l.contains("--zap-all")));
        assert!(!lines.iter().any(|l| l.contains("--delete=4") || l.contains("--new=4")));
        assert!(!lines
            .iter()
            .any(|l| l.starts_with("mkfs") && l.ends_with("/dev/nvme0n1p4")));
        // Still mounted
        assert!(lines.contains(&"mount /dev/nvme0n1p4 /mnt/home".to_string()));
    }

    #[test]
    fn test_mount_order_root_efi_home_swap() {
        let (_dir, host) = host_with_nodes("/dev/sda");
        let runner = runner_with_uuid();
        DiskProvisioner::new(&runner, &host, &NoSleep, "/mnt")
            .execute(&layout("/dev/sda", HomeChoice::Wipe))
            .unwrap();

        let lines = runner.command_lines();
        let pos = |needle: &str| lines.iter().position(|l| l == needle).unwrap();
        let root = pos("mount /dev/sda3 /mnt");
        let boot_dir = pos("mkdir -p /mnt/boot");
        let efi = pos("mount /dev/sda1 /mnt/boot");
        let home = pos("mount /dev/sda4 /mnt/home");
        let swap = pos("swapon /dev/sda2");
        assert!(root < boot_dir && boot_dir < efi && efi < home && home < swap);
    }

    #[test]
    fn test_missing_device_nodes_fail_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostPaths::under(dir.path());
        let runner = runner_with_uuid();
        let err = DiskProvisioner::new(&runner, &host, &NoSleep, "/mnt")
            .with_device_wait(RetryPolicy::new(3, std::time::Duration::ZERO))
            .execute(&layout("/dev/sda", HomeChoice::Wipe))
            .unwrap_err();
        assert!(matches!(err, InstallError::Destructive(_)));
        assert!(!runner.ran("mkfs.ext4"));
    }

    #[test]
    fn test_tool_failure_is_destructive() {
        let (_dir, host) = host_with_nodes("/dev/sda");
        let runner = runner_with_uuid();
        runner.respond("mkswap", None, CommandOutput::failed(1, "bad device"));
        let err = DiskProvisioner::new(&runner, &host, &NoSleep, "/mnt")
            .execute(&layout("/dev/sda", HomeChoice::Wipe))
            .unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert!(!runner.ran("mount"));
    }

    #[test]
    fn test_btrfs_mount_options() {
        let (_dir, host) = host_with_nodes("/dev/sda");
        let runner = runner_with_uuid();
        let mut plan = layout("/dev/sda", HomeChoice::Wipe);
        plan.filesystem = Filesystem::Btrfs;
        DiskProvisioner::new(&runner, &host, &NoSleep, "/mnt")
            .execute(&plan)
            .unwrap();
        let lines = runner.command_lines();
        assert!(lines.contains(&"mkfs.btrfs -f -L root /dev/sda3".to_string()));
        assert!(lines.contains(&"mount -o compress=zstd,noatime /dev/sda3 /mnt".to_string()));
    }

    #[test]
    fn test_kept_home_mounts_without_new_filesystem_options() {
        let (_dir, host) = host_with_nodes("/dev/sda");
        let runner = runner_with_uuid();
        let mut plan = layout("/dev/sda", HomeChoice::Keep);
        plan.filesystem = Filesystem::Btrfs;
        DiskProvisioner::new(&runner, &host, &NoSleep, "/mnt")
            .execute(&plan)
            .unwrap();
        let lines = runner.command_lines();
        assert!(lines.contains(&"mount -o compress=zstd,noatime /dev/sda3 /mnt".to_string()));
        assert!(lines.contains(&"mount /dev/sda4 /mnt/home".to_string()));
        assert!(!lines.iter().any(|l| l.contains("mkfs") && l.contains("/dev/sda4")));
    }
}
