//! Crossing from the live environment into the installed root.
//!
//! The outer instance copies itself into the target root, writes the resolved
//! configuration and device identifiers to an envelope file, and runs a tiny
//! entry script inside `arch-chroot`. The inner instance's only
//! initialisation path is `archstrap resume --envelope <file>`.
//!
//! ```text
//! <root>/root/archstrap/
//! ├── bin/archstrap     copy of the running executable
//! ├── profiles/         copy of <profile_dir>/profiles, when present
//! ├── envelope.json     BoundaryEnvelope, mode 0600
//! └── enter.sh          exec bin/archstrap resume --envelope ..., mode 0700
//! ```
//!
//! The envelope is a file, never piped: the chroot inherits the terminal so
//! the inner instance can still read stdin.

use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::InstallConfig;
use crate::engine::ProvisionedDevices;
use crate::error::{InstallError, Result};
use crate::runner::{Invocation, Runner};

pub const ENVELOPE_VERSION: u32 = 1;
/// Location of the copied tree as seen from inside the root.
pub const INNER_TREE: &str = "/root/archstrap";

/// Everything the inner instance needs, and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryEnvelope {
    pub version: u32,
    pub config: InstallConfig,
    pub devices: ProvisionedDevices,
}

impl BoundaryEnvelope {
    pub fn new(config: InstallConfig, devices: ProvisionedDevices) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            config,
            devices,
        }
    }

    /// Write with mode 0600 (it carries the password).
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            InstallError::configuration(format!("Cannot read envelope {}: {}", path.display(), e))
        })?;
        let envelope: Self = serde_json::from_str(&content)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(InstallError::configuration(format!(
                "Envelope version {} does not match installer version {}",
                envelope.version, ENVELOPE_VERSION
            )));
        }
        Ok(envelope)
    }
}

pub struct PhaseBoundary<'a> {
    runner: &'a dyn Runner,
    root: PathBuf,
    executable: PathBuf,
    profile_dir: PathBuf,
}

impl<'a> PhaseBoundary<'a> {
    /// `executable` is the binary to copy in (normally `current_exe()`).
    pub fn new(
        runner: &'a dyn Runner,
        root: impl Into<PathBuf>,
        executable: impl Into<PathBuf>,
        profile_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            root: root.into(),
            executable: executable.into(),
            profile_dir: profile_dir.into(),
        }
    }

    /// The copied tree, as seen from the live environment.
    pub fn tree(&self) -> PathBuf {
        self.root.join(INNER_TREE.trim_start_matches('/'))
    }

    pub fn envelope_path(&self) -> PathBuf {
        self.tree().join("envelope.json")
    }

    pub fn entry_script_path(&self) -> PathBuf {
        self.tree().join("enter.sh")
    }

    /// Materialise the tree, envelope and entry script. Existing copies of the
    /// binary and profiles from an earlier attempt are reused.
    pub fn prepare(&self, envelope: &BoundaryEnvelope) -> Result<()> {
        let tree = self.tree();
        let bin_dir = tree.join("bin");
        fs::create_dir_all(&bin_dir)?;
        fs::set_permissions(&tree, fs::Permissions::from_mode(0o700))?;

        let binary = bin_dir.join("archstrap");
        if binary.exists() {
            tracing::debug!(path = %binary.display(), "installer binary already copied");
        } else {
            fs::copy(&self.executable, &binary)?;
            fs::set_permissions(&binary, fs::Permissions::from_mode(0o755))?;
        }

        let profiles_src = self.profile_dir.join("profiles");
        let profiles_dst = tree.join("profiles");
        if profiles_dst.exists() {
            tracing::debug!(path = %profiles_dst.display(), "profiles already copied");
        } else if profiles_src.is_dir() {
            copy_dir_all(&profiles_src, &profiles_dst)?;
        } else {
            fs::create_dir_all(&profiles_dst)?;
        }

        envelope.write(&self.envelope_path())?;

        let script = entry_script();
        let script_path = self.entry_script_path();
        fs::write(&script_path, script)?;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o700))?;

        tracing::info!(tree = %tree.display(), "phase boundary prepared");
        Ok(())
    }

    /// Prepare, then run the inner instance inside the root. Returns once the
    /// inner instance has exited; a non-zero exit is an error.
    pub fn cross(&self, config: &InstallConfig, devices: &ProvisionedDevices) -> Result<()> {
        let envelope = BoundaryEnvelope::new(config.clone(), devices.clone());
        self.prepare(&envelope)?;

        let inner_script = format!("{}/enter.sh", INNER_TREE);
        tracing::info!(root = %self.root.display(), "entering installed root");
        self.runner.run_checked(
            &Invocation::new("arch-chroot")
                .arg(self.root.display().to_string())
                .arg(inner_script)
                .interactive(),
        )?;
        Ok(())
    }

    /// Remove the copied tree. A missing tree is fine.
    pub fn teardown(&self) -> Result<()> {
        let tree = self.tree();
        match fs::remove_dir_all(&tree) {
            Ok(()) => {
                tracing::debug!(tree = %tree.display(), "phase boundary removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn entry_script() -> String {
    format!(
        "#!/bin/sh\nexec {tree}/bin/archstrap resume --envelope {tree}/envelope.json\n",
        tree = INNER_TREE
    )
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{merge, ConfigLayer, Secret};
    use crate::runner::RecordingRunner;

    fn envelope() -> BoundaryEnvelope {
        let mut config = merge(ConfigLayer::defaults(), ConfigLayer::default(), ConfigLayer::default());
        config.disk = Some(PathBuf::from("/dev/sda"));
        config.password = Some(Secret::new("pw"));
        let mut devices = ProvisionedDevices::for_disk(Path::new("/dev/sda"), false);
        devices.swap_uuid = "abcd".to_string();
        BoundaryEnvelope::new(config, devices)
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        exe: PathBuf,
        profile_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("mnt");
        fs::create_dir_all(&root).unwrap();
        let exe = dir.path().join("archstrap-bin");
        fs::write(&exe, b"\x7fELF").unwrap();
        let profile_dir = dir.path().join("share");
        fs::create_dir_all(profile_dir.join("profiles")).unwrap();
        fs::write(profile_dir.join("profiles/10-desktop.sh"), "#!/bin/sh\n").unwrap();
        Fixture { _dir: dir, root, exe, profile_dir }
    }

    #[test]
    fn test_envelope_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("envelope.json");
        let mut env = envelope();
        env.version = 99;
        env.write(&path).unwrap();
        assert!(matches!(BoundaryEnvelope::read(&path), Err(InstallError::Configuration(_))));
    }

    #[test]
    fn test_prepare_layout_and_permissions() {
        let f = fixture();
        let runner = RecordingRunner::new();
        let boundary = PhaseBoundary::new(&runner, &f.root, &f.exe, &f.profile_dir);
        boundary.prepare(&envelope()).unwrap();

        let tree = f.root.join("root/archstrap");
        assert_eq!(boundary.tree(), tree);
        assert!(tree.join("bin/archstrap").is_file());
        assert!(tree.join("profiles/10-desktop.sh").is_file());

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&tree.join("envelope.json")), 0o600);
        assert_eq!(mode(&tree.join("enter.sh")), 0o700);

        let script = fs::read_to_string(tree.join("enter.sh")).unwrap();
        assert!(script.contains(
            "exec /root/archstrap/bin/archstrap resume --envelope /root/archstrap/envelope.json"
        ));
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let f = fixture();
        let runner = RecordingRunner::new();
        let boundary = PhaseBoundary::new(&runner, &f.root, &f.exe, &f.profile_dir);
        boundary.prepare(&envelope()).unwrap();

        // A later executable is not copied over the existing one
        fs::write(&f.exe, b"newer").unwrap();
        let mut second = envelope();
        second.config.hostname = "second".to_string();
        boundary.prepare(&second).unwrap();

        assert_eq!(fs::read(boundary.tree().join("bin/archstrap")).unwrap(), b"\x7fELF");
        let read = BoundaryEnvelope::read(&boundary.envelope_path()).unwrap();
        assert_eq!(read.config.hostname, "second");
    }

    #[test]
    fn test_cross_runs_entry_script_in_chroot() {
        let f = fixture();
        let runner = RecordingRunner::new();
        let boundary = PhaseBoundary::new(&runner, &f.root, &f.exe, &f.profile_dir);
        let env = envelope();
        boundary.cross(&env.config, &env.devices).unwrap();

        let calls = runner.calls_to("arch-chroot");
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].args,
            vec![f.root.display().to_string(), "/root/archstrap/enter.sh".to_string()]
        );
        assert!(calls[0].interactive);
    }

    #[test]
    fn test_teardown_removes_tree_and_tolerates_absence() {
        let f = fixture();
        let runner = RecordingRunner::new();
        let boundary = PhaseBoundary::new(&runner, &f.root, &f.exe, &f.profile_dir);
        boundary.prepare(&envelope()).unwrap();
        boundary.teardown().unwrap();
        assert!(!boundary.tree().exists());
        boundary.teardown().unwrap();
    }
}
