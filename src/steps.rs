//! The opaque installation steps around the core engine.
//!
//! [`BaseInstaller`] runs in the live environment against the mounted root.
//! [`SystemConfigurator`], [`ProfileRunner`] and [`post_fixup`] run in the
//! inner instance, inside the installed root, so their `root` is normally
//! `/`; tests point it at a temp dir.
//!
//! Failures come back as plain [`InstallError`]s. The orchestrator assigns the
//! phase error kind.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::{InstallConfig, Secret};
use crate::engine::ProvisionedDevices;
use crate::error::{InstallError, Result};
use crate::runner::{Invocation, Runner};
use crate::types::Bootloader;

/// Bootstraps packages into the mounted root and writes its fstab.
pub struct BaseInstaller<'a> {
    runner: &'a dyn Runner,
    mount_root: PathBuf,
}

impl<'a> BaseInstaller<'a> {
    pub fn new(runner: &'a dyn Runner, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            mount_root: mount_root.into(),
        }
    }

    pub fn install(&self, packages: &[String]) -> Result<()> {
        let root = self.mount_root.display().to_string();
        tracing::info!(count = packages.len(), root = %root, "installing base system");
        self.runner.run_checked(
            &Invocation::new("pacstrap")
                .args(["-K", root.as_str()])
                .args(packages.iter().map(String::as_str)),
        )?;

        let fstab = self
            .runner
            .run_checked(&Invocation::new("genfstab").args(["-U", root.as_str()]))?;
        let etc = self.mount_root.join("etc");
        fs::create_dir_all(&etc)?;
        append(&etc.join("fstab"), &fstab.stdout)?;
        Ok(())
    }
}

fn append(path: &Path, content: &str) -> Result<()> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Sudo access for members of `wheel`.
pub const SUDOERS_DROP_IN: &str = "%wheel ALL=(ALL:ALL) ALL\n";

/// System configuration from inside the installed root.
pub struct SystemConfigurator<'a> {
    runner: &'a dyn Runner,
    root: PathBuf,
}

impl<'a> SystemConfigurator<'a> {
    pub fn new(runner: &'a dyn Runner, root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            root: root.into(),
        }
    }

    fn path(&self, absolute: &str) -> PathBuf {
        self.root.join(absolute.trim_start_matches('/'))
    }

    fn write(&self, absolute: &str, content: &str) -> Result<()> {
        let path = self.path(absolute);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(())
    }

    pub fn configure(&self, config: &InstallConfig, devices: &ProvisionedDevices) -> Result<()> {
        self.timezone(config)?;
        self.locale(config)?;
        self.identity(config)?;
        self.user(config)?;
        self.initramfs()?;
        self.bootloader(config, devices)?;
        Ok(())
    }

    fn timezone(&self, config: &InstallConfig) -> Result<()> {
        let timezone = config
            .timezone
            .as_deref()
            .ok_or_else(|| InstallError::config("Timezone must be specified"))?;
        let link = self.path("/etc/localtime");
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link)?;
        }
        std::os::unix::fs::symlink(format!("/usr/share/zoneinfo/{}", timezone), &link)?;
        self.runner.run_checked(&Invocation::new("hwclock").arg("--systohc"))?;
        tracing::info!(timezone, "timezone set");
        Ok(())
    }

    fn locale(&self, config: &InstallConfig) -> Result<()> {
        let locale_gen = self.path("/etc/locale.gen");
        let current = fs::read_to_string(&locale_gen).unwrap_or_default();
        self.write("/etc/locale.gen", &enable_locale(&current, &config.locale))?;
        self.runner.run_checked(&Invocation::new("locale-gen"))?;

        self.write("/etc/locale.conf", &format!("LANG={}\n", config.locale))?;
        self.write("/etc/vconsole.conf", &format!("KEYMAP={}\n", config.keymap))?;
        Ok(())
    }

    fn identity(&self, config: &InstallConfig) -> Result<()> {
        self.write("/etc/hostname", &format!("{}\n", config.hostname))?;
        self.write(
            "/etc/hosts",
            &format!(
                "127.0.0.1   localhost\n::1         localhost\n127.0.1.1   {0}.localdomain {0}\n",
                config.hostname
            ),
        )?;
        Ok(())
    }

    fn user(&self, config: &InstallConfig) -> Result<()> {
        let password = config
            .password
            .as_ref()
            .ok_or_else(|| InstallError::config("Password must be specified"))?;

        let exists = self
            .runner
            .succeeds(&Invocation::new("id").args(["-u", config.username.as_str()]));
        if exists {
            tracing::info!(user = %config.username, "user already exists");
        } else {
            self.runner.run_checked(
                &Invocation::new("useradd")
                    .args(["-m", "-G", "wheel", "-s", "/bin/bash"])
                    .arg(config.username.as_str()),
            )?;
        }

        // Never on the command line: argv is world-readable under /proc
        self.runner.run_checked(
            &Invocation::new("chpasswd")
                .stdin_bytes(chpasswd_input(&config.username, password))
                .redact(),
        )?;

        let sudoers = self.path("/etc/sudoers.d/10-wheel");
        if let Some(parent) = sudoers.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&sudoers, SUDOERS_DROP_IN)?;
        fs::set_permissions(&sudoers, fs::Permissions::from_mode(0o440))?;
        Ok(())
    }

    fn initramfs(&self) -> Result<()> {
        let conf = self.path("/etc/mkinitcpio.conf");
        if let Ok(current) = fs::read_to_string(&conf) {
            fs::write(&conf, add_resume_hook(&current))?;
        }
        self.runner.run_checked(&Invocation::new("mkinitcpio").arg("-P"))?;
        Ok(())
    }

    fn bootloader(&self, config: &InstallConfig, devices: &ProvisionedDevices) -> Result<()> {
        let resume = format!("resume=UUID={}", devices.swap_uuid);
        match config.bootloader {
            Bootloader::Grub => {
                self.runner.run_checked(&Invocation::new("grub-install").args([
                    "--target=x86_64-efi",
                    "--efi-directory=/boot",
                    "--bootloader-id=GRUB",
                ]))?;
                let defaults = self.path("/etc/default/grub");
                let current = fs::read_to_string(&defaults).unwrap_or_default();
                self.write("/etc/default/grub", &add_kernel_param(&current, &resume))?;
                self.runner.run_checked(
                    &Invocation::new("grub-mkconfig").args(["-o", "/boot/grub/grub.cfg"]),
                )?;
            }
            Bootloader::SystemdBoot => {
                self.runner.run_checked(&Invocation::new("bootctl").arg("install"))?;
                let root_uuid = self
                    .runner
                    .run_checked(
                        &Invocation::new("blkid")
                            .args(["-s", "UUID", "-o", "value"])
                            .arg(devices.root.display().to_string()),
                    )?
                    .stdout
                    .trim()
                    .to_string();
                if root_uuid.is_empty() {
                    return Err(InstallError::configuration(format!(
                        "no filesystem UUID for {}",
                        devices.root.display()
                    )));
                }
                self.write("/boot/loader/loader.conf", "default arch.conf\ntimeout 3\n")?;
                self.write(
                    "/boot/loader/entries/arch.conf",
                    &format!(
                        "title   Arch Linux\nlinux   /vmlinuz-linux\ninitrd  /initramfs-linux.img\noptions root=UUID={} rw {}\n",
                        root_uuid, resume
                    ),
                )?;
            }
        }
        tracing::info!(bootloader = %config.bootloader, "bootloader installed");
        Ok(())
    }
}

fn chpasswd_input(username: &str, password: &Secret) -> Vec<u8> {
    format!(
        "{user}:{pw}\nroot:{pw}\n",
        user = username,
        pw = password.expose()
    )
    .into_bytes()
}

/// Uncomment `locale` in a locale.gen, appending it when absent.
pub fn enable_locale(locale_gen: &str, locale: &str) -> String {
    let charset = locale.split_once('.').map(|(_, c)| c).unwrap_or("UTF-8");
    let entry = format!("{} {}", locale, charset);
    let mut found = false;
    let mut lines: Vec<String> = locale_gen
        .lines()
        .map(|line| {
            let bare = line.trim_start_matches('#').trim();
            if bare == entry {
                found = true;
                entry.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(entry);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Insert `resume` after `filesystems` in the HOOKS array.
///
/// Left alone when the hook is present or the systemd hook handles resume.
pub fn add_resume_hook(conf: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for line in conf.lines() {
        let Some(rest) = line.strip_prefix("HOOKS=(") else {
            out.push(line.to_string());
            continue;
        };
        let inner = rest.trim_end_matches(')');
        let mut hooks: Vec<&str> = inner.split_whitespace().collect();
        if !hooks.contains(&"resume") && !hooks.contains(&"systemd") {
            match hooks.iter().position(|h| *h == "filesystems") {
                Some(i) => hooks.insert(i + 1, "resume"),
                None => hooks.push("resume"),
            }
        }
        out.push(format!("HOOKS=({})", hooks.join(" ")));
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}

/// Append `param` to GRUB_CMDLINE_LINUX_DEFAULT, adding the key if missing.
pub fn add_kernel_param(grub_default: &str, param: &str) -> String {
    const KEY: &str = "GRUB_CMDLINE_LINUX_DEFAULT=";
    let mut found = false;
    let mut lines: Vec<String> = grub_default
        .lines()
        .map(|line| {
            let Some(value) = line.strip_prefix(KEY) else {
                return line.to_string();
            };
            found = true;
            let value = value.trim_matches('"');
            let mut params: Vec<&str> = value
                .split_whitespace()
                .filter(|p| !p.starts_with("resume="))
                .collect();
            params.push(param);
            format!("{}\"{}\"", KEY, params.join(" "))
        })
        .collect();
    if !found {
        lines.push(format!("{}\"{}\"", KEY, param));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Runs the profile scripts copied across the boundary.
pub struct ProfileRunner<'a> {
    runner: &'a dyn Runner,
    dir: PathBuf,
}

impl<'a> ProfileRunner<'a> {
    pub fn new(runner: &'a dyn Runner, dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            dir: dir.into(),
        }
    }

    /// `*.sh` files in the profile directory, sorted by name.
    pub fn scripts(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut scripts = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "sh") {
                scripts.push(path);
            }
        }
        scripts.sort();
        Ok(scripts)
    }

    /// Run every script with the configuration in its environment. The
    /// first non-zero exit stops the run.
    pub fn run_all(&self, config: &InstallConfig) -> Result<usize> {
        let scripts = self.scripts()?;
        for script in &scripts {
            tracing::info!(script = %script.display(), "running profile");
            self.runner.run_checked(
                &Invocation::new("bash")
                    .arg(script.display().to_string())
                    .envs(config.to_env_vars())
                    .interactive(),
            )?;
        }
        Ok(scripts.len())
    }
}

/// Services enabled on the installed system.
pub const ENABLED_SERVICES: &[&str] = &["NetworkManager", "systemd-timesyncd"];

pub fn post_fixup(runner: &dyn Runner, config: &InstallConfig) -> Result<()> {
    runner.run_checked(&Invocation::new("systemctl").arg("enable").args(ENABLED_SERVICES.iter().copied()))?;
    let owner = format!("{0}:{0}", config.username);
    runner.run_checked(
        &Invocation::new("chown")
            .args(["-R", owner.as_str()])
            .arg(format!("/home/{}", config.username)),
    )?;
    Ok(())
}
