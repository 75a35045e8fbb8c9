//! Phase orchestration.
//!
//! Both instances run an explicit, ordered phase list through one driver
//! loop (`drive`); [`PhaseContext`] rejects anything that
//! is not a single forward step.
//!
//! ```text
//! outer (live environment)              inner (installed root)
//! ------------------------              ----------------------
//! Preflight      probe, geolocation
//! Configuring    prompts, plan, summary, confirmation checkpoint
//! Confirmed      mirror ranking
//! Provisioning   partition, format, mount
//! BaseInstall    pacstrap, genfstab
//!    └── cross ──────────────────────▶  ChrootConfig
//!                                       ProfileExecution
//!                                       PostFixup
//!    ◀── exit status ─────────────────  Complete
//! teardown, copy run log, release mounts
//! ```
//!
//! Every prompt happens before the checkpoint. Afterwards the [`Prompter`] is
//! sealed, so a stray prompt fails instead of blocking an unattended run.

use std::path::{Path, PathBuf};

use crate::boundary::{BoundaryEnvelope, PhaseBoundary, INNER_TREE};
use crate::config::{is_country_code, InstallConfig};
use crate::engine::planner::{resolve_home, HomeDecision};
use crate::engine::{partition_path, plan, DiskLayoutPlan, DiskProvisioner, PlanRequest, ProvisionedDevices};
use crate::error::{InstallError, Result};
use crate::hardware::{first_failure, EnvironmentProbe};
use crate::host::{format_size, HostPaths};
use crate::install_state::{PhaseContext, PhaseState};
use crate::location::{GeoFetcher, Location, LocationResolver};
use crate::logging;
use crate::mirrors::{rank_mirrors, MirrorOptions};
use crate::network::{Connectivity, NetworkRecovery};
use crate::packages::{load_package_list, resolve_gpu, resolve_packages};
use crate::prompt::Prompter;
use crate::retry::{RetryPolicy, Sleeper};
use crate::runner::Runner;
use crate::steps::{post_fixup, BaseInstaller, ProfileRunner, SystemConfigurator};
use crate::types::HomeChoice;

/// Phases run by the live-environment instance, before the boundary.
pub const OUTER_PHASES: &[PhaseState] = &[
    PhaseState::Preflight,
    PhaseState::Configuring,
    PhaseState::Confirmed,
    PhaseState::Provisioning,
    PhaseState::BaseInstall,
];

/// Phases run by the inner instance, inside the installed root.
pub const INNER_PHASES: &[PhaseState] = &[
    PhaseState::ChrootConfig,
    PhaseState::ProfileExecution,
    PhaseState::PostFixup,
    PhaseState::Complete,
];

/// The external world, as seen by the orchestrator.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub runner: &'a dyn Runner,
    pub host: &'a HostPaths,
    pub sleeper: &'a dyn Sleeper,
    pub connectivity: &'a dyn Connectivity,
    pub geo: &'a dyn GeoFetcher,
}

/// How a run ended successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Stopped after the confirmation summary; nothing was changed.
    DryRun,
}

enum Flow {
    Continue,
    Stop,
}

/// Values produced by one phase and consumed by later ones.
struct RunState {
    config: InstallConfig,
    location: Location,
    layout: Option<DiskLayoutPlan>,
    devices: Option<ProvisionedDevices>,
}

impl RunState {
    fn new(config: InstallConfig) -> Self {
        Self {
            config,
            location: Location::default(),
            layout: None,
            devices: None,
        }
    }

    fn devices(&self) -> Result<&ProvisionedDevices> {
        self.devices
            .as_ref()
            .ok_or_else(|| InstallError::Transition("no provisioned devices".to_string()))
    }
}

pub struct PhaseOrchestrator<'a> {
    services: Services<'a>,
    prompter: Prompter,
    ctx: PhaseContext,
    executable: Option<PathBuf>,
    log_path: Option<PathBuf>,
    privileged: Option<bool>,
    device_wait: RetryPolicy,
    /// Root as seen by the inner instance (`/` inside the chroot).
    inner_root: PathBuf,
}

impl<'a> PhaseOrchestrator<'a> {
    pub fn new(services: Services<'a>, prompter: Prompter) -> Self {
        Self {
            services,
            prompter,
            ctx: PhaseContext::new(),
            executable: None,
            log_path: None,
            privileged: None,
            device_wait: RetryPolicy::DEVICE_NODES,
            inner_root: PathBuf::from("/"),
        }
    }

    /// Binary copied across the boundary. Defaults to the running executable.
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Run log copied into the installed root after the inner instance exits.
    pub fn with_log(mut self, path: Option<PathBuf>) -> Self {
        self.log_path = path;
        self
    }

    pub fn with_privilege(mut self, privileged: bool) -> Self {
        self.privileged = Some(privileged);
        self
    }

    pub fn with_device_wait(mut self, policy: RetryPolicy) -> Self {
        self.device_wait = policy;
        self
    }

    pub fn with_inner_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.inner_root = root.into();
        self
    }

    pub fn phase(&self) -> PhaseState {
        self.ctx.current()
    }

    pub fn context(&self) -> &PhaseContext {
        &self.ctx
    }

    /// Outer instance: every phase up to the boundary, the crossing, and
    /// cleanup.
    pub fn run(&mut self, config: InstallConfig) -> Result<RunOutcome> {
        let result = self.run_outer(config);
        if result.is_err() && !self.ctx.current().is_terminal() {
            let _ = self.ctx.fail();
        }
        result
    }

    /// Inner instance: picks up after BaseInstall from the envelope alone.
    pub fn resume(&mut self, envelope: BoundaryEnvelope) -> Result<RunOutcome> {
        self.prompter.seal();
        self.ctx = PhaseContext::resume_after(PhaseState::BaseInstall)?;
        let mut state = RunState::new(envelope.config);
        state.devices = Some(envelope.devices);

        let result = self.drive(INNER_PHASES, &mut state).map(|_| RunOutcome::Completed);
        if result.is_err() && !self.ctx.current().is_terminal() {
            let _ = self.ctx.fail();
        }
        result
    }

    fn run_outer(&mut self, config: InstallConfig) -> Result<RunOutcome> {
        config.validate()?;
        let mut state = RunState::new(config);
        if let Flow::Stop = self.drive(OUTER_PHASES, &mut state)? {
            return Ok(RunOutcome::DryRun);
        }
        self.cross(&state)?;
        // The inner instance ran the remaining phases
        while !self.ctx.is_complete() {
            self.ctx.advance()?;
        }
        Ok(RunOutcome::Completed)
    }

    /// The single driver loop. Each phase is entered through the state
    /// machine, then its handler runs; failures take the phase's error kind.
    fn drive(&mut self, phases: &[PhaseState], state: &mut RunState) -> Result<Flow> {
        for &phase in phases {
            if self.ctx.current() != phase {
                self.ctx.transition_to(phase)?;
            }
            tracing::info!(phase = %phase, "phase started");
            let flow = self.run_phase(phase, state).map_err(|e| classify(phase, e))?;
            if let Flow::Stop = flow {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn run_phase(&mut self, phase: PhaseState, state: &mut RunState) -> Result<Flow> {
        match phase {
            PhaseState::Preflight => self.preflight(state),
            PhaseState::Configuring => self.configuring(state),
            PhaseState::Confirmed => self.rank_mirrors(state),
            PhaseState::Provisioning => self.provision(state),
            PhaseState::BaseInstall => self.base_install(state),
            PhaseState::ChrootConfig => {
                SystemConfigurator::new(self.services.runner, &self.inner_root)
                    .configure(&state.config, state.devices()?)?;
                Ok(Flow::Continue)
            }
            PhaseState::ProfileExecution => {
                let dir = self.inner_root.join(INNER_TREE.trim_start_matches('/')).join("profiles");
                let count = ProfileRunner::new(self.services.runner, dir).run_all(&state.config)?;
                tracing::info!(count, "profiles finished");
                Ok(Flow::Continue)
            }
            PhaseState::PostFixup => {
                post_fixup(self.services.runner, &state.config)?;
                Ok(Flow::Continue)
            }
            PhaseState::Complete => {
                self.prompter.say("Installation complete.")?;
                Ok(Flow::Continue)
            }
            PhaseState::Failed => Err(InstallError::Transition("cannot run the failed state".to_string())),
        }
    }

    fn preflight(&mut self, state: &mut RunState) -> Result<Flow> {
        let s = self.services;
        let network = NetworkRecovery::new(s.runner, s.host, s.sleeper, s.connectivity);
        let mut probe = EnvironmentProbe::new(
            s.runner,
            s.host,
            network,
            state.config.keymap.as_str(),
            state.config.disk.clone(),
        );
        if let Some(privileged) = self.privileged {
            probe = probe.with_privilege(privileged);
        }
        let results = probe.check(&mut self.prompter);
        for result in &results {
            self.prompter.say(&result.to_string())?;
        }
        first_failure(&results)?;

        state.location = LocationResolver::new(s.geo, s.host).resolve();
        Ok(Flow::Continue)
    }

    /// Collects every remaining input, plans the disk, and holds the
    /// confirmation checkpoint.
    fn configuring(&mut self, state: &mut RunState) -> Result<Flow> {
        let host = self.services.host;
        let mut config = state.config.clone();

        let disk = self.select_disk(&config)?;
        config.disk = Some(disk.clone());

        let validator = config.clone();
        config.hostname = self.prompter.text_validated("Hostname", &config.hostname, |v| {
            let mut c = validator.clone();
            c.hostname = v.to_string();
            c.validate().map_err(|e| e.to_string())
        })?;
        config.username = self.prompter.text_validated("Username", &config.username, |v| {
            let mut c = validator.clone();
            c.username = v.to_string();
            c.validate().map_err(|e| e.to_string())
        })?;
        config.password = Some(self.prompter.secret("Password", config.password.as_ref())?);

        let default_tz = config
            .timezone
            .clone()
            .or_else(|| state.location.timezone.clone())
            .unwrap_or_else(|| "UTC".to_string());
        let timezone = self.prompter.text_validated("Timezone", &default_tz, |v| {
            if host.timezone_exists(v) {
                Ok(())
            } else {
                Err(format!("Unknown timezone '{}'", v))
            }
        })?;
        if !host.timezone_exists(&timezone) {
            return Err(InstallError::config(format!("Unknown timezone '{}'", timezone)));
        }
        config.timezone = Some(timezone);

        let default_country = config
            .mirror_country
            .clone()
            .or_else(|| state.location.country.clone())
            .unwrap_or_default();
        let country = self.prompter.text_validated(
            "Mirror country (empty for worldwide)",
            &default_country,
            |v| {
                if v.is_empty() || is_country_code(&v.to_ascii_uppercase()) {
                    Ok(())
                } else {
                    Err("Enter a two-letter country code".to_string())
                }
            },
        )?;
        config.mirror_country = Some(country.to_ascii_uppercase()).filter(|c| !c.is_empty());

        let existing_home = host.partition_exists(&partition_path(&disk, 4));
        let home = match resolve_home(existing_home, config.home) {
            HomeDecision::Resolved(choice) => choice,
            HomeDecision::Ask => {
                let question = format!(
                    "Keep the existing home partition {}?",
                    partition_path(&disk, 4).display()
                );
                if self.prompter.confirm(&question, true)? {
                    HomeChoice::Keep
                } else {
                    HomeChoice::Wipe
                }
            }
        };
        config.home = Some(home);
        config.validate_complete()?;

        let ram = host.ram_bytes()?;
        let layout = plan(&PlanRequest::from_config(&config, &disk, ram, existing_home, home))?;

        for line in summary(&config, &layout, host).lines() {
            self.prompter.say(line)?;
        }
        state.config = config;

        if state.config.dry_run {
            self.prompter.say("Dry run: stopping before any change to the disk.")?;
            tracing::info!("dry run finished");
            return Ok(Flow::Stop);
        }

        if !state.config.unattended {
            let question = format!("Erase and install to {}?", disk.display());
            if !self.prompter.confirm(&question, false)? {
                return Err(InstallError::Aborted);
            }
        }
        self.ctx.confirm();
        self.prompter.seal();
        state.layout = Some(layout);
        Ok(Flow::Continue)
    }

    fn select_disk(&mut self, config: &InstallConfig) -> Result<PathBuf> {
        if let Some(disk) = &config.disk {
            return Ok(disk.clone());
        }
        if self.prompter.is_unattended() {
            return Err(InstallError::config("Install disk must be specified in unattended mode"));
        }
        let devices = self.services.host.block_devices()?;
        if devices.is_empty() {
            return Err(InstallError::preflight("no installable disks found"));
        }
        let options: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
        let index = self.prompter.select("Target disk", &options, 0)?;
        Ok(devices[index].path.clone())
    }

    fn rank_mirrors(&mut self, state: &mut RunState) -> Result<Flow> {
        let options = MirrorOptions {
            country: state.config.mirror_country.clone(),
            ..MirrorOptions::default()
        };
        let result = rank_mirrors(self.services.runner, self.services.connectivity, &options);
        self.prompter.say(&format!("Mirrors: {}", result))?;
        Ok(Flow::Continue)
    }

    fn provision(&mut self, state: &mut RunState) -> Result<Flow> {
        let layout = state
            .layout
            .as_ref()
            .ok_or_else(|| InstallError::Transition("no disk layout planned".to_string()))?;
        let devices = self.provisioner(&state.config.mount_root).execute(layout)?;
        tracing::info!(
            root = %devices.root.display(),
            swap_uuid = %devices.swap_uuid,
            home_preserved = devices.home_preserved,
            "disk provisioned"
        );
        state.devices = Some(devices);
        Ok(Flow::Continue)
    }

    fn provisioner(&self, mount_root: &Path) -> DiskProvisioner<'a> {
        let s = self.services;
        DiskProvisioner::new(s.runner, s.host, s.sleeper, mount_root).with_device_wait(self.device_wait)
    }

    fn base_install(&mut self, state: &mut RunState) -> Result<Flow> {
        let config = &state.config;
        let gpu = resolve_gpu(config.gpu, self.services.runner);
        let list = config.profile_dir.join("packages/base.txt");
        let extra = if list.is_file() { load_package_list(&list)? } else { Vec::new() };
        let packages = resolve_packages(config, gpu, &extra);
        BaseInstaller::new(self.services.runner, &config.mount_root).install(&packages)?;
        Ok(Flow::Continue)
    }

    /// Hand over to the inner instance, then clean up. The copied tree is
    /// removed either way; mounts are released only on success.
    fn cross(&mut self, state: &RunState) -> Result<()> {
        let config = &state.config;
        let devices = state.devices()?;
        let executable = match &self.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        let boundary = PhaseBoundary::new(
            self.services.runner,
            &config.mount_root,
            executable,
            &config.profile_dir,
        );

        let crossed = boundary.cross(config, devices);
        let teardown = boundary.teardown();
        if let Some(log) = &self.log_path {
            if let Err(e) = logging::copy_into_root(log, &config.mount_root) {
                tracing::warn!(error = %e, "could not copy run log into the installed root");
            }
        }
        crossed.map_err(|e| match e {
            InstallError::Command { code, .. } => InstallError::configuration(format!(
                "installer inside the new root exited with code {}",
                code
            )),
            other => other.into_configuration(),
        })?;
        teardown?;

        self.provisioner(&config.mount_root)
            .release(devices)
            .map_err(InstallError::into_configuration)?;
        Ok(())
    }
}

/// Assign the error kind of the phase that failed.
fn classify(phase: PhaseState, err: InstallError) -> InstallError {
    match phase {
        PhaseState::Provisioning | PhaseState::BaseInstall => err.into_destructive(),
        PhaseState::ChrootConfig | PhaseState::ProfileExecution | PhaseState::PostFixup => {
            err.into_configuration()
        }
        _ => err,
    }
}

/// The confirmation summary. The password never appears.
pub fn summary(config: &InstallConfig, layout: &DiskLayoutPlan, host: &HostPaths) -> String {
    let disk_size = host
        .disk_size_bytes(&layout.disk)
        .map(format_size)
        .unwrap_or_else(|_| "unknown size".to_string());
    let mut lines = vec![
        "Installation summary".to_string(),
        format!("  Disk:           {} ({})", layout.disk.display(), disk_size),
    ];
    lines.extend(layout.summary().lines().map(|l| format!("    {}", l)));
    let password = if config.password.is_some() { "********" } else { "(not set)" };
    lines.extend([
        format!("  Hostname:       {}", config.hostname),
        format!("  Username:       {}", config.username),
        format!("  Password:       {}", password),
        format!("  Timezone:       {}", config.timezone.as_deref().unwrap_or("-")),
        format!("  Locale:         {}", config.locale),
        format!("  Keymap:         {}", config.keymap),
        format!("  Filesystem:     {}", config.filesystem),
        format!("  Bootloader:     {}", config.bootloader),
        format!("  GPU driver:     {}", config.gpu),
        format!(
            "  Mirror country: {}",
            config.mirror_country.as_deref().unwrap_or("worldwide")
        ),
    ]);
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{merge, ConfigLayer, Secret};

    #[test]
    fn test_phase_lists_cover_every_phase_once() {
        let all: Vec<_> = OUTER_PHASES.iter().chain(INNER_PHASES).copied().collect();
        assert_eq!(all, PhaseState::all_phases());
    }

    #[test]
    fn test_classify_by_phase() {
        let err = || InstallError::config("x");
        assert_eq!(classify(PhaseState::Configuring, err()).exit_code(), 3);
        assert_eq!(classify(PhaseState::Provisioning, err()).exit_code(), 5);
        assert_eq!(classify(PhaseState::BaseInstall, err()).exit_code(), 5);
        assert_eq!(classify(PhaseState::ProfileExecution, err()).exit_code(), 6);
        assert_eq!(classify(PhaseState::Preflight, InstallError::preflight("p")).exit_code(), 2);
    }

    #[test]
    fn test_summary_redacts_password() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostPaths::under(dir.path());
        let mut config = merge(ConfigLayer::defaults(), ConfigLayer::default(), ConfigLayer::default());
        config.password = Some(Secret::new("s3cret-pw"));
        config.timezone = Some("UTC".to_string());
        let layout = plan(&PlanRequest::from_config(
            &config,
            Path::new("/dev/sda"),
            16 << 30,
            false,
            HomeChoice::Wipe,
        ))
        .unwrap();

        let text = summary(&config, &layout, &host);
        assert!(!text.contains("s3cret-pw"));
        assert!(text.contains("Password:       ********"));
        assert!(text.contains("/dev/sda (unknown size)"));
        assert!(text.contains("Mirror country: worldwide"));
    }
}
