//! archstrap - main entry point
//!
//! Parses the command line, sets up logging and child-process cleanup, and
//! hands over to the library. Every failure ends as one line on stderr and
//! the exit code of its error kind.

use anyhow::Context;
use std::path::Path;
use std::process::ExitCode;

use archstrap::cli::{Cli, Commands, PASSWORD_ENV};
use archstrap::config::{merge, ConfigLayer, InstallConfig, Secret};
use archstrap::host::HostPaths;
use archstrap::location::{HttpFetcher, PROVIDER_TIMEOUT};
use archstrap::logging::{self, CHROOT_LOG, RUN_LOG};
use archstrap::network::TcpProbe;
use archstrap::orchestrator::{PhaseOrchestrator, RunOutcome, Services};
use archstrap::process_guard::{self, ProcessGuard};
use archstrap::prompt::{PromptMode, Prompter, TerminalConsole};
use archstrap::retry::ThreadSleeper;
use archstrap::runner::SystemRunner;
use archstrap::{BoundaryEnvelope, InstallError};

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Terminate running tools if we receive SIGINT/SIGTERM/SIGHUP
    if let Err(e) = process_guard::init_signal_handlers() {
        eprintln!("warning: failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<InstallError>()
                .map(InstallError::exit_code)
                .unwrap_or(1);
            tracing::debug!(code, error = ?err, "run failed");
            eprintln!("archstrap: {:#}", err);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    match cli.command.clone().unwrap_or(Commands::Install) {
        Commands::Install => install(cli),
        Commands::Validate { config } => validate(cli, &config),
        Commands::Resume { envelope } => resume(&envelope),
    }
}

/// Merge defaults, the config file and the command line.
fn load_config(cli: &Cli, file: Option<&Path>) -> anyhow::Result<InstallConfig> {
    let file_layer = match file {
        Some(path) => ConfigLayer::load_file(path)?,
        None => ConfigLayer::default(),
    };
    let mut overrides = cli.overrides();
    let unattended = overrides.unattended.or(file_layer.unattended).unwrap_or(false);
    if unattended {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            overrides.password = Some(Secret::new(password));
        }
    }
    Ok(merge(ConfigLayer::defaults(), file_layer, overrides))
}

fn validate(cli: &Cli, path: &Path) -> anyhow::Result<()> {
    let config = load_config(cli, Some(path))?;
    config.validate()?;
    println!("✓ Configuration file is valid: {}", path.display());
    Ok(())
}

fn install(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli, cli.config.as_deref())?;
    let log = logging::init(Some(Path::new(RUN_LOG)), config.debug);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "archstrap starting");

    let live = Live::new()?;

    let mut orchestrator = PhaseOrchestrator::new(live.services(), prompter(&config)).with_log(log);
    match orchestrator.run(config)? {
        RunOutcome::DryRun => println!("Dry run complete. No changes were made."),
        RunOutcome::Completed => println!("Installation complete. You can reboot now."),
    }
    Ok(())
}

/// Inner instance: everything comes from the envelope.
fn resume(path: &Path) -> anyhow::Result<()> {
    let envelope = BoundaryEnvelope::read(path)?;
    logging::init(Some(Path::new(CHROOT_LOG)), envelope.config.debug);
    tracing::info!(envelope = %path.display(), "resuming inside the installed root");

    let live = Live::new()?;

    let prompter = prompter(&envelope.config);
    PhaseOrchestrator::new(live.services(), prompter).resume(envelope)?;
    Ok(())
}

fn prompter(config: &InstallConfig) -> Prompter {
    let mode = if config.unattended {
        PromptMode::Unattended
    } else {
        PromptMode::Interactive
    };
    Prompter::new(Box::new(TerminalConsole), mode)
}

/// The real collaborators of a run on the live system.
struct Live {
    runner: SystemRunner,
    host: HostPaths,
    sleeper: ThreadSleeper,
    connectivity: TcpProbe,
    geo: HttpFetcher,
}

impl Live {
    fn new() -> anyhow::Result<Self> {
        Ok(Self {
            runner: SystemRunner,
            host: HostPaths::default(),
            sleeper: ThreadSleeper,
            connectivity: TcpProbe::default(),
            geo: HttpFetcher::new(PROVIDER_TIMEOUT).context("geolocation client")?,
        })
    }

    fn services(&self) -> Services<'_> {
        Services {
            runner: &self.runner,
            host: &self.host,
            sleeper: &self.sleeper,
            connectivity: &self.connectivity,
            geo: &self.geo,
        }
    }
}
