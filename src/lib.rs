//! archstrap library
//!
//! Installation orchestration and disk provisioning for Arch Linux
//! workstations. The binary is a thin shell around [`orchestrator`].

pub mod boundary;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod host;
pub mod install_state;
pub mod location;
pub mod logging;
pub mod mirrors;
pub mod network;
pub mod orchestrator;
pub mod packages;
pub mod process_guard;
pub mod prompt;
pub mod retry;
pub mod runner;
pub mod steps;
pub mod types;

// Re-export main types for convenience
pub use boundary::{BoundaryEnvelope, PhaseBoundary};
pub use config::{merge, ConfigLayer, InstallConfig, Secret, SwapSize};
pub use engine::{plan, DiskLayoutPlan, DiskProvisioner, PlanRequest, ProvisionedDevices};
pub use error::{InstallError, Result};
pub use hardware::{CheckOutcome, CheckResult, EnvironmentProbe};
pub use install_state::{PhaseContext, PhaseState, PhaseTransitionError};
pub use location::{Location, LocationResolver};
pub use orchestrator::{PhaseOrchestrator, RunOutcome, Services};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use prompt::{PromptMode, Prompter};
pub use runner::{CommandOutput, Invocation, RecordingRunner, Runner, SystemRunner};
pub use types::{Bootloader, Filesystem, GpuDriver, HomeChoice};
