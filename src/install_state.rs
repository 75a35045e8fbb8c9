//! Install State Machine
//!
//! This module provides an authoritative source of truth for installation progress.
//! It enforces valid phase transitions and makes it impossible to skip phases programmatically.
//!
//! # Design Principles
//!
//! - **Single Source of Truth**: The `PhaseContext` owns the current phase
//! - **Validated Transitions**: Only forward transitions to the next phase are allowed
//! - **No Global State**: State is owned by `PhaseContext`, not global/static
//! - **Fail Fast**: Invalid transitions return errors immediately
//!
//! # Phase Flow
//!
//! ```text
//! Preflight
//!     ↓
//! Configuring
//!     ↓
//! Confirmed          ← the single confirmation checkpoint
//!     ↓
//! Provisioning       ← destructive
//!     ↓
//! BaseInstall
//!     ↓              ← phase boundary (live → installed root)
//! ChrootConfig
//!     ↓
//! ProfileExecution
//!     ↓
//! PostFixup
//!     ↓
//! Complete
//!
//! (Any non-terminal phase can transition to Failed)
//! ```

use std::fmt;
use thiserror::Error;

/// Installation phases in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PhaseState {
    /// Live environment checks (privilege, firmware, network, storage, ...)
    Preflight = 0,

    /// Interactive collection of every remaining input
    Configuring = 1,

    /// The user confirmed the summary; configuration is frozen from here on
    Confirmed = 2,

    /// Partitioning, formatting and mounting the target disk
    /// This is a DESTRUCTIVE phase - requires explicit confirmation
    Provisioning = 3,

    /// Bootstrapping the base system into the mounted root
    BaseInstall = 4,

    /// Configuring the system from inside the installed root
    ChrootConfig = 5,

    /// Running profile scripts and feature modules
    ProfileExecution = 6,

    /// Final fixups (services, ownership)
    PostFixup = 7,

    /// Installation completed successfully (terminal state)
    Complete = 8,

    /// Installation failed (terminal state)
    Failed = 255,
}

impl PhaseState {
    /// Returns the numeric order of this phase (0-8, 255 for Failed)
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Returns true if this is a terminal state (Complete or Failed)
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Returns true if this phase involves destructive disk operations
    #[inline]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Provisioning)
    }

    /// Returns true if this phase runs inside the installed root
    #[inline]
    pub const fn runs_in_chroot(self) -> bool {
        matches!(self, Self::ChrootConfig | Self::ProfileExecution | Self::PostFixup)
    }

    /// Returns the next phase in the sequence, or None if at a terminal state
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Preflight => Some(Self::Configuring),
            Self::Configuring => Some(Self::Confirmed),
            Self::Confirmed => Some(Self::Provisioning),
            Self::Provisioning => Some(Self::BaseInstall),
            Self::BaseInstall => Some(Self::ChrootConfig),
            Self::ChrootConfig => Some(Self::ProfileExecution),
            Self::ProfileExecution => Some(Self::PostFixup),
            Self::PostFixup => Some(Self::Complete),
            Self::Complete | Self::Failed => None,
        }
    }

    /// Returns a human-readable description of this phase
    pub const fn description(self) -> &'static str {
        match self {
            Self::Preflight => "Checking live environment",
            Self::Configuring => "Collecting configuration",
            Self::Confirmed => "Configuration confirmed",
            Self::Provisioning => "Provisioning disk",
            Self::BaseInstall => "Installing base system",
            Self::ChrootConfig => "Configuring system",
            Self::ProfileExecution => "Running profiles",
            Self::PostFixup => "Applying final fixups",
            Self::Complete => "Installation complete",
            Self::Failed => "Installation failed",
        }
    }

    /// Returns all phases in order (excluding Failed)
    pub const fn all_phases() -> &'static [Self] {
        &[
            Self::Preflight,
            Self::Configuring,
            Self::Confirmed,
            Self::Provisioning,
            Self::BaseInstall,
            Self::ChrootConfig,
            Self::ProfileExecution,
            Self::PostFixup,
            Self::Complete,
        ]
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during phase transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransitionError {
    /// Attempted to skip one or more phases
    #[error("Cannot skip from {from} to {to} (must transition through intermediate phases)")]
    SkippedPhase { from: PhaseState, to: PhaseState },

    /// Attempted to go backwards (not allowed)
    #[error("Cannot go backwards from {from} to {to} (installation is forward-only)")]
    BackwardTransition { from: PhaseState, to: PhaseState },

    /// Attempted to transition from a terminal state
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: PhaseState },

    /// Attempted to enter a destructive phase without confirmation
    #[error("Phase {phase} requires explicit confirmation (destructive operation)")]
    MissingConfirmation { phase: PhaseState },

    /// Attempted to re-enter the current phase
    #[error("Already at phase {phase}")]
    AlreadyAtPhase { phase: PhaseState },
}

/// Context for tracking installation progress.
///
/// # Example
///
/// ```
/// use archstrap::install_state::{PhaseContext, PhaseState};
///
/// let mut ctx = PhaseContext::new();
/// assert_eq!(ctx.current(), PhaseState::Preflight);
///
/// ctx.advance().unwrap();
/// assert_eq!(ctx.current(), PhaseState::Configuring);
///
/// // Cannot skip phases
/// assert!(ctx.transition_to(PhaseState::Provisioning).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct PhaseContext {
    current: PhaseState,

    /// Phase at which failure occurred (if any)
    failed_at: Option<PhaseState>,

    /// Entered phases with unix timestamps
    history: Vec<(PhaseState, u64)>,

    /// Set once, at the confirmation checkpoint. Cannot be revoked.
    confirmed: bool,
}

impl Default for PhaseContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseContext {
    /// Fresh context for the outer (live environment) instance.
    pub fn new() -> Self {
        Self {
            current: PhaseState::Preflight,
            failed_at: None,
            history: Vec::with_capacity(PhaseState::all_phases().len()),
            confirmed: false,
        }
    }

    /// Context for the inner instance, which picks up where the outer one
    /// handed over. Confirmation was given by the outer instance.
    pub fn resume_after(phase: PhaseState) -> Result<Self, PhaseTransitionError> {
        if phase.is_terminal() {
            return Err(PhaseTransitionError::FromTerminalState { from: phase });
        }
        if phase.order() < PhaseState::Confirmed.order() {
            return Err(PhaseTransitionError::MissingConfirmation {
                phase: PhaseState::Provisioning,
            });
        }
        let mut ctx = Self::new();
        ctx.current = phase;
        ctx.confirmed = true;
        ctx.record(phase);
        Ok(ctx)
    }

    #[inline]
    pub fn current(&self) -> PhaseState {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<PhaseState> {
        self.failed_at
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current == PhaseState::Complete
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.current == PhaseState::Failed
    }

    /// Returns true once the confirmation checkpoint has passed.
    #[inline]
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn history(&self) -> &[(PhaseState, u64)] {
        &self.history
    }

    /// Record the user's confirmation. Must happen before `Configuring → Confirmed`.
    pub fn confirm(&mut self) {
        self.confirmed = true;
    }

    /// Advance to the next phase in sequence.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already at Complete or Failed
    /// - `MissingConfirmation` if entering Confirmed or a destructive phase
    ///   without confirmation
    pub fn advance(&mut self) -> Result<PhaseState, PhaseTransitionError> {
        let Some(next) = self.current.next() else {
            return Err(PhaseTransitionError::FromTerminalState { from: self.current });
        };
        self.enter(next)
    }

    /// Transition to a specific phase (must be the next phase in sequence).
    pub fn transition_to(&mut self, target: PhaseState) -> Result<PhaseState, PhaseTransitionError> {
        if self.current.is_terminal() {
            return Err(PhaseTransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(PhaseTransitionError::AlreadyAtPhase { phase: target });
        }
        // Failed is only reachable through fail()
        if target == PhaseState::Failed {
            return Err(PhaseTransitionError::SkippedPhase {
                from: self.current,
                to: target,
            });
        }
        if target.order() < self.current.order() {
            return Err(PhaseTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        if self.current.next() != Some(target) {
            return Err(PhaseTransitionError::SkippedPhase {
                from: self.current,
                to: target,
            });
        }
        self.enter(target)
    }

    fn enter(&mut self, next: PhaseState) -> Result<PhaseState, PhaseTransitionError> {
        let needs_confirmation = next == PhaseState::Confirmed || next.is_destructive();
        if needs_confirmation && !self.confirmed {
            return Err(PhaseTransitionError::MissingConfirmation { phase: next });
        }
        self.record(next);
        self.current = next;
        tracing::debug!(phase = %next, "entered phase");
        Ok(next)
    }

    /// Mark the installation as failed.
    pub fn fail(&mut self) -> Result<(), PhaseTransitionError> {
        if self.current.is_terminal() {
            return Err(PhaseTransitionError::FromTerminalState { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.record(PhaseState::Failed);
        self.current = PhaseState::Failed;
        Ok(())
    }

    fn record(&mut self, phase: PhaseState) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.history.push((phase, timestamp));
    }
}

impl From<PhaseTransitionError> for crate::error::InstallError {
    fn from(err: PhaseTransitionError) -> Self {
        crate::error::InstallError::Transition(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_sequential() {
        for (i, phase) in PhaseState::all_phases().iter().enumerate() {
            assert_eq!(phase.order() as usize, i, "{:?} should have order {}", phase, i);
        }
    }

    #[test]
    fn test_phase_next_forms_chain() {
        let mut current = PhaseState::Preflight;
        let mut count = 0;
        while let Some(next) = current.next() {
            assert!(next.order() > current.order());
            current = next;
            count += 1;
            assert!(count < 20, "Infinite loop detected in phase chain");
        }
        assert_eq!(current, PhaseState::Complete);
        assert_eq!(count, 8);
    }

    #[test]
    fn test_only_provisioning_is_destructive() {
        for phase in PhaseState::all_phases() {
            assert_eq!(phase.is_destructive(), *phase == PhaseState::Provisioning);
        }
    }

    #[test]
    fn test_cannot_pass_checkpoint_without_confirmation() {
        let mut ctx = PhaseContext::new();
        ctx.advance().expect("Configuring");
        let err = ctx.advance().unwrap_err();
        assert!(matches!(err, PhaseTransitionError::MissingConfirmation { .. }));

        ctx.confirm();
        assert_eq!(ctx.advance().unwrap(), PhaseState::Confirmed);
    }

    #[test]
    fn test_advance_through_all_phases() {
        let mut ctx = PhaseContext::new();
        ctx.confirm();
        let mut count = 0;
        while ctx.advance().is_ok() {
            count += 1;
        }
        assert!(ctx.is_complete());
        assert_eq!(count, 8);
        assert!(matches!(
            ctx.advance().unwrap_err(),
            PhaseTransitionError::FromTerminalState { .. }
        ));
    }

    #[test]
    fn test_cannot_go_backwards_or_skip() {
        let mut ctx = PhaseContext::new();
        ctx.confirm();
        ctx.advance().unwrap();
        ctx.advance().unwrap();

        assert!(matches!(
            ctx.transition_to(PhaseState::Configuring).unwrap_err(),
            PhaseTransitionError::BackwardTransition { .. }
        ));
        assert!(matches!(
            ctx.transition_to(PhaseState::BaseInstall).unwrap_err(),
            PhaseTransitionError::SkippedPhase { .. }
        ));
        assert!(matches!(
            ctx.transition_to(PhaseState::Confirmed).unwrap_err(),
            PhaseTransitionError::AlreadyAtPhase { .. }
        ));
        assert_eq!(ctx.transition_to(PhaseState::Provisioning).unwrap(), PhaseState::Provisioning);
    }

    #[test]
    fn test_fail_records_phase() {
        let mut ctx = PhaseContext::new();
        ctx.advance().unwrap();
        ctx.fail().unwrap();
        assert!(ctx.is_failed());
        assert_eq!(ctx.failed_at(), Some(PhaseState::Configuring));
        assert!(ctx.fail().is_err());
    }

    #[test]
    fn test_resume_after_base_install() {
        let mut ctx = PhaseContext::resume_after(PhaseState::BaseInstall).unwrap();
        assert!(ctx.is_confirmed());
        assert_eq!(ctx.advance().unwrap(), PhaseState::ChrootConfig);
        assert!(ctx.current().runs_in_chroot());
    }

    #[test]
    fn test_resume_rejects_unconfirmed_or_terminal() {
        assert!(PhaseContext::resume_after(PhaseState::Configuring).is_err());
        assert!(PhaseContext::resume_after(PhaseState::Complete).is_err());
    }

    #[test]
    fn test_history_is_recorded() {
        let mut ctx = PhaseContext::new();
        assert!(ctx.history().is_empty());
        ctx.advance().unwrap();
        assert_eq!(ctx.history().len(), 1);
        assert_eq!(ctx.history()[0].0, PhaseState::Configuring);
    }
}
