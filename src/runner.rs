//! External operation execution.
//!
//! Partitioning, filesystem creation, package installation, bootloader setup
//! and the chroot hand-off are opaque external operations. The installer only
//! cares about their exit status and the specific output it parses (device
//! sizes, UUIDs, PCI listings). All of them go through the [`Runner`] trait:
//!
//! - [`SystemRunner`] spawns real processes with process-group isolation and
//!   registers them with the [`ChildRegistry`] so a signal to the installer
//!   also terminates the running tool.
//! - [`RecordingRunner`] records invocations and replays scripted outputs; it
//!   is what the tests drive the orchestrator with.

use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};

use crate::error::{InstallError, Result};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};

/// How the child's stdin is wired.
#[derive(Clone, PartialEq, Eq)]
pub enum StdinMode {
    /// `/dev/null`
    Null,
    /// The installer's own stdin (and terminal)
    Inherit,
    /// Bytes written to a pipe, then closed
    Piped(Vec<u8>),
}

impl fmt::Debug for StdinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Inherit => write!(f, "Inherit"),
            // Piped stdin carries credentials (chpasswd)
            Self::Piped(bytes) => write!(f, "Piped({} bytes)", bytes.len()),
        }
    }
}

/// One external operation: program, arguments, environment, stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: StdinMode,
    /// Inherit stdout/stderr and stay in the foreground process group.
    pub interactive: bool,
    /// Arguments carry a credential and are never displayed.
    pub redacted: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: StdinMode::Null,
            interactive: false,
            redacted: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = StdinMode::Piped(bytes.into());
        self
    }

    /// Attach the child to the installer's terminal (stdin, stdout, stderr).
    pub fn interactive(mut self) -> Self {
        self.stdin = StdinMode::Inherit;
        self.interactive = true;
        self
    }

    /// Hide the arguments from logs and error messages.
    pub fn redact(mut self) -> Self {
        self.redacted = true;
        self
    }

    /// True if any argument equals `needle`.
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        if self.redacted {
            return write!(f, " [arguments redacted]");
        }
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of an external operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (None if terminated by signal).
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes external operations.
pub trait Runner {
    /// Run to completion. A non-zero exit is NOT an error here.
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Run and turn a non-zero exit into [`InstallError::Command`].
    fn run_checked(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let output = self.run(invocation)?;
        if output.success() {
            Ok(output)
        } else {
            Err(InstallError::Command {
                program: invocation.program.clone(),
                code: output.code.unwrap_or(-1),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// True if the operation exited zero. Spawn failures count as false.
    fn succeeds(&self, invocation: &Invocation) -> bool {
        self.run(invocation).map(|o| o.success()).unwrap_or(false)
    }
}

/// Spawns real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        tracing::info!(command = %invocation, "running");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        if invocation.interactive {
            // Foreground: the child may read the terminal
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .in_new_process_group();
            match invocation.stdin {
                StdinMode::Null => cmd.stdin(Stdio::null()),
                StdinMode::Inherit => cmd.stdin(Stdio::inherit()),
                StdinMode::Piped(_) => cmd.stdin(Stdio::piped()),
            };
        }

        let mut child = cmd.spawn().map_err(|e| InstallError::Command {
            program: invocation.program.clone(),
            code: 127,
            stderr: format!("failed to spawn: {}", e),
        })?;
        let pid = child.id();

        if !invocation.interactive {
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.register(pid);
            }
        }

        // The child is reaped and unregistered even when feeding stdin fails
        let mut write_result = Ok(());
        if let StdinMode::Piped(bytes) = &invocation.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                write_result = stdin.write_all(bytes);
            }
        }

        let output = child.wait_with_output();

        if !invocation.interactive {
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.unregister(pid);
            }
        }

        let output = output?;
        write_result?;
        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if result.success() {
            tracing::debug!(program = %invocation.program, "succeeded");
        } else {
            tracing::warn!(
                program = %invocation.program,
                code = result.code.unwrap_or(-1),
                stderr = %result.stderr.trim(),
                "exited unsuccessfully"
            );
        }
        Ok(result)
    }
}

/// A scripted response for [`RecordingRunner`].
#[derive(Debug, Clone)]
struct Rule {
    program: String,
    arg: Option<String>,
    output: CommandOutput,
    /// Remaining uses; `None` = unlimited.
    remaining: Option<usize>,
}

/// Records every invocation and replays scripted outputs.
///
/// Rules match on program name and, optionally, one exact argument. The first
/// matching rule in insertion order applies. Unmatched invocations succeed
/// with empty output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: RefCell<Vec<Invocation>>,
    rules: RefCell<Vec<Rule>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `program` (with `arg`, if given) with `output`.
    pub fn respond(&self, program: &str, arg: Option<&str>, output: CommandOutput) -> &Self {
        self.push_rule(program, arg, output, None)
    }

    /// Answer the next `times` matching invocations with `output`.
    pub fn respond_times(
        &self,
        program: &str,
        arg: Option<&str>,
        output: CommandOutput,
        times: usize,
    ) -> &Self {
        self.push_rule(program, arg, output, Some(times))
    }

    fn push_rule(
        &self,
        program: &str,
        arg: Option<&str>,
        output: CommandOutput,
        remaining: Option<usize>,
    ) -> &Self {
        self.rules.borrow_mut().push(Rule {
            program: program.to_string(),
            arg: arg.map(str::to_string),
            output,
            remaining,
        });
        self
    }

    /// All recorded invocations, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }

    /// Recorded invocations rendered as command lines.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.to_string()).collect()
    }

    /// Recorded invocations of `program`.
    pub fn calls_to(&self, program: &str) -> Vec<Invocation> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.program == program)
            .cloned()
            .collect()
    }

    pub fn ran(&self, program: &str) -> bool {
        self.calls.borrow().iter().any(|c| c.program == program)
    }
}

impl Runner for RecordingRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(invocation.clone());

        let mut rules = self.rules.borrow_mut();
        let matched = rules.iter_mut().find(|rule| {
            rule.program == invocation.program
                && rule.arg.as_deref().is_none_or(|a| invocation.has_arg(a))
                && rule.remaining != Some(0)
        });

        Ok(match matched {
            Some(rule) => {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                rule.output.clone()
            }
            None => CommandOutput::ok(""),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_builder_and_display() {
        let inv = Invocation::new("sgdisk")
            .arg("--zap-all")
            .args(["/dev/sda"])
            .env("LC_ALL", "C");
        assert_eq!(inv.to_string(), "sgdisk --zap-all /dev/sda");
        assert!(inv.has_arg("--zap-all"));
        assert_eq!(inv.env, vec![("LC_ALL".to_string(), "C".to_string())]);
        assert!(!inv.interactive);
    }

    #[test]
    fn test_redacted_display() {
        let inv = Invocation::new("iwctl")
            .args(["--passphrase", "hunter2", "station", "wlan0", "connect", "home"])
            .redact();
        assert_eq!(inv.to_string(), "iwctl [arguments redacted]");
    }

    #[test]
    fn test_piped_stdin_is_not_debug_printed() {
        let inv = Invocation::new("chpasswd").stdin_bytes("root:hunter2\n");
        assert!(!format!("{:?}", inv).contains("hunter2"));
    }

    #[test]
    fn test_recording_runner_rules() {
        let runner = RecordingRunner::new();
        runner.respond("lsblk", None, CommandOutput::ok("sda\n"));
        runner.respond_times("ping", None, CommandOutput::failed(1, "unreachable"), 1);

        let out = runner.run(&Invocation::new("lsblk")).unwrap();
        assert_eq!(out.stdout, "sda\n");

        assert!(!runner.succeeds(&Invocation::new("ping")));
        // Rule exhausted: default success
        assert!(runner.succeeds(&Invocation::new("ping")));

        assert_eq!(runner.calls_to("ping").len(), 2);
        assert!(runner.ran("lsblk"));
        assert!(!runner.ran("mkfs.ext4"));
    }

    #[test]
    fn test_run_checked_maps_failure() {
        let runner = RecordingRunner::new();
        runner.respond("sgdisk", Some("-n"), CommandOutput::failed(4, "no space\n"));

        let err = runner
            .run_checked(&Invocation::new("sgdisk").arg("-n"))
            .unwrap_err();
        match err {
            InstallError::Command { program, code, stderr } => {
                assert_eq!(program, "sgdisk");
                assert_eq!(code, 4);
                assert_eq!(stderr, "no space");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(runner.run_checked(&Invocation::new("sgdisk").arg("-Z")).is_ok());
    }

    #[test]
    fn test_system_runner_captures_output() {
        let out = SystemRunner
            .run(&Invocation::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]))
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.code, Some(3));
    }

    #[test]
    fn test_system_runner_pipes_stdin() {
        let out = SystemRunner
            .run(&Invocation::new("cat").stdin_bytes("piped\n"))
            .unwrap();
        assert_eq!(out.stdout, "piped\n");
    }

    #[test]
    fn test_stdin_write_failure_still_reaps_child() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exit 0", pid_file.display());
        // Far larger than a pipe buffer, and never read
        let err = SystemRunner
            .run(&Invocation::new("sh").args(["-c", script.as_str()]).stdin_bytes(vec![b'x'; 4 << 20]))
            .unwrap_err();
        assert!(matches!(err, InstallError::Io(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe));

        let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(!ChildRegistry::global().lock().unwrap().contains(pid));
        // A zombie would still accept signal 0
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[test]
    fn test_system_runner_missing_program() {
        let err = SystemRunner
            .run(&Invocation::new("definitely-not-a-real-program-12345"))
            .unwrap_err();
        assert!(matches!(err, InstallError::Command { code: 127, .. }));
    }
}
