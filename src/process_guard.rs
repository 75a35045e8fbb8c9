//! Child process lifetime management.
//!
//! Destructive tools (`sgdisk`, `mkfs.*`, `pacstrap`) must not outlive the
//! installer. Non-interactive children are spawned as leaders of their own
//! process group with a parent-death signal and tracked in a global registry.
//! When the installer receives SIGINT, SIGTERM or SIGHUP every tracked group
//! gets SIGTERM, then SIGKILL once the grace period runs out.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

static REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Grace period between SIGTERM and SIGKILL on a signal-driven shutdown.
pub const SIGNAL_GRACE: Duration = Duration::from_secs(3);
/// Grace period when the [`ProcessGuard`] is dropped.
pub const DROP_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Process group leaders of the external operations currently running.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    leaders: HashSet<u32>,
    shutting_down: bool,
}

impl ChildRegistry {
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.leaders.insert(pid);
        tracing::trace!(pid, "external operation tracked");
    }

    pub fn unregister(&mut self, pid: u32) {
        self.leaders.remove(&pid);
        tracing::trace!(pid, "external operation finished");
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.leaders.contains(&pid)
    }

    pub fn count(&self) -> usize {
        self.leaders.len()
    }

    /// Stop every tracked group: SIGTERM, up to `grace` to exit, then
    /// SIGKILL. Only the first call does anything.
    pub fn terminate_all(&mut self, grace: Duration) {
        if std::mem::replace(&mut self.shutting_down, true) || self.leaders.is_empty() {
            return;
        }
        let leaders: Vec<u32> = self.leaders.drain().collect();
        tracing::info!(count = leaders.len(), "stopping running external operations");

        leaders.iter().for_each(|&pid| deliver(pid, Signal::SIGTERM));

        let deadline = Instant::now() + grace;
        let mut survivors = running(&leaders);
        while !survivors.is_empty() && Instant::now() < deadline {
            std::thread::sleep(POLL_INTERVAL);
            survivors = running(&leaders);
        }

        for pid in survivors {
            tracing::warn!(pid, "operation ignored SIGTERM, killing its process group");
            deliver(pid, Signal::SIGKILL);
        }
    }
}

fn running(pids: &[u32]) -> Vec<u32> {
    pids.iter().copied().filter(|&pid| is_running(pid)).collect()
}

/// Signal the group led by `pid`, or the process alone when it has no group.
fn deliver(pid: u32, sig: Signal) {
    let pid = pid as i32;
    if signal::kill(Pid::from_raw(-pid), sig).is_ok() {
        return;
    }
    if let Err(err) = signal::kill(Pid::from_raw(pid), sig) {
        tracing::debug!(pid, signal = %sig, %err, "signal not delivered");
    }
}

/// Process state letter from the contents of `/proc/<pid>/stat`.
fn stat_state(stat: &str) -> Option<&str> {
    // The command name may contain spaces and parentheses; the state follows
    // the last ')'
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().next()
}

/// Exists and is neither a zombie nor dead.
fn is_running(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !matches!(stat_state(&stat), Some("Z" | "X")),
        Err(_) => true,
    }
}

/// Stops every tracked operation when dropped. Held by `main` for the
/// whole run.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }

    pub fn child_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(DROP_GRACE);
        }
    }
}

/// Watch for SIGINT/SIGTERM/SIGHUP on a background thread. Call once at
/// startup.
///
/// A signal stops every tracked operation and exits with `128 + signal`.
/// Nothing is rolled back.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        let Some(sig) = signals.forever().next() else {
            return;
        };
        let name = Signal::try_from(sig).map(Signal::as_str).unwrap_or("signal");
        tracing::error!(signal = name, "installer interrupted");

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.terminate_all(SIGNAL_GRACE);
        }
        std::process::exit(128 + sig);
    });

    Ok(())
}

/// Spawn as leader of a new process group that dies with the installer.
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: setpgid and prctl are async-signal-safe.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn reaped_within(pid: u32, timeout: Duration) -> bool {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return true,
                Err(nix::errno::Errno::ECHILD) if !is_running(pid) => return true,
                _ => {}
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_registry_tracks_leaders() {
        let mut registry = ChildRegistry::default();
        registry.register(1234);
        registry.register(5678);
        registry.register(1234);
        assert_eq!(registry.count(), 2);

        registry.unregister(1234);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_terminate_all_stops_group_and_grandchildren() {
        let child = Command::new("sh")
            .args(["-c", "sleep 60 & wait"])
            .in_new_process_group()
            .spawn()
            .expect("spawn sh");
        let pid = child.id();

        let mut registry = ChildRegistry::default();
        registry.register(pid);
        assert!(is_running(pid));

        registry.terminate_all(Duration::from_millis(500));
        assert!(reaped_within(pid, Duration::from_secs(2)));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_terminate_all_runs_once() {
        let mut registry = ChildRegistry::default();
        registry.register(999_999);
        registry.terminate_all(Duration::from_millis(10));
        assert!(registry.shutting_down);

        registry.register(999_998);
        registry.terminate_all(Duration::from_millis(10));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_stat_state() {
        assert_eq!(stat_state("42 (sgdisk) R 1 42 42"), Some("R"));
        assert_eq!(stat_state("43 (weird) name)) Z 1 43"), Some("Z"));
        assert_eq!(stat_state("garbage"), None);
    }

    #[test]
    fn test_missing_pid_is_not_running() {
        assert!(!is_running(999_999));
    }
}
