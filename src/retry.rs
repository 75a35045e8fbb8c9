//! Bounded retry helpers.
//!
//! Every wait in the installer is a fixed number of attempts separated by a
//! fixed interval: device nodes after a partition table reload, reachability
//! after a network change, a wireless interface after a driver reload. Nothing
//! blocks indefinitely.

use std::time::Duration;

/// Sleeping seam so tests can run retry loops instantly.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Real thread sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Never sleeps. For tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) {}
}

/// Attempt budget for a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Device nodes after `partprobe`: 30 × 1 s.
    pub const DEVICE_NODES: Self = Self::new(30, Duration::from_secs(1));
    /// Reachability after a network change: 10 × 3 s.
    pub const REACHABILITY: Self = Self::new(10, Duration::from_secs(3));
    /// Wireless interface after a driver reload: 10 × 2 s.
    pub const WIFI_INTERFACE: Self = Self::new(10, Duration::from_secs(2));
}

/// Run `op` up to `policy.attempts` times, sleeping between failed attempts.
///
/// Returns the first success, or the error of the last attempt. With zero
/// attempts configured the operation still runs once.
pub fn retry<T, E, F>(policy: RetryPolicy, sleeper: &dyn Sleeper, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(_) => {
                tracing::debug!(attempt, attempts, "attempt failed, retrying");
                sleeper.sleep(policy.interval);
                attempt += 1;
            }
        }
    }
}

/// Boolean variant of [`retry`]: true as soon as `predicate` holds.
pub fn poll_until<F>(policy: RetryPolicy, sleeper: &dyn Sleeper, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    retry(policy, sleeper, |_| if predicate() { Ok(()) } else { Err(()) }).is_ok()
}
