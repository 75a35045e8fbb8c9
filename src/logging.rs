//! Run log setup.
//!
//! Two sinks: stderr for the operator (info, or debug with `--debug`,
//! `RUST_LOG` wins over both) and the run log file, which is truncated at
//! start and always records debug detail without ANSI colours.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::fmt;

use crate::error::Result;

/// Run log of the live-environment instance.
pub const RUN_LOG: &str = "/var/log/archstrap.log";
/// Run log of the inner instance, inside the installed root.
pub const CHROOT_LOG: &str = "/var/log/archstrap-chroot.log";

fn stderr_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }))
}

/// Install the global subscriber.
///
/// Returns the log file path when it could be opened; without one the run
/// continues with stderr only.
pub fn init(log_path: Option<&Path>, debug: bool) -> Option<PathBuf> {
    let file = log_path.and_then(|path| match open_truncated(path) {
        Ok(file) => Some((path.to_path_buf(), file)),
        Err(e) => {
            eprintln!("warning: cannot open run log {}: {}", path.display(), e);
            None
        }
    });
    let opened = file.as_ref().map(|(path, _)| path.clone());

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter(debug));
    let file_layer = file.map(|(_, file)| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(LevelFilter::DEBUG)
    });

    // Fails only when a subscriber is already installed (tests)
    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    opened
}

fn open_truncated(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}

/// Copy the run log to the same path under `root`.
pub fn copy_into_root(log_path: &Path, root: &Path) -> Result<PathBuf> {
    let relative = log_path.strip_prefix("/").unwrap_or(log_path);
    let target = root.join(relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(log_path, &target)?;
    tracing::debug!(target = %target.display(), "run log copied into root");
    Ok(target)
}
