//! Mirror ranking via reflector.
//!
//! Runs before disk preparation. Never fatal: when ranking fails or the
//! network is down the live environment's mirrorlist is kept and the
//! installation continues.

use std::fmt;

use crate::network::Connectivity;
use crate::runner::{Invocation, Runner};

pub const MIRRORLIST_PATH: &str = "/etc/pacman.d/mirrorlist";

/// Outcome of a ranking attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorRankResult {
    /// Mirrors ranked and saved; `country` is the filter that was applied.
    Ranked {
        country: Option<String>,
        /// Upper bound passed to reflector, not the number it wrote
        limit: u32,
    },
    Skipped(SkipReason),
    /// reflector failed; the existing mirrorlist is kept.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
}

impl fmt::Display for MirrorRankResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ranked { country: Some(c), limit } => {
                write!(f, "Ranked up to {} mirrors ({})", limit, c)
            }
            Self::Ranked { country: None, limit } => {
                write!(f, "Ranked up to {} mirrors (worldwide)", limit)
            }
            Self::Skipped(reason) => write!(f, "Skipped: {}", reason),
            Self::Failed(err) => write!(f, "Failed: {}", err),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "no network connectivity"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorOptions {
    /// ISO 3166-1 alpha-2 filter
    pub country: Option<String>,
    pub limit: u32,
    pub save_path: String,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            country: None,
            limit: 20,
            save_path: MIRRORLIST_PATH.to_string(),
        }
    }
}

fn reflector(options: &MirrorOptions, country: Option<&str>) -> Invocation {
    let mut inv = Invocation::new("reflector");
    if let Some(country) = country {
        inv = inv.args(["--country", country]);
    }
    inv.args(["--protocol", "https", "--latest"])
        .arg(options.limit.to_string())
        .args(["--sort", "rate", "--save"])
        .arg(options.save_path.as_str())
}

/// Rank mirrors. A failed country-filtered run falls back to one worldwide run.
pub fn rank_mirrors(
    runner: &dyn Runner,
    connectivity: &dyn Connectivity,
    options: &MirrorOptions,
) -> MirrorRankResult {
    if !connectivity.is_reachable() {
        tracing::warn!("mirror ranking skipped: no network connectivity");
        return MirrorRankResult::Skipped(SkipReason::Offline);
    }

    let mut attempts: Vec<Option<&str>> = Vec::new();
    if let Some(country) = options.country.as_deref() {
        attempts.push(Some(country));
    }
    attempts.push(None);

    let mut last_error = String::new();
    for country in attempts {
        tracing::info!(country = country.unwrap_or("worldwide"), limit = options.limit, "ranking mirrors");
        match runner.run(&reflector(options, country)) {
            Ok(out) if out.success() => {
                return MirrorRankResult::Ranked {
                    country: country.map(str::to_string),
                    limit: options.limit,
                };
            }
            Ok(out) => {
                last_error = format!(
                    "reflector exited with code {}: {}",
                    out.code.unwrap_or(-1),
                    out.stderr.trim()
                );
            }
            Err(e) => last_error = format!("reflector failed to execute: {}", e),
        }
        tracing::warn!(error = %last_error, "mirror ranking attempt failed");
    }

    MirrorRankResult::Failed(format!("{}; keeping existing mirrorlist", last_error))
}
