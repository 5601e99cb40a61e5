//! Tracing subscriber setup for the `buildsect` binary
//!
//! Logs go to stderr; stdout carries the bisect progress and report.
//!
//! # Filter priority (highest first)
//!
//! 1. `BUILDSECT_LOG` (directives, e.g. `buildsect::build=debug,warn`)
//! 2. `RUST_LOG`
//! 3. `-v` / `-q`
//! 4. `warn`

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Project filter variable
pub const LOG_ENV: &str = "BUILDSECT_LOG";

/// Verbosity chosen on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Verbosity {
    /// `-q`: errors only
    Quiet,
    /// Warnings and above
    #[default]
    Normal,
    /// `-v`: engine progress and build output
    Verbose,
}

impl Verbosity {
    /// From the `-v` / `-q` flags; `-v` wins when both are given
    #[must_use]
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    /// Level used when no environment filter is set
    #[must_use]
    pub const fn default_level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::WARN,
            Self::Verbose => Level::DEBUG,
        }
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_subscriber(verbosity: Verbosity, no_color: bool) {
    let filter = build_env_filter(
        verbosity,
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let use_ansi = !no_color && std::io::IsTerminal::is_terminal(&std::io::stderr());

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(use_ansi)
        .with_target(true)
        .with_level(true);

    let installed = if verbosity == Verbosity::Verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.with_timer(fmt::time::uptime()))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.without_time().compact())
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Unparseable directives fall through to the next source
pub(crate) fn build_env_filter(
    verbosity: Verbosity,
    project: Option<&str>,
    rust_log: Option<&str>,
) -> EnvFilter {
    for directives in [project, rust_log].into_iter().flatten() {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
    }

    let level = verbosity.default_level();
    let directive = if verbosity == Verbosity::Verbose {
        format!("{level},buildsect=debug,buildsect_core=debug")
    } else {
        level.to_string()
    };
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}
