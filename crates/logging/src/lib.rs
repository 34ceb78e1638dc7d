//! MeshTunnel Logging
//!
//! `tracing-subscriber` setup shared by the binaries. `RUST_LOG` always wins
//! over the level chosen here.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::{fmt as fmt_layer, prelude::*, EnvFilter};

/// Default verbosity when `RUST_LOG` is unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Pick the level for a `-v` flag
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Filter directives: the workspace crates log at this level, everything
    /// else at info (or quieter).
    pub fn directives(self) -> String {
        match self {
            LogLevel::Error | LogLevel::Warn => self.as_str().to_string(),
            LogLevel::Info => "info".to_string(),
            level => format!("info,meshtunnel={}", level.as_str()),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

fn filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directives()))
}

/// Install the global subscriber.
///
/// Panics if one is already installed; use [`try_init`] when that can happen.
pub fn init(level: LogLevel) {
    tracing_subscriber::registry()
        .with(fmt_layer::layer())
        .with(filter(level))
        .init();
}

/// Install the global subscriber unless one already exists
pub fn try_init(level: LogLevel) -> Result<(), String> {
    tracing_subscriber::registry()
        .with(fmt_layer::layer())
        .with(filter(level))
        .try_init()
        .map_err(|e| e.to_string())
}
