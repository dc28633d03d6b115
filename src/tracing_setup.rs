//! Tracing setup for Undertow
//!
//! Undertow is a library, so the embedding client normally installs its own
//! subscriber and this module stays unused. For stand-alone tools and
//! debugging sessions it offers a ready-made init: console output at the
//! caller's level, with the peer-scheduling modules (`peer::swarm`,
//! `peer::manager`, `peer::choke`, `peer::candidates`) one notch more
//! verbose than the rest of the crate, since purge/ban/dial decisions are
//! what one is usually chasing. Passing a log directory additionally
//! captures this crate's full trace output to a file.

use std::fs::{create_dir_all, File};
use std::path::Path;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Modules whose decisions drive the swarm; logged one level finer.
const SCHEDULING_TARGETS: [&str; 4] = [
    "undertow::peer::swarm",
    "undertow::peer::manager",
    "undertow::peer::choke",
    "undertow::peer::candidates",
];

/// Installs a global subscriber for stand-alone use of this crate.
///
/// `RUST_LOG` overrides everything. Otherwise the console shows
/// `console_level` with the scheduling modules raised one notch. With a
/// `logs_dir`, `undertow-swarm.log` inside it captures this crate at trace
/// level (other crates stay at info so a host application cannot flood it).
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - If the log directory or file cannot be created
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let console = fmt::layer()
        .with_target(true)
        .compact()
        .with_filter(scheduling_filter(console_level));

    let registry = tracing_subscriber::registry().with(console);

    match logs_dir {
        Some(dir) => {
            create_dir_all(dir)?;
            let file = File::create(dir.join("undertow-swarm.log"))?;
            let file_layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(file)
                .with_filter(EnvFilter::new("info,undertow=trace"));
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }

    tracing::debug!(level = %console_level, "tracing initialized");
    Ok(())
}

/// Filter with the swarm-scheduling modules one notch finer than `base`.
fn scheduling_filter(base: Level) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut directives = base.to_string();
    let finer = one_notch_finer(base);
    for target in SCHEDULING_TARGETS {
        directives.push_str(&format!(",{target}={finer}"));
    }
    EnvFilter::new(directives)
}

fn one_notch_finer(level: Level) -> Level {
    match level {
        Level::ERROR => Level::WARN,
        Level::WARN => Level::INFO,
        Level::INFO => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Log levels for embedder-facing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Informational, warning, and error messages
    Info,
    /// Debug, informational, warning, and error messages
    Debug,
    /// All messages including detailed tracing
    Trace,
}

impl LogLevel {
    /// Converts to the tracing Level enum.
    pub fn as_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("Invalid log level: {s}")),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}
