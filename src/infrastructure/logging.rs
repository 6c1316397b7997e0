//! Tracing setup for binaries embedding the pod core.
//!
//! The library itself only emits `tracing` events and never installs a
//! subscriber; that is the embedder's call. [`init_logger`] wires console
//! and rolling-file output from a [`LogSettings`] and hands back a guard
//! that must stay alive for file logs to flush.

use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Default directive set; `RUST_LOG` wins when present.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub console: bool,
    /// Directory for rolling log files. `None` disables file logging.
    #[serde(default = "default_log_dir")]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_rotation")]
    pub rotation: LogRotation,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            rotation: default_rotation(),
            show_file_line: default_true(),
            show_target: default_true(),
            ansi_colors: default_true(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_log_dir() -> Option<PathBuf> {
    Some(PathBuf::from("logs"))
}
fn default_prefix() -> String {
    "acoustic_pod".to_string()
}
fn default_rotation() -> LogRotation {
    LogRotation::Daily
}

/// Keeps the non-blocking file writers alive. Dropping it stops flushing.
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Installs the global subscriber. Fails if one is already set, which an
/// embedding app may legitimately have done first.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = settings.console.then(|| {
        fmt::layer()
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    let file_layer = settings.log_dir.as_ref().map(|dir| {
        let appender =
            RollingFileAppender::new(settings.rotation.into(), dir, &settings.file_name_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_target(settings.show_target)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!("Logging initialized");
    Ok(LoggingGuard { _guards: guards })
}
