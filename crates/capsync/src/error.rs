//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use capsync_config::ConfigError;
use capsync_core::CoreError;
use capsync_link::LinkError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Devices ──────────────────────────────────────────────────────

    #[error("No devices could be opened ({attempted} serial port(s) tried)")]
    #[diagnostic(
        code(capsync::no_devices),
        help(
            "Check cabling and the port names passed with --port or set in [serial] ports.\n\
             Try: capsync ports"
        )
    )]
    NoDevices { attempted: usize },

    #[error("Serial port enumeration failed: {reason}")]
    #[diagnostic(
        code(capsync::ports),
        help("Check that the serial subsystem is accessible to this user.")
    )]
    Ports { reason: String },

    #[error("Sensor setup failed: {reason}")]
    #[diagnostic(
        code(capsync::sensors),
        help("Check that Bluetooth is enabled, or pass --no-sensors.")
    )]
    Sensors { reason: String },

    #[error("{message}")]
    #[diagnostic(code(capsync::session))]
    Session { message: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Invalid {field}: {reason}")]
    #[diagnostic(code(capsync::validation))]
    Validation { field: String, reason: String },

    #[error("{what} not found: {}", path.display())]
    #[diagnostic(code(capsync::not_found), help("Check the path and try again."))]
    NotFound { what: String, path: PathBuf },

    #[error("Config file already exists: {}", path.display())]
    #[diagnostic(
        code(capsync::config_exists),
        help("Use --force to overwrite it, or edit the file directly.")
    )]
    ConfigExists { path: PathBuf },

    #[error(transparent)]
    #[diagnostic(code(capsync::config))]
    Config(ConfigError),

    // ── IO / Serialization ───────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render config: {0}")]
    #[diagnostic(code(capsync::toml))]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoDevices { .. } | Self::Sensors { .. } => exit_code::CONNECTION,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Validation { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NoDevices { attempted } => CliError::NoDevices { attempted },
            CoreError::SensorDomain { reason } => CliError::Sensors { reason },
            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },
            other => CliError::Session {
                message: other.to_string(),
            },
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::Exists { path } => CliError::ConfigExists { path },
            other => CliError::Config(other),
        }
    }
}

impl From<LinkError> for CliError {
    fn from(err: LinkError) -> Self {
        CliError::Ports {
            reason: err.to_string(),
        }
    }
}
