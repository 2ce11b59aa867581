//! Configuration for the capsync binary.
//!
//! One TOML file (platform config dir or an explicit path), layered over
//! built-in defaults and `CAPSYNC_` environment variables, translated into
//! a `capsync_core::SessionConfig` plus the serial opener settings. The
//! network credential list lives in its own plain-text file.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use capsync_core::{
    Credential, FanoutConfig, GattLayout, ProvisioningConfig, SensorConfig, SessionConfig,
    parse_credentials,
};
use capsync_link::SerialPortOpener;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file already exists: {}", path.display())]
    Exists { path: PathBuf },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialSection,

    #[serde(default)]
    pub provisioning: ProvisioningSection,

    #[serde(default)]
    pub fanout: FanoutSection,

    #[serde(default)]
    pub sensors: SensorSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialSection {
    /// Ports to open, one trigger box each.
    pub ports: Vec<String>,
    pub baud: u32,
    pub read_timeout_ms: u64,
    /// Pause after opening a port; boards reset on open.
    pub open_settle_ms: u64,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            baud: 115_200,
            read_timeout_ms: 1000,
            open_settle_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisioningSection {
    /// `name,secret` lines. Relative paths resolve against the working
    /// directory.
    pub credentials_file: PathBuf,
    pub attempt_timeout_secs: u64,
    pub settle_ms: u64,
    pub max_attempts: u32,
    pub manual_override: bool,
    pub override_timeout_secs: u64,
}

impl Default for ProvisioningSection {
    fn default() -> Self {
        Self {
            credentials_file: PathBuf::from("networks.txt"),
            attempt_timeout_secs: 15,
            settle_ms: 500,
            max_attempts: 3,
            manual_override: true,
            override_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FanoutSection {
    pub workers: usize,
    pub ack_timeout_secs: u64,
    /// Zero disables the periodic STATUS probe.
    pub status_interval_secs: u64,
}

impl Default for FanoutSection {
    fn default() -> Self {
        Self {
            workers: 8,
            ack_timeout_secs: 5,
            status_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SensorSection {
    pub enabled: bool,
    pub name_filter: String,
    pub max_sensors: usize,
    pub scan_secs: u64,
    pub connect_settle_ms: u64,
    pub probe_window_ms: u64,
    pub configure_attempts: u32,
    pub configure_pause_ms: u64,
    pub op_timeout_secs: u64,
    /// Defaults to the platform data directory.
    pub capture_dir: Option<PathBuf>,
    pub gatt: GattSection,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            name_filter: "Movella DOT".into(),
            max_sensors: 5,
            scan_secs: 5,
            connect_settle_ms: 2500,
            probe_window_ms: 3000,
            configure_attempts: 3,
            configure_pause_ms: 1500,
            op_timeout_secs: 10,
            capture_dir: None,
            gatt: GattSection::default(),
        }
    }
}

/// Characteristic layout overrides for other sensor firmware.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GattSection {
    pub control: Uuid,
    pub data_candidates: Vec<Uuid>,
    pub config_candidates: Vec<Uuid>,
    pub start_opcode: Vec<u8>,
    pub stop_opcode: Vec<u8>,
    pub config_payload: Vec<u8>,
}

impl Default for GattSection {
    fn default() -> Self {
        let g = GattLayout::default();
        Self {
            control: g.control,
            data_candidates: g.data_candidates,
            config_candidates: g.config_candidates,
            start_opcode: g.start_opcode,
            stop_opcode: g.stop_opcode,
            config_payload: g.config_payload,
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "capsync", "capsync")
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(".config").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default directory for capture files.
pub fn capture_dir() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(".local/share").join("captures"),
        |dirs| dirs.data_dir().join("captures"),
    )
}

fn home_fallback(sub: &str) -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(sub);
    p.push("capsync");
    p
}

// ── Loading ─────────────────────────────────────────────────────────

/// Load the config from `path` (or the default location) merged over the
/// defaults and `CAPSYNC_*` environment variables. A missing file is not
/// an error.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    debug!(path = %path.display(), "loading config");

    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("CAPSYNC_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Read a credentials file. A missing file yields an empty list.
pub fn load_credentials(path: &Path) -> Result<Vec<Credential>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let credentials = parse_credentials(&text);
            debug!(path = %path.display(), count = credentials.len(), "credentials loaded");
            Ok(credentials)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "credentials file not found, provisioning disabled");
            Ok(Vec::new())
        }
        Err(source) => Err(ConfigError::Read {
            path: path.to_owned(),
            source,
        }),
    }
}

// ── Saving ──────────────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

/// Write a default config to `path`, refusing to overwrite.
pub fn init_config(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        return Err(ConfigError::Exists {
            path: path.to_owned(),
        });
    }
    let cfg = Config::default();
    save_config(&cfg, path)?;
    Ok(cfg)
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Build the runtime session config. Credentials are passed in so the
    /// caller decides which file they come from.
    pub fn to_session_config(
        &self,
        credentials: Vec<Credential>,
    ) -> Result<SessionConfig, ConfigError> {
        let workers = NonZeroUsize::new(self.fanout.workers).ok_or_else(|| {
            ConfigError::Validation {
                field: "fanout.workers".into(),
                reason: "must be at least 1".into(),
            }
        })?;
        if self.provisioning.max_attempts == 0 {
            return Err(ConfigError::Validation {
                field: "provisioning.max_attempts".into(),
                reason: "must be at least 1".into(),
            });
        }
        let s = &self.sensors;
        if s.gatt.data_candidates.is_empty() {
            return Err(ConfigError::Validation {
                field: "sensors.gatt.data_candidates".into(),
                reason: "at least one candidate is required".into(),
            });
        }

        let p = &self.provisioning;
        Ok(SessionConfig {
            ports: self.serial.ports.clone(),
            credentials,
            provisioning: ProvisioningConfig {
                attempt_timeout: Duration::from_secs(p.attempt_timeout_secs),
                settle: Duration::from_millis(p.settle_ms),
                max_attempts: p.max_attempts,
                manual_override: p.manual_override,
                override_timeout: Duration::from_secs(p.override_timeout_secs),
            },
            fanout: FanoutConfig {
                workers,
                ack_timeout: Duration::from_secs(self.fanout.ack_timeout_secs),
                status_interval: Duration::from_secs(self.fanout.status_interval_secs),
            },
            sensors: SensorConfig {
                name_filter: s.name_filter.clone(),
                max_sensors: s.max_sensors,
                scan_window: Duration::from_secs(s.scan_secs),
                connect_settle: Duration::from_millis(s.connect_settle_ms),
                probe_window: Duration::from_millis(s.probe_window_ms),
                configure_attempts: s.configure_attempts,
                configure_pause: Duration::from_millis(s.configure_pause_ms),
                op_timeout: Duration::from_secs(s.op_timeout_secs),
                capture_dir: s.capture_dir.clone().unwrap_or_else(capture_dir),
                gatt: GattLayout {
                    control: s.gatt.control,
                    data_candidates: s.gatt.data_candidates.clone(),
                    config_candidates: s.gatt.config_candidates.clone(),
                    start_opcode: s.gatt.start_opcode.clone(),
                    stop_opcode: s.gatt.stop_opcode.clone(),
                    config_payload: s.gatt.config_payload.clone(),
                },
            },
        })
    }

    /// Opener for real serial ports with this config's settings.
    pub fn serial_opener(&self) -> SerialPortOpener {
        SerialPortOpener {
            baud: self.serial.baud,
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
            settle: Duration::from_millis(self.serial.open_settle_ms),
        }
    }
}
