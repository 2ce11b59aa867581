// ── Core error types ──
//
// Every per-device failure carries the device identity so it can be
// reported and isolated. Only `NoDevices` is fatal to a session; the rest
// exclude one device or reject one operator action.
// The `From<LinkError>` impl translates transport errors into these.

use capsync_link::LinkError;
use thiserror::Error;

use crate::model::DeviceId;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Device errors ────────────────────────────────────────────────
    #[error("Cannot open {device}: {reason}")]
    Connection { device: DeviceId, reason: String },

    #[error("Provisioning of {device} failed after {attempts} attempt(s)")]
    Provisioning { device: DeviceId, attempts: u32 },

    #[error("I/O failure on {device}: {reason}")]
    Io { device: DeviceId, reason: String },

    #[error("No working data channel on {device}: {reason}")]
    Negotiation { device: DeviceId, reason: String },

    // ── Session errors ───────────────────────────────────────────────
    #[error("No devices could be opened ({attempted} serial port(s) tried, no sensors connected)")]
    NoDevices { attempted: usize },

    #[error("Recording has already been started")]
    AlreadyStarted,

    #[error("Recording has not been started")]
    NotStarted,

    #[error("Session is already closed")]
    SessionClosed,

    #[error("Sensor domain unavailable: {reason}")]
    SensorDomain { reason: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CoreError {
    /// The device this error concerns, for per-device failures.
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Self::Connection { device, .. }
            | Self::Provisioning { device, .. }
            | Self::Io { device, .. }
            | Self::Negotiation { device, .. } => Some(device),
            _ => None,
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<LinkError> for CoreError {
    fn from(err: LinkError) -> Self {
        let device = DeviceId::from(err.target().unwrap_or("<unknown>"));
        match err {
            LinkError::Open { reason, .. } => CoreError::Connection { device, reason },
            LinkError::Io { source, .. } => CoreError::Io {
                device,
                reason: source.to_string(),
            },
            LinkError::Closed { .. } => CoreError::Io {
                device,
                reason: "link is closed".into(),
            },
            LinkError::MissingCharacteristic { uuid, .. } => CoreError::Negotiation {
                device,
                reason: format!("characteristic {uuid} not available"),
            },
            LinkError::Bluetooth { reason, .. } => CoreError::Io { device, reason },
            LinkError::NoAdapter => CoreError::SensorDomain {
                reason: "no bluetooth adapter available".into(),
            },
        }
    }
}
