use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the `capsync-link` crate.
///
/// Covers every failure mode of both transport families. `capsync-core`
/// maps these into per-device diagnostics; nothing here is fatal to a
/// session on its own.
#[derive(Debug, Error)]
pub enum LinkError {
    // ── Opening ─────────────────────────────────────────────────────
    /// The transport could not be opened (port busy, missing, permission).
    #[error("cannot open {target}: {reason}")]
    Open { target: String, reason: String },

    // ── Established links ───────────────────────────────────────────
    /// Read or write failed on an already-open transport.
    #[error("I/O error on {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// The link was closed locally; no further traffic is possible.
    #[error("link {target} is closed")]
    Closed { target: String },

    // ── Wireless ────────────────────────────────────────────────────
    /// The peripheral does not expose the requested characteristic.
    #[error("characteristic {uuid} not available on {target}")]
    MissingCharacteristic { target: String, uuid: Uuid },

    /// Error reported by the Bluetooth stack.
    #[error("bluetooth error on {target}: {reason}")]
    Bluetooth { target: String, reason: String },

    /// No Bluetooth adapter is present on this host.
    #[error("no bluetooth adapter available")]
    NoAdapter,
}

impl LinkError {
    /// Identity of the device this error concerns, when known.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Open { target, .. }
            | Self::Io { target, .. }
            | Self::Closed { target }
            | Self::MissingCharacteristic { target, .. }
            | Self::Bluetooth { target, .. } => Some(target),
            Self::NoAdapter => None,
        }
    }
}
