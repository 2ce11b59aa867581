// ── Domain model ──
//
// Device identity, the per-device status record and the serial line
// protocol vocabulary. Everything here is plain data; the shared,
// lock-protected view lives in `registry`.

pub mod device;
pub mod protocol;
pub mod status;

// ── Re-exports ──────────────────────────────────────────────────────
pub use device::{ConnectionState, DeviceId, DeviceKind, WifiState};
pub use protocol::{CommandEcho, DeviceCommand, InboundMessage};
pub use status::{DeviceStatus, Transition};
