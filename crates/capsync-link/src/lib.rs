//! Device transports for the capsync workspace.
//!
//! Two device families, two I/O models:
//!
//! - **Serial trigger boxes**: [`SerialLink`] wraps a blocking byte channel
//!   (a real port from [`SerialPortOpener`], or anything `Read + Write`).
//!   Outbound commands are newline-terminated text; inbound traffic is split
//!   into lines by a [`LineReader`] meant to run on a dedicated thread.
//!
//! - **Wireless sensors**: [`SensorLink`] / [`SensorScanner`] describe a
//!   characteristic-based link driven from a cooperative async scheduler.
//!   The `ble` feature provides a `btleplug` implementation.
//!
//! Neither family interprets payloads here: lines and notification frames
//! are handed up to `capsync-core` as-is.

pub mod error;
pub mod sensor;
pub mod serial;

#[cfg(feature = "ble")]
pub mod ble;

// ── Primary re-exports ──────────────────────────────────────────────
pub use error::LinkError;
pub use sensor::{Advertisement, Notification, SensorLink, SensorScanner, decode_le_f32};
pub use serial::{LineReader, PortOpener, PortSummary, SerialLink, SerialPortOpener, list_ports};
