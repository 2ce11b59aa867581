//! Orchestration core for synchronized multi-device acquisition.
//!
//! This crate owns device state, provisioning and the start/stop protocol
//! for two device families with different I/O models:
//!
//! - **Serial trigger boxes** ([`TriggerDevice`]): one blocking reader
//!   thread per port feeds inbound lines through the state machine in
//!   [`DeviceStatus::apply`] into the shared [`StatusRegistry`]. A
//!   [`Provisioner`] per box walks the wifi handshake using claims from the
//!   [`CredentialPool`].
//!
//! - **Wireless sensors** ([`SensorDomain`]): a dedicated thread runs a
//!   current-thread tokio runtime; each sensor is a local actor task.
//!   Callers hand requests in through a queue and block on oneshot replies.
//!
//! - **[`Session`]**: ties both together. START/STOP go out through the
//!   bounded fan-out in [`broadcast`], then to the sensor domain, and wait
//!   a bounded time for echoes. Sticky one-shot signals in
//!   [`SessionBarrier`] let every thread and task observe start and stop
//!   without missing them.
//!
//! - **Operator console** ([`run_console`]): parses operator commands and
//!   routes manual-override credential requests from provisioning threads
//!   through the same event queue.

pub mod barrier;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fanout;
pub mod model;
pub mod operator;
pub mod provisioning;
pub mod registry;
pub mod sensor;
pub mod session;
pub mod trigger;

#[cfg(test)]
mod testing;

// ── Primary re-exports ──────────────────────────────────────────────
pub use barrier::{SessionBarrier, StickySignal};
pub use config::{FanoutConfig, GattLayout, ProvisioningConfig, SensorConfig, SessionConfig};
pub use credentials::{Credential, CredentialPool, parse_credentials};
pub use error::CoreError;
pub use fanout::{CommandTarget, FanoutReport, broadcast};
pub use operator::{
    ConsoleEvent, ConsolePrompt, ConsoleView, CredentialRequest, OperatorCommand, run_console,
};
pub use provisioning::{CredentialPrompt, Provisioner, ProvisioningOutcome};
pub use registry::StatusRegistry;
pub use sensor::{CaptureLog, SensorAck, SensorDomain, SensorReport};
pub use session::{Session, SessionBuilder, SessionReport};
pub use trigger::TriggerDevice;

pub use model::{
    CommandEcho, ConnectionState, DeviceCommand, DeviceId, DeviceKind, DeviceStatus,
    InboundMessage, Transition, WifiState,
};
