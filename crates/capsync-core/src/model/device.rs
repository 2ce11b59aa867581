use std::fmt;

use strum::{Display, IntoStaticStr};

/// Stable identity of one physical device: a serial port name or a
/// wireless address. Unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which device family a status record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum DeviceKind {
    /// Serial trigger box relaying commands to a camera.
    Trigger,
    /// Wireless inertial sensor.
    Sensor,
}

/// Connection lifecycle of a device.
///
/// `Failed` and `Closed` are terminal for inbound traffic: only the
/// orchestrator moves a device out of them (and only into `Closed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Closed,
    Open,
    Provisioning,
    Ready,
    Recording,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Wifi handshake state of a serial trigger box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum WifiState {
    Unprovisioned,
    AwaitingSsid,
    AwaitingPassword,
    Connected,
    Disconnected,
}
