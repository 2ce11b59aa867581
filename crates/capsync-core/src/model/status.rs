// ── Per-device status record ──
//
// The serial state machine lives here as `DeviceStatus::apply`, a pure
// function over one record so it can be tested without any transport.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::device::{ConnectionState, DeviceKind, WifiState};
use super::protocol::{CommandEcho, InboundMessage};

/// Snapshot of one device's state.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub kind: DeviceKind,
    pub connection: ConnectionState,
    /// Serial trigger boxes only.
    pub wifi: Option<WifiState>,
    pub last_command_echo: Option<CommandEcho>,
    pub last_error: Option<String>,
    /// Last free-form diagnostic line.
    pub last_message: Option<String>,
    /// Network name currently claimed by this device.
    pub assigned_network: Option<String>,
    /// Bound wireless data characteristic.
    pub data_channel: Option<Uuid>,
    /// Wireless negotiation completed.
    pub negotiated: bool,
    /// Bumped on every wifi transition. Waiters compare against a value
    /// captured before sending a command to ignore stale states.
    pub wifi_revision: u64,
    /// Bumped on every command echo.
    pub echo_revision: u64,
    pub updated_at: DateTime<Utc>,
}

/// Formal state change caused by one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connection {
        from: ConnectionState,
        to: ConnectionState,
    },
    Wifi {
        from: Option<WifiState>,
        to: WifiState,
    },
}

impl DeviceStatus {
    /// Fresh record for a just-opened serial trigger box.
    pub fn trigger() -> Self {
        Self::new(DeviceKind::Trigger, Some(WifiState::Unprovisioned))
    }

    /// Fresh record for a just-connected wireless sensor.
    pub fn sensor() -> Self {
        Self::new(DeviceKind::Sensor, None)
    }

    fn new(kind: DeviceKind, wifi: Option<WifiState>) -> Self {
        Self {
            kind,
            connection: ConnectionState::Open,
            wifi,
            last_command_echo: None,
            last_error: None,
            last_message: None,
            assigned_network: None,
            data_channel: None,
            negotiated: false,
            wifi_revision: 0,
            echo_revision: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether a START/STOP broadcast should include this device.
    pub fn is_eligible(&self) -> bool {
        let linked = match self.kind {
            DeviceKind::Trigger => self.wifi == Some(WifiState::Connected),
            DeviceKind::Sensor => self.negotiated,
        };
        linked
            && matches!(
                self.connection,
                ConnectionState::Ready | ConnectionState::Recording
            )
    }

    // ── Orchestrator-side mutations ─────────────────────────────────

    /// Move to a new connection state. Returns the transition if the state
    /// actually changed. `Closed` is final; `Failed` may only become `Closed`.
    pub fn set_connection(&mut self, to: ConnectionState) -> Option<Transition> {
        let from = self.connection;
        let allowed = match from {
            ConnectionState::Closed => false,
            ConnectionState::Failed => to == ConnectionState::Closed,
            _ => from != to,
        };
        if !allowed {
            return None;
        }
        self.connection = to;
        Some(Transition::Connection { from, to })
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Option<Transition> {
        self.last_error = Some(reason.into());
        self.set_connection(ConnectionState::Failed)
    }

    /// Record a wifi state. The revision is bumped even when the state
    /// repeats, so a second `DISCONNECTED` is still a fresh answer.
    pub fn set_wifi(&mut self, to: WifiState) -> Option<Transition> {
        let from = self.wifi;
        self.wifi = Some(to);
        self.wifi_revision += 1;
        (from != Some(to)).then_some(Transition::Wifi { from, to })
    }

    pub fn record_echo(&mut self, echo: CommandEcho) {
        self.last_command_echo = Some(echo);
        self.echo_revision += 1;
    }

    // ── Inbound state machine ───────────────────────────────────────

    /// Apply one inbound message from a serial trigger box.
    pub fn apply(&mut self, message: &InboundMessage) -> Option<Transition> {
        if self.connection.is_terminal() {
            if let InboundMessage::Diagnostic(text) = message {
                self.last_message = Some(text.clone());
            }
            return None;
        }

        match message {
            InboundMessage::Ready => match self.connection {
                ConnectionState::Recording => None,
                _ => self.set_connection(ConnectionState::Ready),
            },
            InboundMessage::NoSsid => self.set_wifi(WifiState::AwaitingSsid),
            InboundMessage::NoPass => self.set_wifi(WifiState::AwaitingPassword),
            InboundMessage::Connected => {
                let t = self.set_wifi(WifiState::Connected);
                // A box that joined a network has clearly booted.
                if matches!(
                    self.connection,
                    ConnectionState::Open | ConnectionState::Provisioning
                ) {
                    self.set_connection(ConnectionState::Ready);
                }
                t
            }
            InboundMessage::Disconnected => {
                if self.connection == ConnectionState::Recording {
                    self.set_connection(ConnectionState::Ready);
                }
                self.set_wifi(WifiState::Disconnected)
            }
            InboundMessage::Echo(echo) => {
                self.record_echo(*echo);
                match echo {
                    CommandEcho::Started
                        if self.connection == ConnectionState::Ready
                            && self.wifi == Some(WifiState::Connected) =>
                    {
                        self.set_connection(ConnectionState::Recording)
                    }
                    CommandEcho::Stopped if self.connection == ConnectionState::Recording => {
                        self.set_connection(ConnectionState::Ready)
                    }
                    _ => None,
                }
            }
            InboundMessage::Diagnostic(text) => {
                self.last_message = Some(text.clone());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn feed(status: &mut DeviceStatus, lines: &[&str]) {
        for line in lines {
            status.apply(&InboundMessage::parse(line));
        }
    }

    #[test]
    fn handshake_reaches_connected() {
        let mut s = DeviceStatus::trigger();
        s.set_connection(ConnectionState::Provisioning);
        feed(&mut s, &["READY", "NO_SSID"]);
        assert_eq!(s.wifi, Some(WifiState::AwaitingSsid));
        feed(&mut s, &["NO_PASS"]);
        assert_eq!(s.wifi, Some(WifiState::AwaitingPassword));
        feed(&mut s, &["CONNECTED"]);
        assert_eq!(s.wifi, Some(WifiState::Connected));
        assert_eq!(s.connection, ConnectionState::Ready);
        assert!(s.is_eligible());
    }

    #[test]
    fn started_requires_wifi() {
        let mut s = DeviceStatus::trigger();
        feed(&mut s, &["READY", "STARTED"]);
        assert_eq!(s.connection, ConnectionState::Ready);
        assert_eq!(s.last_command_echo, Some(CommandEcho::Started));

        feed(&mut s, &["CONNECTED", "STARTED"]);
        assert_eq!(s.connection, ConnectionState::Recording);
        feed(&mut s, &["STOPPED"]);
        assert_eq!(s.connection, ConnectionState::Ready);
    }

    #[test]
    fn never_jumps_from_open_to_recording() {
        let mut s = DeviceStatus::trigger();
        s.set_wifi(WifiState::Connected);
        feed(&mut s, &["STARTED"]);
        assert_eq!(s.connection, ConnectionState::Open);
    }

    #[test]
    fn disconnect_while_recording_drops_to_ready() {
        let mut s = DeviceStatus::trigger();
        feed(&mut s, &["READY", "CONNECTED", "STARTED", "DISCONNECTED"]);
        assert_eq!(s.connection, ConnectionState::Ready);
        assert_eq!(s.wifi, Some(WifiState::Disconnected));
        assert!(!s.is_eligible());
    }

    #[test]
    fn ready_does_not_interrupt_recording() {
        let mut s = DeviceStatus::trigger();
        feed(&mut s, &["READY", "CONNECTED", "STARTED", "READY"]);
        assert_eq!(s.connection, ConnectionState::Recording);
    }

    #[test]
    fn terminal_states_ignore_keywords() {
        let mut s = DeviceStatus::trigger();
        s.fail("write failed");
        feed(&mut s, &["READY", "CONNECTED", "STARTED", "overheating"]);
        assert_eq!(s.connection, ConnectionState::Failed);
        assert_eq!(s.wifi, Some(WifiState::Unprovisioned));
        assert_eq!(s.last_message.as_deref(), Some("overheating"));

        assert!(s.set_connection(ConnectionState::Closed).is_some());
        assert!(s.set_connection(ConnectionState::Ready).is_none());
    }

    #[test]
    fn diagnostics_are_kept_verbatim() {
        let mut s = DeviceStatus::trigger();
        feed(&mut s, &["  battery 42% "]);
        assert_eq!(s.last_message.as_deref(), Some("battery 42%"));
        assert_eq!(s.connection, ConnectionState::Open);
    }

    #[test]
    fn repeated_wifi_state_still_bumps_revision() {
        let mut s = DeviceStatus::trigger();
        feed(&mut s, &["DISCONNECTED"]);
        let rev = s.wifi_revision;
        assert!(s.apply(&InboundMessage::Disconnected).is_none());
        assert!(s.wifi_revision > rev);
    }

    #[test]
    fn sensor_eligibility_follows_negotiation() {
        let mut s = DeviceStatus::sensor();
        s.set_connection(ConnectionState::Ready);
        assert!(!s.is_eligible());
        s.negotiated = true;
        assert!(s.is_eligible());
    }
}
