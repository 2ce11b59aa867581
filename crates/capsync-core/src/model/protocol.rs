// ── Serial line protocol ──
//
// Outbound: START, STOP, STATUS, SETSSID <name>, SETPASS <secret>.
// Inbound: a fixed keyword set plus arbitrary free-text diagnostics.
// Keywords match exactly (case-sensitive) after trimming.

use std::fmt;
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use strum::{Display, EnumString, IntoStaticStr};

/// Keywords a trigger box can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum Keyword {
    Ready,
    Started,
    Stopped,
    Connected,
    Disconnected,
    NoSsid,
    NoPass,
}

/// Command echoes, the acknowledgements a box sends after START/STOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandEcho {
    Started,
    Stopped,
}

/// One decoded inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Ready,
    NoSsid,
    NoPass,
    Connected,
    Disconnected,
    Echo(CommandEcho),
    /// Anything else, kept verbatim.
    Diagnostic(String),
}

impl InboundMessage {
    /// Decode a raw line. Never fails: unknown text becomes a diagnostic.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match Keyword::from_str(line) {
            Ok(Keyword::Ready) => Self::Ready,
            Ok(Keyword::Started) => Self::Echo(CommandEcho::Started),
            Ok(Keyword::Stopped) => Self::Echo(CommandEcho::Stopped),
            Ok(Keyword::Connected) => Self::Connected,
            Ok(Keyword::Disconnected) => Self::Disconnected,
            Ok(Keyword::NoSsid) => Self::NoSsid,
            Ok(Keyword::NoPass) => Self::NoPass,
            Err(_) => Self::Diagnostic(line.to_owned()),
        }
    }
}

/// A command sent to a serial trigger box.
#[derive(Clone)]
pub enum DeviceCommand {
    Start,
    Stop,
    Status,
    SetSsid(String),
    SetPass(SecretString),
}

impl DeviceCommand {
    /// Wire form, without the line terminator.
    pub fn to_line(&self) -> String {
        match self {
            Self::Start => "START".into(),
            Self::Stop => "STOP".into(),
            Self::Status => "STATUS".into(),
            Self::SetSsid(name) => format!("SETSSID {name}"),
            Self::SetPass(secret) => format!("SETPASS {}", secret.expose_secret()),
        }
    }

    /// The echo a box sends back for this command, if any.
    pub fn expected_echo(&self) -> Option<CommandEcho> {
        match self {
            Self::Start => Some(CommandEcho::Started),
            Self::Stop => Some(CommandEcho::Stopped),
            _ => None,
        }
    }
}

/// Log-safe rendering: secrets are masked.
impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetPass(_) => f.write_str("SETPASS ********"),
            other => f.write_str(&other.to_line()),
        }
    }
}

impl fmt::Debug for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl PartialEq for DeviceCommand {
    fn eq(&self, other: &Self) -> bool {
        self.to_line() == other.to_line()
    }
}
