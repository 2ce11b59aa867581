// ── Wireless sensor links ──
//
// Characteristic-based links driven from a single cooperative scheduler.
// The traits use `async fn` without `Send` bounds: every sensor future runs
// on one thread, so implementations are free to hold `!Send` state.

#![allow(async_fn_in_trait)]

use std::time::Duration;

use bytes::{Buf, Bytes};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::LinkError;

/// One notification frame received on a subscribed characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(characteristic: Uuid, payload: impl Into<Bytes>) -> Self {
        Self {
            characteristic,
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Payload as space-separated lowercase hex (`01 ab ff`).
    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(self.payload.len() * 3);
        for (i, b) in self.payload.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

/// Decode a payload as consecutive little-endian `f32` values.
///
/// Returns `None` unless the length is a non-zero multiple of four.
pub fn decode_le_f32(payload: &[u8]) -> Option<Vec<f32>> {
    if payload.is_empty() || payload.len() % 4 != 0 {
        return None;
    }
    let mut buf = payload;
    let mut values = Vec::with_capacity(payload.len() / 4);
    while buf.has_remaining() {
        values.push(buf.get_f32_le());
    }
    Some(values)
}

/// A peripheral seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Stable wireless address; used as the device identity.
    pub address: String,
    /// Advertised local name.
    pub name: String,
}

/// A connected wireless sensor.
///
/// Writes are write-with-response. Notifications from every subscribed
/// characteristic arrive through one ordered stream.
pub trait SensorLink {
    fn address(&self) -> &str;

    fn name(&self) -> &str;

    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), LinkError>;

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), LinkError>;

    async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), LinkError>;

    /// Wait for the next notification. `None` means the link is gone.
    ///
    /// Must be cancel-safe: callers race it against timers and commands.
    async fn next_notification(&mut self) -> Option<Notification>;

    async fn disconnect(&mut self) -> Result<(), LinkError>;
}

/// Discovers and connects wireless sensors.
pub trait SensorScanner {
    type Link: SensorLink;

    /// Scan for `window` and return peripherals whose name contains `name_filter`.
    async fn discover(
        &mut self,
        window: Duration,
        name_filter: &str,
    ) -> Result<Vec<Advertisement>, LinkError>;

    async fn connect(&mut self, advertisement: &Advertisement) -> Result<Self::Link, LinkError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_little_endian_floats() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1.5f32.to_le_bytes());
        raw.extend_from_slice(&(-2.0f32).to_le_bytes());
        assert_eq!(decode_le_f32(&raw), Some(vec![1.5, -2.0]));
    }

    #[test]
    fn rejects_ragged_payloads() {
        assert_eq!(decode_le_f32(&[1, 2, 3]), None);
        assert_eq!(decode_le_f32(&[]), None);
    }

    #[test]
    fn hex_rendering() {
        let n = Notification::new(Uuid::nil(), vec![0x01u8, 0xab, 0xff]);
        assert_eq!(n.hex(), "01 ab ff");
    }
}
