// ── Serial trigger devices ──
//
// One `TriggerDevice` per opened serial port. Its dedicated reader thread
// is the only inbound writer of the device's status record; commands are
// written by whoever holds the device, serialized by the link's mutex.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use capsync_link::{LineReader, SerialLink};
use tracing::{debug, info, warn};

use crate::credentials::CredentialPool;
use crate::error::CoreError;
use crate::fanout::CommandTarget;
use crate::model::{
    ConnectionState, DeviceCommand, DeviceId, DeviceStatus, InboundMessage, Transition, WifiState,
};
use crate::registry::StatusRegistry;

/// An opened serial trigger box.
#[derive(Debug)]
pub struct TriggerDevice {
    id: DeviceId,
    link: SerialLink,
    registry: Arc<StatusRegistry>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TriggerDevice {
    /// Register `link` in the registry and start its reader thread.
    ///
    /// The device enters `Open`, then immediately `Provisioning` with wifi
    /// `Unprovisioned`.
    pub fn attach(
        link: SerialLink,
        registry: Arc<StatusRegistry>,
        pool: Arc<CredentialPool>,
    ) -> Result<Arc<Self>, CoreError> {
        let id = DeviceId::from(link.target());
        let reader = link.take_reader().ok_or_else(|| CoreError::Connection {
            device: id.clone(),
            reason: "read half already in use".into(),
        })?;

        registry.insert(id.clone(), DeviceStatus::trigger());
        registry.set_connection(&id, ConnectionState::Provisioning);

        let handle = {
            let reader_id = id.clone();
            let registry = Arc::clone(&registry);
            thread::Builder::new()
                .name(format!("serial-{id}"))
                .spawn(move || read_loop(&reader_id, reader, &registry, &pool))
                .map_err(|e| CoreError::Connection {
                    device: id.clone(),
                    reason: format!("cannot spawn reader thread: {e}"),
                })?
        };

        Ok(Arc::new(Self {
            id,
            link,
            registry,
            reader: Mutex::new(Some(handle)),
        }))
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn status(&self) -> Option<DeviceStatus> {
        self.registry.get(&self.id)
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    /// Write one command. A transport failure marks the device `Failed`.
    pub fn send(&self, command: &DeviceCommand) -> Result<(), CoreError> {
        debug!(device = %self.id, %command, "sending command");
        self.link.send_line(&command.to_line()).map_err(|e| {
            let err = CoreError::from(e);
            self.registry.mark_failed(&self.id, err.to_string());
            err
        })
    }

    /// Close the link and mark the device `Closed`. Idempotent.
    ///
    /// The reader thread exits on its next read timeout; use [`join`]
    /// to wait for it.
    ///
    /// [`join`]: Self::join
    pub fn close(&self) -> bool {
        let first = self.link.close();
        if first {
            self.registry.set_connection(&self.id, ConnectionState::Closed);
        }
        first
    }

    /// Wait for the reader thread to finish.
    pub fn join(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(device = %self.id, "serial reader thread panicked");
            }
        }
    }
}

impl CommandTarget for TriggerDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn deliver(&self, command: &DeviceCommand) -> Result<(), CoreError> {
        self.send(command)
    }
}

// ── Reader thread ───────────────────────────────────────────────────

fn read_loop<R: std::io::Read>(
    id: &DeviceId,
    mut reader: LineReader<R>,
    registry: &StatusRegistry,
    pool: &CredentialPool,
) {
    loop {
        match reader.next_line() {
            Ok(Some(line)) => handle_line(id, &line, registry, pool),
            Ok(None) => {
                // End of stream without a local close: the handle is gone.
                registry.set_connection(id, ConnectionState::Closed);
                debug!(device = %id, "serial reader finished");
                return;
            }
            Err(e) => {
                registry.mark_failed(id, e.to_string());
                return;
            }
        }
    }
}

/// Publish one inbound line to the registry, then log it.
pub(crate) fn handle_line(
    id: &DeviceId,
    line: &str,
    registry: &StatusRegistry,
    pool: &CredentialPool,
) {
    let message = InboundMessage::parse(line);
    // A dropped link gives up its claim in the same update that records
    // the drop, so no waiter sees one without the other.
    let Some((from, transition, to, released)) = registry.update(id, |s| {
        let from = s.connection;
        let t = s.apply(&message);
        let dropped = matches!(
            t,
            Some(Transition::Wifi {
                from: Some(WifiState::Connected),
                to: WifiState::Disconnected,
            })
        );
        let released = if dropped {
            s.assigned_network = None;
            pool.release_device(id)
        } else {
            Vec::new()
        };
        (from, t, s.connection, released)
    }) else {
        return;
    };
    debug!(device = %id, %line, "received");

    if from != to {
        info!(device = %id, %from, %to, "connection state changed");
    }
    if let Some(Transition::Wifi { to, .. }) = transition {
        info!(device = %id, wifi = %to, "wifi state changed");
    }
    for network in released {
        info!(device = %id, %network, "link dropped, network released");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use std::collections::HashSet;
    use std::io;
    use std::time::{Duration, Instant};

    fn setup() -> (Arc<StatusRegistry>, Arc<CredentialPool>, DeviceId) {
        let reg = Arc::new(StatusRegistry::new());
        let pool = Arc::new(CredentialPool::new(vec![Credential::new("net1", "p1")]));
        let id = DeviceId::from("COM5");
        reg.insert(id.clone(), DeviceStatus::trigger());
        (reg, pool, id)
    }

    #[test]
    fn drop_after_connected_releases_claim() {
        let (reg, pool, id) = setup();
        pool.claim_next(&id, &HashSet::new(), 0).unwrap();
        handle_line(&id, "CONNECTED", &reg, &pool);
        assert_eq!(pool.holder("net1"), Some(id.clone()));

        handle_line(&id, "DISCONNECTED", &reg, &pool);
        assert_eq!(pool.holder("net1"), None);
    }

    #[test]
    fn disconnect_during_handshake_keeps_claim() {
        let (reg, pool, id) = setup();
        pool.claim_next(&id, &HashSet::new(), 0).unwrap();
        handle_line(&id, "NO_PASS", &reg, &pool);
        handle_line(&id, "DISCONNECTED", &reg, &pool);
        assert_eq!(pool.holder("net1"), Some(id));
    }

    #[test]
    fn reader_publishes_lines_and_closes_on_eof() {
        let reg = Arc::new(StatusRegistry::new());
        let pool = Arc::new(CredentialPool::default());
        let link = SerialLink::new("COM8", io::Cursor::new(b"READY\nCONNECTED\n".to_vec()), io::sink());
        let dev = TriggerDevice::attach(link, Arc::clone(&reg), pool).unwrap();

        let status = reg
            .wait_until(dev.id(), Instant::now() + Duration::from_secs(5), |s| {
                s.connection == ConnectionState::Closed
            })
            .unwrap();
        dev.join();
        assert_eq!(status.wifi, Some(WifiState::Connected));
    }

    #[test]
    fn reader_and_handle_share_the_port_id() {
        let reg = Arc::new(StatusRegistry::new());
        let link = SerialLink::new("COM9", io::Cursor::new(b"READY\n".to_vec()), io::sink());
        let dev = TriggerDevice::attach(link, Arc::clone(&reg), Arc::default()).unwrap();
        assert_eq!(dev.id(), &DeviceId::from("COM9"));

        let closed = reg.wait_until(
            &DeviceId::from("COM9"),
            Instant::now() + Duration::from_secs(5),
            |s| s.connection == ConnectionState::Closed,
        );
        dev.join();
        assert!(closed.is_some());
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[test]
    fn write_failure_marks_failed() {
        struct Broken;
        impl io::Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let reg = Arc::new(StatusRegistry::new());
        let link = SerialLink::new("COM6", io::empty(), Broken);
        let dev = TriggerDevice::attach(link, Arc::clone(&reg), Arc::default()).unwrap();
        // The empty reader may close the device first; either way START fails.
        assert!(dev.send(&DeviceCommand::Start).is_err());
        dev.close();
        dev.join();
    }
}
