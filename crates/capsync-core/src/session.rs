// ── Session synchronizer ──
//
// Owns both device families for one recording session. Serial trigger
// boxes live on blocking threads (reader + provisioning per box); sensors
// live in the sensor domain. START and STOP go to the serial side first
// through the fan-out, then to the sensor domain, then wait for echoes.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use capsync_link::{LinkError, PortOpener, SensorScanner, SerialLink};
use tracing::{debug, info, warn};

use crate::barrier::SessionBarrier;
use crate::config::{SensorConfig, SessionConfig};
use crate::credentials::CredentialPool;
use crate::error::CoreError;
use crate::fanout::{FanoutReport, broadcast};
use crate::model::{CommandEcho, DeviceCommand, DeviceId, DeviceStatus};
use crate::provisioning::{CredentialPrompt, Provisioner};
use crate::registry::StatusRegistry;
use crate::sensor::{SensorDomain, SensorReport};
use crate::trigger::TriggerDevice;

type SensorConnect = Box<
    dyn FnOnce(Arc<StatusRegistry>, Arc<SessionBarrier>, SensorConfig) -> Result<SensorDomain, CoreError>
        + Send,
>;

// ── Builder ─────────────────────────────────────────────────────────

/// Collects transports and collaborators, then opens a [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    opener: Arc<dyn PortOpener>,
    prompt: Option<Arc<dyn CredentialPrompt>>,
    sensors: Option<SensorConnect>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            config,
            opener,
            prompt: None,
            sensors: None,
        }
    }

    /// Operator prompt for manual-override credentials.
    pub fn prompt(mut self, prompt: Arc<dyn CredentialPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Enable the sensor family. `connect` runs on the sensor domain
    /// thread and builds the scanner there.
    pub fn sensors<S, F, Fut>(mut self, connect: F) -> Self
    where
        S: SensorScanner + 'static,
        S::Link: 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<S, LinkError>> + 'static,
    {
        self.sensors = Some(Box::new(move |registry, barrier, config| {
            SensorDomain::spawn(connect, config, registry, barrier)
        }));
        self
    }

    /// Open every configured port, start provisioning in the background,
    /// and set up the sensor family (blocking until sensors are negotiated).
    ///
    /// Individual devices that fail to open are recorded in
    /// [`Session::open_failures`]. Fails with [`CoreError::NoDevices`] only
    /// when neither family produced a single usable device.
    pub fn open(self) -> Result<Session, CoreError> {
        let Self {
            config,
            opener,
            prompt,
            sensors,
        } = self;

        let registry = Arc::new(StatusRegistry::new());
        let pool = Arc::new(CredentialPool::new(config.credentials.clone()));
        let barrier = Arc::new(SessionBarrier::new());

        let mut session = Session {
            registry: Arc::clone(&registry),
            pool: Arc::clone(&pool),
            barrier: Arc::clone(&barrier),
            triggers: Vec::new(),
            sensors: None,
            workers: Vec::new(),
            open_failures: Vec::new(),
            closed: false,
            config,
        };

        for (port, opened) in open_ports(opener.as_ref(), &session.config.ports) {
            match opened.map_err(CoreError::from).and_then(|link| {
                TriggerDevice::attach(link, Arc::clone(&registry), Arc::clone(&pool))
            }) {
                Ok(device) => {
                    info!(device = %device.id(), "serial port opened");
                    session.triggers.push(device);
                }
                Err(e) => {
                    warn!(port = %port, error = %e, "serial port unavailable");
                    session.open_failures.push(e);
                }
            }
        }

        let provisioner = Provisioner::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&barrier),
            prompt,
            session.config.provisioning.clone(),
        );
        session.spawn_provisioning(&provisioner);

        if let Some(connect) = sensors {
            match connect(
                Arc::clone(&registry),
                Arc::clone(&barrier),
                session.config.sensors.clone(),
            ) {
                Ok(domain) => {
                    info!(count = domain.sensors().len(), "sensors ready");
                    session.sensors = Some(domain);
                }
                Err(e) => {
                    warn!(error = %e, "sensor family unavailable");
                    session.open_failures.push(e);
                }
            }
        }

        let sensor_count = session.sensors.as_ref().map_or(0, |d| d.sensors().len());
        if session.triggers.is_empty() && sensor_count == 0 {
            session.teardown();
            return Err(CoreError::NoDevices {
                attempted: session.config.ports.len(),
            });
        }

        session.spawn_status_probe();
        info!(
            triggers = session.triggers.len(),
            sensors = sensor_count,
            "session open"
        );
        Ok(session)
    }
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("prompt", &self.prompt.is_some())
            .field("sensors", &self.sensors.is_some())
            .finish_non_exhaustive()
    }
}

/// Open all ports concurrently; results keep the configured order.
fn open_ports(
    opener: &dyn PortOpener,
    ports: &[String],
) -> Vec<(String, Result<SerialLink, LinkError>)> {
    thread::scope(|scope| {
        let handles: Vec<_> = ports
            .iter()
            .map(|port| (port, scope.spawn(move || opener.open(port))))
            .collect();
        handles
            .into_iter()
            .map(|(port, handle)| {
                let opened = handle.join().unwrap_or_else(|_| {
                    Err(LinkError::Open {
                        target: port.clone(),
                        reason: "open thread panicked".into(),
                    })
                });
                (port.clone(), opened)
            })
            .collect()
    })
}

// ── Session ─────────────────────────────────────────────────────────

/// Result of one START or STOP across both device families.
#[derive(Debug)]
pub struct SessionReport {
    pub command: DeviceCommand,
    /// Serial delivery outcomes.
    pub serial: FanoutReport,
    /// Sensor outcomes.
    pub sensors: Vec<SensorReport>,
    /// Devices that confirmed the command within the acknowledgement window.
    pub acknowledged: Vec<DeviceId>,
    /// Trigger boxes left out because they were not eligible.
    pub skipped: Vec<DeviceId>,
}

impl SessionReport {
    /// Number of devices whose delivery failed outright.
    pub fn failures(&self) -> usize {
        self.serial.failures().len() + self.sensors.iter().filter(|r| r.result.is_err()).count()
    }
}

/// One acquisition session over serial trigger boxes and sensors.
///
/// Dropping the session tears it down.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    registry: Arc<StatusRegistry>,
    pool: Arc<CredentialPool>,
    barrier: Arc<SessionBarrier>,
    triggers: Vec<Arc<TriggerDevice>>,
    sensors: Option<SensorDomain>,
    workers: Vec<JoinHandle<()>>,
    open_failures: Vec<CoreError>,
    closed: bool,
}

impl Session {
    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> Vec<(DeviceId, DeviceStatus)> {
        self.registry.snapshot()
    }

    /// Network claims currently held, as `(network, device)`.
    pub fn claims(&self) -> Vec<(String, DeviceId)> {
        self.pool.claims()
    }

    /// Devices that could not be opened or set up.
    pub fn open_failures(&self) -> &[CoreError] {
        &self.open_failures
    }

    pub fn is_recording(&self) -> bool {
        !self.closed && self.barrier.start_requested() && !self.barrier.stop_requested()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Start recording on every eligible device.
    pub fn start(&mut self) -> Result<SessionReport, CoreError> {
        if self.closed {
            return Err(CoreError::SessionClosed);
        }
        if !self.barrier.request_start() {
            return Err(CoreError::AlreadyStarted);
        }
        info!("starting recording");
        Ok(self.dispatch(&DeviceCommand::Start, CommandEcho::Started))
    }

    /// Stop recording everywhere, then tear the session down.
    ///
    /// Devices still provisioning are abandoned and left out of the report.
    pub fn stop(&mut self) -> Result<SessionReport, CoreError> {
        if self.closed {
            return Err(CoreError::SessionClosed);
        }
        if !self.barrier.start_requested() {
            return Err(CoreError::NotStarted);
        }
        self.barrier.request_stop();
        self.registry.notify_waiters();
        info!("stopping recording");

        let report = self.dispatch(&DeviceCommand::Stop, CommandEcho::Stopped);
        self.teardown();
        Ok(report)
    }

    /// End the session, stopping first if it is recording.
    pub fn quit(&mut self) -> Result<Option<SessionReport>, CoreError> {
        if self.is_recording() {
            return self.stop().map(Some);
        }
        self.teardown();
        Ok(None)
    }

    fn dispatch(&self, command: &DeviceCommand, echo: CommandEcho) -> SessionReport {
        let mut eligible = Vec::new();
        let mut skipped = Vec::new();
        for device in &self.triggers {
            if device.status().is_some_and(|s| s.is_eligible()) {
                eligible.push(Arc::clone(device));
            } else {
                info!(device = %device.id(), %command, "device not ready, skipped");
                skipped.push(device.id().clone());
            }
        }

        let before: HashMap<DeviceId, u64> = eligible
            .iter()
            .filter_map(|d| d.status().map(|s| (d.id().clone(), s.echo_revision)))
            .collect();
        let serial = broadcast(&eligible, command, self.config.fanout.workers);

        let sensors = match &self.sensors {
            Some(domain) => {
                let result = match command {
                    DeviceCommand::Stop => domain.stop_all(),
                    _ => domain.start_all(),
                };
                result.unwrap_or_else(|e| {
                    warn!(error = %e, %command, "sensor domain did not answer");
                    Vec::new()
                })
            }
            None => Vec::new(),
        };

        let mut acknowledged = self.await_echoes(&serial.delivered(), &before, echo);
        acknowledged.extend(
            sensors
                .iter()
                .filter(|r| r.result.is_ok())
                .map(|r| r.id.clone()),
        );
        info!(
            %command,
            acknowledged = acknowledged.len(),
            skipped = skipped.len(),
            "command complete"
        );

        SessionReport {
            command: command.clone(),
            serial,
            sensors,
            acknowledged,
            skipped,
        }
    }

    /// Wait, bounded by the acknowledgement timeout, for a fresh `echo` from
    /// each delivered device.
    fn await_echoes(
        &self,
        delivered: &[DeviceId],
        before: &HashMap<DeviceId, u64>,
        echo: CommandEcho,
    ) -> Vec<DeviceId> {
        if delivered.is_empty() {
            return Vec::new();
        }
        let deadline = Instant::now() + self.config.fanout.ack_timeout;
        let acked = self.registry.wait_for_all(delivered, deadline, |id, s| {
            s.last_command_echo == Some(echo)
                && before.get(id).is_none_or(|rev| s.echo_revision > *rev)
        });
        for id in delivered.iter().filter(|id| !acked.contains(id)) {
            warn!(device = %id, %echo, "no acknowledgement");
        }
        acked
    }

    fn spawn_provisioning(&mut self, provisioner: &Provisioner) {
        for (index, device) in self.triggers.iter().enumerate() {
            let provisioner = provisioner.clone();
            let device = Arc::clone(device);
            let spawned = thread::Builder::new()
                .name(format!("provision-{}", device.id()))
                .spawn(move || {
                    let outcome = provisioner.supervise(&device, index);
                    debug!(device = %device.id(), ?outcome, "provisioning finished");
                });
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => warn!(error = %e, "cannot spawn provisioning thread"),
            }
        }
    }

    /// Periodic STATUS to every live trigger box until stop is requested.
    fn spawn_status_probe(&mut self) {
        let interval = self.config.fanout.status_interval;
        if interval.is_zero() || self.triggers.is_empty() {
            return;
        }
        let triggers = self.triggers.clone();
        let barrier = Arc::clone(&self.barrier);
        let workers = self.config.fanout.workers;
        let spawned = thread::Builder::new()
            .name("status-probe".into())
            .spawn(move || status_probe(&triggers, &barrier, interval, workers));
        match spawned {
            Ok(handle) => self.workers.push(handle),
            Err(e) => warn!(error = %e, "cannot spawn status probe"),
        }
    }

    /// Abandon provisioning, close every link and stop the sensor domain.
    /// Idempotent.
    pub fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.barrier.request_stop();
        self.registry.notify_waiters();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("session worker thread panicked");
            }
        }
        for device in &self.triggers {
            device.close();
        }
        for device in &self.triggers {
            device.join();
        }
        if let Some(mut domain) = self.sensors.take() {
            domain.shutdown();
        }
        info!("session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn status_probe(
    triggers: &[Arc<TriggerDevice>],
    barrier: &SessionBarrier,
    interval: Duration,
    workers: NonZeroUsize,
) {
    while !barrier.stop().wait_timeout(interval) {
        let live: Vec<_> = triggers
            .iter()
            .filter(|d| !d.is_closed() && d.status().is_some_and(|s| !s.connection.is_terminal()))
            .cloned()
            .collect();
        if live.is_empty() {
            continue;
        }
        let report = broadcast(&live, &DeviceCommand::Status, workers);
        debug!(
            probed = report.outcomes.len(),
            failed = report.failures().len(),
            "status probe"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::GattLayout;
    use crate::credentials::Credential;
    use crate::model::{ConnectionState, WifiState};
    use crate::testing::{FakeScanner, FakeSensor, SimBox, SimOpener};

    const BOTH: &[(&str, &str)] = &[("net1", "p1"), ("net2", "p2")];

    fn config(ports: &[&str]) -> SessionConfig {
        let mut config = SessionConfig {
            ports: ports.iter().map(|p| (*p).to_owned()).collect(),
            credentials: vec![Credential::new("net1", "p1"), Credential::new("net2", "p2")],
            ..SessionConfig::default()
        };
        config.provisioning.settle = Duration::from_millis(50);
        config.provisioning.attempt_timeout = Duration::from_secs(2);
        config.provisioning.manual_override = false;
        config.fanout.ack_timeout = Duration::from_secs(2);
        config.fanout.status_interval = Duration::ZERO;
        config.sensors.scan_window = Duration::from_millis(10);
        config.sensors.connect_settle = Duration::from_millis(1);
        config.sensors.probe_window = Duration::from_millis(50);
        config.sensors.configure_pause = Duration::from_millis(1);
        config.sensors.op_timeout = Duration::from_secs(1);
        config
    }

    fn wait_eligible(session: &Session, ports: &[&str]) {
        let ids: Vec<DeviceId> = ports.iter().map(|p| DeviceId::from(*p)).collect();
        let ready = session.registry().wait_for_all(
            &ids,
            Instant::now() + Duration::from_secs(5),
            |_, s| s.is_eligible(),
        );
        assert_eq!(ready, ids);
    }

    #[test]
    fn start_and_stop_reach_every_provisioned_box() {
        let opener = Arc::new(
            SimOpener::default()
                .with("COM1", SimBox::joining(BOTH))
                .with("COM2", SimBox::joining(BOTH)),
        );
        let mut session = SessionBuilder::new(config(&["COM1", "COM2"]), opener.clone())
            .open()
            .unwrap();
        wait_eligible(&session, &["COM1", "COM2"]);

        let networks: Vec<_> = session
            .snapshot()
            .into_iter()
            .filter_map(|(_, s)| s.assigned_network)
            .collect();
        assert_eq!(networks.len(), 2);
        assert_ne!(networks[0], networks[1]);

        let started = session.start().unwrap();
        assert!(started.serial.is_clean());
        assert_eq!(started.acknowledged.len(), 2);
        assert!(session.is_recording());

        let stopped = session.stop().unwrap();
        assert_eq!(stopped.acknowledged.len(), 2);
        assert!(session.is_closed());
        for (_, status) in session.snapshot() {
            assert_eq!(status.connection, ConnectionState::Closed);
        }
        let sent = opener.sent("COM1");
        assert!(sent.iter().any(|l| l == "START"));
        assert!(sent.iter().any(|l| l == "STOP"));
    }

    #[test]
    fn start_and_stop_are_guarded() {
        let opener = Arc::new(SimOpener::default().with("COM1", SimBox::joining(BOTH)));
        let mut session = SessionBuilder::new(config(&["COM1"]), opener).open().unwrap();

        assert!(matches!(session.stop(), Err(CoreError::NotStarted)));
        session.start().unwrap();
        assert!(matches!(session.start(), Err(CoreError::AlreadyStarted)));
        session.stop().unwrap();
        assert!(matches!(session.stop(), Err(CoreError::SessionClosed)));
    }

    #[test]
    fn nothing_opened_is_fatal() {
        let opener = Arc::new(SimOpener::default());
        let err = SessionBuilder::new(config(&["COM404"]), opener)
            .open()
            .unwrap_err();
        assert!(matches!(err, CoreError::NoDevices { attempted: 1 }));
    }

    #[test]
    fn missing_port_does_not_block_others() {
        let opener = Arc::new(SimOpener::default().with("COM1", SimBox::joining(BOTH)));
        let session = SessionBuilder::new(config(&["COM1", "COM404"]), opener)
            .open()
            .unwrap();
        assert_eq!(session.open_failures().len(), 1);
        assert!(matches!(
            session.open_failures()[0],
            CoreError::Connection { .. }
        ));
        wait_eligible(&session, &["COM1"]);
    }

    #[test]
    fn stop_during_provisioning_excludes_the_box() {
        let silent = SimBox {
            silent: true,
            ..SimBox::joining(BOTH)
        };
        let opener = Arc::new(
            SimOpener::default()
                .with("COM1", SimBox::joining(BOTH))
                .with("COM2", silent),
        );
        let mut cfg = config(&["COM1", "COM2"]);
        cfg.provisioning.attempt_timeout = Duration::from_secs(30);
        let mut session = SessionBuilder::new(cfg, opener).open().unwrap();
        wait_eligible(&session, &["COM1"]);

        let started = session.start().unwrap();
        assert_eq!(started.skipped, [DeviceId::from("COM2")]);

        let begun = Instant::now();
        let stopped = session.stop().unwrap();
        assert!(begun.elapsed() < Duration::from_secs(10));
        assert_eq!(stopped.acknowledged, [DeviceId::from("COM1")]);

        let com2 = session.registry().get(&DeviceId::from("COM2")).unwrap();
        assert_eq!(com2.connection, ConnectionState::Closed);
        assert_ne!(com2.wifi, Some(WifiState::Connected));
        assert!(session.claims().iter().all(|(_, d)| d.as_str() == "COM1"));
    }

    #[test]
    fn sensors_follow_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(SimOpener::default().with("COM1", SimBox::joining(BOTH)));
        let mut cfg = config(&["COM1"]);
        cfg.sensors.capture_dir = dir.path().to_owned();

        let sensor = FakeSensor::new("AA:10", "Movella DOT").streaming_on(GattLayout::DATA[2]);
        let state = sensor.handle();
        let scanner = FakeScanner {
            sensors: vec![sensor],
        };
        let mut session = SessionBuilder::new(cfg, opener)
            .sensors(move || async move { Ok::<_, LinkError>(scanner) })
            .open()
            .unwrap();
        wait_eligible(&session, &["COM1"]);

        let started = session.start().unwrap();
        assert_eq!(started.sensors.len(), 1);
        assert!(started.acknowledged.contains(&DeviceId::from("AA:10")));

        let stopped = session.stop().unwrap();
        assert!(stopped.acknowledged.contains(&DeviceId::from("AA:10")));
        assert!(state.lock().unwrap().disconnected);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn sensors_alone_are_enough_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&[]);
        cfg.sensors.capture_dir = dir.path().to_owned();
        let scanner = FakeScanner {
            sensors: vec![FakeSensor::new("AA:11", "Movella DOT").streaming_on(GattLayout::DATA[0])],
        };
        let session = SessionBuilder::new(cfg, Arc::new(SimOpener::default()))
            .sensors(move || async move { Ok::<_, LinkError>(scanner) })
            .open()
            .unwrap();
        assert_eq!(session.snapshot().len(), 1);
    }

    #[test]
    fn quit_while_recording_stops_first() {
        let opener = Arc::new(SimOpener::default().with("COM1", SimBox::joining(BOTH)));
        let mut session = SessionBuilder::new(config(&["COM1"]), opener.clone())
            .open()
            .unwrap();
        wait_eligible(&session, &["COM1"]);
        session.start().unwrap();

        let report = session.quit().unwrap().unwrap();
        assert_eq!(report.acknowledged, [DeviceId::from("COM1")]);
        assert!(opener.sent("COM1").iter().any(|l| l == "STOP"));
        assert!(session.quit().unwrap().is_none());
    }
}
