// ── In-memory devices for unit tests ──
//
// `SimOpener` hands out serial links backed by a scripted trigger box;
// `FakeSensor` / `FakeScanner` stand in for the wireless stack.

#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capsync_link::{
    Advertisement, LinkError, Notification, PortOpener, SensorLink, SensorScanner, SerialLink,
};
use uuid::Uuid;

use crate::config::GattLayout;

// ── Serial trigger box simulator ────────────────────────────────────

/// How a simulated trigger box answers.
#[derive(Debug, Clone, Default)]
pub struct SimBox {
    /// Networks the box can join, with their passwords.
    pub networks: HashMap<String, String>,
    /// Never answer SETPASS.
    pub silent: bool,
    /// Every write fails.
    pub broken: bool,
    /// Already on a network when opened.
    pub preconnected: bool,
}

impl SimBox {
    pub fn joining(networks: &[(&str, &str)]) -> Self {
        Self {
            networks: networks
                .iter()
                .map(|(n, p)| ((*n).to_owned(), (*p).to_owned()))
                .collect(),
            ..Self::default()
        }
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(bytes) => self.pending.extend(bytes),
                Err(RecvTimeoutError::Timeout) => return Err(io::ErrorKind::TimedOut.into()),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

struct SimWriter {
    rules: SimBox,
    to_host: Sender<Vec<u8>>,
    buf: Vec<u8>,
    ssid: Option<String>,
    log: Arc<Mutex<Vec<String>>>,
}

impl SimWriter {
    fn say(&self, line: &str) {
        let _ = self.to_host.send(format!("{line}\r\n").into_bytes());
    }

    fn handle(&mut self, line: &str) {
        self.log.lock().unwrap().push(line.to_owned());
        let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
        match cmd {
            "SETSSID" => {
                self.ssid = Some(arg.to_owned());
                self.say("NO_PASS");
            }
            "SETPASS" if !self.rules.silent => {
                let ok = self
                    .ssid
                    .as_ref()
                    .and_then(|s| self.rules.networks.get(s))
                    .is_some_and(|p| p == arg);
                self.say(if ok { "CONNECTED" } else { "DISCONNECTED" });
            }
            "START" => self.say("STARTED"),
            "STOP" => self.say("STOPPED"),
            "STATUS" => self.say("status ok"),
            _ => {}
        }
    }
}

impl Write for SimWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.rules.broken {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_owned();
            self.handle(&line);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens simulated boxes by port name; unknown ports fail to open.
#[derive(Default)]
pub struct SimOpener {
    boxes: HashMap<String, SimBox>,
    logs: Mutex<HashMap<String, Arc<Mutex<Vec<String>>>>>,
}

impl SimOpener {
    pub fn with(mut self, port: &str, rules: SimBox) -> Self {
        self.boxes.insert(port.to_owned(), rules);
        self
    }

    /// Lines the host wrote to `port`.
    pub fn sent(&self, port: &str) -> Vec<String> {
        self.logs
            .lock()
            .unwrap()
            .get(port)
            .map(|l| l.lock().unwrap().clone())
            .unwrap_or_default()
    }
}

impl PortOpener for SimOpener {
    fn open(&self, target: &str) -> Result<SerialLink, LinkError> {
        let rules = self.boxes.get(target).cloned().ok_or_else(|| LinkError::Open {
            target: target.to_owned(),
            reason: "no such port".into(),
        })?;
        let (tx, rx) = mpsc::channel();
        let log = Arc::new(Mutex::new(Vec::new()));
        self.logs
            .lock()
            .unwrap()
            .insert(target.to_owned(), Arc::clone(&log));

        let writer = SimWriter {
            rules: rules.clone(),
            to_host: tx,
            buf: Vec::new(),
            ssid: None,
            log,
        };
        writer.say("READY");
        writer.say(if rules.preconnected { "CONNECTED" } else { "NO_SSID" });

        Ok(SerialLink::new(
            target,
            ChannelReader {
                rx,
                pending: VecDeque::new(),
            },
            writer,
        ))
    }
}

// ── Wireless sensor fakes ───────────────────────────────────────────

/// What happened to a [`FakeSensor`], shared so tests can inspect it after
/// the link moved into the sensor domain.
#[derive(Debug, Clone, Default)]
pub struct FakeState {
    /// Currently subscribed characteristics.
    pub subscribed: Vec<Uuid>,
    pub ever_subscribed: Vec<Uuid>,
    pub unsubscribed: Vec<Uuid>,
    /// Every write attempt, accepted or not.
    pub writes: Vec<(Uuid, Vec<u8>)>,
    pub streaming: bool,
    pub disconnected: bool,
}

pub struct FakeSensor {
    address: String,
    name: String,
    gatt: GattLayout,
    streams_on: Option<Uuid>,
    frames_per_start: usize,
    rejects: HashSet<Uuid>,
    queue: VecDeque<Notification>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeSensor {
    pub fn new(address: &str, name: &str) -> Self {
        Self {
            address: address.to_owned(),
            name: name.to_owned(),
            gatt: GattLayout::default(),
            streams_on: None,
            frames_per_start: 3,
            rejects: HashSet::new(),
            queue: VecDeque::new(),
            state: Arc::default(),
        }
    }

    /// Notifications flow on `uuid` after a START opcode.
    pub fn streaming_on(mut self, uuid: Uuid) -> Self {
        self.streams_on = Some(uuid);
        self
    }

    pub fn rejecting_writes_to(mut self, uuid: Uuid) -> Self {
        self.rejects.insert(uuid);
        self
    }

    pub fn state(&self) -> FakeState {
        self.state.lock().unwrap().clone()
    }

    pub fn handle(&self) -> Arc<Mutex<FakeState>> {
        Arc::clone(&self.state)
    }

    fn err(&self, reason: &str) -> LinkError {
        LinkError::Bluetooth {
            target: self.address.clone(),
            reason: reason.to_owned(),
        }
    }
}

impl SensorLink for FakeSensor {
    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        state.writes.push((characteristic, payload.to_vec()));
        if self.rejects.contains(&characteristic) {
            return Err(self.err("write rejected"));
        }
        if characteristic == self.gatt.control {
            if payload == self.gatt.start_opcode.as_slice() {
                state.streaming = true;
                if let Some(uuid) = self.streams_on.filter(|u| state.subscribed.contains(u)) {
                    for i in 0..self.frames_per_start {
                        let value = f32::from(u8::try_from(i).unwrap_or(0));
                        let mut frame = value.to_le_bytes().to_vec();
                        frame.extend_from_slice(&(-value).to_le_bytes());
                        self.queue.push_back(Notification::new(uuid, frame));
                    }
                }
            } else if payload == self.gatt.stop_opcode.as_slice() {
                state.streaming = false;
                self.queue.clear();
            }
        }
        Ok(())
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        if !state.subscribed.contains(&characteristic) {
            state.subscribed.push(characteristic);
        }
        state.ever_subscribed.push(characteristic);
        Ok(())
    }

    async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), LinkError> {
        let mut state = self.state.lock().unwrap();
        state.subscribed.retain(|u| *u != characteristic);
        state.unsubscribed.push(characteristic);
        Ok(())
    }

    async fn next_notification(&mut self) -> Option<Notification> {
        match self.queue.pop_front() {
            Some(n) => Some(n),
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.state.lock().unwrap().disconnected = true;
        Ok(())
    }
}

/// Scanner over a fixed set of fake sensors.
#[derive(Default)]
pub struct FakeScanner {
    pub sensors: Vec<FakeSensor>,
}

impl SensorScanner for FakeScanner {
    type Link = FakeSensor;

    async fn discover(
        &mut self,
        _window: Duration,
        name_filter: &str,
    ) -> Result<Vec<Advertisement>, LinkError> {
        Ok(self
            .sensors
            .iter()
            .filter(|s| s.name.contains(name_filter))
            .map(|s| Advertisement {
                address: s.address.clone(),
                name: s.name.clone(),
            })
            .collect())
    }

    async fn connect(&mut self, advertisement: &Advertisement) -> Result<FakeSensor, LinkError> {
        let pos = self
            .sensors
            .iter()
            .position(|s| s.address == advertisement.address)
            .ok_or_else(|| LinkError::Open {
                target: advertisement.address.clone(),
                reason: "gone".into(),
            })?;
        Ok(self.sensors.remove(pos))
    }
}
