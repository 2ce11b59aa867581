// ── Serial line transport ──
//
// A serial trigger box is an opaque byte channel speaking newline-terminated
// text. `SerialLink` owns the write half behind a mutex (one writer at a
// time per device) and hands the read half to a `LineReader` that runs on
// the device's dedicated reader thread.

use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serialport::SerialPortType;
use tracing::{debug, trace};

use crate::error::LinkError;

type BoxedReader = Box<dyn Read + Send>;
type BoxedWriter = Box<dyn Write + Send>;

// ── SerialLink ──────────────────────────────────────────────────────

/// One open serial connection.
///
/// Writes are serialized by an internal mutex, so a partial write to one
/// device can never interleave with another write to the same device.
pub struct SerialLink {
    target: String,
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<BoxedReader>>,
    closed: Arc<AtomicBool>,
}

impl SerialLink {
    /// Wrap an already-open byte channel.
    pub fn new(
        target: impl Into<String>,
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            target: target.into(),
            writer: Mutex::new(Some(Box::new(writer))),
            reader: Mutex::new(Some(Box::new(reader))),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The port name (or other identity) this link was opened on.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Take the read half as a [`LineReader`]. Only the first call succeeds.
    pub fn take_reader(&self) -> Option<LineReader<BoxedReader>> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        Some(LineReader::new(
            self.target.clone(),
            reader,
            Arc::clone(&self.closed),
        ))
    }

    /// Send one command line. A trailing `\n` is appended and the port is
    /// flushed before returning.
    pub fn send_line(&self, line: &str) -> Result<(), LinkError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = match guard.as_mut() {
            Some(w) if !self.is_closed() => w,
            _ => {
                return Err(LinkError::Closed {
                    target: self.target.clone(),
                });
            }
        };

        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');

        writer
            .write_all(&frame)
            .and_then(|()| writer.flush())
            .map_err(|source| LinkError::Io {
                target: self.target.clone(),
                source,
            })?;

        trace!(target_port = %self.target, bytes = frame.len(), "line written");
        Ok(())
    }

    /// Close the link. Returns `true` on the first call only.
    ///
    /// The write half is dropped immediately; the reader notices the closed
    /// flag on its next read timeout and stops.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!(target_port = %self.target, "serial link closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("target", &self.target)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ── LineReader ──────────────────────────────────────────────────────

/// Splits a blocking byte stream into trimmed text lines.
///
/// Decoding is permissive: invalid UTF-8 is replaced, never rejected.
/// Read timeouts are not errors, they just give the reader a chance to
/// notice that the link was closed.
pub struct LineReader<R> {
    target: String,
    inner: BufReader<R>,
    pending: Vec<u8>,
    closed: Arc<AtomicBool>,
}

impl<R: Read> LineReader<R> {
    pub fn new(target: impl Into<String>, reader: R, closed: Arc<AtomicBool>) -> Self {
        Self {
            target: target.into(),
            inner: BufReader::new(reader),
            pending: Vec::new(),
            closed,
        }
    }

    /// Block until the next non-empty line.
    ///
    /// Returns `Ok(None)` once the link is closed or the stream ends, and an
    /// error for any other I/O failure. Callers should not retry after an
    /// error: the transport is gone.
    pub fn next_line(&mut self) -> Result<Option<String>, LinkError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }

            match self.inner.read_until(b'\n', &mut self.pending) {
                Ok(0) if self.pending.is_empty() => return Ok(None),
                Ok(_) => {
                    let line = decode_line(&self.pending);
                    self.pending.clear();
                    if !line.is_empty() {
                        return Ok(Some(line));
                    }
                }
                Err(e) if is_transient(&e) => {}
                Err(_) if self.closed.load(Ordering::Acquire) => return Ok(None),
                Err(source) => {
                    return Err(LinkError::Io {
                        target: self.target.clone(),
                        source,
                    });
                }
            }
        }
    }
}

impl<R: Read> Iterator for LineReader<R> {
    type Item = Result<String, LinkError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line().transpose()
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_owned()
}

// ── Opening ports ───────────────────────────────────────────────────

/// Opens serial links by target name.
///
/// The orchestrator only ever sees this trait, so tests can substitute
/// in-memory channels for real hardware.
pub trait PortOpener: Send + Sync {
    fn open(&self, target: &str) -> Result<SerialLink, LinkError>;
}

/// Opens real serial ports through the `serialport` crate.
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    pub baud: u32,
    /// Per-read timeout. Bounds how long a closed link keeps its reader alive.
    pub read_timeout: Duration,
    /// Pause after opening; most boards reset when the port is opened.
    pub settle: Duration,
}

impl Default for SerialPortOpener {
    fn default() -> Self {
        Self {
            baud: 115_200,
            read_timeout: Duration::from_secs(1),
            settle: Duration::from_secs(2),
        }
    }
}

impl PortOpener for SerialPortOpener {
    fn open(&self, target: &str) -> Result<SerialLink, LinkError> {
        let open_err = |e: serialport::Error| LinkError::Open {
            target: target.to_owned(),
            reason: e.to_string(),
        };

        let port = serialport::new(target, self.baud)
            .timeout(self.read_timeout)
            .open()
            .map_err(open_err)?;
        let reader = port.try_clone().map_err(open_err)?;

        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }

        debug!(target_port = target, baud = self.baud, "serial port opened");
        Ok(SerialLink::new(target, reader, port))
    }
}

/// A serial port visible on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSummary {
    pub name: String,
    pub kind: String,
}

/// Enumerate serial ports present on this host.
pub fn list_ports() -> Result<Vec<PortSummary>, LinkError> {
    let ports = serialport::available_ports().map_err(|e| LinkError::Open {
        target: "<enumerate>".into(),
        reason: e.to_string(),
    })?;

    Ok(ports
        .into_iter()
        .map(|p| PortSummary {
            kind: match p.port_type {
                SerialPortType::UsbPort(usb) => format!("usb {:04x}:{:04x}", usb.vid, usb.pid),
                SerialPortType::PciPort => "pci".into(),
                SerialPortType::BluetoothPort => "bluetooth".into(),
                SerialPortType::Unknown => "unknown".into(),
            },
            name: p.port_name,
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Reader that replays scripted chunks, yielding `TimedOut` between them.
    struct Scripted {
        chunks: VecDeque<io::Result<Vec<u8>>>,
    }

    impl Scripted {
        fn new(chunks: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                chunks: chunks.into(),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                None => Ok(0),
                Some(Err(e)) => Err(e),
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.chunks.push_front(Ok(bytes[n..].to_vec()));
                    }
                    Ok(n)
                }
            }
        }
    }

    fn reader(chunks: Vec<io::Result<Vec<u8>>>) -> LineReader<Scripted> {
        LineReader::new("COM9", Scripted::new(chunks), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn splits_lines_and_trims_carriage_returns() {
        let mut r = reader(vec![Ok(b"READY\r\nNO_SSID\n".to_vec())]);
        assert_eq!(r.next_line().unwrap().as_deref(), Some("READY"));
        assert_eq!(r.next_line().unwrap().as_deref(), Some("NO_SSID"));
        assert_eq!(r.next_line().unwrap(), None);
    }

    #[test]
    fn partial_line_survives_read_timeout() {
        let mut r = reader(vec![
            Ok(b"CONN".to_vec()),
            Err(io::Error::from(ErrorKind::TimedOut)),
            Ok(b"ECTED\n".to_vec()),
        ]);
        assert_eq!(r.next_line().unwrap().as_deref(), Some("CONNECTED"));
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut r = reader(vec![Ok(vec![b'o', b'k', 0xff, b'\n'])]);
        assert_eq!(r.next_line().unwrap().as_deref(), Some("ok\u{fffd}"));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut r = reader(vec![Ok(b"\r\n\n  \nSTOPPED\n".to_vec())]);
        assert_eq!(r.next_line().unwrap().as_deref(), Some("STOPPED"));
    }

    #[test]
    fn hard_io_error_is_reported() {
        let mut r = reader(vec![Err(io::Error::from(ErrorKind::BrokenPipe))]);
        assert!(matches!(r.next_line(), Err(LinkError::Io { .. })));
    }

    #[test]
    fn closed_flag_stops_reader() {
        let closed = Arc::new(AtomicBool::new(true));
        let mut r = LineReader::new("COM9", Scripted::new(vec![Ok(b"READY\n".to_vec())]), closed);
        assert_eq!(r.next_line().unwrap(), None);
    }

    #[test]
    fn send_line_appends_newline() {
        let sink = SharedSink::default();
        let link = SerialLink::new("COM9", io::empty(), sink.clone());
        link.send_line("SETSSID lab").unwrap();
        link.send_line("START").unwrap();
        assert_eq!(sink.contents(), "SETSSID lab\nSTART\n");
    }

    #[test]
    fn send_after_close_fails() {
        let link = SerialLink::new("COM9", io::empty(), io::sink());
        assert!(link.close());
        assert!(!link.close());
        assert!(matches!(link.send_line("STOP"), Err(LinkError::Closed { .. })));
    }

    #[test]
    fn reader_can_only_be_taken_once() {
        let link = SerialLink::new("COM9", io::empty(), io::sink());
        assert!(link.take_reader().is_some());
        assert!(link.take_reader().is_none());
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl SharedSink {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
