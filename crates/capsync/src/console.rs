//! Terminal side of the operator console: a stdin reader thread feeding
//! the console event queue, and a [`ConsoleView`] that prints to stdout.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use owo_colors::OwoColorize;
use tracing::debug;

use capsync_core::{ConsoleEvent, ConsoleView, CoreError, DeviceId, DeviceStatus, SessionReport};

use crate::output;

/// Forward stdin lines as console events until end of input.
pub fn spawn_stdin_reader(events: Sender<ConsoleEvent>) -> io::Result<()> {
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if events.send(ConsoleEvent::Line(line)).is_err() {
                    return;
                }
            }
            debug!("stdin closed");
            let _ = events.send(ConsoleEvent::Closed);
        })
        .map(drop)
}

pub struct TerminalView {
    color: bool,
}

impl TerminalView {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    fn show(text: &str) {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{text}");
    }

    fn ask(text: &str) {
        let mut out = io::stdout().lock();
        let _ = write!(out, "{text}");
        let _ = out.flush();
    }
}

impl ConsoleView for TerminalView {
    fn prompt(&mut self) {
        let keys = "[a] start  [s] stop  [status]  [q] quit";
        if self.color {
            Self::ask(&format!("{} > ", keys.cyan()));
        } else {
            Self::ask(&format!("{keys} > "));
        }
    }

    fn credential_prompt(&mut self, device: &DeviceId, remaining: Duration) {
        Self::show("");
        Self::ask(&format!(
            "{device} could not join any listed network. Enter name,secret \
             (empty to skip, {}s left): ",
            remaining.as_secs()
        ));
    }

    fn rejected(&mut self, input: &str) {
        Self::show(&format!("Unknown command '{input}'"));
    }

    fn report(&mut self, report: &SessionReport) {
        Self::show(&output::render_report(report, self.color));
    }

    fn status(&mut self, devices: &[(DeviceId, DeviceStatus)], claims: &[(String, DeviceId)]) {
        Self::show(&output::render_status(devices, claims, self.color));
    }

    fn error(&mut self, error: &CoreError) {
        if self.color {
            Self::show(&error.to_string().red().to_string());
        } else {
            Self::show(&error.to_string());
        }
    }
}
