// ── Operator console protocol ──
//
// One event queue feeds the console: typed lines from the terminal and
// credential requests from provisioning threads. Routing both through the
// same queue means a single reader owns stdin, and the line right after a
// credential request is always taken as the answer.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use strum::{Display, EnumString};
use tracing::{debug, warn};

use crate::barrier::StickySignal;
use crate::credentials::Credential;
use crate::error::CoreError;
use crate::model::{DeviceId, DeviceStatus};
use crate::provisioning::CredentialPrompt;
use crate::session::{Session, SessionReport};

/// Commands the operator can type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum OperatorCommand {
    #[strum(serialize = "a")]
    Start,
    #[strum(serialize = "s")]
    Stop,
    #[strum(serialize = "status")]
    Status,
    #[strum(serialize = "q")]
    Quit,
}

impl OperatorCommand {
    /// Parse one console line, ignoring surrounding whitespace.
    pub fn parse(line: &str) -> Option<Self> {
        Self::from_str(line.trim()).ok()
    }
}

/// Something the console has to react to.
#[derive(Debug)]
pub enum ConsoleEvent {
    Line(String),
    Credential(CredentialRequest),
    /// Input ended.
    Closed,
}

/// A provisioning thread waiting for an operator-supplied credential.
#[derive(Debug)]
pub struct CredentialRequest {
    pub device: DeviceId,
    pub expires_at: Instant,
    reply: Arc<Sender<Option<Credential>>>,
}

impl CredentialRequest {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Answer with a `name,secret` line. An empty or malformed line declines.
    pub fn answer(self, line: &str) {
        let line = line.trim();
        let credential = if line.is_empty() {
            None
        } else {
            let parsed = Credential::parse(line);
            if parsed.is_none() {
                warn!(device = %self.device, "expected name,secret; declining");
            }
            parsed
        };
        let _ = self.reply.send(credential);
    }
}

/// [`CredentialPrompt`] that asks through the console event queue.
#[derive(Debug, Clone)]
pub struct ConsolePrompt {
    events: Sender<ConsoleEvent>,
}

impl ConsolePrompt {
    pub fn new(events: Sender<ConsoleEvent>) -> Self {
        Self { events }
    }
}

impl CredentialPrompt for ConsolePrompt {
    fn request(
        &self,
        device: &DeviceId,
        timeout: Duration,
        stop: &StickySignal,
    ) -> Option<Credential> {
        if stop.is_set() {
            return None;
        }
        let (reply, answer) = mpsc::channel();
        let reply = Arc::new(reply);
        let expires_at = Instant::now() + timeout;

        // Stop declines on the operator's behalf. The hook holds a weak
        // handle so a dropped request still disconnects the channel.
        let on_stop = Arc::downgrade(&reply);
        stop.on_set(move || {
            if let Some(reply) = on_stop.upgrade() {
                let _ = reply.send(None);
            }
        });

        self.events
            .send(ConsoleEvent::Credential(CredentialRequest {
                device: device.clone(),
                expires_at,
                reply,
            }))
            .ok()?;

        answer
            .recv_timeout(timeout)
            .ok()
            .flatten()
            .filter(|_| !stop.is_set())
    }
}

/// How the console presents itself. The binary renders to a terminal;
/// tests record calls.
pub trait ConsoleView {
    fn prompt(&mut self);

    fn credential_prompt(&mut self, device: &DeviceId, remaining: Duration);

    fn rejected(&mut self, input: &str);

    fn report(&mut self, report: &SessionReport);

    fn status(&mut self, devices: &[(DeviceId, DeviceStatus)], claims: &[(String, DeviceId)]);

    fn error(&mut self, error: &CoreError);
}

/// Run the operator loop until stop, quit or end of input.
///
/// The session is always closed on return; quitting or losing input while
/// recording stops every device first.
pub fn run_console<V: ConsoleView>(
    session: &mut Session,
    events: &Receiver<ConsoleEvent>,
    view: &mut V,
) -> Result<(), CoreError> {
    let mut pending: VecDeque<CredentialRequest> = VecDeque::new();
    view.prompt();

    while let Ok(event) = events.recv() {
        match event {
            ConsoleEvent::Closed => break,
            ConsoleEvent::Credential(request) => {
                if pending.is_empty() {
                    view.credential_prompt(&request.device, remaining(&request));
                }
                pending.push_back(request);
            }
            ConsoleEvent::Line(line) => {
                pending.retain(|r| !r.is_expired());
                if let Some(request) = pending.pop_front() {
                    debug!(device = %request.device, "credential answer received");
                    request.answer(&line);
                    match pending.front() {
                        Some(next) => view.credential_prompt(&next.device, remaining(next)),
                        None => view.prompt(),
                    }
                    continue;
                }

                let Some(command) = OperatorCommand::parse(&line) else {
                    view.rejected(line.trim());
                    view.prompt();
                    continue;
                };
                debug!(%command, "operator command");
                match command {
                    OperatorCommand::Start => match session.start() {
                        Ok(report) => view.report(&report),
                        Err(e) => view.error(&e),
                    },
                    OperatorCommand::Stop => match session.stop() {
                        Ok(report) => {
                            view.report(&report);
                            return Ok(());
                        }
                        Err(e) => view.error(&e),
                    },
                    OperatorCommand::Status => {
                        view.status(&session.snapshot(), &session.claims());
                    }
                    OperatorCommand::Quit => break,
                }
                view.prompt();
            }
        }
    }

    // Dropping unanswered requests declines them.
    drop(pending);
    if let Some(report) = session.quit()? {
        view.report(&report);
    }
    Ok(())
}

fn remaining(request: &CredentialRequest) -> Duration {
    request.expires_at.saturating_duration_since(Instant::now())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::SessionBuilder;
    use crate::testing::{SimBox, SimOpener};
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;
    use std::thread;

    #[test]
    fn commands_are_trimmed_and_case_insensitive() {
        assert_eq!(OperatorCommand::parse(" A \n"), Some(OperatorCommand::Start));
        assert_eq!(OperatorCommand::parse("s"), Some(OperatorCommand::Stop));
        assert_eq!(OperatorCommand::parse("STATUS"), Some(OperatorCommand::Status));
        assert_eq!(OperatorCommand::parse("q"), Some(OperatorCommand::Quit));
        assert_eq!(OperatorCommand::parse("start"), None);
        assert_eq!(OperatorCommand::parse(""), None);
    }

    #[test]
    fn prompt_receives_console_answer() {
        let (tx, rx) = mpsc::channel();
        let prompt = ConsolePrompt::new(tx);
        let stop = StickySignal::new();

        let answerer = thread::spawn(move || {
            let ConsoleEvent::Credential(request) = rx.recv().unwrap() else {
                panic!("expected a credential request");
            };
            assert_eq!(request.device.as_str(), "COM3");
            request.answer(" lab , s3cret ");
        });

        let credential = prompt
            .request(&DeviceId::from("COM3"), Duration::from_secs(5), &stop)
            .unwrap();
        answerer.join().unwrap();
        assert_eq!(credential.name, "lab");
        assert_eq!(credential.secret.expose_secret(), "s3cret");
    }

    #[test]
    fn empty_answer_declines() {
        let (tx, rx) = mpsc::channel();
        let prompt = ConsolePrompt::new(tx);
        let stop = StickySignal::new();
        let answerer = thread::spawn(move || {
            if let ConsoleEvent::Credential(request) = rx.recv().unwrap() {
                request.answer("   ");
            }
        });
        assert!(
            prompt
                .request(&DeviceId::from("COM3"), Duration::from_secs(5), &stop)
                .is_none()
        );
        answerer.join().unwrap();
    }

    #[test]
    fn stop_cuts_a_pending_prompt_short() {
        let (tx, _rx) = mpsc::channel();
        let prompt = ConsolePrompt::new(tx);
        let stop = StickySignal::new();
        stop.set();

        let begun = Instant::now();
        assert!(
            prompt
                .request(&DeviceId::from("COM3"), Duration::from_secs(30), &stop)
                .is_none()
        );
        assert!(begun.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn stop_wakes_a_waiting_prompt() {
        let (tx, rx) = mpsc::channel();
        let prompt = ConsolePrompt::new(tx);
        let stop = Arc::new(StickySignal::new());

        let stopper = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                // Hold the request unanswered until stop arrives.
                let request = rx.recv().unwrap();
                thread::sleep(Duration::from_millis(100));
                stop.set();
                request
            })
        };

        let begun = Instant::now();
        assert!(
            prompt
                .request(&DeviceId::from("COM3"), Duration::from_secs(30), &stop)
                .is_none()
        );
        assert!(begun.elapsed() < Duration::from_secs(5));
        assert!(matches!(stopper.join().unwrap(), ConsoleEvent::Credential(_)));
    }

    #[derive(Default)]
    struct Recorder {
        lines: Vec<String>,
    }

    impl ConsoleView for Recorder {
        fn prompt(&mut self) {}

        fn credential_prompt(&mut self, device: &DeviceId, _remaining: Duration) {
            self.lines.push(format!("credential {device}"));
        }

        fn rejected(&mut self, input: &str) {
            self.lines.push(format!("rejected {input}"));
        }

        fn report(&mut self, report: &SessionReport) {
            self.lines
                .push(format!("{} acked {}", report.command, report.acknowledged.len()));
        }

        fn status(&mut self, devices: &[(DeviceId, DeviceStatus)], _claims: &[(String, DeviceId)]) {
            self.lines.push(format!("status {}", devices.len()));
        }

        fn error(&mut self, error: &CoreError) {
            self.lines.push(format!("error {error}"));
        }
    }

    fn provisioned_session() -> Session {
        let mut config = SessionConfig {
            ports: vec!["COM1".into()],
            credentials: vec![Credential::new("net1", "p1")],
            ..SessionConfig::default()
        };
        config.provisioning.settle = Duration::from_millis(50);
        config.fanout.status_interval = Duration::ZERO;
        let opener = Arc::new(SimOpener::default().with("COM1", SimBox::joining(&[("net1", "p1")])));
        let session = SessionBuilder::new(config, opener).open().unwrap();
        let ready = session
            .registry()
            .wait_until(&DeviceId::from("COM1"), Instant::now() + Duration::from_secs(5), |s| {
                s.is_eligible()
            });
        assert!(ready.is_some());
        session
    }

    #[test]
    fn console_runs_a_recording() {
        let mut session = provisioned_session();
        let (tx, rx) = mpsc::channel();
        for line in ["status", "go", "s", "A", "a", "s"] {
            tx.send(ConsoleEvent::Line(line.into())).unwrap();
        }

        let mut view = Recorder::default();
        run_console(&mut session, &rx, &mut view).unwrap();

        assert_eq!(
            view.lines,
            [
                "status 1",
                "rejected go",
                "error Recording has not been started",
                "START acked 1",
                "error Recording has already been started",
                "STOP acked 1",
            ]
        );
        assert!(session.is_closed());
    }

    #[test]
    fn end_of_input_while_recording_stops() {
        let mut session = provisioned_session();
        let (tx, rx) = mpsc::channel();
        tx.send(ConsoleEvent::Line("a".into())).unwrap();
        tx.send(ConsoleEvent::Closed).unwrap();

        let mut view = Recorder::default();
        run_console(&mut session, &rx, &mut view).unwrap();
        assert_eq!(view.lines, ["START acked 1", "STOP acked 1"]);
    }

    #[test]
    fn line_after_credential_request_is_the_answer() {
        let mut session = provisioned_session();
        let (tx, rx) = mpsc::channel();
        let (reply, answer) = mpsc::channel();
        tx.send(ConsoleEvent::Credential(CredentialRequest {
            device: DeviceId::from("COM9"),
            expires_at: Instant::now() + Duration::from_secs(30),
            reply: Arc::new(reply),
        }))
        .unwrap();
        tx.send(ConsoleEvent::Line("q".into())).unwrap();
        tx.send(ConsoleEvent::Line("q".into())).unwrap();

        let mut view = Recorder::default();
        run_console(&mut session, &rx, &mut view).unwrap();
        assert_eq!(view.lines, ["credential COM9"]);
        // "q" has no comma, so the request was declined.
        assert!(answer.recv().unwrap().is_none());
    }
}
