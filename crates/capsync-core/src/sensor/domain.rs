// ── Sensor domain ──
//
// All wireless work runs on one dedicated OS thread driving a
// current-thread runtime and a `LocalSet`. The rest of the program talks to
// it through `SensorDomain`: an unbounded request queue carrying oneshot
// reply channels. Blocking callers wait on the reply; every operation
// inside the domain is individually time-bounded, so those waits are too.

use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use capsync_link::{LinkError, SensorLink, SensorScanner};
use futures_util::future::join_all;
use tokio::runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, LocalSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::actor::{ActorCommand, AckReply, SensorAck, SensorActor};
use super::negotiate::{bounded, configure, negotiate};
use crate::barrier::SessionBarrier;
use crate::config::SensorConfig;
use crate::error::CoreError;
use crate::model::{ConnectionState, DeviceId, DeviceStatus};
use crate::registry::StatusRegistry;

/// Outcome of one sensor operation.
#[derive(Debug)]
pub struct SensorReport {
    pub id: DeviceId,
    pub result: Result<SensorAck, CoreError>,
}

type SetupResult = Result<Vec<DeviceId>, CoreError>;

enum HubRequest {
    StartAll(oneshot::Sender<Vec<SensorReport>>),
    StopAll(oneshot::Sender<Vec<SensorReport>>),
    Shutdown(oneshot::Sender<()>),
}

fn domain_gone() -> CoreError {
    CoreError::SensorDomain {
        reason: "sensor domain has shut down".into(),
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Handle to the sensor domain thread.
///
/// Dropping the handle shuts the domain down and disconnects every sensor.
#[derive(Debug)]
pub struct SensorDomain {
    requests: mpsc::UnboundedSender<HubRequest>,
    sensors: Vec<DeviceId>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for HubRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::StartAll(_) => "StartAll",
            Self::StopAll(_) => "StopAll",
            Self::Shutdown(_) => "Shutdown",
        })
    }
}

impl SensorDomain {
    /// Start the domain thread, then discover, connect, configure and
    /// negotiate sensors. Blocks until that setup is complete.
    ///
    /// `connect` builds the scanner on the domain thread, so the scanner
    /// and its links never need to be `Send`. Sensors that fail
    /// negotiation are marked `Failed` and left out of [`sensors`].
    ///
    /// [`sensors`]: Self::sensors
    pub fn spawn<S, F, Fut>(
        connect: F,
        config: SensorConfig,
        registry: Arc<StatusRegistry>,
        barrier: Arc<SessionBarrier>,
    ) -> Result<Self, CoreError>
    where
        S: SensorScanner + 'static,
        S::Link: 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<S, LinkError>> + 'static,
    {
        let (requests, inbox) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<SetupResult>();

        let thread = thread::Builder::new()
            .name("sensor-domain".into())
            .spawn(move || {
                let rt = match runtime::Builder::new_current_thread().enable_time().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(CoreError::SensorDomain {
                            reason: format!("cannot build runtime: {e}"),
                        }));
                        return;
                    }
                };
                let local = LocalSet::new();
                local.block_on(&rt, hub(connect, config, registry, barrier, inbox, ready_tx));
            })
            .map_err(|e| CoreError::SensorDomain {
                reason: format!("cannot spawn sensor thread: {e}"),
            })?;

        let setup = ready_rx.blocking_recv();
        let mut domain = Self {
            requests,
            sensors: Vec::new(),
            thread: Some(thread),
        };
        match setup {
            Ok(Ok(sensors)) => {
                domain.sensors = sensors;
                Ok(domain)
            }
            Ok(Err(e)) => {
                domain.shutdown();
                Err(e)
            }
            Err(_) => {
                domain.shutdown();
                Err(domain_gone())
            }
        }
    }

    /// Sensors that completed negotiation.
    pub fn sensors(&self) -> &[DeviceId] {
        &self.sensors
    }

    /// Start recording on every sensor and wait for all of them.
    pub fn start_all(&self) -> Result<Vec<SensorReport>, CoreError> {
        self.call(HubRequest::StartAll)
    }

    /// Stop recording on every sensor and wait for all of them.
    pub fn stop_all(&self) -> Result<Vec<SensorReport>, CoreError> {
        self.call(HubRequest::StopAll)
    }

    fn call(
        &self,
        request: impl FnOnce(oneshot::Sender<Vec<SensorReport>>) -> HubRequest,
    ) -> Result<Vec<SensorReport>, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .map_err(|_| domain_gone())?;
        rx.blocking_recv().map_err(|_| domain_gone())
    }

    /// Disconnect every sensor and stop the domain thread. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if self.requests.send(HubRequest::Shutdown(tx)).is_ok() {
            let _ = rx.blocking_recv();
        }
        if thread.join().is_err() {
            warn!("sensor domain thread panicked");
        }
        debug!("sensor domain stopped");
    }
}

impl Drop for SensorDomain {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Hub (runs on the domain thread) ─────────────────────────────────

struct ActorHandle {
    id: DeviceId,
    commands: mpsc::UnboundedSender<ActorCommand>,
    task: task::JoinHandle<()>,
}

impl ActorHandle {
    async fn request(
        &self,
        command: fn(AckReply) -> ActorCommand,
        limit: Duration,
    ) -> SensorReport {
        let (tx, rx) = oneshot::channel();
        let result = if self.commands.send(command(tx)).is_err() {
            Err(CoreError::Io {
                device: self.id.clone(),
                reason: "sensor task has ended".into(),
            })
        } else {
            match timeout(limit, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(CoreError::Io {
                    device: self.id.clone(),
                    reason: "sensor task has ended".into(),
                }),
                Err(_) => Err(CoreError::Io {
                    device: self.id.clone(),
                    reason: "sensor did not answer in time".into(),
                }),
            }
        };
        if let Err(e) = &result {
            warn!(device = %self.id, error = %e, "sensor operation failed");
        }
        SensorReport {
            id: self.id.clone(),
            result,
        }
    }
}

async fn hub<S, F, Fut>(
    connect: F,
    config: SensorConfig,
    registry: Arc<StatusRegistry>,
    barrier: Arc<SessionBarrier>,
    mut inbox: mpsc::UnboundedReceiver<HubRequest>,
    ready: oneshot::Sender<SetupResult>,
) where
    S: SensorScanner,
    S::Link: 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<S, LinkError>>,
{
    let mut scanner = match connect().await {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    let config = Rc::new(config);
    let cancel = CancellationToken::new();
    let actors = match setup(&mut scanner, &config, &registry, &barrier, &cancel).await {
        Ok(actors) => actors,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let ids = actors.iter().map(|a| a.id.clone()).collect();
    if ready.send(Ok(ids)).is_err() {
        shutdown_actors(actors, &cancel, config.op_timeout).await;
        return;
    }

    // Actor ops are bounded by op_timeout; allow the reply some slack.
    let limit = config.op_timeout * 2;
    while let Some(request) = inbox.recv().await {
        match request {
            HubRequest::StartAll(reply) => {
                let reports = join_all(actors.iter().map(|a| a.request(ActorCommand::Start, limit))).await;
                let _ = reply.send(reports);
            }
            HubRequest::StopAll(reply) => {
                let reports = join_all(actors.iter().map(|a| a.request(ActorCommand::Stop, limit))).await;
                let _ = reply.send(reports);
            }
            HubRequest::Shutdown(reply) => {
                shutdown_actors(actors, &cancel, config.op_timeout).await;
                let _ = reply.send(());
                return;
            }
        }
    }
    shutdown_actors(actors, &cancel, config.op_timeout).await;
}

/// Discover, connect, configure and negotiate, one sensor at a time.
async fn setup<S>(
    scanner: &mut S,
    config: &Rc<SensorConfig>,
    registry: &Arc<StatusRegistry>,
    barrier: &SessionBarrier,
    cancel: &CancellationToken,
) -> Result<Vec<ActorHandle>, CoreError>
where
    S: SensorScanner,
    S::Link: 'static,
{
    info!(filter = %config.name_filter, window = ?config.scan_window, "scanning for sensors");
    let found = bounded(
        config.scan_window + config.op_timeout,
        "<scan>",
        scanner.discover(config.scan_window, &config.name_filter),
    )
    .await?;
    info!(count = found.len(), "sensors discovered");

    let mut actors = Vec::new();
    for ad in found.into_iter().take(config.max_sensors) {
        if barrier.stop_requested() {
            break;
        }
        let id = DeviceId::from(ad.address.as_str());
        let mut link = match bounded(config.op_timeout, &ad.address, scanner.connect(&ad)).await {
            Ok(link) => link,
            Err(e) => {
                warn!(device = %id, error = %e, "sensor connect failed");
                continue;
            }
        };

        registry.insert(id.clone(), DeviceStatus::sensor());
        registry.update(&id, |s| s.last_message = Some(ad.name.clone()));
        info!(device = %id, name = %ad.name, "sensor connected");
        sleep(config.connect_settle).await;

        configure(&mut link, config).await;
        let negotiated = tokio::select! {
            biased;
            () = barrier.stop().wait() => None,
            result = negotiate(&mut link, config) => Some(result),
        };

        match negotiated {
            Some(Ok(channel)) => {
                registry.update(&id, |s| {
                    s.data_channel = Some(channel);
                    s.negotiated = true;
                });
                registry.set_connection(&id, ConnectionState::Ready);
                actors.push(spawn_actor(link, channel, config, registry, cancel));
            }
            Some(Err(e)) => {
                registry.mark_failed(&id, e.to_string());
                drop_link(&mut link, config.op_timeout).await;
            }
            None => {
                info!(device = %id, "stop requested, abandoning sensor negotiation");
                drop_link(&mut link, config.op_timeout).await;
                registry.set_connection(&id, ConnectionState::Closed);
                break;
            }
        }
    }
    Ok(actors)
}

fn spawn_actor<L: SensorLink + 'static>(
    link: L,
    channel: uuid::Uuid,
    config: &Rc<SensorConfig>,
    registry: &Arc<StatusRegistry>,
    cancel: &CancellationToken,
) -> ActorHandle {
    let actor = SensorActor::new(link, channel, Rc::clone(config), Arc::clone(registry));
    let id = actor.id().clone();
    let (commands, rx) = mpsc::unbounded_channel();
    let task = task::spawn_local(actor.run(rx, cancel.child_token()));
    ActorHandle { id, commands, task }
}

async fn drop_link<L: SensorLink>(link: &mut L, limit: Duration) {
    let address = link.address().to_owned();
    if let Err(e) = bounded(limit, &address, link.disconnect()).await {
        debug!(device = %address, error = %e, "disconnect failed");
    }
}

async fn shutdown_actors(actors: Vec<ActorHandle>, cancel: &CancellationToken, limit: Duration) {
    let mut acks = Vec::new();
    for actor in &actors {
        let (tx, rx) = oneshot::channel();
        if actor.commands.send(ActorCommand::Disconnect(tx)).is_ok() {
            acks.push((actor.id.clone(), rx));
        }
    }
    for (id, rx) in acks {
        if timeout(limit * 2, rx).await.is_err() {
            warn!(device = %id, "sensor did not disconnect in time");
        }
    }
    cancel.cancel();
    for actor in actors {
        let _ = timeout(limit, actor.task).await;
    }
}
