// ── Per-sensor actor ──
//
// Each negotiated sensor is owned by one local task on the sensor domain's
// scheduler. It serializes commands for its link and, while recording,
// drains notifications into the capture file.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use capsync_link::{Notification, SensorLink};
use chrono::Local;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::capture::CaptureLog;
use super::negotiate::bounded;
use crate::config::SensorConfig;
use crate::error::CoreError;
use crate::model::{CommandEcho, ConnectionState, DeviceId};
use crate::registry::StatusRegistry;

/// What a sensor reports back for a start or stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorAck {
    Recording { capture: PathBuf },
    Stopped { frames: u64 },
}

pub(crate) type AckReply = oneshot::Sender<Result<SensorAck, CoreError>>;

pub(crate) enum ActorCommand {
    Start(AckReply),
    Stop(AckReply),
    Disconnect(oneshot::Sender<()>),
}

pub(crate) struct SensorActor<L> {
    id: DeviceId,
    link: L,
    data_channel: Uuid,
    config: Rc<SensorConfig>,
    registry: Arc<StatusRegistry>,
    capture: Option<CaptureLog>,
}

impl<L: SensorLink> SensorActor<L> {
    pub(crate) fn new(
        link: L,
        data_channel: Uuid,
        config: Rc<SensorConfig>,
        registry: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            id: DeviceId::from(link.address()),
            link,
            data_channel,
            config,
            registry,
            capture: None,
        }
    }

    pub(crate) fn id(&self) -> &DeviceId {
        &self.id
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ActorCommand>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    self.disconnect().await;
                    break;
                }

                cmd = commands.recv() => match cmd {
                    Some(ActorCommand::Start(reply)) => {
                        let _ = reply.send(self.start().await);
                    }
                    Some(ActorCommand::Stop(reply)) => {
                        let _ = reply.send(self.stop().await);
                    }
                    Some(ActorCommand::Disconnect(reply)) => {
                        self.disconnect().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },

                frame = self.link.next_notification(), if self.capture.is_some() => {
                    self.on_frame(frame);
                }
            }
        }
        debug!(device = %self.id, "sensor actor finished");
    }

    fn on_frame(&mut self, frame: Option<Notification>) {
        let Some(n) = frame else {
            warn!(device = %self.id, "sensor link lost while recording");
            self.registry.mark_failed(&self.id, "link lost while recording");
            self.finish_capture();
            return;
        };
        if n.characteristic != self.data_channel {
            return;
        }
        if let Some(log) = self.capture.as_mut() {
            if let Err(e) = log.append(&n) {
                warn!(device = %self.id, error = %e, "capture write failed");
            }
        }
    }

    async fn start(&mut self) -> Result<SensorAck, CoreError> {
        if let Some(log) = &self.capture {
            return Ok(SensorAck::Recording {
                capture: log.path().to_owned(),
            });
        }
        let eligible = self.registry.get(&self.id).is_some_and(|s| s.is_eligible());
        if !eligible {
            return Err(CoreError::Io {
                device: self.id.clone(),
                reason: "sensor is not ready".into(),
            });
        }

        let label = format!("{} {}", self.link.name(), self.id);
        let log = CaptureLog::create(&self.config.capture_dir, &label, Local::now()).map_err(
            |e| CoreError::Io {
                device: self.id.clone(),
                reason: format!("cannot create capture file: {e}"),
            },
        )?;

        let gatt = &self.config.gatt;
        bounded(
            self.config.op_timeout,
            self.id.as_str(),
            self.link.write(gatt.control, &gatt.start_opcode),
        )
        .await?;

        let capture = log.path().to_owned();
        self.capture = Some(log);
        self.registry.update(&self.id, |s| {
            s.record_echo(CommandEcho::Started);
            s.set_connection(ConnectionState::Recording);
        });
        info!(device = %self.id, file = %capture.display(), "sensor recording");
        Ok(SensorAck::Recording { capture })
    }

    async fn stop(&mut self) -> Result<SensorAck, CoreError> {
        if self.capture.is_none() {
            return Err(CoreError::NotStarted);
        }
        let gatt = &self.config.gatt;
        let written = bounded(
            self.config.op_timeout,
            self.id.as_str(),
            self.link.write(gatt.control, &gatt.stop_opcode),
        )
        .await;

        let frames = self.finish_capture();
        written?;

        self.registry.update(&self.id, |s| {
            s.record_echo(CommandEcho::Stopped);
            s.set_connection(ConnectionState::Ready);
        });
        info!(device = %self.id, frames, "sensor stopped");
        Ok(SensorAck::Stopped { frames })
    }

    fn finish_capture(&mut self) -> u64 {
        let Some(log) = self.capture.take() else {
            return 0;
        };
        let path = log.path().to_owned();
        match log.finish() {
            Ok(frames) => frames,
            Err(e) => {
                warn!(device = %self.id, file = %path.display(), error = %e, "capture flush failed");
                0
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.capture.is_some() {
            if let Err(e) = self.stop().await {
                warn!(device = %self.id, error = %e, "stop before disconnect failed");
            }
        }
        if let Err(e) = bounded(
            self.config.op_timeout,
            self.id.as_str(),
            self.link.disconnect(),
        )
        .await
        {
            warn!(device = %self.id, error = %e, "sensor disconnect failed");
        }
        self.registry
            .set_connection(&self.id, ConnectionState::Closed);
    }
}
