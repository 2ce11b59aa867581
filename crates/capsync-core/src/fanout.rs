// ── Command fan-out ──
//
// Broadcast one command to many devices over a bounded pool of scoped
// worker threads. A slow or failing device occupies one worker; the rest
// keep draining the queue. Outcomes come back in target order.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{debug, warn};

use crate::error::CoreError;
use crate::model::{DeviceCommand, DeviceId};

/// Something a command can be delivered to.
pub trait CommandTarget: Sync {
    fn id(&self) -> &DeviceId;

    fn deliver(&self, command: &DeviceCommand) -> Result<(), CoreError>;
}

impl<T: CommandTarget + Send + ?Sized> CommandTarget for Arc<T> {
    fn id(&self) -> &DeviceId {
        (**self).id()
    }

    fn deliver(&self, command: &DeviceCommand) -> Result<(), CoreError> {
        (**self).deliver(command)
    }
}

/// Per-device outcomes of one broadcast.
#[derive(Debug)]
pub struct FanoutReport {
    pub command: DeviceCommand,
    pub outcomes: Vec<(DeviceId, Result<(), CoreError>)>,
}

impl FanoutReport {
    pub fn delivered(&self) -> Vec<DeviceId> {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn failures(&self) -> Vec<(&DeviceId, &CoreError)> {
        self.outcomes
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (id, e)))
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|(_, r)| r.is_ok())
    }
}

/// Deliver `command` to every target, at most `workers` at a time.
///
/// Never fails as a whole: each device's error is logged and recorded in
/// the report, and delivery to the others continues.
pub fn broadcast<T: CommandTarget>(
    targets: &[T],
    command: &DeviceCommand,
    workers: NonZeroUsize,
) -> FanoutReport {
    let slots: Vec<Mutex<Option<Result<(), CoreError>>>> =
        targets.iter().map(|_| Mutex::new(None)).collect();
    let next = AtomicUsize::new(0);
    let pool = workers.get().min(targets.len());

    thread::scope(|scope| {
        for _ in 0..pool {
            scope.spawn(|| {
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let (Some(target), Some(slot)) = (targets.get(i), slots.get(i)) else {
                        break;
                    };
                    let result = target.deliver(command);
                    match &result {
                        Ok(()) => debug!(device = %target.id(), %command, "delivered"),
                        Err(e) => warn!(device = %target.id(), %command, error = %e, "delivery failed"),
                    }
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
                }
            });
        }
    });

    let outcomes = targets
        .iter()
        .zip(slots)
        .map(|(t, slot)| {
            let result = slot
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)
                .unwrap_or_else(|| {
                    Err(CoreError::Io {
                        device: t.id().clone(),
                        reason: "delivery worker exited early".into(),
                    })
                });
            (t.id().clone(), result)
        })
        .collect();

    FanoutReport {
        command: command.clone(),
        outcomes,
    }
}
