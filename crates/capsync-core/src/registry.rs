// ── Status registry ──
//
// The only state shared between the serial reader threads, the
// provisioning workers, the sensor domain and the operator. One mutex
// guards the whole map; a condition variable is notified on every
// update so waiters block with a deadline instead of polling.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};

use crate::model::{ConnectionState, DeviceId, DeviceStatus, Transition};

/// Thread-safe map from device identity to its current status.
#[derive(Debug, Default)]
pub struct StatusRegistry {
    devices: Mutex<HashMap<DeviceId, DeviceStatus>>,
    changed: Condvar,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceId, DeviceStatus>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a device. An existing record for the same id is replaced.
    pub fn insert(&self, id: DeviceId, status: DeviceStatus) {
        self.lock().insert(id, status);
        self.changed.notify_all();
    }

    /// Mutate one record under the lock and wake all waiters.
    ///
    /// Returns `None` if the device is unknown.
    pub fn update<R>(&self, id: &DeviceId, f: impl FnOnce(&mut DeviceStatus) -> R) -> Option<R> {
        let result = {
            let mut devices = self.lock();
            let status = devices.get_mut(id)?;
            let result = f(status);
            status.updated_at = Utc::now();
            result
        };
        self.changed.notify_all();
        Some(result)
    }

    /// Set a connection state and log the transition.
    pub fn set_connection(&self, id: &DeviceId, to: ConnectionState) -> Option<Transition> {
        let t = self.update(id, |s| s.set_connection(to)).flatten();
        if let Some(Transition::Connection { from, to }) = t {
            info!(device = %id, %from, %to, "connection state changed");
        }
        t
    }

    /// Mark a device `Failed` with a diagnostic.
    pub fn mark_failed(&self, id: &DeviceId, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(Some(Transition::Connection { from, .. })) =
            self.update(id, |s| s.fail(reason.clone()))
        {
            warn!(device = %id, %from, %reason, "device failed");
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceStatus> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.lock().contains_key(id)
    }

    /// Every record, ordered by device id.
    pub fn snapshot(&self) -> Vec<(DeviceId, DeviceStatus)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Ids of devices satisfying `pred`, ordered.
    pub fn select(&self, mut pred: impl FnMut(&DeviceStatus) -> bool) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self
            .lock()
            .iter()
            .filter(|(_, s)| pred(s))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Wake every waiter without changing anything, so they can re-check
    /// conditions that live outside the registry (e.g. a stop signal).
    pub fn notify_waiters(&self) {
        let _guard = self.lock();
        self.changed.notify_all();
    }

    /// Block until `pred` holds for `id` or `deadline` passes.
    ///
    /// Returns the satisfying snapshot, or `None` on timeout or if the
    /// device is not registered.
    pub fn wait_until(
        &self,
        id: &DeviceId,
        deadline: Instant,
        mut pred: impl FnMut(&DeviceStatus) -> bool,
    ) -> Option<DeviceStatus> {
        let mut devices = self.lock();
        loop {
            let status = devices.get(id)?;
            if pred(status) {
                return Some(status.clone());
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if remaining.is_zero() {
                return None;
            }
            devices = self
                .changed
                .wait_timeout(devices, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Block until `f` yields a value over the whole map, or `deadline`
    /// passes. `None` as the deadline waits indefinitely.
    ///
    /// `f` runs with the registry locked, so it must not call back into
    /// the registry.
    pub fn watch<T>(
        &self,
        deadline: Option<Instant>,
        mut f: impl FnMut(&HashMap<DeviceId, DeviceStatus>) -> Option<T>,
    ) -> Option<T> {
        let mut devices = self.lock();
        loop {
            if let Some(found) = f(&devices) {
                return Some(found);
            }
            devices = match deadline {
                None => self
                    .changed
                    .wait(devices)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = match deadline.checked_duration_since(Instant::now()) {
                        Some(r) if !r.is_zero() => r,
                        _ => return None,
                    };
                    self.changed
                        .wait_timeout(devices, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Block until `pred` holds for every id in `ids` or `deadline` passes.
    ///
    /// Returns the ids that satisfy `pred` at return time, in input order.
    /// Unknown ids never satisfy it.
    pub fn wait_for_all(
        &self,
        ids: &[DeviceId],
        deadline: Instant,
        mut pred: impl FnMut(&DeviceId, &DeviceStatus) -> bool,
    ) -> Vec<DeviceId> {
        let mut devices = self.lock();
        loop {
            let done: Vec<DeviceId> = ids
                .iter()
                .filter(|id| devices.get(*id).is_some_and(|s| pred(*id, s)))
                .cloned()
                .collect();
            if done.len() == ids.len() {
                return done;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if !r.is_zero() => r,
                _ => return done,
            };
            devices = self
                .changed
                .wait_timeout(devices, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
