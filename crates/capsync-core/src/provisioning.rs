// ── Provisioning engine ──
//
// Drives one trigger box from Unprovisioned/Disconnected to Connected.
// Each device runs this on its own thread; the only shared state is the
// status registry, the credential pool and the session barrier.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::barrier::{SessionBarrier, StickySignal};
use crate::config::ProvisioningConfig;
use crate::credentials::{Credential, CredentialPool};
use crate::error::CoreError;
use crate::model::{ConnectionState, DeviceCommand, DeviceId, DeviceStatus, WifiState};
use crate::registry::StatusRegistry;
use crate::trigger::TriggerDevice;

/// Source of operator-supplied credentials once the list is exhausted.
pub trait CredentialPrompt: Send + Sync {
    /// Ask for a credential for `device`. `None` means declined, timed out,
    /// or `stop` was set while waiting.
    fn request(
        &self,
        device: &DeviceId,
        timeout: Duration,
        stop: &StickySignal,
    ) -> Option<Credential>;
}

/// How provisioning of one device ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    Connected { network: String, attempts: u32 },
    /// Every attempt failed; the device is now `Failed`.
    Failed { attempts: u32 },
    /// Stop was requested or the device closed before provisioning finished.
    Abandoned,
    /// The device reported a live network before provisioning began.
    AlreadyConnected,
    /// No credentials configured.
    Skipped,
}

enum Attempt {
    Connected,
    Rejected,
    TimedOut,
    Aborted,
    Broken(CoreError),
}

/// Shared provisioning context; cheap to clone into worker threads.
#[derive(Clone)]
pub struct Provisioner {
    registry: Arc<StatusRegistry>,
    pool: Arc<CredentialPool>,
    barrier: Arc<SessionBarrier>,
    prompt: Option<Arc<dyn CredentialPrompt>>,
    config: ProvisioningConfig,
}

impl Provisioner {
    pub fn new(
        registry: Arc<StatusRegistry>,
        pool: Arc<CredentialPool>,
        barrier: Arc<SessionBarrier>,
        prompt: Option<Arc<dyn CredentialPrompt>>,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            barrier,
            prompt,
            config,
        }
    }

    /// Provision `device`. `default_index` is the device's position, used
    /// for the fallback credential.
    pub fn run(&self, device: &TriggerDevice, default_index: usize) -> ProvisioningOutcome {
        let id = device.id();
        if device.status().is_some_and(|s| !needs_provisioning(&s)) {
            info!(device = %id, "device already on a network");
            return ProvisioningOutcome::AlreadyConnected;
        }
        if self.pool.is_empty() {
            warn!(device = %id, "no credentials configured, skipping provisioning");
            return ProvisioningOutcome::Skipped;
        }

        let mut tried = HashSet::new();
        let mut attempts = 0;

        while attempts < self.config.max_attempts {
            if self.should_abandon(device) {
                return ProvisioningOutcome::Abandoned;
            }
            let credential = match self.pool.claim_next(id, &tried, default_index) {
                Some(credential) => credential,
                None => {
                    info!(device = %id, "every network is claimed, waiting for a release");
                    let Some(credential) = self.wait_for_release(device, &tried, default_index)
                    else {
                        // An empty wait costs an attempt.
                        attempts += 1;
                        continue;
                    };
                    credential
                }
            };
            attempts += 1;

            match self.attempt(device, &credential) {
                Attempt::Connected => {
                    return self.connected(id, credential.name, attempts);
                }
                Attempt::Aborted => {
                    self.release(id, &credential.name);
                    return ProvisioningOutcome::Abandoned;
                }
                Attempt::Broken(e) => {
                    self.release(id, &credential.name);
                    warn!(device = %id, error = %e, "provisioning aborted by transport failure");
                    return ProvisioningOutcome::Failed { attempts };
                }
                Attempt::Rejected | Attempt::TimedOut => {
                    self.release(id, &credential.name);
                    tried.insert(credential.name);
                }
            }
        }

        if let Some(outcome) = self.manual_override(device, attempts) {
            return outcome;
        }

        if self.should_abandon(device) {
            return ProvisioningOutcome::Abandoned;
        }
        let err = CoreError::Provisioning {
            device: id.clone(),
            attempts,
        };
        self.registry.mark_failed(id, err.to_string());
        ProvisioningOutcome::Failed { attempts }
    }

    /// Provision `device`, then provision it again every time its network
    /// drops, until stop is requested or the device closes or fails.
    pub fn supervise(&self, device: &TriggerDevice, default_index: usize) -> ProvisioningOutcome {
        let id = device.id();
        loop {
            let outcome = self.run(device, default_index);
            if !matches!(
                outcome,
                ProvisioningOutcome::Connected { .. } | ProvisioningOutcome::AlreadyConnected
            ) {
                return outcome;
            }

            let dropped = self.registry.watch(None, |devices| {
                let status = devices.get(id);
                if self.barrier.stop_requested()
                    || device.is_closed()
                    || status.is_none_or(|s| s.connection.is_terminal())
                {
                    return Some(false);
                }
                status.is_some_and(needs_provisioning).then_some(true)
            });
            if dropped != Some(true) {
                return outcome;
            }
            warn!(device = %id, "network dropped, provisioning again");
        }
    }

    /// One extra attempt with an operator-supplied credential.
    fn manual_override(
        &self,
        device: &TriggerDevice,
        attempts: u32,
    ) -> Option<ProvisioningOutcome> {
        let id = device.id();
        let prompt = self.prompt.as_ref().filter(|_| self.config.manual_override)?;
        if self.should_abandon(device) {
            return Some(ProvisioningOutcome::Abandoned);
        }

        warn!(device = %id, attempts, "credential list exhausted, asking operator");
        let credential = prompt.request(id, self.config.override_timeout, self.barrier.stop())?;
        if !self.pool.try_claim(&credential.name, id) {
            warn!(device = %id, network = %credential.name, "override network is claimed by another device");
            return None;
        }

        let attempts = attempts + 1;
        match self.attempt(device, &credential) {
            Attempt::Connected => Some(self.connected(id, credential.name, attempts)),
            Attempt::Aborted => {
                self.release(id, &credential.name);
                Some(ProvisioningOutcome::Abandoned)
            }
            Attempt::Broken(_) => {
                self.release(id, &credential.name);
                Some(ProvisioningOutcome::Failed { attempts })
            }
            Attempt::Rejected | Attempt::TimedOut => {
                self.release(id, &credential.name);
                None
            }
        }
    }

    /// Block for up to one attempt timeout until another device frees a
    /// network this one may claim. `None` on timeout or abandonment.
    fn wait_for_release(
        &self,
        device: &TriggerDevice,
        tried: &HashSet<String>,
        default_index: usize,
    ) -> Option<Credential> {
        let id = device.id();
        let deadline = Instant::now() + self.config.attempt_timeout;
        let claimed = self
            .registry
            .watch(Some(deadline), |devices| {
                let gone = self.barrier.stop_requested()
                    || device.is_closed()
                    || devices.get(id).is_none_or(|s| s.connection.is_terminal());
                if gone {
                    return Some(None);
                }
                self.pool.claim_next(id, tried, default_index).map(Some)
            })
            .flatten();
        if claimed.is_none() && !self.should_abandon(device) {
            warn!(device = %id, "no network was released in time");
        }
        claimed
    }

    fn connected(&self, id: &DeviceId, network: String, attempts: u32) -> ProvisioningOutcome {
        self.registry
            .update(id, |s| s.assigned_network = Some(network.clone()));
        info!(device = %id, %network, attempts, "device provisioned");
        ProvisioningOutcome::Connected { network, attempts }
    }

    fn release(&self, id: &DeviceId, network: &str) {
        self.pool.release(network, id);
        self.registry.update(id, |s| {
            if s.assigned_network.as_deref() == Some(network) {
                s.assigned_network = None;
            }
        });
    }

    fn should_abandon(&self, device: &TriggerDevice) -> bool {
        self.barrier.stop_requested()
            || device.is_closed()
            || device
                .status()
                .is_none_or(|s| s.connection.is_terminal())
    }

    fn aborted(&self, s: &DeviceStatus) -> bool {
        self.barrier.stop_requested() || s.connection.is_terminal()
    }

    /// SETSSID, settle (or NO_PASS), SETPASS, then wait for a fresh answer.
    fn attempt(&self, device: &TriggerDevice, credential: &Credential) -> Attempt {
        let id = device.id();
        info!(device = %id, network = %credential.name, "trying network");
        self.registry
            .update(id, |s| s.assigned_network = Some(credential.name.clone()));

        let Some(before) = device.status() else {
            return Attempt::Aborted;
        };
        if let Err(e) = device.send(&DeviceCommand::SetSsid(credential.name.clone())) {
            return Attempt::Broken(e);
        }

        let settle_deadline = Instant::now() + self.config.settle;
        let settled = self.registry.wait_until(id, settle_deadline, |s| {
            self.aborted(s)
                || (s.wifi_revision > before.wifi_revision
                    && s.wifi == Some(WifiState::AwaitingPassword))
        });
        if settled.is_some_and(|s| self.aborted(&s)) || self.should_abandon(device) {
            return Attempt::Aborted;
        }

        let Some(before) = device.status() else {
            return Attempt::Aborted;
        };
        if let Err(e) = device.send(&DeviceCommand::SetPass(credential.secret.clone())) {
            return Attempt::Broken(e);
        }

        let deadline = Instant::now() + self.config.attempt_timeout;
        let answer = self.registry.wait_until(id, deadline, |s| {
            self.aborted(s)
                || (s.wifi_revision > before.wifi_revision
                    && matches!(
                        s.wifi,
                        Some(WifiState::Connected | WifiState::Disconnected)
                    ))
        });

        match answer {
            None if self.should_abandon(device) => Attempt::Aborted,
            None => {
                warn!(device = %id, network = %credential.name, "no answer from device");
                Attempt::TimedOut
            }
            Some(s) if self.aborted(&s) => Attempt::Aborted,
            Some(s) if s.wifi == Some(WifiState::Connected) => Attempt::Connected,
            Some(_) => {
                warn!(device = %id, network = %credential.name, "network rejected");
                Attempt::Rejected
            }
        }
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("config", &self.config)
            .field("manual_override", &self.prompt.is_some())
            .finish_non_exhaustive()
    }
}

/// Whether provisioning still applies to a device in this state.
pub fn needs_provisioning(status: &DeviceStatus) -> bool {
    !status.connection.is_terminal()
        && status.connection != ConnectionState::Recording
        && status.wifi != Some(WifiState::Connected)
}
