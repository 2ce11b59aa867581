// ── Session barrier ──
//
// Two sticky one-shot signals shared by the thread domain (serial,
// provisioning, operator) and the cooperative sensor domain. Once set, a
// signal stays set; a waiter that arrives late returns immediately.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    set: bool,
    hooks: Vec<Hook>,
}

/// A boolean that can be set once and is never missed.
///
/// Blocking waiters use the condition variable; async waiters use the
/// watch channel; anything else registers a hook. `set` updates all three
/// under the same lock.
pub struct StickySignal {
    state: Mutex<State>,
    cond: Condvar,
    watch: watch::Sender<bool>,
}

impl Default for StickySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StickySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("StickySignal")
            .field("set", &state.set)
            .field("hooks", &state.hooks.len())
            .finish()
    }
}

impl StickySignal {
    pub fn new() -> Self {
        let (watch, _) = watch::channel(false);
        Self {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            watch,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the signal. Returns `true` only for the call that set it.
    pub fn set(&self) -> bool {
        let hooks = {
            let mut state = self.lock();
            if state.set {
                return false;
            }
            state.set = true;
            self.watch.send_replace(true);
            self.cond.notify_all();
            std::mem::take(&mut state.hooks)
        };
        for hook in hooks {
            hook();
        }
        true
    }

    pub fn is_set(&self) -> bool {
        self.lock().set
    }

    /// Run `hook` once the signal is set: right away if it already is,
    /// otherwise on the thread that sets it.
    pub fn on_set(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.lock();
            if !state.set {
                state.hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Block until set or until `timeout` elapses. Returns whether it is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.set {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            state = self
                .cond
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Resolve once the signal is set (immediately if it already is).
    pub async fn wait(&self) {
        let mut rx = self.watch.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|set| *set).await;
    }
}

/// The `startRequested` / `stopRequested` pair for one session.
#[derive(Debug, Default)]
pub struct SessionBarrier {
    start: StickySignal,
    stop: StickySignal,
}

impl SessionBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_start(&self) -> bool {
        self.start.set()
    }

    pub fn request_stop(&self) -> bool {
        self.stop.set()
    }

    pub fn start_requested(&self) -> bool {
        self.start.is_set()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_set()
    }

    pub fn start(&self) -> &StickySignal {
        &self.start
    }

    pub fn stop(&self) -> &StickySignal {
        &self.stop
    }
}
