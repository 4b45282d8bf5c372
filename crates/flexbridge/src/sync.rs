//! The state synchronizer: owner of the canonical [`DeviceState`].
//!
//! Every observable change goes through [`Synchronizer::apply`]. Changes to
//! the connection flag, mode, transmit, noise blanker/reduction, memory, or
//! the active screen are pushed to subscribers at once. Frequency, tuning
//! step, and meter changes only mark the state dirty; the periodic tick
//! (see [`Synchronizer::spawn_ticker`]) flushes them.
//!
//! The synchronizer implements [`StateSink`], so the command channel and
//! the telemetry stream feed it directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flexbridge_core::{DeviceState, StateSink, StateUpdate};

/// Why a push was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushReason {
    /// A discrete field changed.
    Immediate,
    /// The active screen changed.
    Screen,
    /// Periodic flush of frequency or tuning step changes.
    Periodic,
    /// Periodic flush where only meter values changed.
    Meters,
    /// Explicit full snapshot.
    Snapshot,
}

/// One state push delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    pub reason: PushReason,
    pub state: DeviceState,
}

/// Handle returned by [`Synchronizer::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&Push) + Send + Sync>;

#[derive(Default)]
struct Dirty {
    continuous: bool,
    meters: bool,
}

impl Dirty {
    fn take(&mut self) -> Option<PushReason> {
        let reason = if self.continuous {
            Some(PushReason::Periodic)
        } else if self.meters {
            Some(PushReason::Meters)
        } else {
            None
        };
        *self = Dirty::default();
        reason
    }
}

#[derive(Default)]
struct Guarded {
    state: DeviceState,
    dirty: Dirty,
}

/// Canonical device state plus push policy.
///
/// Pushes reach subscribers in the order their states were taken, so the
/// last push a subscriber sees always matches [`snapshot`](Self::snapshot).
/// Callbacks must not call back into the synchronizer.
#[derive(Default)]
pub struct Synchronizer {
    /// Held from taking a push's state until it is delivered.
    delivery: Mutex<()>,
    guarded: Mutex<Guarded>,
    subscribers: Mutex<Vec<(SubscriptionId, Callback)>>,
    next_id: AtomicU64,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a synchronizer seeded with `state`.
    pub fn with_state(state: DeviceState) -> Self {
        Synchronizer {
            guarded: Mutex::new(Guarded {
                state,
                dirty: Dirty::default(),
            }),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Guarded> {
        self.guarded.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Callback)>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a partial update and push if the change is discrete.
    ///
    /// Invalid fields are logged and dropped without touching state.
    pub fn apply(&self, update: StateUpdate) {
        if update.is_empty() {
            return;
        }

        let _delivery = self.lock_delivery();
        let push = {
            let mut guarded = self.lock();
            let changes = guarded.state.apply(&update);

            for rejection in &changes.rejected {
                tracing::warn!(
                    field = rejection.field,
                    reason = %rejection.reason,
                    "Rejected state update"
                );
            }

            if changes.is_immediate() {
                // The push carries every pending continuous value too.
                guarded.dirty = Dirty::default();
                let reason = if changes.screen && !changes.connection && !changes.discrete {
                    PushReason::Screen
                } else {
                    PushReason::Immediate
                };
                Some(Push {
                    reason,
                    state: guarded.state.clone(),
                })
            } else {
                guarded.dirty.continuous |= changes.continuous;
                guarded.dirty.meters |= changes.meters;
                None
            }
        };

        if let Some(push) = push {
            self.deliver(&push);
        }
    }

    /// A copy of the current state.
    pub fn snapshot(&self) -> DeviceState {
        self.lock().state.clone()
    }

    /// Whether a periodic flush is pending.
    pub fn is_dirty(&self) -> bool {
        let guarded = self.lock();
        guarded.dirty.continuous || guarded.dirty.meters
    }

    /// Register a callback for every push.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Push) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock_subscribers().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock_subscribers();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Number of registered callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    /// Push pending frequency/step/meter changes, if any.
    ///
    /// Returns whether anything was pushed.
    pub fn flush(&self) -> bool {
        let _delivery = self.lock_delivery();
        let push = {
            let mut guarded = self.lock();
            guarded.dirty.take().map(|reason| Push {
                reason,
                state: guarded.state.clone(),
            })
        };
        match push {
            Some(push) => {
                self.deliver(&push);
                true
            }
            None => false,
        }
    }

    /// Push the full state regardless of dirtiness.
    pub fn push_snapshot(&self) {
        let _delivery = self.lock_delivery();
        let push = {
            let mut guarded = self.lock();
            guarded.dirty = Dirty::default();
            Push {
                reason: PushReason::Snapshot,
                state: guarded.state.clone(),
            }
        };
        self.deliver(&push);
    }

    /// Start the periodic flush. The task ends when `cancel` fires.
    pub fn spawn_ticker(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            tracing::debug!(interval_ms = interval.as_millis() as u64, "Push timer started");

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        sync.flush();
                    }
                }
            }
            tracing::debug!("Push timer stopped");
        })
    }

    fn deliver(&self, push: &Push) {
        // Clone the list so callbacks may subscribe or unsubscribe.
        let callbacks: Vec<Callback> = self
            .lock_subscribers()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        tracing::trace!(
            reason = ?push.reason,
            subscribers = callbacks.len(),
            "Pushing state"
        );
        for callback in callbacks {
            callback(push);
        }
    }
}

impl StateSink for Synchronizer {
    fn apply(&self, update: StateUpdate) {
        Synchronizer::apply(self, update);
    }
}
