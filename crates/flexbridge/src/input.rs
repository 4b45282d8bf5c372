//! Input routing: two ingress adapters, one dispatch function.
//!
//! Direct triggers are bare action ids sent by the display surface.
//! Mapped action events are `{id, value}` envelopes from the external key
//! mapping subsystem. Both end in [`InputRouter::dispatch`], which turns
//! an action into command channel traffic and/or a local state update.
//!
//! Each adapter is registered at most once per router. The bridge calls
//! the registration functions on every start; only the first call spawns
//! a forwarding task, so restarting never multiplies delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, broadcast};

use flexbridge_core::{
    DEVICE_COVERAGE, Error, KeyMode, MEMORY_SLOTS, MemorySlot, Mode, Result, Screen, StateUpdate,
};
use flexbridge_flex::mode::mode_to_flex;
use flexbridge_flex::{Command, CommandChannel};

use crate::sync::Synchronizer;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// An action the bridge can perform, as advertised to the mapping
/// subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub category: String,
    /// Allowed values, when the action takes one from a closed set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_options: Option<Vec<String>>,
    /// Value used when an event carries none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl ActionDescriptor {
    fn new(id: &str, display_name: &str, description: &str, category: &str) -> Self {
        ActionDescriptor {
            id: id.to_string(),
            display_name: display_name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            value_options: None,
            default_value: None,
        }
    }

    fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.value_options = Some(options.into_iter().map(Into::into).collect());
        self
    }

    fn with_default(mut self, value: &str) -> Self {
        self.default_value = Some(value.to_string());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(invalid(&self.id, "id", "must not be empty"));
        }
        if let (Some(options), Some(default)) = (&self.value_options, &self.default_value) {
            if !options.iter().any(|o| o == default) {
                return Err(invalid(
                    &self.id,
                    "default_value",
                    format!("'{default}' is not one of the value options"),
                ));
            }
        }
        Ok(())
    }

    /// Whether `value` is acceptable for this action.
    fn accepts(&self, value: &str) -> bool {
        match &self.value_options {
            Some(options) => options.iter().any(|o| o.eq_ignore_ascii_case(value)),
            None => true,
        }
    }
}

/// A physical key or control as described in the configuration.
///
/// `mode` is kept as the raw string; [`KeyDescriptor::validate`] checks it
/// against the fixed [`KeyMode`] vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// A key descriptor that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredKey {
    pub id: String,
    pub description: String,
    pub mode: Option<KeyMode>,
}

impl KeyDescriptor {
    /// Check the id and mode.
    pub fn validate(&self) -> Result<RegisteredKey> {
        if self.id.trim().is_empty() {
            return Err(invalid(&self.id, "id", "must not be empty"));
        }
        let mode = match &self.mode {
            None => None,
            Some(raw) => Some(raw.parse::<KeyMode>().map_err(|_| {
                let allowed: Vec<&str> = KeyMode::all().iter().map(KeyMode::as_str).collect();
                invalid(
                    &self.id,
                    "mode",
                    format!("'{raw}' is not one of: {}", allowed.join(", ")),
                )
            })?),
        };
        Ok(RegisteredKey {
            id: self.id.clone(),
            description: self.description.clone(),
            mode,
        })
    }
}

fn invalid(descriptor: &str, field: &'static str, reason: impl Into<String>) -> Error {
    Error::InvalidRegistration {
        descriptor: descriptor.to_string(),
        field,
        reason: reason.into(),
    }
}

/// The actions the bridge implements.
pub fn builtin_actions() -> Vec<ActionDescriptor> {
    let modes = Mode::all().iter().map(|m| m.as_str());
    let screens = Screen::all().iter().map(|s| s.as_str());
    let slots = (0..MEMORY_SLOTS).map(|i| i.to_string());

    vec![
        ActionDescriptor::new("tune_up", "Tune Up", "Raise frequency by the tuning step", "Tuning")
            .with_default("1"),
        ActionDescriptor::new("tune_down", "Tune Down", "Lower frequency by the tuning step", "Tuning")
            .with_default("1"),
        ActionDescriptor::new("step_up", "Step Up", "Next larger tuning step", "Tuning"),
        ActionDescriptor::new("step_down", "Step Down", "Next smaller tuning step", "Tuning"),
        ActionDescriptor::new("mode_next", "Next Mode", "Cycle to the next mode", "Mode"),
        ActionDescriptor::new("mode_prev", "Previous Mode", "Cycle to the previous mode", "Mode"),
        ActionDescriptor::new("set_mode", "Set Mode", "Select a mode", "Mode").with_options(modes),
        ActionDescriptor::new("toggle_nb", "Noise Blanker", "Toggle the noise blanker", "DSP"),
        ActionDescriptor::new("toggle_nr", "Noise Reduction", "Toggle noise reduction", "DSP"),
        ActionDescriptor::new("ptt_on", "PTT On", "Start transmitting", "Transmit"),
        ActionDescriptor::new("ptt_off", "PTT Off", "Stop transmitting", "Transmit"),
        ActionDescriptor::new("ptt_toggle", "PTT Toggle", "Toggle transmit", "Transmit"),
        ActionDescriptor::new(
            "memory_store",
            "Store Memory",
            "Store frequency and mode in a slot",
            "Memory",
        )
        .with_options(slots.clone()),
        ActionDescriptor::new(
            "memory_recall",
            "Recall Memory",
            "Tune to a stored slot",
            "Memory",
        )
        .with_options(slots),
        ActionDescriptor::new("screen", "Screen", "Switch the display screen", "Display")
            .with_options(screens)
            .with_default(Screen::Vfo.as_str()),
    ]
}

// ---------------------------------------------------------------------------
// Ingress events
// ---------------------------------------------------------------------------

/// A bare action id from the display surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectTrigger {
    pub action_id: String,
    pub value: Option<String>,
}

impl DirectTrigger {
    pub fn new(action_id: impl Into<String>) -> Self {
        DirectTrigger {
            action_id: action_id.into(),
            value: None,
        }
    }
}

/// An action envelope from the key mapping subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedActionEvent {
    pub id: String,
    #[serde(default)]
    pub value: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Routes user input to the radio and the synchronizer.
pub struct InputRouter {
    sync: Arc<Synchronizer>,
    channel: CommandChannel,
    slice_index: u8,
    actions: Mutex<HashMap<String, ActionDescriptor>>,
    keys: Mutex<HashMap<String, RegisteredKey>>,
    direct_registered: AtomicBool,
    mapped_registered: AtomicBool,
    dispatched: AtomicU64,
    /// One action at a time: each reads state, writes to the radio, and
    /// applies the result before the next one reads.
    dispatching: AsyncMutex<()>,
}

impl InputRouter {
    pub fn new(sync: Arc<Synchronizer>, channel: CommandChannel, slice_index: u8) -> Self {
        InputRouter {
            sync,
            channel,
            slice_index,
            actions: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
            direct_registered: AtomicBool::new(false),
            mapped_registered: AtomicBool::new(false),
            dispatched: AtomicU64::new(0),
            dispatching: AsyncMutex::new(()),
        }
    }

    fn lock_actions(&self) -> MutexGuard<'_, HashMap<String, ActionDescriptor>> {
        self.actions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_keys(&self) -> MutexGuard<'_, HashMap<String, RegisteredKey>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register action descriptors. Re-registering an id replaces it.
    ///
    /// Nothing is registered if any descriptor is invalid.
    pub fn register_actions<I>(&self, actions: I) -> Result<()>
    where
        I: IntoIterator<Item = ActionDescriptor>,
    {
        let actions: Vec<ActionDescriptor> = actions.into_iter().collect();
        for action in &actions {
            if let Err(e) = action.validate() {
                tracing::error!(action = %action.id, error = %e, "Action registration failed");
                return Err(e);
            }
        }
        let count = actions.len();
        let mut registered = self.lock_actions();
        for action in actions {
            registered.insert(action.id.clone(), action);
        }
        tracing::debug!(count = count, total = registered.len(), "Registered actions");
        Ok(())
    }

    /// Validate and register key descriptors. Re-registering an id
    /// replaces it.
    ///
    /// Nothing is registered if any descriptor is invalid.
    pub fn register_keys(&self, keys: &[KeyDescriptor]) -> Result<()> {
        let mut validated = Vec::with_capacity(keys.len());
        for key in keys {
            match key.validate() {
                Ok(key) => validated.push(key),
                Err(e) => {
                    tracing::error!(key = %key.id, error = %e, "Key registration failed");
                    return Err(e);
                }
            }
        }
        let mut registered = self.lock_keys();
        for key in validated {
            registered.insert(key.id.clone(), key);
        }
        tracing::debug!(count = keys.len(), total = registered.len(), "Registered keys");
        Ok(())
    }

    /// Registered actions, sorted by id.
    pub fn actions(&self) -> Vec<ActionDescriptor> {
        let mut actions: Vec<_> = self.lock_actions().values().cloned().collect();
        actions.sort_by(|a, b| a.id.cmp(&b.id));
        actions
    }

    /// Look up one registered action.
    pub fn action(&self, id: &str) -> Option<ActionDescriptor> {
        self.lock_actions().get(id).cloned()
    }

    /// Registered keys, sorted by id.
    pub fn keys(&self) -> Vec<RegisteredKey> {
        let mut keys: Vec<_> = self.lock_keys().values().cloned().collect();
        keys.sort_by(|a, b| a.id.cmp(&b.id));
        keys
    }

    /// Number of dispatch calls made so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Attach the direct trigger adapter.
    ///
    /// Returns `false`, and does nothing, if it was already attached.
    pub fn register_direct_adapter(
        self: &Arc<Self>,
        mut source: broadcast::Receiver<DirectTrigger>,
    ) -> bool {
        if self
            .direct_registered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Direct trigger adapter already registered");
            return false;
        }

        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(trigger) => {
                        router
                            .dispatch_logged("direct", &trigger.action_id, trigger.value.as_deref())
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Direct trigger adapter lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Direct trigger adapter stopped");
        });
        tracing::debug!("Direct trigger adapter registered");
        true
    }

    /// Attach the mapped action adapter.
    ///
    /// Returns `false`, and does nothing, if it was already attached.
    pub fn register_mapped_adapter(
        self: &Arc<Self>,
        mut source: broadcast::Receiver<MappedActionEvent>,
    ) -> bool {
        if self
            .mapped_registered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Mapped action adapter already registered");
            return false;
        }

        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        router
                            .dispatch_logged("mapped", &event.id, event.value.as_deref())
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Mapped action adapter lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Mapped action adapter stopped");
        });
        tracing::debug!("Mapped action adapter registered");
        true
    }

    async fn dispatch_logged(&self, source: &'static str, action_id: &str, value: Option<&str>) {
        if let Err(e) = self.dispatch(action_id, value).await {
            tracing::warn!(
                source = source,
                action = %action_id,
                error = %e,
                "Action failed"
            );
        }
    }

    /// Perform one action.
    ///
    /// The action must be registered. A missing value falls back to the
    /// descriptor's default.
    pub async fn dispatch(&self, action_id: &str, value: Option<&str>) -> Result<()> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);

        let descriptor = self
            .action(action_id)
            .ok_or_else(|| Error::InvalidParameter(format!("unknown action: {action_id}")))?;
        let value = value.map(str::to_string).or(descriptor.default_value.clone());
        if let Some(v) = &value {
            if !descriptor.accepts(v) {
                return Err(Error::InvalidParameter(format!(
                    "'{v}' is not a valid value for {action_id}"
                )));
            }
        }
        let value = value.as_deref();

        let _dispatching = self.dispatching.lock().await;
        tracing::debug!(action = %action_id, value = ?value, "Dispatching action");

        let state = self.sync.snapshot();
        match action_id {
            "tune_up" | "tune_down" => {
                let count = match value {
                    Some(v) => v.parse::<u64>().map_err(|_| {
                        Error::InvalidParameter(format!("invalid step count: {v}"))
                    })?,
                    None => 1,
                };
                let delta = state.tuning_step.hz().saturating_mul(count);
                let target = if action_id == "tune_up" {
                    state.frequency_hz.saturating_add(delta)
                } else {
                    state.frequency_hz.saturating_sub(delta)
                };
                self.tune(target).await
            }
            "step_up" | "step_down" => {
                let step = if action_id == "step_up" {
                    state.tuning_step.up()
                } else {
                    state.tuning_step.down()
                };
                self.sync.apply(StateUpdate::tuning_step(step));
                if self.channel.is_connected() {
                    self.send(Command::slice_set_step(self.slice_index, step.hz()))
                        .await?;
                }
                Ok(())
            }
            "mode_next" => self.set_mode(state.mode.next()).await,
            "mode_prev" => self.set_mode(state.mode.prev()).await,
            "set_mode" => {
                let raw = required(action_id, value)?;
                let mode: Mode = raw
                    .parse()
                    .map_err(|_| Error::InvalidParameter(format!("unknown mode: {raw}")))?;
                self.set_mode(mode).await
            }
            "toggle_nb" => {
                let on = !state.nb_enabled;
                self.send(Command::slice_set_nb(self.slice_index, on)).await?;
                self.sync.apply(StateUpdate {
                    nb_enabled: Some(on),
                    ..StateUpdate::default()
                });
                Ok(())
            }
            "toggle_nr" => {
                let on = !state.nr_enabled;
                self.send(Command::slice_set_nr(self.slice_index, on)).await?;
                self.sync.apply(StateUpdate {
                    nr_enabled: Some(on),
                    ..StateUpdate::default()
                });
                Ok(())
            }
            // Transmit state is only taken from the radio's interlock status.
            "ptt_on" => self.send(Command::xmit(true)).await,
            "ptt_off" => self.send(Command::xmit(false)).await,
            "ptt_toggle" => self.send(Command::xmit(!state.tx_active)).await,
            "memory_store" => {
                let slot = slot_index(required(action_id, value)?)?;
                self.sync.apply(StateUpdate {
                    memory_slot: Some((
                        slot,
                        Some(MemorySlot {
                            frequency_hz: state.frequency_hz,
                            mode: state.mode,
                        }),
                    )),
                    ..StateUpdate::default()
                });
                tracing::info!(slot = slot, freq_hz = state.frequency_hz, "Stored memory");
                Ok(())
            }
            "memory_recall" => {
                let slot = slot_index(required(action_id, value)?)?;
                let stored = state.memory_slots[slot]
                    .ok_or_else(|| Error::InvalidParameter(format!("memory slot {slot} is empty")))?;
                self.tune(stored.frequency_hz).await?;
                self.set_mode(stored.mode).await
            }
            "screen" => {
                let raw = required(action_id, value)?;
                let screen: Screen = raw.parse().map_err(Error::InvalidParameter)?;
                self.sync.apply(StateUpdate::screen(screen));
                Ok(())
            }
            other => Err(Error::InvalidParameter(format!(
                "action {other} has no handler"
            ))),
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.channel.send_command(&command).await.map(|_| ())
    }

    async fn tune(&self, freq_hz: u64) -> Result<()> {
        if !DEVICE_COVERAGE.contains(freq_hz) {
            return Err(Error::InvalidParameter(format!(
                "{freq_hz} Hz is outside {DEVICE_COVERAGE}"
            )));
        }
        self.send(Command::slice_tune(self.slice_index, freq_hz)).await?;
        self.sync.apply(StateUpdate::frequency(freq_hz));
        Ok(())
    }

    async fn set_mode(&self, mode: Mode) -> Result<()> {
        self.send(Command::slice_set_mode(self.slice_index, mode_to_flex(mode)))
            .await?;
        self.sync.apply(StateUpdate::mode(mode));
        Ok(())
    }
}

fn required<'a>(action_id: &str, value: Option<&'a str>) -> Result<&'a str> {
    value.ok_or_else(|| Error::InvalidParameter(format!("{action_id} needs a value")))
}

fn slot_index(raw: &str) -> Result<usize> {
    raw.parse::<usize>()
        .ok()
        .filter(|slot| *slot < MEMORY_SLOTS)
        .ok_or_else(|| Error::InvalidParameter(format!("invalid memory slot: {raw}")))
}
