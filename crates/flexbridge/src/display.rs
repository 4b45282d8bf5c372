//! Display surface protocol, served as newline-delimited JSON over TCP.
//!
//! Outbound messages are `{"type": ..., "payload": ...}` with `type` one
//! of `appState`, `screenChange`, `meterUpdate`, or `dataList`. Inbound
//! messages are `{"type": ..., "payload"?: ...}` where `type` is
//! `getState`, a screen id (`VFO`, `DSP`, `MEMORY`, `TX`, `POTA`), or an
//! action id. Screen ids and action ids become direct triggers for the
//! input router.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use flexbridge_core::{
    DeviceState, Error, MEMORY_SLOTS, Result, Screen, format_freq_mhz, s_units_from_dbm,
};

use crate::input::{DirectTrigger, InputRouter};
use crate::sync::{Push, PushReason, SubscriptionId, Synchronizer};

const OUTBOUND_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A message sent to the display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum DisplayMessage {
    AppState(AppState),
    ScreenChange(ScreenChange),
    MeterUpdate(Meters),
    DataList(DataList),
}

/// Full device state as the display sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub connected: bool,
    pub frequency_hz: u64,
    pub frequency_display: String,
    pub band: Option<String>,
    pub mode: String,
    pub tuning_step_index: usize,
    pub tuning_step_hz: u64,
    pub tx_active: bool,
    pub nb_enabled: bool,
    pub nr_enabled: bool,
    #[serde(flatten)]
    pub meters: Meters,
    pub memory_slots: Vec<Option<MemoryEntry>>,
    pub active_screen: Screen,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub frequency_hz: u64,
    pub frequency_display: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meters {
    pub s_meter_dbm: f32,
    pub s_units: String,
    pub power_meter_watts: f32,
    pub swr_ratio: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenChange {
    pub screen: Screen,
    pub state: AppState,
}

/// A named list for list-style screens.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataList {
    pub list: String,
    pub items: Vec<DataItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataItem {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&DeviceState> for Meters {
    fn from(state: &DeviceState) -> Self {
        Meters {
            s_meter_dbm: state.s_meter_dbm,
            s_units: s_units_from_dbm(state.s_meter_dbm),
            power_meter_watts: state.power_meter_watts,
            swr_ratio: state.swr_ratio,
        }
    }
}

impl From<&DeviceState> for AppState {
    fn from(state: &DeviceState) -> Self {
        AppState {
            connected: state.connected,
            frequency_hz: state.frequency_hz,
            frequency_display: format_freq_mhz(state.frequency_hz),
            band: state.band().map(|b| b.name().to_string()),
            mode: state.mode.as_str().to_string(),
            tuning_step_index: state.tuning_step.index(),
            tuning_step_hz: state.tuning_step.hz(),
            tx_active: state.tx_active,
            nb_enabled: state.nb_enabled,
            nr_enabled: state.nr_enabled,
            meters: Meters::from(state),
            memory_slots: state
                .memory_slots
                .iter()
                .map(|slot| {
                    slot.map(|s| MemoryEntry {
                        frequency_hz: s.frequency_hz,
                        frequency_display: format_freq_mhz(s.frequency_hz),
                        mode: s.mode.as_str().to_string(),
                    })
                })
                .collect(),
            active_screen: state.active_screen,
        }
    }
}

impl DisplayMessage {
    pub fn app_state(state: &DeviceState) -> Self {
        DisplayMessage::AppState(AppState::from(state))
    }

    /// The message for a synchronizer push.
    pub fn from_push(push: &Push) -> Self {
        match push.reason {
            PushReason::Screen => DisplayMessage::ScreenChange(ScreenChange {
                screen: push.state.active_screen,
                state: AppState::from(&push.state),
            }),
            PushReason::Meters => DisplayMessage::MeterUpdate(Meters::from(&push.state)),
            PushReason::Immediate | PushReason::Periodic | PushReason::Snapshot => {
                DisplayMessage::app_state(&push.state)
            }
        }
    }

    /// Memory slots as a list.
    pub fn memory_list(state: &DeviceState) -> Self {
        let items = (0..MEMORY_SLOTS)
            .map(|i| {
                let slot = state.memory_slots[i];
                DataItem {
                    id: i.to_string(),
                    label: match slot {
                        Some(s) => format_freq_mhz(s.frequency_hz),
                        None => "empty".to_string(),
                    },
                    detail: slot.map(|s| s.mode.as_str().to_string()),
                }
            })
            .collect();
        DisplayMessage::DataList(DataList {
            list: "memories".to_string(),
            items,
        })
    }

    /// Registered actions as a list.
    pub fn action_list(router: &InputRouter) -> Self {
        let items = router
            .actions()
            .into_iter()
            .map(|a| DataItem {
                id: a.id,
                label: a.display_name,
                detail: Some(a.category),
            })
            .collect();
        DisplayMessage::DataList(DataList {
            list: "actions".to_string(),
            items,
        })
    }

    /// Serialize as one protocol line, newline included.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| Error::Protocol(format!("failed to encode display message: {e}")))?;
        line.push('\n');
        Ok(line)
    }
}

/// A message received from the display.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DisplayRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl DisplayRequest {
    /// The payload as an action value.
    ///
    /// Strings, numbers, and booleans are used as-is; an object's `value`
    /// field is used when present.
    pub fn value(&self) -> Option<String> {
        self.payload.as_ref().and_then(value_text)
    }
}

fn value_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Object(map) => map.get("value").and_then(value_text),
        _ => None,
    }
}

/// What an inbound request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    GetState,
    Trigger(DirectTrigger),
}

impl From<DisplayRequest> for Inbound {
    fn from(request: DisplayRequest) -> Self {
        if request.kind == "getState" {
            return Inbound::GetState;
        }
        if let Some(screen) = Screen::all().iter().find(|s| s.as_str() == request.kind) {
            return Inbound::Trigger(DirectTrigger {
                action_id: "screen".to_string(),
                value: Some(screen.as_str().to_string()),
            });
        }
        let value = request.value();
        Inbound::Trigger(DirectTrigger {
            action_id: request.kind,
            value,
        })
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct Context {
    sync: Arc<Synchronizer>,
    router: Arc<InputRouter>,
    triggers: broadcast::Sender<DirectTrigger>,
    outbound: broadcast::Sender<Arc<str>>,
    clients: AtomicUsize,
}

/// Serves the display protocol to any number of clients.
///
/// Every client gets the same pushes. Closing the server unsubscribes it
/// from the synchronizer and disconnects all clients.
pub struct DisplayServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    subscription: SubscriptionId,
    ctx: Arc<Context>,
}

impl DisplayServer {
    /// Bind the listener and start serving.
    ///
    /// Screen and action requests are forwarded on `triggers`.
    pub async fn bind(
        addr: SocketAddr,
        sync: Arc<Synchronizer>,
        router: Arc<InputRouter>,
        triggers: broadcast::Sender<DirectTrigger>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            Error::Transport(format!("failed to bind display listener on {addr}: {e}"))
        })?;
        let local_addr = listener.local_addr()?;

        let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
        let ctx = Arc::new(Context {
            sync: Arc::clone(&sync),
            router,
            triggers,
            outbound: outbound.clone(),
            clients: AtomicUsize::new(0),
        });

        let subscription = sync.subscribe(move |push| {
            match DisplayMessage::from_push(push).to_line() {
                Ok(line) => {
                    // No receivers just means no display is connected.
                    let _ = outbound.send(Arc::from(line));
                }
                Err(e) => tracing::warn!(error = %e, "Dropping display push"),
            }
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&ctx), cancel.clone()));
        tracing::info!(addr = %local_addr, "Display server listening");

        Ok(DisplayServer {
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
            subscription,
            ctx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected display clients.
    pub fn client_count(&self) -> usize {
        self.ctx.clients.load(Ordering::SeqCst)
    }

    /// Disconnect all clients and release the listener. Safe to call
    /// repeatedly.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.ctx.sync.unsubscribe(self.subscription);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
            tracing::info!(addr = %self.local_addr, "Display server closed");
        }
    }
}

impl Drop for DisplayServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.ctx.sync.unsubscribe(self.subscription);
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<Context>, cancel: CancellationToken) {
    let mut clients = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::info!(peer = %peer, "Display client connected");
                    let ctx = Arc::clone(&ctx);
                    let cancel = cancel.clone();
                    clients.spawn(async move {
                        ctx.clients.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = handle_client(stream, &ctx, cancel).await {
                            tracing::debug!(peer = %peer, error = %e, "Display client error");
                        }
                        ctx.clients.fetch_sub(1, Ordering::SeqCst);
                        tracing::info!(peer = %peer, "Display client disconnected");
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Display accept failed");
                }
            },
            // Reap finished clients so the set does not grow.
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    }
    clients.shutdown().await;
}

async fn handle_client(stream: TcpStream, ctx: &Context, cancel: CancellationToken) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut outbound = ctx.outbound.subscribe();

    send(&mut writer, &DisplayMessage::app_state(&ctx.sync.snapshot())).await?;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                handle_line(trimmed, ctx, &mut writer).await?;
            }
            pushed = outbound.recv() => match pushed {
                Ok(line) => writer.write_all(line.as_bytes()).await?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Display client lagged, resending state");
                    send(&mut writer, &DisplayMessage::app_state(&ctx.sync.snapshot())).await?;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn handle_line(line: &str, ctx: &Context, writer: &mut OwnedWriteHalf) -> Result<()> {
    let request: DisplayRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, line = %line, "Ignoring malformed display message");
            return Ok(());
        }
    };

    match Inbound::from(request) {
        Inbound::GetState => {
            let state = ctx.sync.snapshot();
            send(writer, &DisplayMessage::app_state(&state)).await?;
            send(writer, &DisplayMessage::memory_list(&state)).await?;
            send(writer, &DisplayMessage::action_list(&ctx.router)).await?;
        }
        Inbound::Trigger(trigger) => {
            tracing::debug!(action = %trigger.action_id, "Display trigger");
            if ctx.triggers.send(trigger).is_err() {
                tracing::debug!("No input adapter attached, trigger dropped");
            }
        }
    }
    Ok(())
}

async fn send(writer: &mut OwnedWriteHalf, message: &DisplayMessage) -> Result<()> {
    writer.write_all(message.to_line()?.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::builtin_actions;
    use flexbridge_core::{Mode, StateUpdate};
    use flexbridge_flex::{ClientOptions, CommandChannel, MeterMap};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::io::Lines;
    use tokio::net::tcp::OwnedReadHalf;

    struct Fixture {
        sync: Arc<Synchronizer>,
        triggers: broadcast::Receiver<DirectTrigger>,
        server: DisplayServer,
    }

    async fn fixture() -> Fixture {
        let sync = Arc::new(Synchronizer::new());
        let channel = CommandChannel::new(
            Arc::clone(&sync) as Arc<dyn flexbridge_core::StateSink>,
            MeterMap::default().shared(),
            ClientOptions::default(),
        );
        let router = Arc::new(InputRouter::new(Arc::clone(&sync), channel, 0));
        router.register_actions(builtin_actions()).unwrap();
        let (trigger_tx, triggers) = broadcast::channel(16);
        let server = DisplayServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&sync),
            router,
            trigger_tx,
        )
        .await
        .unwrap();
        Fixture {
            sync,
            triggers,
            server,
        }
    }

    async fn connect(addr: SocketAddr) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        (BufReader::new(read).lines(), write)
    }

    async fn next_json(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("timed out waiting for display message")
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn app_state_shape() {
        let mut state = DeviceState::default();
        state.connected = true;
        state.frequency_hz = 7_074_000;
        state.mode = Mode::DIGU;
        let value = serde_json::to_value(DisplayMessage::app_state(&state)).unwrap();

        assert_eq!(value["type"], "appState");
        let payload = &value["payload"];
        assert_eq!(payload["connected"], true);
        assert_eq!(payload["frequencyHz"], 7_074_000);
        assert_eq!(payload["frequencyDisplay"], "7.074.000");
        assert_eq!(payload["band"], "40m");
        assert_eq!(payload["mode"], "DIGU");
        assert_eq!(payload["tuningStepIndex"], 2);
        assert_eq!(payload["tuningStepHz"], 100);
        assert_eq!(payload["activeScreen"], "VFO");
        assert_eq!(payload["swrRatio"], 1.0);
        assert_eq!(payload["memorySlots"].as_array().unwrap().len(), MEMORY_SLOTS);
    }

    #[test]
    fn push_reasons_map_to_message_types() {
        let state = DeviceState::default();
        let kind = |reason| {
            let msg = DisplayMessage::from_push(&Push {
                reason,
                state: state.clone(),
            });
            serde_json::to_value(msg).unwrap()["type"].clone()
        };
        assert_eq!(kind(PushReason::Immediate), "appState");
        assert_eq!(kind(PushReason::Periodic), "appState");
        assert_eq!(kind(PushReason::Snapshot), "appState");
        assert_eq!(kind(PushReason::Screen), "screenChange");
        assert_eq!(kind(PushReason::Meters), "meterUpdate");
    }

    #[test]
    fn inbound_classification() {
        let parse = |s: &str| Inbound::from(serde_json::from_str::<DisplayRequest>(s).unwrap());

        assert_eq!(parse(r#"{"type":"getState"}"#), Inbound::GetState);
        assert_eq!(
            parse(r#"{"type":"POTA"}"#),
            Inbound::Trigger(DirectTrigger {
                action_id: "screen".into(),
                value: Some("POTA".into()),
            })
        );
        assert_eq!(
            parse(r#"{"type":"tune_up"}"#),
            Inbound::Trigger(DirectTrigger::new("tune_up"))
        );
        assert_eq!(
            parse(r#"{"type":"memory_recall","payload":3}"#),
            Inbound::Trigger(DirectTrigger {
                action_id: "memory_recall".into(),
                value: Some("3".into()),
            })
        );
        assert_eq!(
            parse(r#"{"type":"set_mode","payload":{"value":"LSB"}}"#),
            Inbound::Trigger(DirectTrigger {
                action_id: "set_mode".into(),
                value: Some("LSB".into()),
            })
        );
    }

    #[tokio::test]
    async fn get_state_replies_with_state_and_lists() {
        let fx = fixture().await;
        let (mut lines, mut write) = connect(fx.server.local_addr()).await;

        assert_eq!(next_json(&mut lines).await["type"], "appState");

        write.write_all(b"{\"type\":\"getState\"}\n").await.unwrap();
        let state = next_json(&mut lines).await;
        assert_eq!(state["type"], "appState");
        assert_eq!(state["payload"]["connected"], false);

        let memories = next_json(&mut lines).await;
        assert_eq!(memories["type"], "dataList");
        assert_eq!(memories["payload"]["list"], "memories");
        assert_eq!(memories["payload"]["items"][0]["label"], "empty");

        let actions = next_json(&mut lines).await;
        assert_eq!(actions["payload"]["list"], "actions");
        assert_eq!(actions["payload"]["items"].as_array().unwrap().len(), 15);
    }

    #[tokio::test]
    async fn pushes_reach_every_client() {
        let fx = fixture().await;
        let (mut a, _wa) = connect(fx.server.local_addr()).await;
        let (mut b, _wb) = connect(fx.server.local_addr()).await;
        next_json(&mut a).await;
        next_json(&mut b).await;

        fx.sync.apply(StateUpdate::screen(Screen::Tx));
        for lines in [&mut a, &mut b] {
            let msg = next_json(lines).await;
            assert_eq!(msg["type"], "screenChange");
            assert_eq!(msg["payload"]["screen"], "TX");
        }

        fx.sync.apply(StateUpdate {
            s_meter_dbm: Some(-73.0),
            ..StateUpdate::default()
        });
        fx.sync.flush();
        let msg = next_json(&mut a).await;
        assert_eq!(msg, json!({
            "type": "meterUpdate",
            "payload": {
                "sMeterDbm": -73.0,
                "sUnits": s_units_from_dbm(-73.0),
                "powerMeterWatts": 0.0,
                "swrRatio": 1.0,
            }
        }));
    }

    #[tokio::test]
    async fn screen_and_action_requests_become_triggers() {
        let mut fx = fixture().await;
        let (mut lines, mut write) = connect(fx.server.local_addr()).await;
        next_json(&mut lines).await;

        write
            .write_all(b"not json\n{\"type\":\"DSP\"}\n{\"type\":\"toggle_nr\"}\n")
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), fx.triggers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.action_id, "screen");
        assert_eq!(first.value.as_deref(), Some("DSP"));
        let second = tokio::time::timeout(Duration::from_secs(2), fx.triggers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, DirectTrigger::new("toggle_nr"));
    }

    #[tokio::test]
    async fn close_disconnects_and_unsubscribes() {
        let fx = fixture().await;
        let (mut lines, _write) = connect(fx.server.local_addr()).await;
        next_json(&mut lines).await;
        assert_eq!(fx.sync.subscriber_count(), 1);

        fx.server.close().await;
        fx.server.close().await;
        assert_eq!(fx.sync.subscriber_count(), 0);

        let end = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap();
        assert!(matches!(end, Ok(None) | Err(_)));
        assert!(TcpStream::connect(fx.server.local_addr()).await.is_err());
    }
}
