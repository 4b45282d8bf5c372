//! Bridge lifecycle.
//!
//! A [`Bridge`] owns the synchronizer, the command channel, the input
//! router, and the display server, and moves through
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//!
//! Starting registers descriptors, attaches the input adapters, serves the
//! display, resolves the radio address (discovering it when no host is
//! configured), connects, binds telemetry, starts the push timer, and
//! pushes a full snapshot. Stopping releases the radio-facing resources
//! only; the display stays up and shows `connected: false` until
//! [`Bridge::shutdown`].
//!
//! ```no_run
//! use flexbridge::{Bridge, BridgeConfig};
//!
//! # async fn example() -> flexbridge_core::Result<()> {
//! let mut config = BridgeConfig::default();
//! config.radio.host = Some("192.168.1.40".into());
//! let bridge = Bridge::new(config);
//! bridge.start().await?;
//! // ...
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flexbridge_core::{Error, Result, StateSink};
use flexbridge_flex::discovery::{self, Discovery};
use flexbridge_flex::{
    Command, CommandChannel, MeterMap, SharedMeterMap, TelemetryStats, TelemetryStream,
};

use crate::config::BridgeConfig;
use crate::display::DisplayServer;
use crate::input::{DirectTrigger, InputRouter, MappedActionEvent, builtin_actions};
use crate::sync::Synchronizer;

const INGRESS_CAPACITY: usize = 64;

/// Lifecycle state of a [`Bridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Resources acquired by one start.
#[derive(Default)]
struct Session {
    radio_addr: Option<SocketAddr>,
    telemetry: Option<TelemetryStream>,
    ticker: Option<(CancellationToken, JoinHandle<()>)>,
}

/// The device control bridge.
pub struct Bridge {
    config: BridgeConfig,
    sync: Arc<Synchronizer>,
    meters: SharedMeterMap,
    channel: CommandChannel,
    router: Arc<InputRouter>,
    direct_tx: broadcast::Sender<DirectTrigger>,
    mapped_tx: broadcast::Sender<MappedActionEvent>,
    state: StdMutex<BridgeState>,
    /// Held for the whole of a start or stop so they never interleave.
    session: Mutex<Session>,
    display: Mutex<Option<DisplayServer>>,
}

impl Bridge {
    /// Build a stopped bridge. No I/O happens until [`start`](Self::start).
    pub fn new(config: BridgeConfig) -> Self {
        let sync = Arc::new(Synchronizer::new());
        let meters = MeterMap::default().shared();
        let channel = CommandChannel::new(
            Arc::clone(&sync) as Arc<dyn StateSink>,
            Arc::clone(&meters),
            config.radio.client_options(),
        );
        let router = Arc::new(InputRouter::new(
            Arc::clone(&sync),
            channel.clone(),
            config.radio.slice_index,
        ));
        let (direct_tx, _) = broadcast::channel(INGRESS_CAPACITY);
        let (mapped_tx, _) = broadcast::channel(INGRESS_CAPACITY);

        Bridge {
            config,
            sync,
            meters,
            channel,
            router,
            direct_tx,
            mapped_tx,
            state: StdMutex::new(BridgeState::Stopped),
            session: Mutex::new(Session::default()),
            display: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: BridgeState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(from = ?*state, to = ?next, "Bridge state");
        *state = next;
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    pub fn router(&self) -> &Arc<InputRouter> {
        &self.router
    }

    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    /// Meter id to role map shared by the command channel and telemetry.
    pub fn meters(&self) -> &SharedMeterMap {
        &self.meters
    }

    /// Sender for the key mapping subsystem's action events.
    pub fn mapped_events(&self) -> broadcast::Sender<MappedActionEvent> {
        self.mapped_tx.clone()
    }

    /// Sender for direct triggers; the display server uses the same one.
    pub fn direct_triggers(&self) -> broadcast::Sender<DirectTrigger> {
        self.direct_tx.clone()
    }

    /// Address of the display listener, once bound.
    pub async fn display_addr(&self) -> Option<SocketAddr> {
        self.display.lock().await.as_ref().map(DisplayServer::local_addr)
    }

    /// Address of the telemetry socket while running.
    pub async fn telemetry_addr(&self) -> Option<SocketAddr> {
        self.session
            .lock()
            .await
            .telemetry
            .as_ref()
            .map(TelemetryStream::local_addr)
    }

    /// Telemetry counters while running.
    pub async fn telemetry_stats(&self) -> Option<TelemetryStats> {
        self.session
            .lock()
            .await
            .telemetry
            .as_ref()
            .map(TelemetryStream::stats)
    }

    /// The radio address in use while running.
    pub async fn radio_addr(&self) -> Option<SocketAddr> {
        self.session.lock().await.radio_addr
    }

    /// Start the bridge. Starting a running bridge is a no-op.
    ///
    /// On failure everything acquired so far is released and the bridge is
    /// left `Stopped`.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if self.state() == BridgeState::Running {
            tracing::debug!("Bridge already running");
            return Ok(());
        }

        self.set_state(BridgeState::Starting);
        match self.start_session(&mut session).await {
            Ok(()) => {
                self.set_state(BridgeState::Running);
                tracing::info!(
                    radio = ?session.radio_addr,
                    "Bridge running"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Bridge start failed");
                self.release(&mut session).await;
                self.set_state(BridgeState::Stopped);
                self.sync.push_snapshot();
                Err(e)
            }
        }
    }

    async fn start_session(&self, session: &mut Session) -> Result<()> {
        self.router.register_actions(builtin_actions())?;
        self.router.register_keys(&self.config.keys)?;
        self.router.register_direct_adapter(self.direct_tx.subscribe());
        self.router.register_mapped_adapter(self.mapped_tx.subscribe());

        self.ensure_display().await?;

        let addr = self.resolve_radio().await?;
        // Meter ids are assigned per radio session.
        *self.meters.lock().await = MeterMap::default();
        self.channel.connect(addr).await?;
        session.radio_addr = Some(addr);

        let telemetry = TelemetryStream::bind(
            self.config.telemetry.bind_addr()?,
            self.config.telemetry.throttle_interval(),
            Arc::clone(&self.meters),
            Arc::clone(&self.sync) as Arc<dyn StateSink>,
        )
        .await?;
        let udp_port = telemetry.local_addr().port();
        session.telemetry = Some(telemetry);
        self.channel
            .send_command(&Command::client_udpport(udp_port))
            .await?;

        let cancel = CancellationToken::new();
        let ticker = self
            .sync
            .spawn_ticker(self.config.display.push_interval(), cancel.clone());
        session.ticker = Some((cancel, ticker));

        self.sync.push_snapshot();
        Ok(())
    }

    /// Stop the bridge. Stopping a stopped bridge is a no-op.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if self.state() == BridgeState::Stopped {
            tracing::debug!("Bridge already stopped");
            return;
        }
        self.set_state(BridgeState::Stopping);
        self.release(&mut session).await;
        self.set_state(BridgeState::Stopped);
        tracing::info!("Bridge stopped");
    }

    /// Stop, then start again.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    /// Stop and close the display server.
    pub async fn shutdown(&self) {
        self.stop().await;
        if let Some(display) = self.display.lock().await.take() {
            display.close().await;
        }
    }

    /// Release whatever the session holds. Each step tolerates a resource
    /// that was never acquired.
    async fn release(&self, session: &mut Session) {
        self.channel.close().await;
        if let Some(telemetry) = session.telemetry.take() {
            telemetry.close().await;
        }
        if let Some((cancel, ticker)) = session.ticker.take() {
            cancel.cancel();
            let _ = ticker.await;
        }
        session.radio_addr = None;
    }

    async fn ensure_display(&self) -> Result<()> {
        if !self.config.display.enabled {
            return Ok(());
        }
        let mut display = self.display.lock().await;
        if display.is_none() {
            let server = DisplayServer::bind(
                self.config.display.listen_addr()?,
                Arc::clone(&self.sync),
                Arc::clone(&self.router),
                self.direct_tx.clone(),
            )
            .await?;
            *display = Some(server);
        }
        Ok(())
    }

    async fn resolve_radio(&self) -> Result<SocketAddr> {
        let radio = &self.config.radio;
        if let Some(host) = &radio.host {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(SocketAddr::new(ip, radio.command_port));
            }
            return tokio::net::lookup_host((host.as_str(), radio.command_port))
                .await
                .map_err(|e| Error::Transport(format!("failed to resolve {host}: {e}")))?
                .next()
                .ok_or_else(|| Error::Transport(format!("no address for {host}")));
        }

        let cfg = &self.config.discovery;
        match discovery::discover_on_port(cfg.port, cfg.timeout(), &cfg.marker()).await? {
            Discovery::Found(found) => Ok(found.command_addr()),
            Discovery::NotFound => Err(Error::Transport(format!(
                "no radio announced itself within {} ms",
                cfg.timeout_ms
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_when_stopped_is_noop() {
        let bridge = Bridge::new(BridgeConfig::default());
        bridge.stop().await;
        assert_eq!(bridge.state(), BridgeState::Stopped);
        assert_eq!(bridge.display_addr().await, None);
    }

    #[tokio::test]
    async fn invalid_keys_fail_start_before_any_io() {
        let mut config = BridgeConfig::default();
        config.display.listen = "127.0.0.1:0".into();
        config.radio.host = Some("127.0.0.1".into());
        config.keys = vec![crate::input::KeyDescriptor {
            id: "f1".into(),
            description: String::new(),
            mode: Some("default".into()),
        }];
        let bridge = Bridge::new(config);

        assert!(matches!(
            bridge.start().await,
            Err(Error::InvalidRegistration { field: "mode", .. })
        ));
        assert_eq!(bridge.state(), BridgeState::Stopped);
        assert_eq!(bridge.display_addr().await, None);
    }

    #[tokio::test]
    async fn bad_display_address_fails_start() {
        let mut config = BridgeConfig::default();
        config.display.listen = "nowhere".into();
        let bridge = Bridge::new(config);
        assert!(matches!(bridge.start().await, Err(Error::Config(_))));
        assert_eq!(bridge.state(), BridgeState::Stopped);
    }
}
