//! Bridge start/stop/restart against a mock radio.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flexbridge::{
    Bridge, BridgeConfig, BridgeState, DirectTrigger, Error, MappedActionEvent, PushReason,
};
use flexbridge_flex::MeterRole;
use flexbridge_test_harness::MockRadio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};

/// Commands sent on every connect: program name, four subscriptions,
/// and the telemetry port.
const CONNECT_COMMANDS: usize = 6;

fn config_for(radio_addr: SocketAddr) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.radio.host = Some(radio_addr.ip().to_string());
    config.radio.command_port = radio_addr.port();
    config.telemetry.bind_address = "127.0.0.1".into();
    config.telemetry.port = 0;
    config.telemetry.throttle_ms = 300;
    config.display.listen = "127.0.0.1:0".into();
    config.display.push_interval_ms = 100;
    config
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn start_connects_and_configures_radio() {
    let radio = MockRadio::start().await.unwrap();
    let bridge = Bridge::new(config_for(radio.addr()));

    bridge.start().await.unwrap();
    assert_eq!(bridge.state(), BridgeState::Running);
    assert!(bridge.channel().is_connected());
    assert!(bridge.synchronizer().snapshot().connected);
    assert_eq!(bridge.radio_addr().await, Some(radio.addr()));

    let telemetry = bridge.telemetry_addr().await.unwrap();
    let lines = radio
        .wait_for_lines(CONNECT_COMMANDS, Duration::from_secs(2))
        .await;
    assert_eq!(
        lines,
        vec![
            "C1|client program flexbridge".to_string(),
            "C2|sub slice all".to_string(),
            "C3|sub tx all".to_string(),
            "C4|sub interlock".to_string(),
            "C5|sub meter list".to_string(),
            format!("C6|client udpport {}", telemetry.port()),
        ]
    );

    // Starting again is a no-op.
    bridge.start().await.unwrap();
    assert_eq!(radio.connections(), 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn restart_cycles_do_not_multiply_delivery() {
    let radio = MockRadio::start().await.unwrap();
    let bridge = Bridge::new(config_for(radio.addr()));

    for cycle in 0..3 {
        bridge.start().await.unwrap();
        if cycle < 2 {
            bridge.stop().await;
            assert_eq!(bridge.state(), BridgeState::Stopped);
        }
    }
    assert!(radio.wait_for_connections(3, Duration::from_secs(2)).await);
    radio
        .wait_for_lines(3 * CONNECT_COMMANDS, Duration::from_secs(2))
        .await;
    radio.clear().await;

    bridge
        .mapped_events()
        .send(MappedActionEvent {
            id: "ptt_on".into(),
            value: None,
        })
        .unwrap();
    bridge
        .direct_triggers()
        .send(DirectTrigger::new("ptt_off"))
        .unwrap();

    radio.wait_for_lines(2, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let lines = radio.received().await;
    assert_eq!(lines.len(), 2, "unexpected traffic: {lines:?}");
    assert!(lines[0].ends_with("|xmit 1") || lines[1].ends_with("|xmit 1"));
    assert!(lines[0].ends_with("|xmit 0") || lines[1].ends_with("|xmit 0"));
    assert_eq!(bridge.router().dispatch_count(), 2);

    bridge.shutdown().await;
}

#[tokio::test]
async fn restart_forgets_meter_ids_from_the_previous_session() {
    let radio = MockRadio::start().await.unwrap();
    let bridge = Bridge::new(config_for(radio.addr()));
    bridge.start().await.unwrap();

    radio.push_line("S12345678|meter 12.nam=SWR#12.src=TX-#");
    let mut mapped = false;
    for _ in 0..200 {
        if bridge.meters().lock().await.role_for_id(12) == Some(MeterRole::Swr) {
            mapped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(mapped);
    assert_eq!(bridge.meters().lock().await.role_for_id(3), None);

    bridge.restart().await.unwrap();
    let meters = bridge.meters().lock().await;
    assert_eq!(meters.role_for_id(12), None);
    assert_eq!(meters.role_for_id(3), Some(MeterRole::Swr));
    drop(meters);

    bridge.shutdown().await;
}

#[tokio::test]
async fn stop_releases_radio_resources_and_keeps_display() {
    let radio = MockRadio::start().await.unwrap();
    let bridge = Bridge::new(config_for(radio.addr()));
    bridge.start().await.unwrap();

    let telemetry = bridge.telemetry_addr().await.unwrap();
    bridge.stop().await;
    bridge.stop().await;

    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert!(!bridge.channel().is_connected());
    assert!(!bridge.synchronizer().snapshot().connected);
    assert_eq!(bridge.telemetry_addr().await, None);
    assert!(UdpSocket::bind(telemetry).await.is_ok());

    let display = bridge.display_addr().await.unwrap();
    let stream = TcpStream::connect(display).await.unwrap();
    let mut lines = BufReader::new(stream).lines();
    let first: serde_json::Value =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(first["type"], "appState");
    assert_eq!(first["payload"]["connected"], false);

    bridge.shutdown().await;
    assert_eq!(bridge.display_addr().await, None);
    assert!(TcpStream::connect(display).await.is_err());
}

#[tokio::test]
async fn connect_failure_leaves_bridge_stopped() {
    let addr: SocketAddr = format!("127.0.0.1:{}", closed_port()).parse().unwrap();
    let bridge = Bridge::new(config_for(addr));

    let err = bridge.start().await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err:?}");
    assert_eq!(bridge.state(), BridgeState::Stopped);
    assert_eq!(bridge.telemetry_addr().await, None);
    assert_eq!(bridge.radio_addr().await, None);

    // The display stays reachable and reports the radio as disconnected.
    let display = bridge.display_addr().await.unwrap();
    let stream = TcpStream::connect(display).await.unwrap();
    let mut lines = BufReader::new(stream).lines();
    let first: serde_json::Value =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(first["payload"]["connected"], false);

    bridge.shutdown().await;
}

#[tokio::test]
async fn discovery_not_found_fails_start() {
    let mut config = config_for("127.0.0.1:1".parse().unwrap());
    config.radio.host = None;
    config.discovery.port = free_udp_port();
    config.discovery.timeout_ms = 100;
    let bridge = Bridge::new(config);

    assert!(bridge.start().await.is_err());
    assert_eq!(bridge.state(), BridgeState::Stopped);
    bridge.shutdown().await;
}

#[tokio::test]
async fn discovery_resolves_radio_address() {
    let radio = MockRadio::start().await.unwrap();
    let discovery_port = free_udp_port();
    let mut config = config_for(radio.addr());
    config.radio.host = None;
    config.discovery.port = discovery_port;
    config.discovery.timeout_ms = 2_000;
    let bridge = Bridge::new(config);

    let announcement = format!(
        "type=radio model=FLEX-6600 serial=0001 ip=127.0.0.1 port={}",
        radio.addr().port()
    );
    let announcer = tokio::spawn(async move {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        loop {
            let _ = socket
                .send_to(announcement.as_bytes(), ("127.0.0.1", discovery_port))
                .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    bridge.start().await.unwrap();
    announcer.abort();
    assert_eq!(bridge.radio_addr().await, Some(radio.addr()));
    assert!(bridge.channel().is_connected());

    bridge.shutdown().await;
}

#[tokio::test]
async fn radio_hangup_is_reported_once() {
    let radio = MockRadio::start().await.unwrap();
    let bridge = Bridge::new(config_for(radio.addr()));
    bridge.start().await.unwrap();

    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);
    bridge.synchronizer().subscribe(move |push| {
        if push.reason == PushReason::Immediate && !push.state.connected {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    radio.drop_connection();
    let sync = Arc::clone(bridge.synchronizer());
    assert!(wait_until(|| !sync.snapshot().connected).await);

    // Closing an already-lost channel reports nothing new.
    bridge.stop().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn actions_while_radio_is_gone_send_nothing() {
    let radio = MockRadio::start().await.unwrap();
    let bridge = Bridge::new(config_for(radio.addr()));
    bridge.start().await.unwrap();
    radio
        .wait_for_lines(CONNECT_COMMANDS, Duration::from_secs(2))
        .await;

    radio.drop_connection();
    let channel = bridge.channel().clone();
    assert!(wait_until(|| !channel.is_connected()).await);
    radio.clear().await;

    assert!(matches!(
        bridge.router().dispatch("tune_up", None).await,
        Err(Error::NotConnected)
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(radio.received().await.is_empty());

    bridge.shutdown().await;
}
