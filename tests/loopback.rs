//! End-to-end loopback: a server session and a client session on one
//! host, exchanging control messages and a short audio stream over real
//! sockets.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use lan_mic_relay::audio::format::AudioFormat;
use lan_mic_relay::config::SessionConfig;
use lan_mic_relay::session::{ConnectionStatus, SessionEvents, SessionOrchestrator};

struct Collector {
    audio: Mutex<Vec<Bytes>>,
}

impl Collector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            audio: Mutex::new(Vec::new()),
        })
    }

    fn frames(&self) -> usize {
        self.audio.lock().len()
    }
}

impl SessionEvents for Collector {
    fn on_audio_received(&self, pcm: &Bytes, _format: AudioFormat) {
        self.audio.lock().push(pcm.clone());
    }
}

fn loopback_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.network.audio_port = 0;
    config.network.control_port = 0;
    config.network.discovery_port = 0;
    config.jitter.playout_depth = 3;
    config
}

async fn wait_for(mut probe: impl FnMut() -> bool) {
    for _ in 0..500 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn test_full_session_roundtrip() {
    let server_events = Collector::new();
    let server = SessionOrchestrator::new(loopback_config(), server_events.clone()).unwrap();
    server.start_as_server().await.unwrap();

    let control_port = server.control_port().unwrap();
    let audio_port = server.audio_port();
    assert_eq!(
        server.connection_state().status,
        ConnectionStatus::Connecting
    );

    let client_events = Collector::new();
    let client = SessionOrchestrator::new(loopback_config(), client_events.clone()).unwrap();
    client
        .connect_to_peer("127.0.0.1", control_port)
        .await
        .unwrap();

    wait_for(|| client.connection_state().status == ConnectionStatus::Connected).await;
    wait_for(|| server.connection_state().status == ConnectionStatus::Connected).await;
    assert!(client.connection_state().connected_at.is_some());

    // StartStream flips the sender to Streaming and, via the control
    // message, the receiver too.
    client
        .start_streaming("127.0.0.1", audio_port)
        .await
        .unwrap();
    assert_eq!(client.connection_state().status, ConnectionStatus::Streaming);
    wait_for(|| server.connection_state().status == ConnectionStatus::Streaming).await;

    // Keepalive exercise; the server answers with Pong automatically
    client.send_ping().await.unwrap();

    // Stream enough 20ms frames to fill the playout depth and release
    let frame = Bytes::from(vec![0x55u8; 1920]);
    for _ in 0..10 {
        client.send_audio(frame.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    wait_for(|| server_events.frames() >= 5).await;

    let state = server.connection_state();
    assert!(state.packets_received >= 5);
    assert!(state.bytes_received >= 5 * 1920);
    assert_eq!(state.packet_loss_rate, 0.0);

    let sent = client.connection_state();
    assert_eq!(sent.packets_sent, 10);
    assert_eq!(sent.bytes_sent, 10 * 1920);

    // Stop streaming drops both sides back to Connected
    client.stop_streaming().await.unwrap();
    assert_eq!(client.connection_state().status, ConnectionStatus::Connected);
    wait_for(|| server.connection_state().status == ConnectionStatus::Connected).await;

    // Disconnect resets traffic counters and is observed by the peer
    client.disconnect().await;
    let state = client.connection_state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert_eq!(state.packets_sent, 0);
    assert_eq!(state.bytes_sent, 0);

    wait_for(|| server.connection_state().status == ConnectionStatus::Disconnected).await;
    server.disconnect().await;
}

#[tokio::test]
async fn test_connect_to_dead_peer_reports_error() {
    let events = Collector::new();
    let client = SessionOrchestrator::new(loopback_config(), events).unwrap();

    // Grab a port nothing listens on
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe);

    let result = client.connect_to_peer("127.0.0.1", dead_port).await;
    assert!(result.is_err());

    let state = client.connection_state();
    assert_eq!(state.status, ConnectionStatus::Error);
    assert!(state.error_message.is_some());
}

#[tokio::test]
async fn test_audio_ignored_before_streaming() {
    let events = Collector::new();
    let client = SessionOrchestrator::new(loopback_config(), events).unwrap();

    client.send_audio(Bytes::from_static(&[0; 64])).await.unwrap();
    assert_eq!(client.connection_state().packets_sent, 0);
}
