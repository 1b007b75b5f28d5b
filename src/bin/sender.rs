//! Relay sender application
//!
//! Runs the client side of a session: dials a receiver's control channel,
//! starts a stream, and pushes 20 ms PCM frames. A real deployment feeds
//! microphone capture in; this binary generates a test tone as a stand-in
//! capture collaborator.

use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_mic_relay::{
    config::SessionConfig,
    network::discovery::DeviceDescriptor,
    session::{ConnectionState, ConnectionStatus, SessionEvents, SessionOrchestrator},
};

struct LogEvents;

impl SessionEvents for LogEvents {
    fn on_state_changed(&self, state: &ConnectionState) {
        match (&state.status, &state.error_message) {
            (ConnectionStatus::Error, Some(message)) => {
                tracing::error!("Session error: {}", message);
            }
            _ => tracing::info!("Session state: {}", state.status.name()),
        }
    }
}

/// 440 Hz sine, one 20 ms frame per call
struct ToneGenerator {
    sample_rate: u32,
    channels: u8,
    phase: f32,
}

impl ToneGenerator {
    fn next_frame(&mut self) -> Bytes {
        let samples_per_frame = self.sample_rate as usize / 50;
        let step = 440.0 * 2.0 * std::f32::consts::PI / self.sample_rate as f32;

        let mut pcm = Vec::with_capacity(samples_per_frame * 2 * self.channels as usize);
        for _ in 0..samples_per_frame {
            let value = (self.phase.sin() * 8000.0) as i16;
            for _ in 0..self.channels {
                pcm.extend_from_slice(&value.to_le_bytes());
            }
            self.phase += step;
        }
        self.phase %= 2.0 * std::f32::consts::PI;
        Bytes::from(pcm)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN mic relay sender");

    let config = SessionConfig::load_or_default();
    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let control_port = config.network.control_port;
    let audio_port = config.network.audio_port;

    let session = SessionOrchestrator::new(
        SessionConfig {
            network: lan_mic_relay::config::NetworkConfig {
                // Client binds an ephemeral audio port; the receiver owns 5000
                audio_port: 0,
                ..config.network.clone()
            },
            ..config.clone()
        },
        Arc::new(LogEvents),
    )?;

    tracing::info!("Connecting to {}:{}", host, control_port);
    session.connect_to_peer(&host, control_port).await?;
    session.start_streaming(&host, audio_port).await?;

    // Announce ourselves so receivers can list this device
    let descriptor = DeviceDescriptor::new(
        uuid::Uuid::new_v4().to_string(),
        hostname(),
        local_ip(),
        control_port,
    );
    if let Err(e) = session.broadcast_presence(&descriptor).await {
        tracing::warn!("Presence broadcast failed: {}", e);
    }

    let mut tone = ToneGenerator {
        sample_rate: config.audio.format.sample_rate,
        channels: config.audio.format.channels,
        phase: 0.0,
    };

    tracing::info!("Streaming {} to {}:{}", config.audio.format, host, audio_port);

    let mut ticker = tokio::time::interval(Duration::from_millis(20));
    let mut last_keepalive = Instant::now();
    let mut last_stats = Instant::now();

    loop {
        ticker.tick().await;
        session.send_audio(tone.next_frame()).await?;

        if last_keepalive.elapsed() >= Duration::from_secs(5) {
            last_keepalive = Instant::now();
            if let Err(e) = session.send_ping().await {
                tracing::warn!("Keepalive failed: {}", e);
            }
        }

        if last_stats.elapsed() >= Duration::from_secs(5) {
            last_stats = Instant::now();
            let state = session.connection_state();
            tracing::info!(
                "Sender stats: {} packets, {:.1} KB sent",
                state.packets_sent,
                state.bytes_sent as f64 / 1024.0
            );
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "lan-mic-sender".to_string())
}

fn local_ip() -> String {
    local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "0.0.0.0".to_string())
}
