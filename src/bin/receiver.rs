//! Relay receiver application
//!
//! Runs the server side of a session: listens on the audio, control, and
//! discovery channels and drains reconstructed PCM. A real deployment
//! hands the PCM to a virtual microphone; this binary stands in for that
//! collaborator and just accounts for it.

use anyhow::Result;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_mic_relay::{
    audio::format::{AudioFormat, AudioFrame},
    config::SessionConfig,
    network::discovery::DeviceDescriptor,
    session::{ConnectionState, SessionEvents, SessionOrchestrator},
};

/// Bridges inline session callbacks onto the main loop without blocking
/// the receive tasks
struct PlaybackBridge {
    tx: Sender<AudioFrame>,
}

impl SessionEvents for PlaybackBridge {
    fn on_state_changed(&self, state: &ConnectionState) {
        tracing::info!(
            "Session state: {} (loss {:.1}%)",
            state.status.name(),
            state.packet_loss_rate * 100.0
        );
    }

    fn on_audio_received(&self, pcm: &Bytes, format: AudioFormat) {
        // A full channel means the consumer is behind; dropping here is
        // the documented degradation mode.
        let frame = AudioFrame::new(pcm.clone(), format);
        if let Err(TrySendError::Full(_)) = self.tx.try_send(frame) {
            tracing::warn!("Playback consumer behind, dropping frame");
        }
    }

    fn on_device_discovered(&self, descriptor: &DeviceDescriptor) {
        tracing::info!(
            "Discovered device: {} at {}:{}",
            descriptor.device_name,
            descriptor.ip_address,
            descriptor.port
        );
    }

    fn on_device_lost(&self, device_id: &str) {
        tracing::info!("Device lost: {}", device_id);
    }
}

fn drain(rx: &Receiver<AudioFrame>, total_bytes: &mut u64, frames: &mut u64) {
    while let Ok(frame) = rx.try_recv() {
        // Injection collaborator would consume the PCM here
        *total_bytes += frame.pcm.len() as u64;
        *frames += 1;
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

    tracing::info!("Starting LAN mic relay receiver");

    let config = SessionConfig::load_or_default();
    let (tx, rx) = bounded::<AudioFrame>(256);

    let session = SessionOrchestrator::new(config.clone(), Arc::new(PlaybackBridge { tx }))?;
    session.start_as_server().await?;

    tracing::info!(
        "Listening: audio udp/{}, control tcp/{:?}, discovery udp/{}",
        session.audio_port(),
        session.control_port(),
        config.network.discovery_port
    );

    let mut total_bytes: u64 = 0;
    let mut frames: u64 = 0;
    let mut last_stats = Instant::now();

    loop {
        drain(&rx, &mut total_bytes, &mut frames);

        if last_stats.elapsed() >= Duration::from_secs(5) {
            last_stats = Instant::now();
            let state = session.connection_state();
            tracing::info!(
                "Receiver stats: {} frames, {:.1} KB played, {} packets in, {:.2}% loss",
                frames,
                total_bytes as f64 / 1024.0,
                state.packets_received,
                state.packet_loss_rate * 100.0
            );
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
