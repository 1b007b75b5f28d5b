//! Session orchestration
//!
//! Composes the UDP audio transport, TCP control channel, discovery
//! service, packetizer, and jitter buffer into one connection state
//! machine. All `ConnectionState` mutation funnels through a single
//! transition point so counters updated from the various receive tasks
//! never race.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::audio::format::AudioFormat;
use crate::audio::jitter::JitterBuffer;
use crate::audio::packetizer::AudioPacketizer;
use crate::config::SessionConfig;
use crate::error::{NetworkError, Result, SessionError};
use crate::network::control::{ControlChannel, ControlEvents};
use crate::network::discovery::{DeviceDescriptor, DiscoveryEvents, DiscoveryService};
use crate::network::udp::{AudioEvents, UdpTransport};
use crate::protocol::{AudioPacket, ControlMessage, MessageType};

/// Connection lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
}

impl ConnectionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Streaming => "streaming",
            ConnectionStatus::Error => "error",
        }
    }
}

/// Observable session state, exclusively owned by the orchestrator
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub remote_address: Option<String>,
    pub remote_port: u16,
    pub connected_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packet_loss_rate: f64,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self.status,
            ConnectionStatus::Connected | ConnectionStatus::Streaming
        )
    }

    /// Time since the connection was established
    pub fn connection_duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|at| Utc::now() - at)
    }

    fn reset_traffic(&mut self) {
        self.connected_at = None;
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.packets_sent = 0;
        self.packets_received = 0;
        self.packet_loss_rate = 0.0;
    }
}

/// Observer for session-level events
///
/// Delivered inline from whichever receive task produced them; a slow
/// implementation stalls that receive path.
pub trait SessionEvents: Send + Sync + 'static {
    fn on_state_changed(&self, _state: &ConnectionState) {}
    fn on_audio_received(&self, _pcm: &Bytes, _format: AudioFormat) {}
    fn on_device_discovered(&self, _descriptor: &DeviceDescriptor) {}
    fn on_device_lost(&self, _device_id: &str) {}
}

/// Session observer that ignores everything
pub struct NullEvents;
impl SessionEvents for NullEvents {}

struct Inner {
    config: SessionConfig,
    transport: UdpTransport,
    control: Arc<ControlChannel>,
    discovery: DiscoveryService,
    /// Gain and downmix operate on the capture format
    shaper: AudioPacketizer,
    /// Frames shaped PCM with the on-wire format
    packetizer: Mutex<AudioPacketizer>,
    jitter: JitterBuffer,
    state: Mutex<ConnectionState>,
    events: Arc<dyn SessionEvents>,
    epoch: Instant,
    control_port: Mutex<Option<u16>>,
}

/// One end of a relay session, server or client
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    /// Bind the audio socket and assemble the session
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: SessionConfig, events: Arc<dyn SessionEvents>) -> Result<Self> {
        let transport =
            UdpTransport::bind(config.network.audio_port, config.network.recv_buffer_size)?;

        let capture_format = config.audio.format;
        let wire_format = if config.audio.downmix_to_mono && capture_format.is_stereo_16bit() {
            AudioFormat {
                channels: 1,
                ..capture_format
            }
        } else {
            capture_format
        };

        let inner = Arc::new(Inner {
            transport,
            control: Arc::new(ControlChannel::new()),
            discovery: DiscoveryService::new(config.network.discovery_port, config.discovery),
            shaper: AudioPacketizer::new(capture_format),
            packetizer: Mutex::new(AudioPacketizer::new(wire_format)),
            jitter: JitterBuffer::new(config.jitter),
            state: Mutex::new(ConnectionState::default()),
            events,
            epoch: Instant::now(),
            control_port: Mutex::new(None),
            config,
        });

        Ok(Self { inner })
    }

    /// Begin listening on the audio, control, and discovery channels
    pub async fn start_as_server(&self) -> Result<()> {
        let inner = &self.inner;
        inner
            .transport
            .start_receiving(inner.clone() as Arc<dyn AudioEvents>);

        let port = inner
            .control
            .listen(
                inner.config.network.control_port,
                inner.clone() as Arc<dyn ControlEvents>,
            )
            .await?;
        *inner.control_port.lock() = Some(port);

        inner
            .discovery
            .start(inner.clone() as Arc<dyn DiscoveryEvents>)?;

        inner.transition(ConnectionStatus::Connecting, Some("Waiting for connection"));
        Ok(())
    }

    /// Dial a peer's control channel
    pub async fn connect_to_peer(&self, host: &str, control_port: u16) -> Result<()> {
        let inner = &self.inner;
        inner.transition(
            ConnectionStatus::Connecting,
            Some(&format!("Connecting to {}", host)),
        );

        match inner
            .control
            .connect(host, control_port, inner.clone() as Arc<dyn ControlEvents>)
            .await
        {
            // on_peer_connected already transitioned to Connected
            Ok(()) => Ok(()),
            Err(e) => {
                inner.transition(ConnectionStatus::Error, Some(&e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Tell the peer a stream is starting and enter `Streaming`
    pub async fn start_streaming(&self, destination_host: &str, audio_port: u16) -> Result<()> {
        let inner = &self.inner;
        let message = ControlMessage::new(MessageType::StartStream, audio_port.to_string());

        if let Err(e) = inner.control.send(&message).await {
            inner.transition(ConnectionStatus::Error, Some(&e.to_string()));
            return Err(e.into());
        }

        {
            let mut state = inner.state.lock();
            state.remote_address = Some(destination_host.to_string());
            state.remote_port = audio_port;
        }
        inner.transition(ConnectionStatus::Streaming, Some("Streaming audio"));
        Ok(())
    }

    /// Tell the peer the stream is over and fall back to `Connected`
    pub async fn stop_streaming(&self) -> Result<()> {
        let inner = &self.inner;
        inner
            .control
            .send(&ControlMessage::empty(MessageType::StopStream))
            .await
            .map_err(crate::error::Error::from)?;
        inner.transition(ConnectionStatus::Connected, Some("Streaming stopped"));
        Ok(())
    }

    /// Shape, packetize, and transmit one capture buffer
    ///
    /// Silently ignored unless the session is `Streaming`; applies the
    /// configured downmix and gain before framing.
    pub async fn send_audio(&self, pcm: Bytes) -> Result<()> {
        let inner = &self.inner;

        let target: SocketAddr = {
            let state = inner.state.lock();
            if state.status != ConnectionStatus::Streaming {
                return Ok(());
            }
            let host = state
                .remote_address
                .as_deref()
                .ok_or(SessionError::NoRemotePeer)?;
            format!("{}:{}", host, state.remote_port)
                .parse()
                .map_err(|_| SessionError::NoRemotePeer)?
        };

        let settings = &inner.config.audio;
        let mut pcm = if settings.downmix_to_mono {
            inner.shaper.downmix_stereo_to_mono(&pcm)
        } else {
            pcm
        };
        if (settings.gain - 1.0).abs() > f32::EPSILON {
            let mut scaled = BytesMut::from(&pcm[..]);
            inner.shaper.apply_gain(&mut scaled, settings.gain);
            pcm = scaled.freeze();
        }

        let timestamp = inner.epoch.elapsed().as_millis() as u32;
        let packet = inner.packetizer.lock().create_packet(pcm, timestamp);
        let payload_len = packet.payload.len() as u64;

        match inner.transport.send_packet(&packet, target).await {
            Ok(_) => {
                let mut state = inner.state.lock();
                state.bytes_sent += payload_len;
                state.packets_sent += 1;
                Ok(())
            }
            Err(e) => {
                inner.transition(ConnectionStatus::Error, Some(&e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Keepalive probe; the peer answers with `Pong` automatically
    pub async fn send_ping(&self) -> Result<()> {
        self.inner
            .control
            .send(&ControlMessage::empty(MessageType::Ping))
            .await
            .map_err(crate::error::Error::from)
    }

    /// Announce this device on the discovery channel
    pub async fn broadcast_presence(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        self.inner
            .discovery
            .broadcast_presence(descriptor)
            .await
            .map_err(crate::error::Error::from)
    }

    /// Peers currently visible on the discovery channel
    pub fn discovered_devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.discovery.devices()
    }

    /// Snapshot of the connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().clone()
    }

    /// Port the audio socket is bound to
    pub fn audio_port(&self) -> u16 {
        self.inner.transport.local_port()
    }

    /// Port the control channel is listening on, once `start_as_server`
    /// has run
    pub fn control_port(&self) -> Option<u16> {
        *self.inner.control_port.lock()
    }

    /// Tear down every channel and reset to `Disconnected`
    ///
    /// No automatic reconnection happens afterwards; call
    /// `connect_to_peer` or `start_as_server` again to resume.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.control.disconnect().await;
        inner.transport.stop().await;
        inner.discovery.stop().await;
        inner.jitter.reset();
        inner.transition(ConnectionStatus::Disconnected, Some("Disconnected"));
    }
}

impl Inner {
    /// The single serialization point for `ConnectionState` mutation
    fn transition(&self, status: ConnectionStatus, message: Option<&str>) {
        let snapshot = {
            let mut state = self.state.lock();
            state.status = status;

            match status {
                ConnectionStatus::Error => {
                    state.error_message = message.map(str::to_string);
                }
                ConnectionStatus::Connected => {
                    // Recorded once; re-entering Connected (e.g. after a
                    // stream stops) keeps the original timestamp.
                    if state.connected_at.is_none() {
                        state.connected_at = Some(Utc::now());
                    }
                }
                ConnectionStatus::Disconnected => {
                    state.reset_traffic();
                }
                _ => {}
            }
            state.clone()
        };

        if let Some(message) = message {
            tracing::info!("Session {}: {}", status.name(), message);
        }
        // Observer runs outside the state lock
        self.events.on_state_changed(&snapshot);
    }
}

impl AudioEvents for Inner {
    fn on_packet(&self, packet: AudioPacket, _from: SocketAddr) {
        self.jitter.receive(packet);

        while let Some(released) = self.jitter.next() {
            let format = released.format();
            {
                let mut state = self.state.lock();
                state.bytes_received += released.payload.len() as u64;
                state.packets_received += 1;
                state.packet_loss_rate = self.jitter.loss_rate();
            }
            self.events.on_audio_received(&released.payload, format);
        }
    }

    fn on_transport_error(&self, error: NetworkError) {
        self.transition(ConnectionStatus::Error, Some(&error.to_string()));
    }
}

impl ControlEvents for Inner {
    fn on_message(&self, message: ControlMessage) {
        match message.msg_type {
            MessageType::Ping => {
                let control = self.control.clone();
                tokio::spawn(async move {
                    if let Err(e) = control.send(&ControlMessage::empty(MessageType::Pong)).await {
                        tracing::warn!("Failed to answer ping: {}", e);
                    }
                });
            }
            MessageType::Pong => {
                tracing::trace!("Keepalive pong received");
            }
            MessageType::StartStream => {
                self.transition(ConnectionStatus::Streaming, Some("Receiving audio stream"));
            }
            MessageType::StopStream => {
                self.transition(ConnectionStatus::Connected, Some("Stream stopped"));
            }
            MessageType::StreamStarted | MessageType::StreamStopped => {
                tracing::debug!("Peer acknowledged: {:?}", message.msg_type);
            }
            MessageType::Error => {
                self.transition(ConnectionStatus::Error, Some(&message.payload));
            }
            MessageType::DiscoveryRequest | MessageType::DiscoveryResponse => {
                tracing::debug!("Ignoring discovery message on control channel");
            }
            MessageType::Unknown(byte) => {
                tracing::debug!("Ignoring unknown control message type {}", byte);
            }
        }
    }

    fn on_peer_connected(&self) {
        self.transition(ConnectionStatus::Connected, Some("Peer connected"));
    }

    fn on_peer_disconnected(&self) {
        self.transition(ConnectionStatus::Disconnected, Some("Peer disconnected"));
    }

    fn on_error(&self, error: NetworkError) {
        self.transition(ConnectionStatus::Error, Some(&error.to_string()));
    }
}

impl DiscoveryEvents for Inner {
    fn on_device_discovered(&self, descriptor: &DeviceDescriptor) {
        self.events.on_device_discovered(descriptor);
    }

    fn on_device_lost(&self, device_id: &str) {
        self.events.on_device_lost(device_id);
    }

    fn on_error(&self, error: NetworkError) {
        self.transition(ConnectionStatus::Error, Some(&error.to_string()));
    }
}
