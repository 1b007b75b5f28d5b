//! Unreliable datagram transport for audio packets
//!
//! One socket handles both directions: `send_packet` on the data plane's
//! hot path and a background receive task that decodes arriving datagrams
//! and hands them to the registered observer. A datagram that fails to
//! decode is dropped silently; a single corrupt packet never disturbs the
//! stream.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;
use crate::protocol::AudioPacket;

/// Observer for the audio receive path
///
/// Invoked inline on the receive task; implementations must hand off
/// promptly or the receive path stalls.
pub trait AudioEvents: Send + Sync + 'static {
    fn on_packet(&self, packet: AudioPacket, from: SocketAddr);
    fn on_transport_error(&self, error: NetworkError);
}

/// Send-side counters
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub invalid_packets: u64,
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    invalid_packets: AtomicU64,
}

/// UDP audio transport bound to one local port
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    counters: Arc<Counters>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind to `port` (0 for ephemeral) with an enlarged OS receive
    /// buffer so short consumer stalls do not drop datagrams
    pub fn bind(port: u16, recv_buffer_size: usize) -> Result<Self, NetworkError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        socket
            .set_recv_buffer_size(recv_buffer_size)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket
            .bind(&addr.into())
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        Ok(Self {
            socket: Arc::new(socket),
            counters: Arc::new(Counters::default()),
            shutdown: parking_lot::Mutex::new(None),
            task: parking_lot::Mutex::new(None),
        })
    }

    /// The locally bound port
    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Encode and transmit one audio packet
    pub async fn send_packet(
        &self,
        packet: &AudioPacket,
        target: SocketAddr,
    ) -> Result<usize, NetworkError> {
        let data = packet.encode();
        if data.len() > MAX_PACKET_SIZE {
            return Err(NetworkError::PacketTooLarge(data.len()));
        }

        let sent = self
            .socket
            .send_to(&data, target)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(sent as u64, Ordering::Relaxed);
        Ok(sent)
    }

    /// Spawn the background receive task
    ///
    /// Decoded packets go to `events.on_packet`; transport failures are
    /// reported once and stop the task, per the error model.
    pub fn start_receiving(&self, events: Arc<dyn AudioEvents>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *self.shutdown.lock() = Some(token.clone());

        let socket = self.socket.clone();
        let counters = self.counters.clone();

        *task = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((len, from)) => match AudioPacket::decode(&buf[..len]) {
                            Some(packet) => {
                                counters.packets_received.fetch_add(1, Ordering::Relaxed);
                                events.on_packet(packet, from);
                            }
                            None => {
                                counters.invalid_packets.fetch_add(1, Ordering::Relaxed);
                                tracing::trace!("Dropping malformed datagram from {}", from);
                            }
                        },
                        Err(e) => {
                            tracing::warn!("Audio receive failed: {}", e);
                            events.on_transport_error(NetworkError::ReceiveFailed(e.to_string()));
                            break;
                        }
                    },
                }
            }
        }));
    }

    /// Cancel the receive task and await its termination
    pub async fn stop(&self) {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            invalid_packets: self.counters.invalid_packets.load(Ordering::Relaxed),
        }
    }
}
