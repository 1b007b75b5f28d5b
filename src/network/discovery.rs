//! Broadcast device discovery
//!
//! Peers announce themselves by broadcasting a `DiscoveryRequest` whose
//! payload is a JSON device descriptor; anyone may answer a specific peer
//! with a `DiscoveryResponse`. Every receipt refreshes the sender's
//! `last_seen`; a periodic sweep evicts descriptors that have gone silent
//! and reports each loss exactly once. Malformed payloads are dropped
//! without comment.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::error::NetworkError;
use crate::protocol::{ControlMessage, MessageType};

/// A peer as seen on the discovery channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub device_name: String,
    pub ip_address: String,
    pub port: u16,
    pub last_seen: DateTime<Utc>,
}

impl DeviceDescriptor {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        ip_address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            ip_address: ip_address.into(),
            port,
            last_seen: Utc::now(),
        }
    }
}

/// Observer for discovery events, invoked inline on the receive and sweep
/// tasks
pub trait DiscoveryEvents: Send + Sync + 'static {
    fn on_device_discovered(&self, descriptor: &DeviceDescriptor);
    fn on_device_lost(&self, device_id: &str);
    fn on_error(&self, error: NetworkError);
}

/// Broadcast UDP presence protocol with descriptor expiry
pub struct DiscoveryService {
    port: u16,
    config: DiscoveryConfig,
    devices: Arc<DashMap<String, DeviceDescriptor>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    shutdown: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(port: u16, config: DiscoveryConfig) -> Self {
        Self {
            port,
            config,
            devices: Arc::new(DashMap::new()),
            socket: Mutex::new(None),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the discovery port and start the receive loop and the expiry
    /// sweep
    pub fn start(&self, events: Arc<dyn DiscoveryEvents>) -> Result<(), NetworkError> {
        let mut socket_slot = self.socket.lock();
        if socket_slot.is_some() {
            return Ok(());
        }

        let socket = bind_broadcast(self.port)?;
        let socket = Arc::new(socket);
        *socket_slot = Some(socket.clone());

        let token = CancellationToken::new();
        *self.shutdown.lock() = Some(token.clone());

        let mut tasks = self.tasks.lock();

        {
            let devices = self.devices.clone();
            let events = events.clone();
            let token = token.clone();
            let socket = socket.clone();
            tasks.push(tokio::spawn(async move {
                receive_loop(socket, devices, events, token).await;
            }));
        }

        {
            let devices = self.devices.clone();
            let timeout = chrono::Duration::milliseconds(self.config.device_timeout_ms as i64);
            let interval = Duration::from_millis(self.config.sweep_interval_ms);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            sweep_expired(&devices, timeout, events.as_ref());
                        }
                    }
                }
            }));
        }

        Ok(())
    }

    /// Announce ourselves to the whole subnet
    pub async fn broadcast_presence(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<(), NetworkError> {
        let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port);
        self.send_descriptor(MessageType::DiscoveryRequest, descriptor, target.into())
            .await
    }

    /// Answer one specific peer
    pub async fn send_response(
        &self,
        descriptor: &DeviceDescriptor,
        target: SocketAddr,
    ) -> Result<(), NetworkError> {
        self.send_descriptor(MessageType::DiscoveryResponse, descriptor, target)
            .await
    }

    async fn send_descriptor(
        &self,
        msg_type: MessageType,
        descriptor: &DeviceDescriptor,
        target: SocketAddr,
    ) -> Result<(), NetworkError> {
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or(NetworkError::NotConnected)?;

        let payload = serde_json::to_string(descriptor)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        let message = ControlMessage::new(msg_type, payload);

        socket
            .send_to(&message.encode(), target)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        Ok(())
    }

    /// Snapshot of the currently known peers
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }

    /// Cancel both background tasks and await their termination
    pub async fn stop(&self) {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        *self.socket.lock() = None;
    }
}

fn bind_broadcast(port: u16) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    UdpSocket::from_std(socket.into()).map_err(|e| NetworkError::BindFailed(e.to_string()))
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    devices: Arc<DashMap<String, DeviceDescriptor>>,
    events: Arc<dyn DiscoveryEvents>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => handle_datagram(&buf[..len], from, &devices, events.as_ref()),
                Err(e) => {
                    tracing::warn!("Discovery receive failed: {}", e);
                    events.on_error(NetworkError::ReceiveFailed(e.to_string()));
                    break;
                }
            },
        }
    }
}

fn handle_datagram(
    data: &[u8],
    from: SocketAddr,
    devices: &DashMap<String, DeviceDescriptor>,
    events: &dyn DiscoveryEvents,
) {
    let message = match ControlMessage::decode(data) {
        Some(message) => message,
        None => return,
    };

    if !matches!(
        message.msg_type,
        MessageType::DiscoveryRequest | MessageType::DiscoveryResponse
    ) {
        return;
    }

    let mut descriptor: DeviceDescriptor = match serde_json::from_str(&message.payload) {
        Ok(descriptor) => descriptor,
        Err(_) => return,
    };
    descriptor.last_seen = Utc::now();

    let newly_discovered = !devices.contains_key(&descriptor.device_id);
    devices.insert(descriptor.device_id.clone(), descriptor.clone());

    if newly_discovered {
        tracing::info!(
            "Discovered {} ({}) at {} via {}",
            descriptor.device_name,
            descriptor.device_id,
            descriptor.ip_address,
            from
        );
        events.on_device_discovered(&descriptor);
    }
}

/// Evict descriptors older than `timeout`, reporting each exactly once
fn sweep_expired(
    devices: &DashMap<String, DeviceDescriptor>,
    timeout: chrono::Duration,
    events: &dyn DiscoveryEvents,
) {
    let now = Utc::now();
    let expired: Vec<String> = devices
        .iter()
        .filter(|entry| now - entry.value().last_seen > timeout)
        .map(|entry| entry.key().clone())
        .collect();

    for device_id in expired {
        // remove returns the entry only once even if two sweeps race
        if devices.remove(&device_id).is_some() {
            tracing::info!("Device {} lost (presence timeout)", device_id);
            events.on_device_lost(&device_id);
        }
    }
}
