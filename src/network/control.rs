//! Reliable control channel
//!
//! A single-peer, ordered message channel over TCP. The channel either
//! listens for exactly one inbound peer or dials an outbound one; in both
//! cases a background read loop decodes length-prefixed control frames
//! and dispatches them inline to the registered observer.
//!
//! The read loop frames messages by their declared length (header first,
//! then exactly the payload) rather than assuming one read returns one
//! message; the wire format itself is unchanged, so either framing style
//! interoperates on the writer side.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::NetworkError;
use crate::protocol::message::FRAME_HEADER_SIZE;
use crate::protocol::{ControlMessage, MessageType};

/// Upper bound on a declared control payload; anything larger is treated
/// as a broken peer
pub const MAX_CONTROL_PAYLOAD: usize = 64 * 1024;

/// Control channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Listening,
    Connecting,
    Connected,
    Disconnected,
}

/// Observer for control channel events, invoked inline on the read task
pub trait ControlEvents: Send + Sync + 'static {
    fn on_message(&self, message: ControlMessage);
    fn on_peer_connected(&self);
    fn on_peer_disconnected(&self);
    fn on_error(&self, error: NetworkError);
}

/// Single-peer reliable message channel
///
/// `Disconnected` is re-enterable: a stopped channel can listen or
/// connect again.
pub struct ControlChannel {
    state: Mutex<ChannelState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    events: Mutex<Option<Arc<dyn ControlEvents>>>,
    peer_attached: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState::Idle),
            writer: tokio::sync::Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            events: Mutex::new(None),
            peer_attached: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    fn ensure_restartable(&self) -> Result<(), NetworkError> {
        match self.state() {
            ChannelState::Idle | ChannelState::Disconnected => Ok(()),
            other => Err(NetworkError::ConnectionFailed(format!(
                "channel busy in state {:?}",
                other
            ))),
        }
    }

    /// Bind `port` (0 for ephemeral) and accept exactly one inbound peer
    ///
    /// Returns the locally bound port. The accept and the subsequent read
    /// loop run on one background task.
    pub async fn listen(
        self: &Arc<Self>,
        port: u16,
        events: Arc<dyn ControlEvents>,
    ) -> Result<u16, NetworkError> {
        self.ensure_restartable()?;

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?
            .port();

        *self.events.lock() = Some(events.clone());
        *self.state.lock() = ChannelState::Listening;

        let token = CancellationToken::new();
        *self.shutdown.lock() = Some(token.clone());

        let channel = self.clone();
        let loop_token = token.clone();
        *self.task.lock() = Some(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!("Control peer connected from {}", peer);
                        channel.attach(stream, &events).await;
                        channel.read_loop(loop_token, events).await;
                    }
                    Err(e) => {
                        *channel.state.lock() = ChannelState::Disconnected;
                        events.on_error(NetworkError::ReceiveFailed(e.to_string()));
                    }
                },
            }
        }));

        Ok(local_port)
    }

    /// Dial an outbound peer
    pub async fn connect(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        events: Arc<dyn ControlEvents>,
    ) -> Result<(), NetworkError> {
        self.ensure_restartable()?;
        *self.state.lock() = ChannelState::Connecting;

        let stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(e) => {
                *self.state.lock() = ChannelState::Disconnected;
                return Err(NetworkError::ConnectionFailed(e.to_string()));
            }
        };

        *self.events.lock() = Some(events.clone());
        self.attach(stream, &events).await;

        let token = CancellationToken::new();
        *self.shutdown.lock() = Some(token.clone());

        let channel = self.clone();
        *self.task.lock() = Some(tokio::spawn(async move {
            channel.read_loop(token, events).await;
        }));

        Ok(())
    }

    async fn attach(&self, stream: TcpStream, events: &Arc<dyn ControlEvents>) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);
        *self.state.lock() = ChannelState::Connected;
        self.peer_attached.store(true, Ordering::Release);
        events.on_peer_connected();
    }

    /// Encode and transmit one message, flushing immediately
    ///
    /// A write failure means the connection is broken; it is reported to
    /// the caller and never retried. There is no send timeout.
    pub async fn send(&self, message: &ControlMessage) -> Result<(), NetworkError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetworkError::NotConnected)?;

        let data = message.encode();
        writer
            .write_all(&data)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    /// Cancel the read loop, close the transport, and await the task;
    /// no-op when already disconnected
    pub async fn disconnect(&self) {
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        *self.writer.lock().await = None;
        *self.reader.lock().await = None;
        *self.state.lock() = ChannelState::Disconnected;

        if self.peer_attached.swap(false, Ordering::AcqRel) {
            let events = self.events.lock().clone();
            if let Some(events) = events {
                events.on_peer_disconnected();
            }
        }
    }

    async fn read_loop(&self, token: CancellationToken, events: Arc<dyn ControlEvents>) {
        let mut reader = match self.reader.lock().await.take() {
            Some(reader) => reader,
            None => return,
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = read_frame(&mut reader) => match result {
                    Ok(Some(message)) => events.on_message(message),
                    Ok(None) => {
                        // Clean EOF from the peer
                        self.peer_closed(&events).await;
                        break;
                    }
                    Err(e) => {
                        if self.peer_attached.load(Ordering::Acquire) {
                            events.on_error(NetworkError::ReceiveFailed(e.to_string()));
                        }
                        self.peer_closed(&events).await;
                        break;
                    }
                },
            }
        }
    }

    async fn peer_closed(&self, events: &Arc<dyn ControlEvents>) {
        *self.writer.lock().await = None;
        *self.state.lock() = ChannelState::Disconnected;
        if self.peer_attached.swap(false, Ordering::AcqRel) {
            events.on_peer_disconnected();
        }
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one length-prefixed control frame
///
/// `Ok(None)` is a clean EOF before any header byte; a declared payload
/// larger than `MAX_CONTROL_PAYLOAD` is an error (broken peer).
async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Option<ControlMessage>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let msg_type = MessageType::from_byte(header[0]);
    let declared = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if declared > MAX_CONTROL_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("declared payload of {} bytes", declared),
        ));
    }

    let mut payload = vec![0u8; declared];
    reader.read_exact(&mut payload).await?;

    Ok(Some(ControlMessage {
        msg_type,
        payload: String::from_utf8_lossy(&payload).into_owned(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Event {
        Message(ControlMessage),
        Connected,
        Disconnected,
        Error(String),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl Recorder {
        fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { tx }), rx)
        }
    }

    impl ControlEvents for Recorder {
        fn on_message(&self, message: ControlMessage) {
            let _ = self.tx.send(Event::Message(message));
        }
        fn on_peer_connected(&self) {
            let _ = self.tx.send(Event::Connected);
        }
        fn on_peer_disconnected(&self) {
            let _ = self.tx.send(Event::Disconnected);
        }
        fn on_error(&self, error: NetworkError) {
            let _ = self.tx.send(Event::Error(error.to_string()));
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_listen_connect_exchange() {
        let server = Arc::new(ControlChannel::new());
        let client = Arc::new(ControlChannel::new());
        let (server_events, mut server_rx) = Recorder::pair();
        let (client_events, mut client_rx) = Recorder::pair();

        let port = server.listen(0, server_events).await.unwrap();
        client.connect("127.0.0.1", port, client_events).await.unwrap();

        assert!(matches!(next_event(&mut client_rx).await, Event::Connected));
        assert!(matches!(next_event(&mut server_rx).await, Event::Connected));

        client
            .send(&ControlMessage::new(MessageType::StartStream, "5000"))
            .await
            .unwrap();

        match next_event(&mut server_rx).await {
            Event::Message(msg) => {
                assert_eq!(msg.msg_type, MessageType::StartStream);
                assert_eq!(msg.payload, "5000");
            }
            other => panic!("expected message, got {:?}", other),
        }

        server
            .send(&ControlMessage::empty(MessageType::StreamStarted))
            .await
            .unwrap();

        match next_event(&mut client_rx).await {
            Event::Message(msg) => assert_eq!(msg.msg_type, MessageType::StreamStarted),
            other => panic!("expected message, got {:?}", other),
        }

        client.disconnect().await;
        server.disconnect().await;
    }

    #[tokio::test]
    async fn test_back_to_back_frames_are_split() {
        let server = Arc::new(ControlChannel::new());
        let client = Arc::new(ControlChannel::new());
        let (server_events, mut server_rx) = Recorder::pair();
        let (client_events, mut client_rx) = Recorder::pair();

        let port = server.listen(0, server_events).await.unwrap();
        client.connect("127.0.0.1", port, client_events).await.unwrap();
        assert!(matches!(next_event(&mut client_rx).await, Event::Connected));
        assert!(matches!(next_event(&mut server_rx).await, Event::Connected));

        // Two frames in quick succession very likely coalesce into one
        // TCP segment; the length-prefixed reader must still split them.
        client
            .send(&ControlMessage::empty(MessageType::Ping))
            .await
            .unwrap();
        client
            .send(&ControlMessage::new(MessageType::StopStream, "bye"))
            .await
            .unwrap();

        match next_event(&mut server_rx).await {
            Event::Message(msg) => assert_eq!(msg.msg_type, MessageType::Ping),
            other => panic!("expected ping, got {:?}", other),
        }
        match next_event(&mut server_rx).await {
            Event::Message(msg) => {
                assert_eq!(msg.msg_type, MessageType::StopStream);
                assert_eq!(msg.payload, "bye");
            }
            other => panic!("expected stop, got {:?}", other),
        }

        client.disconnect().await;
        server.disconnect().await;
    }

    #[tokio::test]
    async fn test_peer_close_reported_once() {
        let server = Arc::new(ControlChannel::new());
        let client = Arc::new(ControlChannel::new());
        let (server_events, mut server_rx) = Recorder::pair();
        let (client_events, mut client_rx) = Recorder::pair();

        let port = server.listen(0, server_events).await.unwrap();
        client.connect("127.0.0.1", port, client_events).await.unwrap();
        assert!(matches!(next_event(&mut client_rx).await, Event::Connected));
        assert!(matches!(next_event(&mut server_rx).await, Event::Connected));

        client.disconnect().await;

        assert!(matches!(next_event(&mut server_rx).await, Event::Disconnected));
        assert_eq!(server.state(), ChannelState::Disconnected);

        server.disconnect().await;
        // Second disconnect is a no-op, no further events
        server.disconnect().await;
        assert!(server_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_without_peer_fails() {
        let channel = ControlChannel::new();
        let result = channel.send(&ControlMessage::empty(MessageType::Ping)).await;
        assert!(matches!(result, Err(NetworkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_channel_restartable_after_disconnect() {
        let server = Arc::new(ControlChannel::new());
        let (events, _rx) = Recorder::pair();

        let port1 = server.listen(0, events.clone()).await.unwrap();
        assert!(port1 > 0);
        assert_eq!(server.state(), ChannelState::Listening);

        // Busy channel refuses a second start
        assert!(server.listen(0, events.clone()).await.is_err());

        server.disconnect().await;
        assert_eq!(server.state(), ChannelState::Disconnected);

        let port2 = server.listen(0, events).await.unwrap();
        assert!(port2 > 0);
        server.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error() {
        let client = Arc::new(ControlChannel::new());
        let (events, _rx) = Recorder::pair();

        // Ephemeral port that nothing listens on
        let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        let result = client.connect("127.0.0.1", dead_port, events).await;
        assert!(matches!(result, Err(NetworkError::ConnectionFailed(_))));
        assert_eq!(client.state(), ChannelState::Disconnected);
    }
}
