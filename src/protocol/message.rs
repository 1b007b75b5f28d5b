//! Control message wire format
//!
//! One byte of message type, a 4-byte little-endian payload length, then
//! the UTF-8 payload. Used on the TCP control channel and, wrapped around
//! JSON descriptors, on the discovery broadcast socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the type + length prefix
pub const FRAME_HEADER_SIZE: usize = 5;

/// Control message types
///
/// Unrecognized bytes decode to `Unknown` rather than failing, so a newer
/// peer never crashes an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Ping,
    Pong,
    StartStream,
    StopStream,
    StreamStarted,
    StreamStopped,
    DiscoveryRequest,
    DiscoveryResponse,
    Error,
    Unknown(u8),
}

impl MessageType {
    pub fn to_byte(self) -> u8 {
        match self {
            MessageType::Ping => 0,
            MessageType::Pong => 1,
            MessageType::StartStream => 2,
            MessageType::StopStream => 3,
            MessageType::StreamStarted => 4,
            MessageType::StreamStopped => 5,
            MessageType::DiscoveryRequest => 10,
            MessageType::DiscoveryResponse => 11,
            MessageType::Error => 255,
            MessageType::Unknown(b) => b,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => MessageType::Ping,
            1 => MessageType::Pong,
            2 => MessageType::StartStream,
            3 => MessageType::StopStream,
            4 => MessageType::StreamStarted,
            5 => MessageType::StreamStopped,
            10 => MessageType::DiscoveryRequest,
            11 => MessageType::DiscoveryResponse,
            255 => MessageType::Error,
            other => MessageType::Unknown(other),
        }
    }
}

/// A session control message with a UTF-8 payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub msg_type: MessageType,
    pub payload: String,
}

impl ControlMessage {
    pub fn new(msg_type: MessageType, payload: impl Into<String>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// A message with an empty payload
    pub fn empty(msg_type: MessageType) -> Self {
        Self::new(msg_type, "")
    }

    /// Serialize into a length-prefixed frame
    pub fn encode(&self) -> Bytes {
        let payload = self.payload.as_bytes();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u8(self.msg_type.to_byte());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Parse one frame; `None` if the buffer is shorter than the header or
    /// the declared payload length exceeds the remaining bytes
    pub fn decode(data: &[u8]) -> Option<ControlMessage> {
        if data.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let mut buf = data;
        let msg_type = MessageType::from_byte(buf.get_u8());
        let declared = buf.get_u32_le() as usize;
        if declared > buf.remaining() {
            return None;
        }

        Some(ControlMessage {
            msg_type,
            payload: String::from_utf8_lossy(&buf[..declared]).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let msg = ControlMessage::new(MessageType::StartStream, "5000");
        let decoded = ControlMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_empty_payload() {
        let msg = ControlMessage::empty(MessageType::Ping);
        let encoded = msg.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE);

        let decoded = ControlMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Ping);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(ControlMessage::decode(&[]).is_none());
        assert!(ControlMessage::decode(&[0, 1, 0, 0]).is_none());
    }

    #[test]
    fn test_over_declared_length_rejected() {
        // declares 100 bytes of payload, supplies 2
        let frame = [2u8, 100, 0, 0, 0, b'a', b'b'];
        assert!(ControlMessage::decode(&frame).is_none());
    }

    #[test]
    fn test_unknown_type_decodes() {
        let msg = ControlMessage::new(MessageType::Unknown(42), "later-version");
        let decoded = ControlMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Unknown(42));
        assert_eq!(decoded.payload, "later-version");
    }

    #[test]
    fn test_type_byte_roundtrip() {
        for byte in 0..=255u8 {
            assert_eq!(MessageType::from_byte(byte).to_byte(), byte);
        }
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let frame = [0u8, 2, 0, 0, 0, 0xFF, 0xFE];
        let decoded = ControlMessage::decode(&frame).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Ping);
        assert_eq!(decoded.payload.chars().count(), 2);
    }
}
