//! Audio packet wire format
//!
//! Fixed 16-byte little-endian header followed by the raw PCM payload:
//!
//! ```text
//! magic(4) | sequence(4) | timestamp(4) | sample_rate(2) | channels(1) | bits(1) | payload...
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::audio::format::AudioFormat;

/// Packet magic, ASCII "AMSY"
pub const MAGIC: u32 = 0x414D_5359;

/// Size of the fixed header in bytes
pub const HEADER_SIZE: usize = 16;

/// A single sequenced frame of raw PCM audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    /// Per-encoder sequence number, wraps at 2^32
    pub sequence: u32,
    /// Sender timestamp in milliseconds (wraps, only deltas are meaningful)
    pub timestamp: u32,
    /// Sample rate in Hz
    pub sample_rate: u16,
    /// Channel count
    pub channels: u8,
    /// Bits per sample
    pub bits_per_sample: u8,
    /// Raw PCM payload
    pub payload: Bytes,
}

impl AudioPacket {
    /// Serialize header + payload into a single buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32_le(MAGIC);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.timestamp);
        buf.put_u16_le(self.sample_rate);
        buf.put_u8(self.channels);
        buf.put_u8(self.bits_per_sample);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a datagram; returns `None` for truncated buffers or magic mismatch
    pub fn decode(data: &[u8]) -> Option<AudioPacket> {
        if data.len() < HEADER_SIZE {
            return None;
        }

        let mut buf = data;
        if buf.get_u32_le() != MAGIC {
            return None;
        }

        Some(AudioPacket {
            sequence: buf.get_u32_le(),
            timestamp: buf.get_u32_le(),
            sample_rate: buf.get_u16_le(),
            channels: buf.get_u8(),
            bits_per_sample: buf.get_u8(),
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Stream format carried in the header
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate as u32,
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
        }
    }

    /// Total wire size of this packet
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}
