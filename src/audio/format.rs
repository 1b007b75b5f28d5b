//! PCM stream format description

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Format of a raw PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u8,
    /// Bits per sample
    pub bits_per_sample: u8,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

impl AudioFormat {
    /// Raw data rate of the stream
    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.channels as u32 * (self.bits_per_sample as u32 / 8)
    }

    /// True for interleaved 16-bit stereo, the only format the downmix
    /// path operates on
    pub fn is_stereo_16bit(&self) -> bool {
        self.channels == 2 && self.bits_per_sample == 16
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

/// One capture buffer of raw PCM, produced by the capture collaborator and
/// consumed once by the packetizer
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pcm: Bytes,
    pub format: AudioFormat,
}

impl AudioFrame {
    pub fn new(pcm: Bytes, format: AudioFormat) -> Self {
        Self { pcm, format }
    }

    /// Frame duration in microseconds
    pub fn duration_us(&self) -> u64 {
        let bps = self.format.bytes_per_second() as u64;
        if bps == 0 {
            0
        } else {
            self.pcm.len() as u64 * 1_000_000 / bps
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_second() {
        let format = AudioFormat::default();
        assert_eq!(format.bytes_per_second(), 96_000);

        let stereo = AudioFormat {
            channels: 2,
            ..format
        };
        assert_eq!(stereo.bytes_per_second(), 192_000);
    }

    #[test]
    fn test_display() {
        assert_eq!(AudioFormat::default().to_string(), "48000Hz 1ch 16bit");
    }

    #[test]
    fn test_frame_duration() {
        // 20ms of mono 16-bit at 48kHz = 1920 bytes
        let frame = AudioFrame::new(Bytes::from(vec![0u8; 1920]), AudioFormat::default());
        assert_eq!(frame.duration_us(), 20_000);
    }
}
