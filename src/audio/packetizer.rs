//! PCM framing for transmission
//!
//! Turns raw capture buffers into sequenced audio packets at a 20 ms
//! cadence, with optional stereo-to-mono downmix and gain scaling before
//! framing.

use bytes::{Bytes, BytesMut};

use crate::audio::format::AudioFormat;
use crate::protocol::AudioPacket;

/// Sequenced packet builder for one outgoing stream
///
/// The format is locked at construction; the sequence counter starts at 0
/// and wraps naturally at 2^32, which the receiving jitter buffer handles
/// via modular distance.
pub struct AudioPacketizer {
    format: AudioFormat,
    sequence: u32,
}

impl AudioPacketizer {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            sequence: 0,
        }
    }

    /// Frame a PCM buffer, assigning the next sequence number
    pub fn create_packet(&mut self, pcm: Bytes, timestamp: u32) -> AudioPacket {
        let packet = AudioPacket {
            sequence: self.sequence,
            timestamp,
            sample_rate: self.format.sample_rate as u16,
            channels: self.format.channels,
            bits_per_sample: self.format.bits_per_sample,
            payload: pcm,
        };
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }

    /// Bytes per 20 ms tick for the locked format
    pub fn frame_size(&self) -> usize {
        let samples_per_frame = self.format.sample_rate as usize / 50;
        let bytes_per_sample = (self.format.bits_per_sample as usize / 8) * self.format.channels as usize;
        samples_per_frame * bytes_per_sample
    }

    /// Average interleaved 16-bit stereo down to mono
    ///
    /// Each (L,R) i16 pair becomes `(L + R) >> 1`; the arithmetic shift
    /// floors toward negative infinity for odd negative sums. Any other
    /// format passes through unchanged.
    pub fn downmix_stereo_to_mono(&self, pcm: &[u8]) -> Bytes {
        if !self.format.is_stereo_16bit() {
            return Bytes::copy_from_slice(pcm);
        }

        let pair_count = pcm.len() / 4;
        let mut mono = BytesMut::with_capacity(pair_count * 2);

        for pair in pcm.chunks_exact(4) {
            let left = i16::from_le_bytes([pair[0], pair[1]]) as i32;
            let right = i16::from_le_bytes([pair[2], pair[3]]) as i32;
            let mixed = ((left + right) >> 1) as i16;
            mono.extend_from_slice(&mixed.to_le_bytes());
        }

        mono.freeze()
    }

    /// Scale every 16-bit sample in place, saturating at the i16 range so
    /// hot input clips instead of wrapping; no-op for non-16-bit formats
    pub fn apply_gain(&self, pcm: &mut [u8], multiplier: f32) {
        if self.format.bits_per_sample != 16 {
            return;
        }

        for sample in pcm.chunks_exact_mut(2) {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            let adjusted = (value as f32 * multiplier) as i32;
            let clamped = adjusted.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            sample.copy_from_slice(&clamped.to_le_bytes());
        }
    }

    /// The locked stream format
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// The sequence number the next packet will carry
    pub fn next_sequence(&self) -> u32 {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_16() -> AudioFormat {
        AudioFormat {
            sample_rate: 48000,
            channels: 2,
            bits_per_sample: 16,
        }
    }

    fn pcm_from_samples(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn samples_from_pcm(pcm: &[u8]) -> Vec<i16> {
        pcm.chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_sequence_assignment() {
        let mut packetizer = AudioPacketizer::new(AudioFormat::default());

        for expected in 0..5u32 {
            let packet = packetizer.create_packet(Bytes::from_static(&[0; 4]), 0);
            assert_eq!(packet.sequence, expected);
        }
        assert_eq!(packetizer.next_sequence(), 5);
    }

    #[test]
    fn test_packet_carries_format() {
        let mut packetizer = AudioPacketizer::new(stereo_16());
        let packet = packetizer.create_packet(Bytes::new(), 99);
        assert_eq!(packet.sample_rate, 48000);
        assert_eq!(packet.channels, 2);
        assert_eq!(packet.bits_per_sample, 16);
        assert_eq!(packet.timestamp, 99);
    }

    #[test]
    fn test_frame_size_20ms() {
        // 48000/50 samples * 2 bytes * 1 channel
        let mono = AudioPacketizer::new(AudioFormat::default());
        assert_eq!(mono.frame_size(), 1920);

        let stereo = AudioPacketizer::new(stereo_16());
        assert_eq!(stereo.frame_size(), 3840);

        let cd = AudioPacketizer::new(AudioFormat {
            sample_rate: 44100,
            channels: 2,
            bits_per_sample: 16,
        });
        assert_eq!(cd.frame_size(), 3528);
    }

    #[test]
    fn test_downmix_extremes() {
        let packetizer = AudioPacketizer::new(stereo_16());

        let pcm = pcm_from_samples(&[32767, 32767, -32768, -32768]);
        let mono = packetizer.downmix_stereo_to_mono(&pcm);
        assert_eq!(samples_from_pcm(&mono), vec![32767, -32768]);
    }

    #[test]
    fn test_downmix_floors_negative_sums() {
        let packetizer = AudioPacketizer::new(stereo_16());

        // (-1 + -2) = -3, floored to -2; (1 + 2) = 3, floored to 1
        let pcm = pcm_from_samples(&[-1, -2, 1, 2]);
        let mono = packetizer.downmix_stereo_to_mono(&pcm);
        assert_eq!(samples_from_pcm(&mono), vec![-2, 1]);
    }

    #[test]
    fn test_downmix_passthrough_for_mono() {
        let packetizer = AudioPacketizer::new(AudioFormat::default());
        let pcm = pcm_from_samples(&[100, -100]);
        let out = packetizer.downmix_stereo_to_mono(&pcm);
        assert_eq!(&out[..], &pcm[..]);
    }

    #[test]
    fn test_gain_clamps() {
        let packetizer = AudioPacketizer::new(AudioFormat::default());

        let mut pcm = pcm_from_samples(&[20000, 10000, -20000]);
        packetizer.apply_gain(&mut pcm, 2.0);
        assert_eq!(samples_from_pcm(&pcm), vec![32767, 20000, -32768]);
    }

    #[test]
    fn test_gain_attenuates() {
        let packetizer = AudioPacketizer::new(AudioFormat::default());

        let mut pcm = pcm_from_samples(&[10000]);
        packetizer.apply_gain(&mut pcm, 0.5);
        assert_eq!(samples_from_pcm(&pcm), vec![5000]);
    }

    #[test]
    fn test_gain_noop_for_non_16bit() {
        let packetizer = AudioPacketizer::new(AudioFormat {
            bits_per_sample: 8,
            ..AudioFormat::default()
        });

        let mut pcm = vec![100u8, 200];
        packetizer.apply_gain(&mut pcm, 2.0);
        assert_eq!(pcm, vec![100, 200]);
    }
}
