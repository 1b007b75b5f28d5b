//! Audio stream processing
//!
//! PCM framing on the send side and jitter-buffered reconstruction on the
//! receive side. Capture and playback devices are external collaborators;
//! this module only sees raw PCM bytes.

pub mod format;
pub mod jitter;
pub mod packetizer;

pub use format::{AudioFormat, AudioFrame};
pub use jitter::{JitterBuffer, JitterStats};
pub use packetizer::AudioPacketizer;
