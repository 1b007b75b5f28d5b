//! # LAN Microphone Relay
//!
//! Relays microphone audio captured on one device to a receiving host
//! over the local network and reconstructs a playable stream despite
//! packet loss, reordering, and jitter.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────── SENDER ─────────────────┐      ┌──────────────── RECEIVER ────────────────┐
//! │  Capture collaborator (raw PCM)           │      │                                          │
//! │        │                                  │      │                                          │
//! │        ▼                                  │      │                                          │
//! │  AudioPacketizer ──▶ UdpTransport ════════╪═UDP══╪══▶ UdpTransport ──▶ JitterBuffer         │
//! │  (gain/downmix,      (port 5000)          │      │       (port 5000)    (reorder + loss)    │
//! │   sequence nos.)                          │      │                          │               │
//! │                                           │      │                          ▼               │
//! │  SessionOrchestrator ◀═══ ControlChannel ═╪═TCP══╪══▶ ControlChannel ──▶ SessionOrchestrator│
//! │        │                  (port 5001)     │      │       (port 5001)        │               │
//! │        ▼                                  │      │                          ▼               │
//! │  DiscoveryService ════════════════════════╪═bcast╪══▶ DiscoveryService   Playback/injection │
//! │  (port 5002, presence + expiry)           │      │                       collaborator       │
//! └───────────────────────────────────────────┘      └──────────────────────────────────────────┘
//! ```
//!
//! The data plane is raw PCM in sequenced UDP packets; the control plane
//! is a length-prefixed TCP message channel driving the session state
//! machine; discovery is JSON descriptors broadcast over UDP with
//! timeout-based expiry. Capture and playback devices are external
//! collaborators that push and consume PCM through the session API.

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default UDP port for audio packets
    pub const DEFAULT_AUDIO_PORT: u16 = 5000;

    /// Default TCP port for the control channel
    pub const DEFAULT_CONTROL_PORT: u16 = 5001;

    /// Default UDP port for discovery broadcasts
    pub const DEFAULT_DISCOVERY_PORT: u16 = 5002;

    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Largest UDP payload we will send or receive; raw 20 ms PCM frames
    /// exceed a single MTU and rely on IP fragmentation on the LAN
    pub const MAX_PACKET_SIZE: usize = 65_507;
}
