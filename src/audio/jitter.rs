//! Jitter buffer for packet reordering and loss accounting
//!
//! Ingests audio packets as they arrive off the network, holds a small
//! lookahead to absorb reordering, and releases a strictly increasing
//! sequence to the playback side. Sequence numbers live on a 32-bit
//! circle, so every ahead/behind decision goes through modular distance
//! rather than plain comparison.
//!
//! The producer (`receive`, network task) and the consumer (`next`,
//! playback poll) run on different tasks; the pending map is a `DashMap`
//! and all cursors and counters are atomics, so neither caller needs a
//! lock of its own.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::audio::format::AudioFormat;
use crate::config::JitterConfig;
use crate::protocol::AudioPacket;

/// Modular distance from `a` forward to `b` on the 32-bit circle
///
/// `b - a` when `b >= a`, otherwise `(2^32 - a) + b`.
pub fn seq_distance(a: u32, b: u32) -> u32 {
    b.wrapping_sub(a)
}

/// True when `seq` is ahead of `from` by less than `window`
fn is_ahead(seq: u32, from: u32, window: u32) -> bool {
    let d = seq_distance(from, seq);
    d > 0 && d < window
}

/// True when `seq` trails `behind_of` by less than `window`
fn is_behind(seq: u32, behind_of: u32, window: u32) -> bool {
    let d = seq_distance(seq, behind_of);
    d > 0 && d < window
}

/// Reordering buffer for one inbound audio stream
///
/// The first packet received locks the stream format and the starting
/// sequence. A duplicate sequence number overwrites the pending entry
/// rather than accumulating; under retransmission the later copy wins.
pub struct JitterBuffer {
    pending: DashMap<u32, AudioPacket>,
    config: JitterConfig,
    /// Next sequence the consumer wants
    expected: AtomicU32,
    /// Last sequence handed to the consumer; anchors the behind-window purge
    last_released: AtomicU32,
    /// First packet seen, cursors and format are locked
    primed: AtomicBool,
    /// Initial lookahead reached at least once; holdback no longer applies
    filled: AtomicBool,
    format: Mutex<Option<AudioFormat>>,
    received: AtomicU64,
    lost: AtomicU64,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        Self {
            pending: DashMap::new(),
            config,
            expected: AtomicU32::new(0),
            last_released: AtomicU32::new(0),
            primed: AtomicBool::new(false),
            filled: AtomicBool::new(false),
            format: Mutex::new(None),
            received: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        }
    }

    /// Ingest an arriving packet
    ///
    /// Called from the network receive task.
    pub fn receive(&self, packet: AudioPacket) {
        self.received.fetch_add(1, Ordering::Relaxed);

        if !self.primed.swap(true, Ordering::AcqRel) {
            self.expected.store(packet.sequence, Ordering::Release);
            // Seeding last_released keeps the purge from treating the
            // opening packets of a stream that starts near the wraparound
            // point as stale.
            self.last_released.store(packet.sequence, Ordering::Release);
            *self.format.lock() = Some(packet.format());
        }

        self.pending.insert(packet.sequence, packet);
        self.purge_stale();
    }

    /// Release the next playable packet, if any
    ///
    /// Called from the playback/consumer task. Returns `None` while the
    /// initial lookahead is filling or while the buffer is still waiting
    /// on a gap that may yet be filled by a late arrival.
    pub fn next(&self) -> Option<AudioPacket> {
        if !self.primed.load(Ordering::Acquire) {
            return None;
        }

        // Hold back output until the initial lookahead has been
        // accumulated once; after that the buffer drains freely.
        if !self.filled.load(Ordering::Acquire) {
            if self.pending.len() < self.config.playout_depth {
                return None;
            }
            self.filled.store(true, Ordering::Release);
        }

        let expected = self.expected.load(Ordering::Acquire);
        if let Some((seq, packet)) = self.pending.remove(&expected) {
            self.advance(seq);
            return Some(packet);
        }

        // The expected packet is missing. If the oldest pending packet is
        // only a short distance ahead, write the gap off as loss and jump
        // to it; otherwise keep waiting.
        let oldest = self
            .pending
            .iter()
            .map(|entry| *entry.key())
            .min_by_key(|&seq| seq_distance(expected, seq))?;

        if is_ahead(oldest, expected, self.config.ahead_window) {
            let skipped = seq_distance(expected, oldest);
            self.lost.fetch_add(skipped as u64, Ordering::Relaxed);

            if let Some((seq, packet)) = self.pending.remove(&oldest) {
                self.advance(seq);
                return Some(packet);
            }
        }

        None
    }

    fn advance(&self, released: u32) {
        self.last_released.store(released, Ordering::Release);
        self.expected
            .store(released.wrapping_add(1), Ordering::Release);
    }

    /// Drop entries too far behind the release cursor to ever be played,
    /// bounding memory against packets that arrive hopelessly late
    fn purge_stale(&self) {
        let anchor = self.last_released.load(Ordering::Acquire);
        let window = self.config.behind_window;
        self.pending
            .retain(|&seq, _| !is_behind(seq, anchor, window));
    }

    /// Fraction of the stream lost so far; 0 before any traffic
    pub fn loss_rate(&self) -> f64 {
        let lost = self.lost.load(Ordering::Relaxed);
        let received = self.received.load(Ordering::Relaxed);
        let total = lost + received;
        if total == 0 {
            0.0
        } else {
            lost as f64 / total as f64
        }
    }

    /// Stream format locked in by the first packet
    pub fn format(&self) -> Option<AudioFormat> {
        *self.format.lock()
    }

    /// Counter snapshot
    pub fn stats(&self) -> JitterStats {
        JitterStats {
            received: self.received.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            pending: self.pending.len(),
            loss_rate: self.loss_rate(),
        }
    }

    /// Forget the current stream; the next packet received re-locks the
    /// format and cursors
    pub fn reset(&self) {
        self.pending.clear();
        self.expected.store(0, Ordering::Release);
        self.last_released.store(0, Ordering::Release);
        self.primed.store(false, Ordering::Release);
        self.filled.store(false, Ordering::Release);
        *self.format.lock() = None;
        self.received.store(0, Ordering::Relaxed);
        self.lost.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time jitter buffer counters
#[derive(Debug, Clone)]
pub struct JitterStats {
    pub received: u64,
    pub lost: u64,
    pub pending: usize,
    pub loss_rate: f64,
}
