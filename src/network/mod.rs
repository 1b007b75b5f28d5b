//! Network subsystem: UDP audio transport, TCP control channel, and
//! broadcast discovery
//!
//! Each channel runs its receive path as an independent background task
//! that dispatches to a registered observer inline. Stopping a channel
//! cancels the task, unblocks any pending receive, and awaits termination
//! before returning.

pub mod control;
pub mod discovery;
pub mod udp;

pub use control::{ChannelState, ControlChannel, ControlEvents};
pub use discovery::{DeviceDescriptor, DiscoveryEvents, DiscoveryService};
pub use udp::{AudioEvents, TransportStats, UdpTransport};
