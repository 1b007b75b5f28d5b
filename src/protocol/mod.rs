//! Wire protocol for audio packets and control messages
//!
//! Pure (de)serialization with no I/O. The audio packet header and the
//! control message frame are both fixed little-endian layouts shared with
//! every peer on the network.

pub mod message;
pub mod packet;

pub use message::{ControlMessage, MessageType};
pub use packet::AudioPacket;
