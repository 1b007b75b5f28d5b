//! Error types for the relay
//!
//! Protocol-level decode failures are deliberately not errors: a corrupt
//! datagram or message is dropped where it arrives and must never abort a
//! stream, so the codecs return `Option` instead.

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

/// Session state machine errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Operation requires status {required}, current status is {current}")]
    InvalidState {
        required: &'static str,
        current: &'static str,
    },

    #[error("No remote peer configured")]
    NoRemotePeer,

    #[error("Session already started")]
    AlreadyStarted,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
