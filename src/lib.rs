//! WebSocket framing and per-connection protocol handling.
//!
//! The crate starts where the HTTP upgrade ends: [`frame`] decodes and encodes
//! wire frames, [`handshake`] checks upgrade headers, and [`Session`] drives
//! one connection from the first frame to the close handshake.

use thiserror::Error;

mod config;
pub mod frame;
pub mod handshake;
pub mod mask;
mod session;

pub use config::Config;
pub use frame::{Frame, OpCode, Parsed};
pub use session::{ConnectionState, Echo, Handler, Message, Phase, Session};

/// Close code sent for every protocol violation.
pub const PROTOCOL_ERROR: u16 = 1002;

/// Represents errors that can occur in WebSocket operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The upgrade request or response was rejected.
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// The peer violated the framing protocol.
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Reasons an upgrade is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The HTTP head was cut short, too long, or not UTF-8.
    #[error("malformed HTTP head")]
    Malformed,
    /// The request method is not `GET`.
    #[error("unsupported method {0}")]
    Method(String),
    /// A required header is absent.
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    /// `Upgrade` names something other than `websocket`.
    #[error("Upgrade header is {0:?}, expected websocket")]
    InvalidUpgrade(String),
    /// `Connection` does not list an `upgrade` token.
    #[error("Connection header has no upgrade token")]
    MissingConnectionUpgrade,
    /// `Sec-WebSocket-Key` is present but blank.
    #[error("empty Sec-WebSocket-Key")]
    EmptyKey,
    /// `Sec-WebSocket-Version` is not `13`.
    #[error("unsupported Sec-WebSocket-Version {0:?}")]
    UnsupportedVersion(String),
    /// The server answered with something other than `101`.
    #[error("upgrade refused: {0}")]
    Rejected(String),
    /// The server's accept token was not derived from our key.
    #[error("Sec-WebSocket-Accept does not match the request key")]
    AcceptMismatch,
}

/// Framing violations. Each one ends the connection, with a `Close(1002)`
/// unless our own Close was already sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A 64-bit length declared 2^32 bytes or more.
    #[error("declared frame length {declared} exceeds 32 bits")]
    FrameTooLarge { declared: u64 },
    /// A continuation frame arrived while no message was being reassembled.
    #[error("continuation frame without a message in progress")]
    ContinuationWithoutStart,
    /// RSV1-3 were set and reserved bits are rejected.
    #[error("reserved bits {0:#05b} set without a negotiated extension")]
    ReservedBits(u8),
    /// A frame had no masking key and masking is required.
    #[error("client frame is not masked")]
    UnmaskedFrame,
}

impl ProtocolError {
    /// The status code for the close frame that reports this error.
    pub fn close_code(&self) -> u16 {
        PROTOCOL_ERROR
    }
}

/// A Result type alias for WebSocket operations.
pub type Result<T> = std::result::Result<T, Error>;
