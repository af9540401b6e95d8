//! Error types for embermq.

use std::io;

use thiserror::Error;

/// Main error type for embermq.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// MQTT protocol errors.
///
/// Everything that should cost a client its connection, as opposed to
/// I/O conditions (`WouldBlock`, `Interrupted`) which are handled in
/// place by the read/write loops.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("packet of {size} bytes exceeds the protocol maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("unauthenticated client sent a packet of {0} bytes, likely garbage")]
    OversizedPreAuthPacket(usize),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("invalid protocol name")]
    InvalidProtocolName,

    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("client identifier rejected")]
    BadClientId,

    #[error("not authorized")]
    NotAuthorized,

    #[error("first packet must be CONNECT")]
    FirstPacketNotConnect,

    #[error("packet not allowed in this connection state")]
    UnexpectedPacket,
}

impl ProtocolError {
    /// MQTT 5 DISCONNECT reason code to send before closing on this error.
    pub fn disconnect_reason(&self) -> u8 {
        use crate::packet::reason;
        match self {
            ProtocolError::InvalidRemainingLength | ProtocolError::MalformedPacket(_) => {
                reason::MALFORMED_PACKET
            }
            ProtocolError::BadClientId => reason::CLIENT_ID_NOT_VALID,
            ProtocolError::NotAuthorized => reason::NOT_AUTHORIZED,
            _ => reason::PROTOCOL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
