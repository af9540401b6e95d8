//! embermq-core - MQTT framing building blocks.
//!
//! This crate provides the pieces that sit between a socket and the
//! broker proper: the growable circular buffer, variable byte integers,
//! the fixed-header framer, and typed packet parsing/encoding.

pub mod buffer;
pub mod codec;
pub mod error;
pub mod packet;
pub mod varint;

pub use buffer::CircularBuffer;
pub use codec::{MqttPacket, PacketType};
pub use error::{Error, ProtocolError, Result};
