//! MQTT fixed-header framing.
//!
//! Cuts complete packets out of a connection's read buffer. A framed
//! [`MqttPacket`] is immutable: packet type, QoS bits and raw bytes are
//! fixed once the constructor has consumed them from the buffer.

use crate::buffer::CircularBuffer;
use crate::error::{ProtocolError, Result};
use crate::varint;

/// Hard cap on any packet, authenticated or not. MQTT's remaining
/// length field cannot express more than this plus the header anyway.
pub const ABSOLUTE_MAX_PACKET_SIZE: usize = 256 * 1024 * 1024;

/// Clients that have not completed CONNECT are held to a much smaller
/// cap; anything bigger is taken for line noise.
pub const UNAUTHENTICATED_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Minimum bytes needed before the fixed header can be inspected.
pub const MQTT_HEADER_LENGTH: usize = 2;

/// MQTT control packet types (the high nibble of the first byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            other => Err(ProtocolError::InvalidPacketType(other)),
        }
    }
}

/// A single MQTT packet, either framed off the wire or built for
/// sending.
///
/// Framed packets carry their fixed header in `bites`; constructed
/// packets carry only the variable header and payload, and the fixed
/// header is synthesized when the packet is written out.
#[derive(Debug, Clone)]
pub struct MqttPacket {
    pub packet_type: PacketType,
    pub first_byte: u8,
    bites: Vec<u8>,
    /// Offset of the variable header within `bites` for framed
    /// packets; 0 for constructed packets.
    fixed_header_length: usize,
    contains_fixed_header: bool,
}

impl MqttPacket {
    /// Frame a packet by consuming exactly `packet_length` bytes from
    /// the read buffer. `fixed_header_length` is the 1-byte type/flags
    /// field plus the remaining-length bytes, as counted by the framer.
    pub fn from_buffer(
        buf: &mut CircularBuffer,
        packet_length: usize,
        fixed_header_length: usize,
    ) -> Result<Self> {
        debug_assert!(packet_length <= buf.used_bytes());
        let bites = buf.take_bytes(packet_length);
        let first_byte = bites[0];
        let packet_type = PacketType::try_from(first_byte >> 4)?;

        if packet_type == PacketType::Publish && (first_byte & 0b0000_0110) == 0b0000_0110 {
            return Err(ProtocolError::MalformedPacket("PUBLISH with QoS 3").into());
        }

        Ok(Self {
            packet_type,
            first_byte,
            bites,
            fixed_header_length,
            contains_fixed_header: true,
        })
    }

    /// Build an outgoing packet from its variable header and payload.
    /// `flags` are the low nibble of the first byte.
    pub fn outgoing(packet_type: PacketType, flags: u8, bites: Vec<u8>) -> Self {
        debug_assert!(flags <= 0x0F);
        Self {
            packet_type,
            first_byte: ((packet_type as u8) << 4) | flags,
            bites,
            fixed_header_length: 0,
            contains_fixed_header: false,
        }
    }

    /// QoS bits of the first byte (meaningful for PUBLISH).
    #[inline]
    pub fn qos(&self) -> u8 {
        (self.first_byte & 0b0000_0110) >> 1
    }

    #[inline]
    pub fn retain(&self) -> bool {
        self.first_byte & 0b0000_0001 != 0
    }

    #[inline]
    pub fn dup(&self) -> bool {
        self.first_byte & 0b0000_1000 != 0
    }

    /// Variable header plus payload, without the fixed header.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.bites[self.fixed_header_length..]
    }

    #[inline]
    pub fn remaining_length(&self) -> usize {
        self.bites.len() - self.fixed_header_length
    }

    /// Total wire size, counting the fixed header whether or not it is
    /// materialized in `bites` yet.
    pub fn size_including_non_present_header(&self) -> usize {
        if self.contains_fixed_header {
            self.bites.len()
        } else {
            1 + varint::encoded_len(self.bites.len()) + self.bites.len()
        }
    }

    /// Serialize into a write buffer. The caller has already grown the
    /// buffer; this only copies bytes.
    pub fn write_to(&self, buf: &mut CircularBuffer) {
        if self.contains_fixed_header {
            buf.write(&self.bites);
        } else {
            let mut header = [0u8; 5];
            header[0] = self.first_byte;
            let mut header_len = 1;
            let mut remaining = Vec::with_capacity(4);
            varint::encode_to_vec(self.bites.len(), &mut remaining);
            header[1..1 + remaining.len()].copy_from_slice(&remaining);
            header_len += remaining.len();
            buf.write(&header[..header_len]);
            buf.write(&self.bites);
        }
    }
}

/// Drain as many complete packets as possible from `buf` into `out`.
///
/// Returns normally when the buffer holds no further complete packet
/// ("need more"). Errors mean the stream is unrecoverable and the
/// connection must go.
pub fn drain_packets(
    buf: &mut CircularBuffer,
    authenticated: bool,
    out: &mut Vec<MqttPacket>,
) -> Result<()> {
    while buf.used_bytes() >= MQTT_HEADER_LENGTH {
        // Decode the remaining-length varint by peeking; nothing is
        // consumed until the whole packet is present.
        let mut fixed_header_length = 1;
        let mut multiplier: usize = 1;
        let mut packet_length: usize = 0;
        loop {
            fixed_header_length += 1;
            if fixed_header_length > 5 {
                return Err(ProtocolError::InvalidRemainingLength.into());
            }
            if fixed_header_length > buf.used_bytes() {
                // The length field itself is incomplete.
                return Ok(());
            }
            let byte = buf.peek_ahead(fixed_header_length - 1);
            packet_length += ((byte & 0x7F) as usize) * multiplier;
            multiplier *= 128;
            if multiplier > 128 * 128 * 128 * 128 {
                return Err(ProtocolError::InvalidRemainingLength.into());
            }
            if byte & 0x80 == 0 {
                break;
            }
        }
        packet_length += fixed_header_length;

        if !authenticated && packet_length >= UNAUTHENTICATED_MAX_PACKET_SIZE {
            return Err(ProtocolError::OversizedPreAuthPacket(packet_length).into());
        }
        if packet_length > ABSOLUTE_MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: packet_length,
                max: ABSOLUTE_MAX_PACKET_SIZE,
            }
            .into());
        }

        if packet_length <= buf.used_bytes() {
            out.push(MqttPacket::from_buffer(buf, packet_length, fixed_header_length)?);
        } else {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(bytes: &[u8]) -> CircularBuffer {
        let mut buf = CircularBuffer::new(2048);
        buf.write(bytes);
        buf
    }

    #[test]
    fn frames_single_packet() {
        // PINGREQ: 0xC0 0x00
        let mut buf = buffer_with(&[0xC0, 0x00]);
        let mut out = Vec::new();
        drain_packets(&mut buf, true, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].packet_type, PacketType::Pingreq);
        assert_eq!(out[0].remaining_length(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn frames_multiple_packets_in_one_pass() {
        // Two QoS 0 PUBLISHes to "a/b" with payloads "x" and "yz".
        let mut bytes = vec![0x30, 6, 0, 3, b'a', b'/', b'b', b'x'];
        bytes.extend_from_slice(&[0x30, 7, 0, 3, b'a', b'/', b'b', b'y', b'z']);
        let mut buf = buffer_with(&bytes);

        let mut out = Vec::new();
        drain_packets(&mut buf, true, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload()[2..5], [b'a', b'/', b'b']);
        assert_eq!(out[1].remaining_length(), 7);
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_packet_needs_more() {
        // Claims 10 remaining bytes, provides 3.
        let mut buf = buffer_with(&[0x30, 10, 0, 3, b'a']);
        let mut out = Vec::new();
        drain_packets(&mut buf, true, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(buf.used_bytes(), 5);
    }

    #[test]
    fn incomplete_varint_needs_more() {
        let mut buf = buffer_with(&[0x30, 0x80]);
        let mut out = Vec::new();
        drain_packets(&mut buf, true, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn overlong_varint_is_malformed() {
        let mut buf = buffer_with(&[0x30, 0x80, 0x80, 0x80, 0x80, 0x01]);
        let mut out = Vec::new();
        assert!(drain_packets(&mut buf, true, &mut out).is_err());
    }

    #[test]
    fn unauthenticated_megabyte_is_rejected() {
        // Remaining length of exactly 1 MiB decodes fine, but a
        // pre-auth packet this size is treated as garbage.
        let header = [0x30, 0x80, 0x80, 0x40];
        let mut buf = buffer_with(&header);
        let mut out = Vec::new();
        assert!(drain_packets(&mut buf, false, &mut out).is_err());

        // The same length from an authenticated client passes the
        // pre-auth check (and then waits for more data).
        let mut buf = buffer_with(&header);
        assert!(drain_packets(&mut buf, true, &mut out).is_ok());
        assert!(out.is_empty());
    }

    #[test]
    fn absolute_maximum_is_enforced() {
        // The largest encodable remaining length plus its header
        // exceeds the 256 MiB absolute cap.
        let mut buf = buffer_with(&[0x30, 0xFF, 0xFF, 0xFF, 0x7F]);
        let mut out = Vec::new();
        assert!(drain_packets(&mut buf, true, &mut out).is_err());
    }

    #[test]
    fn publish_qos3_is_malformed() {
        let mut buf = buffer_with(&[0x36, 4, 0, 1, b'a', b'x']);
        let mut out = Vec::new();
        assert!(drain_packets(&mut buf, true, &mut out).is_err());
    }

    #[test]
    fn outgoing_write_to_synthesizes_header() {
        let pkt = MqttPacket::outgoing(PacketType::Suback, 0, vec![0, 1, 0]);
        assert_eq!(pkt.size_including_non_present_header(), 5);

        let mut buf = CircularBuffer::new(64);
        pkt.write_to(&mut buf);
        assert_eq!(buf.take_bytes(5), vec![0x90, 3, 0, 1, 0]);
    }

    #[test]
    fn framed_write_to_is_verbatim() {
        let wire = vec![0x30u8, 4, 0, 1, b'a', b'x'];
        let mut buf = buffer_with(&wire);
        let mut out = Vec::new();
        drain_packets(&mut buf, true, &mut out).unwrap();

        let mut dst = CircularBuffer::new(64);
        out[0].write_to(&mut dst);
        assert_eq!(dst.take_bytes(wire.len()), wire);
    }
}
