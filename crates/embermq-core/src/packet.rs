//! Typed MQTT packet parsing and encoding.
//!
//! The framer ([`crate::codec`]) hands over raw [`MqttPacket`]s; this
//! module reads their variable headers into typed structs and builds
//! the broker's outgoing packets. MQTT 5 properties are parsed far
//! enough to extract what the broker acts on (session expiry, will
//! delay) and to skip the rest correctly.

use bytes::Bytes;

use crate::codec::{MqttPacket, PacketType};
use crate::error::{ProtocolError, Result};
use crate::varint;

/// MQTT 5 reason codes used by the broker (also doubles as the CONNACK
/// reason byte for v5).
pub mod reason {
    pub const SUCCESS: u8 = 0x00;
    pub const NORMAL_DISCONNECTION: u8 = 0x00;
    pub const UNSPECIFIED_ERROR: u8 = 0x80;
    pub const MALFORMED_PACKET: u8 = 0x81;
    pub const PROTOCOL_ERROR: u8 = 0x82;
    pub const CLIENT_ID_NOT_VALID: u8 = 0x85;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const KEEP_ALIVE_TIMEOUT: u8 = 0x8D;
    pub const SESSION_TAKEN_OVER: u8 = 0x8E;
    pub const TOPIC_FILTER_INVALID: u8 = 0x8F;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolVersion {
    Mqtt31 = 3,
    Mqtt311 = 4,
    Mqtt5 = 5,
}

impl ProtocolVersion {
    #[inline]
    pub fn is_v5(self) -> bool {
        self == ProtocolVersion::Mqtt5
    }
}

/// Last-will registration carried in CONNECT.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
    /// MQTT 5 Will Delay Interval in seconds; 0 for immediate.
    pub delay_interval: u32,
}

#[derive(Debug, Clone)]
pub struct Connect {
    pub protocol_version: ProtocolVersion,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub keep_alive: u16,
    pub clean_start: bool,
    /// MQTT 5 Session Expiry Interval from the CONNECT properties.
    pub session_expiry_interval: Option<u32>,
    pub will: Option<Will>,
}

/// An application message, decoupled from any one wire encoding so it
/// can be re-encoded per receiver during fan-out.
#[derive(Debug, Clone)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: u8) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscribe {
    pub packet_id: u16,
    /// `(filter, requested_qos)` pairs.
    pub topics: Vec<(String, u8)>,
}

#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// Incoming PUBLISH with its wire details.
#[derive(Debug, Clone)]
pub struct IncomingPublish {
    pub publish: Publish,
    pub packet_id: Option<u16>,
    pub dup: bool,
}

// === Cursor ===

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::MalformedPacket("truncated field").into());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_varint(&mut self) -> Result<usize> {
        match varint::decode(&self.buf[self.pos..])? {
            Some((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            None => Err(ProtocolError::MalformedPacket("truncated varint").into()),
        }
    }

    /// Length-prefixed UTF-8 string.
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    /// Length-prefixed binary data.
    fn read_binary(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

// === MQTT 5 properties ===

#[derive(Debug, Default)]
struct Properties {
    session_expiry_interval: Option<u32>,
    will_delay_interval: Option<u32>,
}

/// Read one property block: varint length, then id/value pairs. Values
/// the broker does not act on are skipped by their type class.
fn read_properties(r: &mut Reader<'_>) -> Result<Properties> {
    let mut props = Properties::default();
    let len = r.read_varint()?;
    let end = r.pos + len;
    if end > r.buf.len() {
        return Err(ProtocolError::MalformedPacket("property length past packet end").into());
    }

    while r.pos < end {
        let id = r.read_u8()?;
        match id {
            0x11 => props.session_expiry_interval = Some(r.read_u32()?),
            0x18 => props.will_delay_interval = Some(r.read_u32()?),
            // Byte
            0x01 | 0x17 | 0x19 | 0x24 | 0x25 | 0x28 | 0x29 | 0x2A => {
                r.read_u8()?;
            }
            // Two byte integer
            0x13 | 0x21 | 0x22 | 0x23 => {
                r.read_u16()?;
            }
            // Four byte integer
            0x02 | 0x27 => {
                r.read_u32()?;
            }
            // Variable byte integer
            0x0B => {
                r.read_varint()?;
            }
            // UTF-8 string
            0x03 | 0x08 | 0x12 | 0x15 | 0x1A | 0x1C | 0x1F => {
                r.read_string()?;
            }
            // Binary data
            0x09 | 0x16 => {
                r.read_binary()?;
            }
            // String pair
            0x26 => {
                r.read_string()?;
                r.read_string()?;
            }
            _ => return Err(ProtocolError::MalformedPacket("unknown property id").into()),
        }
    }

    if r.pos != end {
        return Err(ProtocolError::MalformedPacket("property crossed block boundary").into());
    }

    Ok(props)
}

// === Parsing ===

pub fn parse_connect(pkt: &MqttPacket) -> Result<Connect> {
    let mut r = Reader::new(pkt.payload());

    let protocol_name = r.read_string()?;
    let level = r.read_u8()?;
    let protocol_version = match (protocol_name.as_str(), level) {
        ("MQIsdp", 3) => ProtocolVersion::Mqtt31,
        ("MQTT", 4) => ProtocolVersion::Mqtt311,
        ("MQTT", 5) => ProtocolVersion::Mqtt5,
        ("MQTT", other) | ("MQIsdp", other) => {
            return Err(ProtocolError::UnsupportedProtocolVersion(other).into())
        }
        _ => return Err(ProtocolError::InvalidProtocolName.into()),
    };

    let flags = r.read_u8()?;
    if flags & 0x01 != 0 {
        return Err(ProtocolError::MalformedPacket("reserved connect flag set").into());
    }
    let clean_start = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos = (flags >> 3) & 0x03;
    let will_retain = flags & 0x20 != 0;
    let has_password = flags & 0x40 != 0;
    let has_username = flags & 0x80 != 0;

    if will_qos > 2 || (!will_flag && (will_qos != 0 || will_retain)) {
        return Err(ProtocolError::MalformedPacket("invalid will flags").into());
    }

    let keep_alive = r.read_u16()?;

    let mut session_expiry_interval = None;
    if protocol_version.is_v5() {
        let props = read_properties(&mut r)?;
        session_expiry_interval = props.session_expiry_interval;
    }

    let client_id = r.read_string()?;

    let will = if will_flag {
        let mut delay_interval = 0;
        if protocol_version.is_v5() {
            let props = read_properties(&mut r)?;
            delay_interval = props.will_delay_interval.unwrap_or(0);
        }
        let topic = r.read_string()?;
        let payload = Bytes::copy_from_slice(r.read_binary()?);
        Some(Will {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
            delay_interval,
        })
    } else {
        None
    };

    let username = if has_username { Some(r.read_string()?) } else { None };
    let password = if has_password {
        Some(r.read_binary()?.to_vec())
    } else {
        None
    };

    Ok(Connect {
        protocol_version,
        client_id,
        username,
        password,
        keep_alive,
        clean_start,
        session_expiry_interval,
        will,
    })
}

pub fn parse_publish(pkt: &MqttPacket, version: ProtocolVersion) -> Result<IncomingPublish> {
    debug_assert_eq!(pkt.packet_type, PacketType::Publish);
    let mut r = Reader::new(pkt.payload());

    let topic = r.read_string()?;
    if topic.is_empty() {
        return Err(ProtocolError::MalformedPacket("empty publish topic").into());
    }
    if topic.contains(['+', '#']) {
        return Err(ProtocolError::MalformedPacket("wildcard in publish topic").into());
    }

    let qos = pkt.qos();
    let packet_id = if qos > 0 {
        let id = r.read_u16()?;
        if id == 0 {
            return Err(ProtocolError::MalformedPacket("packet id 0").into());
        }
        Some(id)
    } else {
        None
    };

    if version.is_v5() {
        let len = r.read_varint()?;
        r.take(len)?;
    }

    let payload = Bytes::copy_from_slice(r.rest());

    Ok(IncomingPublish {
        publish: Publish {
            topic,
            payload,
            qos,
            retain: pkt.retain(),
        },
        packet_id,
        dup: pkt.dup(),
    })
}

pub fn parse_subscribe(pkt: &MqttPacket, version: ProtocolVersion) -> Result<Subscribe> {
    if pkt.first_byte & 0x0F != 0x02 {
        return Err(ProtocolError::MalformedPacket("bad SUBSCRIBE flags").into());
    }
    let mut r = Reader::new(pkt.payload());

    let packet_id = r.read_u16()?;
    if version.is_v5() {
        let len = r.read_varint()?;
        r.take(len)?;
    }

    let mut topics = Vec::new();
    while r.remaining() > 0 {
        let filter = r.read_string()?;
        let options = r.read_u8()?;
        let qos = options & 0x03;
        if qos > 2 {
            return Err(ProtocolError::MalformedPacket("subscription QoS 3").into());
        }
        topics.push((filter, qos));
    }
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE without filters").into());
    }

    Ok(Subscribe { packet_id, topics })
}

pub fn parse_unsubscribe(pkt: &MqttPacket, version: ProtocolVersion) -> Result<Unsubscribe> {
    if pkt.first_byte & 0x0F != 0x02 {
        return Err(ProtocolError::MalformedPacket("bad UNSUBSCRIBE flags").into());
    }
    let mut r = Reader::new(pkt.payload());

    let packet_id = r.read_u16()?;
    if version.is_v5() {
        let len = r.read_varint()?;
        r.take(len)?;
    }

    let mut topics = Vec::new();
    while r.remaining() > 0 {
        topics.push(r.read_string()?);
    }
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("UNSUBSCRIBE without filters").into());
    }

    Ok(Unsubscribe { packet_id, topics })
}

/// Packet id of a PUBACK/PUBREC/PUBREL/PUBCOMP.
pub fn parse_packet_id(pkt: &MqttPacket) -> Result<u16> {
    let mut r = Reader::new(pkt.payload());
    r.read_u16()
}

// === Encoding ===

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// CONNACK. `reason_code` uses the MQTT 5 values; for older protocol
/// versions it is translated to the v3 return-code table.
pub fn conn_ack(version: ProtocolVersion, reason_code: u8, session_present: bool) -> MqttPacket {
    let ack_flags = u8::from(session_present);
    let bites = if version.is_v5() {
        // No properties advertised.
        vec![ack_flags, reason_code, 0]
    } else {
        let v3_code = match reason_code {
            reason::SUCCESS => 0,
            reason::CLIENT_ID_NOT_VALID => 2,
            reason::NOT_AUTHORIZED => 5,
            _ => 3, // server unavailable
        };
        vec![ack_flags, v3_code]
    };
    MqttPacket::outgoing(PacketType::Connack, 0, bites)
}

/// PUBACK / PUBREC / PUBREL / PUBCOMP.
pub fn pub_response(packet_type: PacketType, packet_id: u16) -> MqttPacket {
    debug_assert!(matches!(
        packet_type,
        PacketType::Puback | PacketType::Pubrec | PacketType::Pubrel | PacketType::Pubcomp
    ));
    let flags = if packet_type == PacketType::Pubrel { 0x02 } else { 0 };
    MqttPacket::outgoing(packet_type, flags, packet_id.to_be_bytes().to_vec())
}

pub fn sub_ack(version: ProtocolVersion, packet_id: u16, return_codes: &[u8]) -> MqttPacket {
    let mut bites = Vec::with_capacity(3 + return_codes.len());
    bites.extend_from_slice(&packet_id.to_be_bytes());
    if version.is_v5() {
        bites.push(0);
    }
    bites.extend_from_slice(return_codes);
    MqttPacket::outgoing(PacketType::Suback, 0, bites)
}

pub fn unsub_ack(version: ProtocolVersion, packet_id: u16, filter_count: usize) -> MqttPacket {
    let mut bites = Vec::with_capacity(3 + filter_count);
    bites.extend_from_slice(&packet_id.to_be_bytes());
    if version.is_v5() {
        bites.push(0);
        // One success code per filter; the tree removes what exists.
        bites.extend(std::iter::repeat(reason::SUCCESS).take(filter_count));
    }
    MqttPacket::outgoing(PacketType::Unsuback, 0, bites)
}

/// Server-side DISCONNECT. Only MQTT 5 has a reason code on the wire;
/// for older versions the caller just closes the socket instead.
pub fn disconnect(reason_code: u8) -> MqttPacket {
    MqttPacket::outgoing(PacketType::Disconnect, 0, vec![reason_code, 0])
}

/// Encode a PUBLISH for one receiver at its effective QoS.
pub fn publish_packet(
    publish: &Publish,
    effective_qos: u8,
    packet_id: Option<u16>,
    retain: bool,
    version: ProtocolVersion,
) -> MqttPacket {
    debug_assert_eq!(effective_qos > 0, packet_id.is_some());

    let mut bites =
        Vec::with_capacity(2 + publish.topic.len() + 3 + publish.payload.len());
    write_string(&mut bites, &publish.topic);
    if let Some(id) = packet_id {
        bites.extend_from_slice(&id.to_be_bytes());
    }
    if version.is_v5() {
        bites.push(0);
    }
    bites.extend_from_slice(&publish.payload);

    let flags = (effective_qos << 1) | u8::from(retain);
    MqttPacket::outgoing(PacketType::Publish, flags, bites)
}
