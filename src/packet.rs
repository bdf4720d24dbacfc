//! # MQTT Packet Structures and Serialization
//!
//! This module defines the MQTT v3.1/v3.1.1 control packets and the traits for
//! encoding them into a frame buffer and decoding them from a received frame.
//!
//! A frame is a fixed header byte (command nibble plus flags), a remaining
//! length (1-4 bytes) and the body. Encoders compute the remaining length up
//! front, decoders receive the fixed header byte and the body separately
//! because the packet reader assembles them in separate steps.

use heapless::Vec;

use crate::error::{ArgumentError, MqttError, PacketResult, ProtocolError};
use crate::util::{
    self, put_slice, put_str16, put_u16, put_u8, read_u16, read_utf8_string,
    write_variable_byte_integer,
};

/// Maximum number of topic filters carried by one SUBSCRIBE or UNSUBSCRIBE.
pub const MAX_FILTERS: usize = 8;

pub const CONNECT: u8 = 0x10;
pub const CONNACK: u8 = 0x20;
pub const PUBLISH: u8 = 0x30;
pub const PUBACK: u8 = 0x40;
pub const PUBREC: u8 = 0x50;
pub const PUBREL: u8 = 0x60;
pub const PUBCOMP: u8 = 0x70;
pub const SUBSCRIBE: u8 = 0x80;
pub const SUBACK: u8 = 0x90;
pub const UNSUBSCRIBE: u8 = 0xA0;
pub const UNSUBACK: u8 = 0xB0;
pub const PINGREQ: u8 = 0xC0;
pub const PINGRESP: u8 = 0xD0;
pub const DISCONNECT: u8 = 0xE0;

/// Human readable name of a command nibble, for logging.
pub fn command_name(command: u8) -> &'static str {
    match command & 0xF0 {
        CONNECT => "CONNECT",
        CONNACK => "CONNACK",
        PUBLISH => "PUBLISH",
        PUBACK => "PUBACK",
        PUBREC => "PUBREC",
        PUBREL => "PUBREL",
        PUBCOMP => "PUBCOMP",
        SUBSCRIBE => "SUBSCRIBE",
        SUBACK => "SUBACK",
        UNSUBSCRIBE => "UNSUBSCRIBE",
        UNSUBACK => "UNSUBACK",
        PINGREQ => "PINGREQ",
        PINGRESP => "PINGRESP",
        DISCONNECT => "DISCONNECT",
        _ => "UNKNOWN",
    }
}

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ArgumentError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ArgumentError::InvalidQos(val)),
        }
    }
}

/// The protocol revision announced in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttVersion {
    /// MQTT 3.1, protocol name `MQIsdp`, level 3.
    V31,
    /// MQTT 3.1.1, protocol name `MQTT`, level 4.
    V311,
}

impl MqttVersion {
    pub fn protocol_name(&self) -> &'static [u8] {
        match self {
            MqttVersion::V31 => b"MQIsdp",
            MqttVersion::V311 => b"MQTT",
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            MqttVersion::V31 => 3,
            MqttVersion::V311 => 4,
        }
    }
}

/// A trait for packets that can be encoded into a frame buffer.
pub trait EncodePacket {
    /// The fixed header byte: command nibble and flags.
    fn header(&self) -> u8;

    /// Length of everything after the remaining-length field.
    fn remaining_len(&self, version: MqttVersion) -> usize;

    /// Writes the variable header and payload.
    fn encode_body<const N: usize>(
        &self,
        buf: &mut Vec<u8, N>,
        version: MqttVersion,
    ) -> PacketResult<()>;

    /// Writes the complete frame.
    fn encode<const N: usize>(&self, buf: &mut Vec<u8, N>, version: MqttVersion) -> PacketResult<()> {
        put_u8(buf, self.header())?;
        let remaining_len = self.remaining_len(version);
        write_variable_byte_integer(buf, remaining_len)?;
        let body_start = buf.len();
        self.encode_body(buf, version)?;
        debug_assert_eq!(buf.len() - body_start, remaining_len);
        Ok(())
    }
}

/// A trait for packets that can be decoded from a received frame.
pub trait DecodePacket<'a>: Sized {
    fn decode(header: u8, body: &'a [u8]) -> PacketResult<Self>;
}

/// Splits the fixed header off a complete frame.
///
/// Returns the header byte, the decoded remaining length and the number of
/// bytes the fixed header occupies.
pub fn decode_fixed_header(buf: &[u8]) -> PacketResult<(u8, usize, usize)> {
    let header = *buf
        .first()
        .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?;
    let mut cursor = 1;
    let remaining_len = util::read_variable_byte_integer(&mut cursor, buf)?;
    Ok((header, remaining_len, cursor))
}

/// Packets a client can receive from a broker.
#[derive(Debug)]
pub enum MqttPacket<'a> {
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    SubAck(SubAck),
    UnsubAck(u16),
    PingReq,
    PingResp,
}

/// Decodes a frame received from the broker.
pub fn decode(header: u8, body: &[u8]) -> PacketResult<MqttPacket<'_>> {
    let packet = match header & 0xF0 {
        CONNACK => MqttPacket::ConnAck(ConnAck::decode(header, body)?),
        PUBLISH => MqttPacket::Publish(Publish::decode(header, body)?),
        PUBACK => MqttPacket::PubAck(decode_packet_id(body)?),
        PUBREC => MqttPacket::PubRec(decode_packet_id(body)?),
        PUBREL => MqttPacket::PubRel(decode_packet_id(body)?),
        PUBCOMP => MqttPacket::PubComp(decode_packet_id(body)?),
        SUBACK => MqttPacket::SubAck(SubAck::decode(header, body)?),
        UNSUBACK => MqttPacket::UnsubAck(decode_packet_id(body)?),
        PINGREQ => MqttPacket::PingReq,
        PINGRESP => MqttPacket::PingResp,
        other => {
            return Err(MqttError::Protocol(ProtocolError::InvalidPacketType(
                other >> 4,
            )));
        }
    };
    Ok(packet)
}

fn decode_packet_id(body: &[u8]) -> PacketResult<u16> {
    if body.len() != 2 {
        return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
    }
    let mut cursor = 0;
    read_u16(&mut cursor, body)
}

// --- CONNECT Packet ---

/// Last-will message announced in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Will<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

impl<'a> Will<'a> {
    pub fn new(topic: &'a str, payload: &'a [u8], qos: QoS, retain: bool) -> Self {
        Self {
            topic,
            payload,
            qos,
            retain,
        }
    }
}

#[derive(Debug)]
pub struct Connect<'a> {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: &'a str,
    pub will: Option<Will<'a>>,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

impl<'a> Connect<'a> {
    pub fn new(client_id: &'a str, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            client_id,
            keep_alive,
            clean_session,
            will: None,
            username: None,
            password: None,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.will {
            flags |= 0x04 | ((will.qos as u8 & 0x03) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        // A password is only sent together with a username.
        if self.username.is_some() {
            flags |= 0x80;
            if self.password.is_some() {
                flags |= 0x40;
            }
        }
        flags
    }
}

impl EncodePacket for Connect<'_> {
    fn header(&self) -> u8 {
        CONNECT
    }

    fn remaining_len(&self, version: MqttVersion) -> usize {
        let mut len = 2 + version.protocol_name().len() + 1 + 1 + 2 + 2 + self.client_id.len();
        if let Some(will) = &self.will {
            len += 2 + will.topic.len() + 2 + will.payload.len();
        }
        if let Some(username) = self.username {
            len += 2 + username.len();
            if let Some(password) = self.password {
                len += 2 + password.len();
            }
        }
        len
    }

    fn encode_body<const N: usize>(
        &self,
        buf: &mut Vec<u8, N>,
        version: MqttVersion,
    ) -> PacketResult<()> {
        put_str16(buf, version.protocol_name())?;
        put_u8(buf, version.level())?;
        put_u8(buf, self.flags())?;
        put_u16(buf, self.keep_alive)?;
        put_str16(buf, self.client_id.as_bytes())?;
        if let Some(will) = &self.will {
            put_str16(buf, will.topic.as_bytes())?;
            put_str16(buf, will.payload)?;
        }
        if let Some(username) = self.username {
            put_str16(buf, username.as_bytes())?;
            if let Some(password) = self.password {
                put_str16(buf, password)?;
            }
        }
        Ok(())
    }
}

// --- CONNACK Packet ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: u8,
}

impl<'a> DecodePacket<'a> for ConnAck {
    fn decode(_header: u8, body: &'a [u8]) -> PacketResult<Self> {
        match body {
            [flags, code] => Ok(Self {
                session_present: flags & 0x01 != 0,
                return_code: *code,
            }),
            _ => Err(MqttError::Protocol(ProtocolError::MalformedPacket)),
        }
    }
}

// --- PUBLISH Packet ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub payload: &'a [u8],
    pub packet_id: Option<u16>,
}

impl<'a> Publish<'a> {
    /// Message id, or 0 for QoS 0.
    pub fn mid(&self) -> u16 {
        self.packet_id.unwrap_or(0)
    }
}

impl<'a> DecodePacket<'a> for Publish<'a> {
    fn decode(header: u8, body: &'a [u8]) -> PacketResult<Self> {
        let qos = match (header >> 1) & 0x03 {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => return Err(MqttError::Protocol(ProtocolError::InvalidQos(other))),
        };

        let mut cursor = 0;
        let topic = read_utf8_string(&mut cursor, body)?;
        if topic.is_empty() {
            return Err(MqttError::Protocol(ProtocolError::EmptyTopic));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            Some(read_u16(&mut cursor, body)?)
        } else {
            None
        };

        Ok(Publish {
            topic,
            qos,
            retain: header & 0x01 != 0,
            dup: header & 0x08 != 0,
            payload: &body[cursor..],
            packet_id,
        })
    }
}

impl EncodePacket for Publish<'_> {
    fn header(&self) -> u8 {
        let mut header = PUBLISH | ((self.qos as u8) << 1);
        if self.dup {
            header |= 0x08;
        }
        if self.retain {
            header |= 0x01;
        }
        header
    }

    fn remaining_len(&self, _version: MqttVersion) -> usize {
        let id_len = if self.qos != QoS::AtMostOnce { 2 } else { 0 };
        2 + self.topic.len() + id_len + self.payload.len()
    }

    fn encode_body<const N: usize>(
        &self,
        buf: &mut Vec<u8, N>,
        _version: MqttVersion,
    ) -> PacketResult<()> {
        put_str16(buf, self.topic.as_bytes())?;
        if self.qos != QoS::AtMostOnce {
            put_u16(buf, self.mid())?;
        }
        put_slice(buf, self.payload)
    }
}

// --- PUBACK / PUBREC / PUBREL / PUBCOMP ---

/// One of the acknowledgements that carry only a message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub command: u8,
    pub packet_id: u16,
    pub dup: bool,
}

impl Ack {
    pub fn puback(packet_id: u16) -> Self {
        Self {
            command: PUBACK,
            packet_id,
            dup: false,
        }
    }

    pub fn pubrec(packet_id: u16) -> Self {
        Self {
            command: PUBREC,
            packet_id,
            dup: false,
        }
    }

    /// PUBREL carries the reserved flag bit 1.
    pub fn pubrel(packet_id: u16, dup: bool) -> Self {
        Self {
            command: PUBREL | 0x02,
            packet_id,
            dup,
        }
    }

    pub fn pubcomp(packet_id: u16) -> Self {
        Self {
            command: PUBCOMP,
            packet_id,
            dup: false,
        }
    }
}

impl EncodePacket for Ack {
    fn header(&self) -> u8 {
        if self.dup {
            self.command | 0x08
        } else {
            self.command
        }
    }

    fn remaining_len(&self, _version: MqttVersion) -> usize {
        2
    }

    fn encode_body<const N: usize>(
        &self,
        buf: &mut Vec<u8, N>,
        _version: MqttVersion,
    ) -> PacketResult<()> {
        put_u16(buf, self.packet_id)
    }
}

// --- SUBSCRIBE Packet ---
#[derive(Debug)]
pub struct Subscribe<'a> {
    pub packet_id: u16,
    pub topics: &'a [(&'a str, QoS)],
}

impl<'a> Subscribe<'a> {
    pub fn new(packet_id: u16, topics: &'a [(&'a str, QoS)]) -> Self {
        Self { packet_id, topics }
    }
}

impl EncodePacket for Subscribe<'_> {
    fn header(&self) -> u8 {
        // SUBSCRIBE packet type (8) with reserved bits (0x02)
        SUBSCRIBE | 0x02
    }

    fn remaining_len(&self, _version: MqttVersion) -> usize {
        2 + self
            .topics
            .iter()
            .map(|(topic, _)| 2 + topic.len() + 1)
            .sum::<usize>()
    }

    fn encode_body<const N: usize>(
        &self,
        buf: &mut Vec<u8, N>,
        _version: MqttVersion,
    ) -> PacketResult<()> {
        put_u16(buf, self.packet_id)?;
        for (topic, qos) in self.topics {
            put_str16(buf, topic.as_bytes())?;
            put_u8(buf, *qos as u8)?;
        }
        Ok(())
    }
}

// --- SUBACK Packet ---

/// Broker answer to a SUBSCRIBE: one granted QoS (or 0x80 failure) per filter,
/// in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub granted_qos: Vec<u8, MAX_FILTERS>,
}

impl<'a> DecodePacket<'a> for SubAck {
    fn decode(_header: u8, body: &'a [u8]) -> PacketResult<Self> {
        let mut cursor = 0;
        let packet_id = read_u16(&mut cursor, body)?;
        let granted_qos = Vec::from_slice(&body[cursor..])
            .map_err(|_| MqttError::Protocol(ProtocolError::MalformedPacket))?;
        Ok(SubAck {
            packet_id,
            granted_qos,
        })
    }
}

// --- UNSUBSCRIBE Packet ---
#[derive(Debug)]
pub struct Unsubscribe<'a> {
    pub packet_id: u16,
    pub topics: &'a [&'a str],
}

impl EncodePacket for Unsubscribe<'_> {
    fn header(&self) -> u8 {
        UNSUBSCRIBE | 0x02
    }

    fn remaining_len(&self, _version: MqttVersion) -> usize {
        2 + self.topics.iter().map(|t| 2 + t.len()).sum::<usize>()
    }

    fn encode_body<const N: usize>(
        &self,
        buf: &mut Vec<u8, N>,
        _version: MqttVersion,
    ) -> PacketResult<()> {
        put_u16(buf, self.packet_id)?;
        for topic in self.topics {
            put_str16(buf, topic.as_bytes())?;
        }
        Ok(())
    }
}

// --- PINGREQ / PINGRESP / DISCONNECT ---

/// A packet consisting of the fixed header only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Simple(pub u8);

impl Simple {
    pub const PING_REQ: Simple = Simple(PINGREQ);
    pub const PING_RESP: Simple = Simple(PINGRESP);
    pub const DISCONNECT: Simple = Simple(DISCONNECT);
}

impl EncodePacket for Simple {
    fn header(&self) -> u8 {
        self.0
    }

    fn remaining_len(&self, _version: MqttVersion) -> usize {
        0
    }

    fn encode_body<const N: usize>(
        &self,
        _buf: &mut Vec<u8, N>,
        _version: MqttVersion,
    ) -> PacketResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame<P: EncodePacket>(packet: &P, version: MqttVersion) -> Vec<u8, 256> {
        let mut buf = Vec::new();
        packet.encode(&mut buf, version).unwrap();
        buf
    }

    #[test]
    fn connect_header_matches_serialized_length() {
        let packet = Connect::new("abc", 60, true);
        let buf = frame(&packet, MqttVersion::V311);
        let (header, remaining_len, header_len) = decode_fixed_header(&buf).unwrap();
        assert_eq!(header, 0x10);
        assert_eq!(remaining_len, buf.len() - header_len);
        assert_eq!(
            buf.as_slice(),
            &[
                0x10, 15, 0x00, 0x04, b'M', b'Q', b'T', b'T', 4, 0x02, 0x00, 60, 0x00, 0x03, b'a',
                b'b', b'c'
            ]
        );
    }

    #[test]
    fn connect_v31_uses_legacy_protocol_name() {
        let buf = frame(&Connect::new("c", 10, false), MqttVersion::V31);
        assert_eq!(&buf[2..10], &[0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p']);
        assert_eq!(buf[10], 3);
        assert_eq!(buf[11], 0x00);
    }

    #[test]
    fn connect_flags_cover_will_and_credentials() {
        let mut packet = Connect::new("dev", 30, true);
        packet.will = Some(Will::new("dev/status", b"offline", QoS::AtLeastOnce, true));
        packet.username = Some("user");
        packet.password = Some(b"pw");
        let buf = frame(&packet, MqttVersion::V311);
        // clean(0x02) | will(0x04) | will qos 1 (0x08) | will retain(0x20) | password | username
        assert_eq!(buf[9], 0x02 | 0x04 | 0x08 | 0x20 | 0x40 | 0x80);
        let (_, remaining_len, header_len) = decode_fixed_header(&buf).unwrap();
        assert_eq!(remaining_len, buf.len() - header_len);
        assert!(buf.ends_with(&[0x00, 0x02, b'p', b'w']));
    }

    #[test]
    fn password_without_username_is_not_sent() {
        let mut packet = Connect::new("dev", 30, true);
        packet.password = Some(b"secret");
        let buf = frame(&packet, MqttVersion::V311);
        assert_eq!(buf[9], 0x02);
        assert_eq!(buf.len(), 2 + 10 + 2 + 3);
    }

    #[test]
    fn publish_flags_and_message_id() {
        let packet = Publish {
            topic: "t",
            qos: QoS::AtLeastOnce,
            retain: true,
            dup: true,
            payload: b"m",
            packet_id: Some(7),
        };
        let buf = frame(&packet, MqttVersion::V311);
        assert_eq!(buf.as_slice(), &[0x3B, 6, 0x00, 0x01, b't', 0x00, 0x07, b'm']);

        let decoded = Publish::decode(buf[0], &buf[2..]).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn qos0_publish_has_no_message_id() {
        let packet = Publish {
            topic: "a/b",
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            payload: b"xy",
            packet_id: None,
        };
        let buf = frame(&packet, MqttVersion::V311);
        assert_eq!(buf.as_slice(), &[0x30, 7, 0x00, 0x03, b'a', b'/', b'b', b'x', b'y']);
    }

    #[test]
    fn publish_decode_rejects_empty_topic_and_qos3() {
        assert_eq!(
            Publish::decode(0x30, &[0x00, 0x00, b'x']),
            Err(MqttError::Protocol(ProtocolError::EmptyTopic))
        );
        assert_eq!(
            Publish::decode(0x36, &[0x00, 0x01, b't', 0x00, 0x01]),
            Err(MqttError::Protocol(ProtocolError::InvalidQos(3)))
        );
    }

    #[test]
    fn pubrel_sets_reserved_and_dup_bits() {
        assert_eq!(frame(&Ack::pubrel(5, false), MqttVersion::V311).as_slice(), &[0x62, 2, 0, 5]);
        assert_eq!(frame(&Ack::pubrel(5, true), MqttVersion::V311).as_slice(), &[0x6A, 2, 0, 5]);
        assert_eq!(frame(&Ack::puback(258), MqttVersion::V311).as_slice(), &[0x40, 2, 1, 2]);
    }

    #[test]
    fn subscribe_and_unsubscribe_layout() {
        let topics = [("a/+", QoS::AtLeastOnce), ("b", QoS::ExactlyOnce)];
        let buf = frame(&Subscribe::new(9, &topics), MqttVersion::V311);
        assert_eq!(
            buf.as_slice(),
            &[0x82, 12, 0, 9, 0, 3, b'a', b'/', b'+', 1, 0, 1, b'b', 2]
        );

        let filters = ["a/+"];
        let buf = frame(
            &Unsubscribe {
                packet_id: 10,
                topics: &filters,
            },
            MqttVersion::V311,
        );
        assert_eq!(buf.as_slice(), &[0xA2, 7, 0, 10, 0, 3, b'a', b'/', b'+']);
    }

    #[test]
    fn decode_broker_packets() {
        match decode(0x20, &[0x01, 0x00]).unwrap() {
            MqttPacket::ConnAck(ack) => {
                assert!(ack.session_present);
                assert_eq!(ack.return_code, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        match decode(0x90, &[0x00, 0x04, 0x01, 0x80]).unwrap() {
            MqttPacket::SubAck(ack) => {
                assert_eq!(ack.packet_id, 4);
                assert_eq!(ack.granted_qos.as_slice(), &[0x01, 0x80]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(decode(0x40, &[0, 3]).unwrap(), MqttPacket::PubAck(3)));
        assert!(matches!(decode(0xD0, &[]).unwrap(), MqttPacket::PingResp));
    }

    #[test]
    fn decode_rejects_unknown_commands_and_bad_lengths() {
        assert_eq!(
            decode(0xF0, &[]).unwrap_err(),
            MqttError::Protocol(ProtocolError::InvalidPacketType(0x0F))
        );
        assert_eq!(
            decode(0x10, &[]).unwrap_err(),
            MqttError::Protocol(ProtocolError::InvalidPacketType(0x01))
        );
        assert_eq!(
            decode(0x40, &[0]).unwrap_err(),
            MqttError::Protocol(ProtocolError::MalformedPacket)
        );
        assert_eq!(
            decode(0x20, &[0, 0, 0]).unwrap_err(),
            MqttError::Protocol(ProtocolError::MalformedPacket)
        );
    }

    #[test]
    fn qos_validation() {
        assert_eq!(QoS::try_from(2), Ok(QoS::ExactlyOnce));
        assert_eq!(QoS::try_from(3), Err(ArgumentError::InvalidQos(3)));
    }
}
