//! MQTT 3.1.1 control packets.
//!
//! Every packet implements [`MqttPacket`]: a fixed header (type,
//! flags, remaining length) followed by a type-specific body. The
//! [`Packet`] enum ties the 14 kinds together for framed readers and
//! writers.

mod ack;
pub mod connack;
pub mod connect;
pub mod publish;
pub mod subscribe;
pub mod unsubscribe;

pub use ack::{PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket};
pub use connack::{ConnAckPacket, ConnectReturnCode};
pub use connect::{ConnectPacket, ProtocolLevel};
pub use publish::PublishPacket;
pub use subscribe::{SubAckPacket, SubscribePacket, SubscribeReturnCode};
pub use unsubscribe::{UnsubAckPacket, UnsubscribePacket};

use bytes::{Buf, BufMut};

use crate::encoding::{decode_remaining_length, encode_remaining_length, remaining_length_len};
use crate::error::{MqttError, Result};

/// The four-bit control packet type from the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// # Errors
    /// Returns a decode error for the reserved values 0 and 15.
    pub fn try_from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(MqttError::Decode(format!("invalid packet type: {value}"))),
        }
    }

    /// Fixed-header flags the protocol mandates for this type.
    /// PUBLISH flags carry DUP/QoS/RETAIN and are validated by the
    /// publish decoder instead.
    #[must_use]
    pub fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}

/// Decoded fixed header: packet type, flag nibble and body length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: usize,
}

impl FixedHeader {
    /// # Errors
    /// Returns a decode error on a truncated buffer, a reserved
    /// packet type, or an over-long remaining-length field.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(MqttError::Decode("missing fixed header".to_string()));
        }
        let first = buf.get_u8();
        let packet_type = PacketType::try_from_u8(first >> 4)?;
        let flags = first & 0x0F;
        let remaining_length = decode_remaining_length(buf)?;
        Ok(Self {
            packet_type,
            flags,
            remaining_length,
        })
    }

    /// # Errors
    /// Returns an encode error if the remaining length overflows.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u8(((self.packet_type as u8) << 4) | (self.flags & 0x0F));
        encode_remaining_length(buf, self.remaining_length)?;
        Ok(())
    }
}

/// Codec contract shared by all control packets.
pub trait MqttPacket: Sized {
    fn packet_type(&self) -> PacketType;

    fn flags(&self) -> u8 {
        self.packet_type().required_flags().unwrap_or(0)
    }

    /// Byte length of the body (the remaining length).
    fn body_len(&self) -> usize;

    /// # Errors
    /// Returns an encode error on illegal field values.
    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()>;

    /// # Errors
    /// Returns a decode error on malformed bytes, wrong flags, or an
    /// inconsistent remaining length.
    fn decode_body<B: Buf>(buf: &mut B, header: &FixedHeader) -> Result<Self>;

    /// Total encoded length including the fixed header.
    fn encoded_len(&self) -> usize {
        let body = self.body_len();
        1 + remaining_length_len(body) + body
    }

    /// Encodes the fixed header and body.
    ///
    /// # Errors
    /// Returns an encode error on illegal field values or overflow.
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        FixedHeader {
            packet_type: self.packet_type(),
            flags: self.flags(),
            remaining_length: self.body_len(),
        }
        .encode(buf)?;
        self.encode_body(buf)
    }
}

fn check_flags(header: &FixedHeader) -> Result<()> {
    if let Some(required) = header.packet_type.required_flags() {
        if header.flags != required {
            return Err(MqttError::Decode(format!(
                "invalid {:?} flags: expected 0x{required:02X}, got 0x{:02X}",
                header.packet_type, header.flags
            )));
        }
    }
    Ok(())
}

/// A decoded control packet of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<ConnectPacket>),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(PubAckPacket),
    PubRec(PubRecPacket),
    PubRel(PubRelPacket),
    PubComp(PubCompPacket),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// The packet identifier, for the kinds that carry one. A QoS 0
    /// PUBLISH returns `None`.
    #[must_use]
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) => p.packet_id,
            Packet::PubAck(p) => Some(p.packet_id),
            Packet::PubRec(p) => Some(p.packet_id),
            Packet::PubRel(p) => Some(p.packet_id),
            Packet::PubComp(p) => Some(p.packet_id),
            Packet::Subscribe(p) => Some(p.packet_id),
            Packet::SubAck(p) => Some(p.packet_id),
            Packet::Unsubscribe(p) => Some(p.packet_id),
            Packet::UnsubAck(p) => Some(p.packet_id),
            _ => None,
        }
    }

    /// Total encoded length including the fixed header.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::Connect(p) => p.encoded_len(),
            Packet::ConnAck(p) => p.encoded_len(),
            Packet::Publish(p) => p.encoded_len(),
            Packet::PubAck(p) => p.encoded_len(),
            Packet::PubRec(p) => p.encoded_len(),
            Packet::PubRel(p) => p.encoded_len(),
            Packet::PubComp(p) => p.encoded_len(),
            Packet::Subscribe(p) => p.encoded_len(),
            Packet::SubAck(p) => p.encoded_len(),
            Packet::Unsubscribe(p) => p.encoded_len(),
            Packet::UnsubAck(p) => p.encoded_len(),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 2,
        }
    }

    /// Encodes the packet onto `buf`.
    ///
    /// # Errors
    /// Returns an encode error on illegal field values.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Packet::Connect(p) => p.encode(buf),
            Packet::ConnAck(p) => p.encode(buf),
            Packet::Publish(p) => p.encode(buf),
            Packet::PubAck(p) => p.encode(buf),
            Packet::PubRec(p) => p.encode(buf),
            Packet::PubRel(p) => p.encode(buf),
            Packet::PubComp(p) => p.encode(buf),
            Packet::Subscribe(p) => p.encode(buf),
            Packet::SubAck(p) => p.encode(buf),
            Packet::Unsubscribe(p) => p.encode(buf),
            Packet::UnsubAck(p) => p.encode(buf),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {
                FixedHeader {
                    packet_type: self.packet_type(),
                    flags: 0,
                    remaining_length: 0,
                }
                .encode(buf)
            }
        }
    }

    /// Decodes one complete packet from `buf`.
    ///
    /// # Errors
    /// Returns a decode error on malformed bytes, wrong flags, a
    /// truncated buffer, or body bytes left over after the payload
    /// grammar is satisfied.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Packet> {
        let header = FixedHeader::decode(buf)?;
        if buf.remaining() < header.remaining_length {
            return Err(MqttError::Decode(format!(
                "truncated packet: body needs {} bytes, have {}",
                header.remaining_length,
                buf.remaining()
            )));
        }
        check_flags(&header)?;

        let mut body = buf.copy_to_bytes(header.remaining_length);
        let packet = match header.packet_type {
            PacketType::Connect => {
                Packet::Connect(Box::new(ConnectPacket::decode_body(&mut body, &header)?))
            }
            PacketType::ConnAck => Packet::ConnAck(ConnAckPacket::decode_body(&mut body, &header)?),
            PacketType::Publish => Packet::Publish(PublishPacket::decode_body(&mut body, &header)?),
            PacketType::PubAck => Packet::PubAck(PubAckPacket::decode_body(&mut body, &header)?),
            PacketType::PubRec => Packet::PubRec(PubRecPacket::decode_body(&mut body, &header)?),
            PacketType::PubRel => Packet::PubRel(PubRelPacket::decode_body(&mut body, &header)?),
            PacketType::PubComp => Packet::PubComp(PubCompPacket::decode_body(&mut body, &header)?),
            PacketType::Subscribe => {
                Packet::Subscribe(SubscribePacket::decode_body(&mut body, &header)?)
            }
            PacketType::SubAck => Packet::SubAck(SubAckPacket::decode_body(&mut body, &header)?),
            PacketType::Unsubscribe => {
                Packet::Unsubscribe(UnsubscribePacket::decode_body(&mut body, &header)?)
            }
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAckPacket::decode_body(&mut body, &header)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
        };

        if body.has_remaining() {
            return Err(MqttError::Decode(format!(
                "{:?} body has {} trailing bytes",
                header.packet_type,
                body.remaining()
            )));
        }
        Ok(packet)
    }

    /// Classifies the next packet from up to five header bytes.
    ///
    /// Returns `None` when more bytes are needed, or the total packet
    /// length (fixed header included) and type once the length header
    /// is complete.
    ///
    /// # Errors
    /// Returns a detection error if five bytes do not finish the
    /// length header, or a decode error on a reserved packet type.
    pub fn detect(buf: &[u8]) -> Result<Option<(usize, PacketType)>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let packet_type = PacketType::try_from_u8(buf[0] >> 4)?;

        let mut remaining: usize = 0;
        let mut shift = 0u32;
        for (i, &byte) in buf.iter().enumerate().skip(1) {
            remaining |= usize::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(Some((1 + i + remaining, packet_type)));
            }
            if i == 4 {
                return Err(MqttError::Detection);
            }
            shift += 7;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_packet_type_bounds() {
        assert!(PacketType::try_from_u8(0).is_err());
        assert!(PacketType::try_from_u8(15).is_err());
        assert_eq!(PacketType::try_from_u8(3).unwrap(), PacketType::Publish);
    }

    #[test]
    fn test_fixed_header_round_trip() {
        let header = FixedHeader {
            packet_type: PacketType::Subscribe,
            flags: 0x02,
            remaining_length: 321,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        let mut rd = buf.freeze();
        assert_eq!(FixedHeader::decode(&mut rd).unwrap(), header);
    }

    #[test]
    fn test_unit_packets_round_trip() {
        for packet in [Packet::PingReq, Packet::PingResp, Packet::Disconnect] {
            let mut buf = BytesMut::new();
            packet.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), packet.encoded_len());
            let mut rd = buf.freeze();
            assert_eq!(Packet::decode(&mut rd).unwrap(), packet);
        }
    }

    #[test]
    fn test_unit_packet_rejects_body() {
        // PINGREQ with a claimed one-byte body.
        let mut rd = &[0xC0, 0x01, 0x00][..];
        assert!(Packet::decode(&mut rd).is_err());
    }

    #[test]
    fn test_wrong_flags_rejected() {
        // PINGREQ with flag bits set.
        let mut rd = &[0xC1, 0x00][..];
        assert!(Packet::decode(&mut rd).is_err());

        // SUBSCRIBE without the mandatory 0x02 flags.
        let mut rd = &[0x80, 0x05, 0x00, 0x01, 0x00, 0x01, b't'][..];
        assert!(Packet::decode(&mut rd).is_err());
    }

    #[test]
    fn test_truncated_packet() {
        // PUBACK claiming 2 body bytes with only 1 present.
        let mut rd = &[0x40, 0x02, 0x00][..];
        assert!(Packet::decode(&mut rd).is_err());
    }

    #[test]
    fn test_detect() {
        // PINGREQ: complete at two bytes.
        assert_eq!(
            Packet::detect(&[0xC0, 0x00]).unwrap(),
            Some((2, PacketType::PingReq))
        );

        // One byte is never enough.
        assert_eq!(Packet::detect(&[0x30]).unwrap(), None);

        // Multi-byte remaining length, incomplete then complete.
        assert_eq!(Packet::detect(&[0x30, 0x80]).unwrap(), None);
        assert_eq!(
            Packet::detect(&[0x30, 0x80, 0x01]).unwrap(),
            Some((3 + 128, PacketType::Publish))
        );

        // Continuation still set after four length bytes.
        assert!(Packet::detect(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }
}
