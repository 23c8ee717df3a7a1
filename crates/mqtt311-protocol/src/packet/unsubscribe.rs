//! UNSUBSCRIBE and UNSUBACK packets.

use bytes::{Buf, BufMut};

use crate::encoding::{decode_string, encode_string, prefixed_len};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};

/// MQTT UNSUBSCRIBE packet: at least one topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

impl UnsubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16, topics: Vec<String>) -> Self {
        Self { packet_id, topics }
    }
}

impl MqttPacket for UnsubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Unsubscribe
    }

    fn body_len(&self) -> usize {
        2 + self
            .topics
            .iter()
            .map(|t| prefixed_len(t.len()))
            .sum::<usize>()
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.topics.is_empty() {
            return Err(MqttError::Encode(
                "UNSUBSCRIBE requires at least one topic filter".to_string(),
            ));
        }
        buf.put_u16(self.packet_id);
        for topic in &self.topics {
            encode_string(buf, topic)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::Decode(
                "UNSUBSCRIBE missing packet id".to_string(),
            ));
        }
        let packet_id = buf.get_u16();

        let mut topics = Vec::new();
        while buf.has_remaining() {
            topics.push(decode_string(buf)?);
        }
        if topics.is_empty() {
            return Err(MqttError::Decode(
                "UNSUBSCRIBE requires at least one topic filter".to_string(),
            ));
        }

        Ok(Self { packet_id, topics })
    }
}

/// MQTT UNSUBACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAckPacket {
    pub packet_id: u16,
}

impl UnsubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id }
    }
}

impl MqttPacket for UnsubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::UnsubAck
    }

    fn body_len(&self) -> usize {
        2
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        buf.put_u16(self.packet_id);
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, header: &FixedHeader) -> Result<Self> {
        if header.remaining_length != 2 || buf.remaining() < 2 {
            return Err(MqttError::Decode(
                "UNSUBACK body must be 2 bytes".to_string(),
            ));
        }
        Ok(Self {
            packet_id: buf.get_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use bytes::BytesMut;

    #[test]
    fn test_unsubscribe_round_trip() {
        let packet = Packet::Unsubscribe(UnsubscribePacket::new(
            99,
            vec!["a/b".to_string(), "c/+".to_string()],
        ));
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), packet.encoded_len());
        let mut rd = buf.freeze();
        assert_eq!(Packet::decode(&mut rd).unwrap(), packet);
    }

    #[test]
    fn test_unsubscribe_empty_rejected() {
        let mut rd = &[0xA2, 0x02, 0x00, 0x01][..];
        assert!(Packet::decode(&mut rd).is_err());
    }

    #[test]
    fn test_unsuback_round_trip() {
        let packet = Packet::UnsubAck(UnsubAckPacket::new(99));
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        let mut rd = buf.freeze();
        assert_eq!(Packet::decode(&mut rd).unwrap(), packet);
    }
}
