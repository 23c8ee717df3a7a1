//! SUBSCRIBE and SUBACK packets.

use bytes::{Buf, BufMut};

use crate::encoding::{decode_string, encode_string, prefixed_len};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::types::{QoS, Subscription};

/// MQTT SUBSCRIBE packet: at least one (topic filter, requested QoS)
/// pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
}

impl SubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            subscriptions: Vec::new(),
        }
    }

    #[must_use]
    pub fn add(mut self, topic: impl Into<String>, qos: QoS) -> Self {
        self.subscriptions.push(Subscription::new(topic, qos));
        self
    }
}

impl MqttPacket for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }

    fn body_len(&self) -> usize {
        2 + self
            .subscriptions
            .iter()
            .map(|s| prefixed_len(s.topic.len()) + 1)
            .sum::<usize>()
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.subscriptions.is_empty() {
            return Err(MqttError::Encode(
                "SUBSCRIBE requires at least one topic filter".to_string(),
            ));
        }
        buf.put_u16(self.packet_id);
        for sub in &self.subscriptions {
            encode_string(buf, &sub.topic)?;
            buf.put_u8(sub.qos as u8);
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::Decode(
                "SUBSCRIBE missing packet id".to_string(),
            ));
        }
        let packet_id = buf.get_u16();

        let mut subscriptions = Vec::new();
        while buf.has_remaining() {
            let topic = decode_string(buf)?;
            if !buf.has_remaining() {
                return Err(MqttError::Decode(
                    "SUBSCRIBE missing requested QoS".to_string(),
                ));
            }
            let qos = QoS::try_from_u8(buf.get_u8())?;
            subscriptions.push(Subscription { topic, qos });
        }

        if subscriptions.is_empty() {
            return Err(MqttError::Decode(
                "SUBSCRIBE requires at least one topic filter".to_string(),
            ));
        }

        Ok(Self {
            packet_id,
            subscriptions,
        })
    }
}

/// Per-topic SUBACK return code: the granted QoS or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscribeReturnCode {
    MaximumQos0 = 0x00,
    MaximumQos1 = 0x01,
    MaximumQos2 = 0x02,
    Failure = 0x80,
}

impl SubscribeReturnCode {
    #[must_use]
    pub fn granted(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Self::MaximumQos0,
            QoS::AtLeastOnce => Self::MaximumQos1,
            QoS::ExactlyOnce => Self::MaximumQos2,
        }
    }

    /// # Errors
    /// Returns a decode error for anything but 0, 1, 2 or 0x80.
    pub fn try_from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::MaximumQos0),
            0x01 => Ok(Self::MaximumQos1),
            0x02 => Ok(Self::MaximumQos2),
            0x80 => Ok(Self::Failure),
            _ => Err(MqttError::Decode(format!(
                "invalid suback return code: 0x{value:02X}"
            ))),
        }
    }
}

/// MQTT SUBACK packet: one return code per requested topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

impl SubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16, return_codes: Vec<SubscribeReturnCode>) -> Self {
        Self {
            packet_id,
            return_codes,
        }
    }
}

impl MqttPacket for SubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::SubAck
    }

    fn body_len(&self) -> usize {
        2 + self.return_codes.len()
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.return_codes.is_empty() {
            return Err(MqttError::Encode(
                "SUBACK requires at least one return code".to_string(),
            ));
        }
        buf.put_u16(self.packet_id);
        for code in &self.return_codes {
            buf.put_u8(*code as u8);
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _header: &FixedHeader) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::Decode("SUBACK missing packet id".to_string()));
        }
        let packet_id = buf.get_u16();

        let mut return_codes = Vec::new();
        while buf.has_remaining() {
            return_codes.push(SubscribeReturnCode::try_from_u8(buf.get_u8())?);
        }
        if return_codes.is_empty() {
            return Err(MqttError::Decode(
                "SUBACK requires at least one return code".to_string(),
            ));
        }

        Ok(Self {
            packet_id,
            return_codes,
        })
    }
}
