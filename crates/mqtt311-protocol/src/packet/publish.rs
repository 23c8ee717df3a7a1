//! PUBLISH packet. The fixed-header flag nibble carries DUP, QoS and
//! RETAIN; the packet identifier is present exactly when QoS > 0.

use bytes::{Buf, BufMut, Bytes};

use crate::encoding::{decode_string, encode_string, prefixed_len};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::topic::valid_topic_name;
use crate::types::{Message, QoS};

/// MQTT PUBLISH packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishPacket {
    /// Present exactly when `message.qos > 0`.
    pub packet_id: Option<u16>,
    pub message: Message,
    pub dup: bool,
}

impl PublishPacket {
    #[must_use]
    pub fn new(message: Message, packet_id: Option<u16>) -> Self {
        Self {
            packet_id,
            message,
            dup: false,
        }
    }

    #[must_use]
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }
}

impl MqttPacket for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish
    }

    fn flags(&self) -> u8 {
        let mut flags = (self.message.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.message.retain {
            flags |= 0x01;
        }
        flags
    }

    fn body_len(&self) -> usize {
        let id_len = if self.message.qos == QoS::AtMostOnce {
            0
        } else {
            2
        };
        prefixed_len(self.message.topic.len()) + id_len + self.message.payload.len()
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if !valid_topic_name(&self.message.topic) {
            return Err(MqttError::Encode(format!(
                "invalid publish topic: {:?}",
                self.message.topic
            )));
        }
        match (self.message.qos, self.packet_id) {
            (QoS::AtMostOnce, Some(_)) => {
                return Err(MqttError::Encode(
                    "QoS 0 publish must not carry a packet id".to_string(),
                ));
            }
            (QoS::AtLeastOnce | QoS::ExactlyOnce, None) => {
                return Err(MqttError::Encode(
                    "QoS > 0 publish requires a packet id".to_string(),
                ));
            }
            _ => {}
        }

        encode_string(buf, &self.message.topic)?;
        if let Some(id) = self.packet_id {
            buf.put_u16(id);
        }
        buf.put_slice(&self.message.payload);
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, header: &FixedHeader) -> Result<Self> {
        let qos_bits = (header.flags >> 1) & 0x03;
        if qos_bits == 3 {
            return Err(MqttError::Decode("invalid publish QoS 3".to_string()));
        }
        let qos = QoS::try_from_u8(qos_bits)?;
        let dup = header.flags & 0x08 != 0;
        let retain = header.flags & 0x01 != 0;

        let topic = decode_string(buf)?;
        if !valid_topic_name(&topic) {
            return Err(MqttError::Decode(format!(
                "invalid publish topic: {topic:?}"
            )));
        }

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            if buf.remaining() < 2 {
                return Err(MqttError::Decode(
                    "QoS > 0 publish missing packet id".to_string(),
                ));
            }
            let id = buf.get_u16();
            if id == 0 {
                return Err(MqttError::Decode("packet id must not be zero".to_string()));
            }
            Some(id)
        };

        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            packet_id,
            message: Message {
                topic,
                payload,
                qos,
                retain,
            },
            dup,
        })
    }
}
