//! The four acknowledgement packets of the QoS 1/2 exchanges. In
//! MQTT 3.1.1 they all share the same two-byte body: the packet
//! identifier being acknowledged.

use bytes::{Buf, BufMut};

use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};

macro_rules! define_ack_packet {
    (
        $(#[$meta:meta])*
        pub struct $name:ident;
        packet_type = $packet_type:expr;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
        }

        impl $name {
            #[must_use]
            pub fn new(packet_id: u16) -> Self {
                Self { packet_id }
            }
        }

        impl MqttPacket for $name {
            fn packet_type(&self) -> PacketType {
                $packet_type
            }

            fn body_len(&self) -> usize {
                2
            }

            fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
                if self.packet_id == 0 {
                    return Err(MqttError::Encode(
                        "packet id must not be zero".to_string(),
                    ));
                }
                buf.put_u16(self.packet_id);
                Ok(())
            }

            fn decode_body<B: Buf>(buf: &mut B, header: &FixedHeader) -> Result<Self> {
                if header.remaining_length != 2 || buf.remaining() < 2 {
                    return Err(MqttError::Decode(format!(
                        "{:?} body must be 2 bytes",
                        $packet_type
                    )));
                }
                let packet_id = buf.get_u16();
                if packet_id == 0 {
                    return Err(MqttError::Decode(
                        "packet id must not be zero".to_string(),
                    ));
                }
                Ok(Self { packet_id })
            }
        }
    };
}

define_ack_packet! {
    /// PUBACK: completes a QoS 1 publish.
    pub struct PubAckPacket;
    packet_type = PacketType::PubAck;
}

define_ack_packet! {
    /// PUBREC: first acknowledgement of a QoS 2 publish.
    pub struct PubRecPacket;
    packet_type = PacketType::PubRec;
}

define_ack_packet! {
    /// PUBREL: release of a QoS 2 exchange (flags fixed to 0x02).
    pub struct PubRelPacket;
    packet_type = PacketType::PubRel;
}

define_ack_packet! {
    /// PUBCOMP: completes a QoS 2 exchange.
    pub struct PubCompPacket;
    packet_type = PacketType::PubComp;
}
