//! CONNECT packet: protocol magic, flags byte, keep-alive and the
//! conditional payload fields (client id, will, credentials).

use bytes::{Buf, BufMut, Bytes};

use crate::encoding::{
    decode_bytes, decode_string, encode_bytes, encode_string, prefixed_len,
};
use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::types::{Message, QoS};

const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_WILL: u8 = 0x04;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

/// Accepted protocol revisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolLevel {
    /// MQTT 3.1, magic `MQIsdp`, level byte 3.
    V31,
    /// MQTT 3.1.1, magic `MQTT`, level byte 4.
    #[default]
    V311,
}

impl ProtocolLevel {
    fn magic(self) -> &'static str {
        match self {
            ProtocolLevel::V31 => "MQIsdp",
            ProtocolLevel::V311 => "MQTT",
        }
    }

    fn level(self) -> u8 {
        match self {
            ProtocolLevel::V31 => 3,
            ProtocolLevel::V311 => 4,
        }
    }
}

/// MQTT CONNECT packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol_level: ProtocolLevel,
    pub client_id: String,
    pub clean_session: bool,
    /// Keep-alive interval in seconds; zero disables the deadline.
    pub keep_alive: u16,
    pub will: Option<Message>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: true,
            keep_alive: 60,
            ..Self::default()
        }
    }

    fn connect_flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= FLAG_CLEAN_SESSION;
        }
        if let Some(ref will) = self.will {
            flags |= FLAG_WILL;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= FLAG_WILL_RETAIN;
            }
        }
        if self.password.is_some() {
            flags |= FLAG_PASSWORD;
        }
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
        }
        flags
    }
}

impl MqttPacket for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn body_len(&self) -> usize {
        let mut len = prefixed_len(self.protocol_level.magic().len()) + 1 + 1 + 2;
        len += prefixed_len(self.client_id.len());
        if let Some(ref will) = self.will {
            len += prefixed_len(will.topic.len()) + prefixed_len(will.payload.len());
        }
        if let Some(ref username) = self.username {
            len += prefixed_len(username.len());
        }
        if let Some(ref password) = self.password {
            len += prefixed_len(password.len());
        }
        len
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if self.password.is_some() && self.username.is_none() {
            return Err(MqttError::Encode(
                "password requires a username".to_string(),
            ));
        }

        encode_string(buf, self.protocol_level.magic())?;
        buf.put_u8(self.protocol_level.level());
        buf.put_u8(self.connect_flags());
        buf.put_u16(self.keep_alive);
        encode_string(buf, &self.client_id)?;
        if let Some(ref will) = self.will {
            encode_string(buf, &will.topic)?;
            encode_bytes(buf, &will.payload)?;
        }
        if let Some(ref username) = self.username {
            encode_string(buf, username)?;
        }
        if let Some(ref password) = self.password {
            encode_bytes(buf, password)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(buf: &mut B, _header: &FixedHeader) -> Result<Self> {
        let magic = decode_string(buf)?;
        if !buf.has_remaining() {
            return Err(MqttError::Decode("missing protocol level".to_string()));
        }
        let level = buf.get_u8();
        let protocol_level = match (magic.as_str(), level) {
            ("MQTT", 4) => ProtocolLevel::V311,
            ("MQIsdp", 3) => ProtocolLevel::V31,
            _ => return Err(MqttError::UnsupportedProtocolVersion),
        };

        if buf.remaining() < 3 {
            return Err(MqttError::Decode(
                "missing connect flags or keep-alive".to_string(),
            ));
        }
        let flags = buf.get_u8();
        if flags & 0x01 != 0 {
            return Err(MqttError::Decode(
                "reserved connect flag must be zero".to_string(),
            ));
        }
        let clean_session = flags & FLAG_CLEAN_SESSION != 0;
        let will_flag = flags & FLAG_WILL != 0;
        let will_qos = QoS::try_from_u8((flags >> 3) & 0x03)?;
        let will_retain = flags & FLAG_WILL_RETAIN != 0;
        if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
            return Err(MqttError::Decode(
                "will qos/retain set without will flag".to_string(),
            ));
        }
        let password_flag = flags & FLAG_PASSWORD != 0;
        let username_flag = flags & FLAG_USERNAME != 0;
        if password_flag && !username_flag {
            return Err(MqttError::Decode(
                "password flag set without username flag".to_string(),
            ));
        }

        let keep_alive = buf.get_u16();
        let client_id = decode_string(buf)?;

        let will = if will_flag {
            let topic = decode_string(buf)?;
            let payload = Bytes::from(decode_bytes(buf)?);
            Some(Message {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(decode_string(buf)?)
        } else {
            None
        };
        let password = if password_flag {
            Some(Bytes::from(decode_bytes(buf)?))
        } else {
            None
        };

        Ok(Self {
            protocol_level,
            client_id,
            clean_session,
            keep_alive,
            will,
            username,
            password,
        })
    }
}
