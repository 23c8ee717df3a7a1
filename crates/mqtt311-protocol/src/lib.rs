//! # MQTT 3.1.1 wire protocol
//!
//! The wire-level half of the broker: packet codec for all fourteen
//! control packets, topic matching (free functions and a prefix
//! tree), and packet-identifier issuance.
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use mqtt311_protocol::packet::{MqttPacket, Packet, PublishPacket};
//! use mqtt311_protocol::{Message, QoS};
//!
//! let publish = PublishPacket::new(Message::new("a/b", &b"hi"[..], QoS::AtLeastOnce), Some(7));
//!
//! let mut buf = BytesMut::new();
//! publish.encode(&mut buf).unwrap();
//! assert_eq!(buf.len(), publish.encoded_len());
//!
//! let mut rd = buf.freeze();
//! let decoded = Packet::decode(&mut rd).unwrap();
//! assert_eq!(decoded, Packet::Publish(publish));
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

pub mod encoding;
pub mod error;
pub mod packet;
pub mod packet_id;
pub mod topic;
pub mod types;

pub use error::{MqttError, Result};
pub use packet::{
    ConnAckPacket, ConnectPacket, ConnectReturnCode, FixedHeader, MqttPacket, Packet, PacketType,
    ProtocolLevel, PubAckPacket, PubCompPacket, PubRecPacket, PubRelPacket, PublishPacket,
    SubAckPacket, SubscribePacket, SubscribeReturnCode, UnsubAckPacket, UnsubscribePacket,
};
pub use packet_id::IdCounter;
pub use topic::{topic_matches_filter, valid_topic_filter, valid_topic_name, TopicTree};
pub use types::{Message, QoS, Subscription};
