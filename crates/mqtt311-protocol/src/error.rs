use thiserror::Error;

use crate::packet::connack::ConnectReturnCode;

pub type Result<T> = std::result::Result<T, MqttError>;

/// Errors surfaced by the codec and the broker core.
///
/// The first group mirrors the boundary taxonomy (encode, decode,
/// detection, network, dial, launch); the rest are broker-level
/// conditions that cross the backend interface.
#[derive(Debug, Clone, Error)]
pub enum MqttError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("detection error: no packet detected within 5 bytes")]
    Detection,

    #[error("network error: {0}")]
    Network(String),

    #[error("dial error: {0}")]
    Dial(String),

    #[error("launch error: {0}")]
    Launch(String),

    #[error("unsupported protocol version")]
    UnsupportedProtocolVersion,

    #[error("connection refused: {0}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("not authorized")]
    NotAuthorized,

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("keep alive timeout")]
    KeepAliveTimeout,

    #[error("token timeout")]
    TokenTimeout,

    #[error("queue full")]
    QueueFull,

    #[error("killed")]
    Killed,

    #[error("closing")]
    Closing,

    #[error("kill timeout")]
    KillTimeout,

    #[error("session gone")]
    SessionGone,

    #[error("client closed connection")]
    ClientClosed,
}

impl MqttError {
    /// Whether the error is an orderly end of the connection rather
    /// than a failure worth reporting.
    #[must_use]
    pub fn is_normal_disconnect(&self) -> bool {
        match self {
            Self::ClientClosed | Self::Killed | Self::Closing => true,
            Self::Network(msg) => {
                msg.contains("unexpected end of file")
                    || msg.contains("Connection reset")
                    || msg.contains("broken pipe")
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            MqttError::ClientClosed
        } else {
            MqttError::Network(err.to_string())
        }
    }
}
