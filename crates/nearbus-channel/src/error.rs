use nearbus_link::LinkError;

use crate::types::ChannelType;

/// Channel-layer errors.
///
/// Wraps lane errors and adds negotiation-specific variants. Every failure
/// a caller can hit is typed here; nothing in this crate terminates the
/// process.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel id pool exhausted for {channel_type}")]
    IdPoolExhausted { channel_type: ChannelType },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("auth connection to {device_id} failed: {reason}")]
    AuthOpenFailed { device_id: String, reason: String },

    #[error("negotiation payload rejected: {reason}")]
    NegotiationParse { reason: String },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("handshake timed out after {ticks} ticks")]
    Timeout { ticks: u32 },

    #[error("no channel {channel_id} of type {channel_type}")]
    ChannelNotFound {
        channel_id: i32,
        channel_type: ChannelType,
    },

    #[error("channel {channel_id} is not ready for data")]
    WrongChannelState { channel_id: i32 },

    #[error("operation not supported on {channel_type} channels")]
    WrongChannelType { channel_type: ChannelType },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("channel engine is shut down")]
    EngineShutdown,
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Serialization(e.to_string())
    }
}
