use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

pub use nearbus_link::{DataClass, DeviceId, LinkType, RouteType};

use crate::error::ChannelError;

/// Channel flavor — decides open/close/send semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    TcpDirect,
    Proxy,
    Udp,
    Auth,
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelType::TcpDirect => "tcp_direct",
            ChannelType::Proxy => "proxy",
            ChannelType::Udp => "udp",
            ChannelType::Auth => "auth",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of a channel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Created, waiting for the transport handshake to finish.
    Connecting,
    /// Ready for data.
    Open,
}

/// Whether a negotiation exchange opens or tears down the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelIntent {
    Open,
    Close,
}

/// Normal application channel or an auth-scoped control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppKind {
    Normal,
    Auth,
}

/// How a payload handed to `send_msg` should be treated by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Bytes,
    Message,
}

/// 32-byte symmetric key minted fresh for every channel attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Mint a key from the OS RNG.
    pub fn generate() -> Self {
        use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ChannelError> {
        let bytes = hex::decode(s).map_err(|e| ChannelError::NegotiationParse {
            reason: format!("bad session key encoding: {e}"),
        })?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChannelError::NegotiationParse {
                reason: "session key is not 32 bytes".into(),
            })?;
        Ok(Self(bytes))
    }
}

// Key material stays out of logs.
impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// What the session layer asks for. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub peer: DeviceId,
    pub data_class: DataClass,
    /// Acceptable link flavors, best first.
    pub preferred_links: Vec<LinkType>,
    pub group_id: String,
    pub uid: i32,
    pub pid: i32,
    pub pkg_name: String,
    pub local_session: String,
    pub peer_session: String,
}

/// Per-channel negotiation context.
///
/// Created fresh for every channel attempt and owned by that attempt's
/// negotiation flow; moved into the channel record on finalize, dropped on
/// teardown.
#[derive(Debug)]
pub struct AppInfo {
    pub local_device: DeviceId,
    pub peer_device: DeviceId,
    pub local_session: String,
    pub peer_session: String,
    pub pkg_name: String,
    pub session_key: SessionKey,
    pub channel_id: i32,
    /// The peer's id for the same channel, learned during negotiation.
    pub peer_channel_id: Option<i32>,
    pub intent: ChannelIntent,
    pub route: RouteType,
    pub local_ip: Option<IpAddr>,
    pub local_port: Option<u16>,
    pub peer_ip: Option<IpAddr>,
    pub peer_port: Option<u16>,
    pub kind: AppKind,
    /// True when this side accepted the channel rather than requested it.
    pub is_server: bool,
    pub uid: i32,
    pub pid: i32,
}

/// What `open_channel` hands back to the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransInfo {
    pub channel_id: i32,
    pub channel_type: ChannelType,
}
