/// Negotiation wire format.
///
/// Frames are JSON. The header travels in the clear on the authenticated
/// link; `body` is the sealed payload (see [`crate::crypto`]), hex-encoded
/// so the frame stays printable.
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::types::{ChannelIntent, DataClass, DeviceId};

/// Frame discriminator — this subsystem only speaks connection control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Connection,
}

/// Which negotiation module a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleId {
    /// UDP channel parameter negotiation.
    UdpInfo,
    /// Application payload on an auth or proxy channel.
    Message,
}

/// Request/reply discriminator. A reply echoes the request's sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFlag {
    Request,
    Reply,
}

/// Which flavor of UDP path the lane resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UdpConnKind {
    Wlan,
    P2p,
}

/// Clear header plus sealed body, as carried on the auth connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthFrame {
    pub data_type: DataType,
    /// Auth connection the frame rode in on; keys are looked up by it.
    pub conn_id: u64,
    pub module: ModuleId,
    pub flag: FrameFlag,
    pub seq: u64,
    /// Hex-encoded sealed payload (nonce || ciphertext).
    pub body: String,
}

impl AuthFrame {
    pub fn new(conn_id: u64, module: ModuleId, flag: FrameFlag, seq: u64, sealed: &[u8]) -> Self {
        Self {
            data_type: DataType::Connection,
            conn_id,
            module,
            flag,
            seq,
            body: hex::encode(sealed),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChannelError> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ChannelError> {
        serde_json::from_slice(data).map_err(|e| ChannelError::Deserialization(e.to_string()))
    }

    /// Decode the sealed body back to raw bytes.
    pub fn sealed_body(&self) -> Result<Vec<u8>, ChannelError> {
        hex::decode(&self.body).map_err(|e| ChannelError::Deserialization(e.to_string()))
    }
}

/// Requester → acceptor payload.
///
/// Open and close share the shape; a close quotes the acceptor's channel
/// id in `peer_channel_id` so the peer can find its record. The sender's
/// address is implicit: the acceptor reads it off the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiateRequest {
    pub channel_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_channel_id: Option<i32>,
    /// Hex-encoded 32-byte session key.
    pub session_key: String,
    pub business_type: DataClass,
    pub pkg_name: String,
    /// The session on the acceptor this channel should attach to.
    pub session_name: String,
    pub group_id: String,
    pub udp_conn_type: UdpConnKind,
    pub intent: ChannelIntent,
    pub device_id: DeviceId,
}

impl NegotiateRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChannelError> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ChannelError> {
        serde_json::from_slice(data).map_err(|e| ChannelError::NegotiationParse {
            reason: e.to_string(),
        })
    }
}

/// Acceptor → requester payload. The acceptor's address is already known
/// from the lane; only the assigned port travels back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiateReply {
    pub udp_port: u16,
    pub channel_id: i32,
    pub device_id: DeviceId,
}

impl NegotiateReply {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChannelError> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ChannelError> {
        serde_json::from_slice(data).map_err(|e| ChannelError::NegotiationParse {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionKey;

    fn sample_request() -> NegotiateRequest {
        NegotiateRequest {
            channel_id: 4,
            peer_channel_id: None,
            session_key: SessionKey::generate().to_hex(),
            business_type: DataClass::Stream,
            pkg_name: "com.example.cast".into(),
            session_name: "cast.sink".into(),
            group_id: "grp-1".into(),
            udp_conn_type: UdpConnKind::P2p,
            intent: ChannelIntent::Open,
            device_id: DeviceId::from("dev-a"),
        }
    }

    #[test]
    fn frame_json_roundtrip() {
        let frame = AuthFrame::new(11, ModuleId::UdpInfo, FrameFlag::Request, 100, b"\x01\x02");
        let bytes = frame.to_bytes().unwrap();
        let decoded = AuthFrame::from_bytes(&bytes).unwrap();
        assert_eq!(frame, decoded);
        assert_eq!(decoded.sealed_body().unwrap(), b"\x01\x02");
    }

    #[test]
    fn frame_rejects_garbage() {
        assert!(AuthFrame::from_bytes(b"not json").is_err());
        assert!(AuthFrame::from_bytes(b"{}").is_err());
    }

    #[test]
    fn frame_rejects_bad_body_hex() {
        let mut frame = AuthFrame::new(1, ModuleId::UdpInfo, FrameFlag::Reply, 3, b"x");
        frame.body = "zz".into();
        assert!(frame.sealed_body().is_err());
    }

    #[test]
    fn request_json_roundtrip() {
        let request = sample_request();
        let decoded = NegotiateRequest::from_bytes(&request.to_bytes().unwrap()).unwrap();
        assert_eq!(request, decoded);
    }

    #[test]
    fn request_close_carries_peer_channel_id() {
        let mut request = sample_request();
        request.intent = ChannelIntent::Close;
        request.peer_channel_id = Some(9);
        let decoded = NegotiateRequest::from_bytes(&request.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.peer_channel_id, Some(9));
        assert_eq!(decoded.intent, ChannelIntent::Close);
    }

    #[test]
    fn open_request_omits_peer_channel_id() {
        let json = String::from_utf8(sample_request().to_bytes().unwrap()).unwrap();
        assert!(!json.contains("peer_channel_id"));
    }

    #[test]
    fn reply_json_roundtrip() {
        let reply = NegotiateReply {
            udp_port: 40123,
            channel_id: 7,
            device_id: DeviceId::from("dev-b"),
        };
        let decoded = NegotiateReply::from_bytes(&reply.to_bytes().unwrap()).unwrap();
        assert_eq!(reply, decoded);
    }

    #[test]
    fn request_parse_failure_is_typed() {
        let err = NegotiateRequest::from_bytes(b"{\"channel_id\":true}").unwrap_err();
        assert!(matches!(err, ChannelError::NegotiationParse { .. }));
    }
}
