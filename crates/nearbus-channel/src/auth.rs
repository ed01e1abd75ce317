/// Authenticated side-channel gateway.
///
/// Negotiation control messages ride an out-of-band authenticated
/// connection owned by the platform's auth service. The gateway seals
/// every outbound body with the per-connection key before it touches the
/// link; plaintext negotiation payloads never reach `post_data`.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::crypto;
use crate::engine::EngineInput;
use crate::error::ChannelError;
use crate::types::DeviceId;
use crate::wire::{AuthFrame, FrameFlag, ModuleId};

/// Identifier of an open authenticated connection.
pub type AuthConnId = u64;

/// The platform auth-connection service (external collaborator).
#[async_trait]
pub trait AuthLink: Send + Sync + 'static {
    /// Open (or reuse) an authenticated connection to `peer`.
    async fn open_conn(&self, peer: &DeviceId) -> Result<AuthConnId, ChannelError>;

    /// Post raw bytes on an open connection.
    async fn post_data(&self, conn: AuthConnId, data: &[u8]) -> Result<(), ChannelError>;

    /// Close a connection. Idempotent.
    async fn close_conn(&self, conn: AuthConnId);

    /// The symmetric key agreed for `conn` during authentication.
    fn conn_key(&self, conn: AuthConnId) -> Result<[u8; 32], ChannelError>;
}

/// Seals, frames, and ships negotiation messages; reports async connection
/// opens back to the engine as inputs.
#[derive(Clone)]
pub struct AuthGateway {
    link: Arc<dyn AuthLink>,
}

impl AuthGateway {
    pub fn new(link: Arc<dyn AuthLink>) -> Self {
        Self { link }
    }

    /// Issue an asynchronous open. Exactly one `AuthOpened` or
    /// `AuthOpenFailed` input is delivered for `request_id`.
    pub fn open(&self, peer: DeviceId, request_id: u64, input_tx: mpsc::Sender<EngineInput>) {
        let link = self.link.clone();
        tokio::spawn(async move {
            let input = match link.open_conn(&peer).await {
                Ok(conn_id) => EngineInput::AuthOpened {
                    request_id,
                    conn_id,
                },
                Err(e) => {
                    tracing::debug!(peer = %peer, request_id, "auth open failed: {e}");
                    EngineInput::AuthOpenFailed {
                        request_id,
                        reason: e.to_string(),
                    }
                }
            };
            let _ = input_tx.send(input).await;
        });
    }

    /// Open a connection within the current command turn.
    pub async fn open_now(&self, peer: &DeviceId) -> Result<AuthConnId, ChannelError> {
        self.link.open_conn(peer).await
    }

    /// Seal `payload` with the connection key and post it as a negotiation
    /// frame.
    pub async fn send_frame(
        &self,
        conn: AuthConnId,
        flag: FrameFlag,
        seq: u64,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let key = self.link.conn_key(conn)?;
        let sealed = crypto::seal(&key, payload)?;
        let frame = AuthFrame::new(conn, ModuleId::UdpInfo, flag, seq, &sealed);
        self.link.post_data(conn, &frame.to_bytes()?).await
    }

    /// Seal and post an application payload for an auth or proxy channel.
    pub async fn send_message(&self, conn: AuthConnId, data: &[u8]) -> Result<(), ChannelError> {
        let key = self.link.conn_key(conn)?;
        let sealed = crypto::seal(&key, data)?;
        let frame = AuthFrame::new(conn, ModuleId::Message, FrameFlag::Request, 0, &sealed);
        self.link.post_data(conn, &frame.to_bytes()?).await
    }

    /// Parse an inbound frame and unseal its body.
    pub fn decode_frame(&self, data: &[u8]) -> Result<(AuthFrame, Vec<u8>), ChannelError> {
        let frame = AuthFrame::from_bytes(data)?;
        let key = self.link.conn_key(frame.conn_id)?;
        let payload = crypto::open(&key, &frame.sealed_body()?)?;
        Ok((frame, payload))
    }

    pub async fn close(&self, conn: AuthConnId) {
        self.link.close_conn(conn).await;
    }
}

// ── MockAuthLink (tests) ────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::mock::MockAuthLink;
    use super::*;

    const KEY: [u8; 32] = [9; 32];

    #[tokio::test]
    async fn send_frame_never_posts_plaintext() {
        let link = Arc::new(MockAuthLink::new(KEY));
        let gateway = AuthGateway::new(link.clone());
        let conn = gateway.open_now(&DeviceId::from("dev-b")).await.unwrap();

        gateway
            .send_frame(conn, FrameFlag::Request, 100, b"channel params")
            .await
            .unwrap();

        let posted = link.posted();
        assert_eq!(posted.len(), 1);
        let wire = String::from_utf8(posted[0].1.clone()).unwrap();
        assert!(!wire.contains("channel params"));
        assert!(!wire.contains(&hex::encode(b"channel params")));
    }

    #[tokio::test]
    async fn frame_roundtrip_through_gateway() {
        let link = Arc::new(MockAuthLink::new(KEY));
        let gateway = AuthGateway::new(link.clone());
        let conn = gateway.open_now(&DeviceId::from("dev-b")).await.unwrap();

        gateway
            .send_frame(conn, FrameFlag::Reply, 101, b"assigned port")
            .await
            .unwrap();

        let (_, wire) = link.posted().pop().unwrap();
        let (frame, payload) = gateway.decode_frame(&wire).unwrap();
        assert_eq!(frame.flag, FrameFlag::Reply);
        assert_eq!(frame.seq, 101);
        assert_eq!(frame.conn_id, conn);
        assert_eq!(payload, b"assigned port");
    }

    #[tokio::test]
    async fn decode_rejects_tampered_frame() {
        let link = Arc::new(MockAuthLink::new(KEY));
        let gateway = AuthGateway::new(link.clone());
        let conn = gateway.open_now(&DeviceId::from("dev-b")).await.unwrap();

        gateway
            .send_frame(conn, FrameFlag::Request, 2, b"payload")
            .await
            .unwrap();

        let (_, wire) = link.posted().pop().unwrap();
        let mut frame = AuthFrame::from_bytes(&wire).unwrap();
        let mut sealed = frame.sealed_body().unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        frame.body = hex::encode(sealed);

        let result = gateway.decode_frame(&frame.to_bytes().unwrap());
        assert!(matches!(result, Err(ChannelError::Crypto(_))));
    }

    #[tokio::test]
    async fn open_reports_failure_as_input() {
        let link = Arc::new(MockAuthLink::new(KEY));
        link.set_fail_opens(true);
        let gateway = AuthGateway::new(link);
        let (tx, mut rx) = mpsc::channel(4);

        gateway.open(DeviceId::from("dev-b"), 42, tx);

        match rx.recv().await.unwrap() {
            EngineInput::AuthOpenFailed { request_id, .. } => assert_eq!(request_id, 42),
            other => panic!("unexpected input: {other:?}"),
        }
    }
}
