//! Full-engine scenario tests.
//!
//! Spawn a real engine over mock collaborators and drive it end to end:
//! the mocks record lane releases, posted auth frames, and socket calls,
//! so every teardown branch can be checked for leaks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use nearbus_link::{
    ConnectOption, DataClass, DeviceId, LinkError, LinkProvider, LinkType, PathInfo,
};

use crate::auth::mock::MockAuthLink;
use crate::crypto;
use crate::error::ChannelError;
use crate::sockets::mock::MockSocketOps;
use crate::types::{ChannelIntent, ChannelType, MessageKind, SessionKey, SessionRequest};
use crate::wire::{AuthFrame, FrameFlag, ModuleId, NegotiateReply, NegotiateRequest, UdpConnKind};

use super::{ChannelEngine, ChannelEvent, EngineConfig, EngineHandle};

const KEY: [u8; 32] = [7; 32];

// ── Mock link provider ────────────────────────────────────────────────

struct MockProvider {
    option: ConnectOption,
    local_ip: std::net::IpAddr,
    supports_udp: bool,
    is_proxy: bool,
    fail: bool,
    next_path: AtomicU64,
    released: Mutex<Vec<u64>>,
}

impl MockProvider {
    fn udp() -> Self {
        Self {
            option: ConnectOption::P2p {
                local_ip: "192.168.49.1".parse().unwrap(),
                peer_ip: "192.168.49.2".parse().unwrap(),
            },
            local_ip: "192.168.49.1".parse().unwrap(),
            supports_udp: true,
            is_proxy: false,
            fail: false,
            next_path: AtomicU64::new(1),
            released: Mutex::new(Vec::new()),
        }
    }

    fn tcp() -> Self {
        Self {
            option: ConnectOption::Tcp {
                ip: "10.0.0.9".parse().unwrap(),
                port: 7100,
            },
            local_ip: "10.0.0.4".parse().unwrap(),
            supports_udp: false,
            is_proxy: false,
            fail: false,
            next_path: AtomicU64::new(1),
            released: Mutex::new(Vec::new()),
        }
    }

    fn proxy() -> Self {
        Self {
            is_proxy: true,
            ..Self::tcp()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::tcp()
        }
    }

    fn released(&self) -> Vec<u64> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl LinkProvider for MockProvider {
    async fn request_path(
        &self,
        peer: &DeviceId,
        _data_class: DataClass,
        _ranked: &[LinkType],
    ) -> Result<PathInfo, LinkError> {
        if self.fail {
            return Err(LinkError::NoPath {
                device_id: peer.to_string(),
            });
        }
        Ok(PathInfo {
            path_id: self.next_path.fetch_add(1, Ordering::Relaxed),
            option: self.option.clone(),
            local_ip: self.local_ip,
            supports_udp: self.supports_udp,
            is_proxy: self.is_proxy,
        })
    }

    async fn release_path(&self, path_id: u64) {
        self.released.lock().unwrap().push(path_id);
    }
}

// ── Harness ───────────────────────────────────────────────────────────

struct Harness {
    provider: Arc<MockProvider>,
    auth: Arc<MockAuthLink>,
    sockets: Arc<MockSocketOps>,
    handle: EngineHandle,
    events: mpsc::Receiver<ChannelEvent>,
}

fn spawn(provider: MockProvider) -> Harness {
    spawn_with(provider, EngineConfig::new())
}

fn spawn_with(provider: MockProvider, config: EngineConfig) -> Harness {
    let provider = Arc::new(provider);
    let auth = Arc::new(MockAuthLink::new(KEY));
    let sockets = Arc::new(MockSocketOps::new());
    let channels = ChannelEngine::spawn(
        DeviceId::from("dev-local"),
        provider.clone(),
        auth.clone(),
        sockets.clone(),
        config,
    );
    Harness {
        provider,
        auth,
        sockets,
        handle: channels.handle,
        events: channels.events,
    }
}

impl Harness {
    async fn next_event(&mut self) -> ChannelEvent {
        timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("engine stopped")
    }

    async fn assert_no_event(&mut self) {
        assert!(
            timeout(Duration::from_millis(150), self.events.recv())
                .await
                .is_err(),
            "unexpected event"
        );
    }

    /// Poll until the auth mock has recorded at least `count` frames.
    async fn wait_posted(&self, count: usize) -> Vec<(u64, Vec<u8>)> {
        for _ in 0..400 {
            let posted = self.auth.posted();
            if posted.len() >= count {
                return posted;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {count} posted frames, got {}",
            self.auth.posted().len()
        );
    }

    /// Poll until `count` lanes were released back to the link layer.
    async fn wait_released(&self, count: usize) {
        for _ in 0..400 {
            if self.provider.released().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {count} lane releases, got {}",
            self.provider.released().len()
        );
    }
}

fn request() -> SessionRequest {
    SessionRequest {
        peer: DeviceId::from("dev-peer"),
        data_class: DataClass::Bytes,
        preferred_links: vec![LinkType::Wlan, LinkType::P2p],
        group_id: "grp-7".into(),
        uid: 1000,
        pid: 2000,
        pkg_name: "com.example.cast".into(),
        local_session: "cast.source".into(),
        peer_session: "cast.sink".into(),
    }
}

fn decode(frame_bytes: &[u8]) -> (AuthFrame, Vec<u8>) {
    let frame = AuthFrame::from_bytes(frame_bytes).unwrap();
    let payload = crypto::open(&KEY, &frame.sealed_body().unwrap()).unwrap();
    (frame, payload)
}

fn seal_frame(conn: u64, flag: FrameFlag, seq: u64, payload: &[u8]) -> Vec<u8> {
    let sealed = crypto::seal(&KEY, payload).unwrap();
    AuthFrame::new(conn, ModuleId::UdpInfo, flag, seq, &sealed)
        .to_bytes()
        .unwrap()
}

fn inbound_open_request(channel_id: i32) -> NegotiateRequest {
    NegotiateRequest {
        channel_id,
        peer_channel_id: None,
        session_key: SessionKey::generate().to_hex(),
        business_type: DataClass::Stream,
        pkg_name: "com.example.remote".into(),
        session_name: "cast.sink".into(),
        group_id: "grp-7".into(),
        udp_conn_type: UdpConnKind::Wlan,
        intent: ChannelIntent::Open,
        device_id: DeviceId::from("dev-peer"),
    }
}

// ── Requester-side UDP ────────────────────────────────────────────────

#[tokio::test]
async fn udp_open_success() {
    let mut h = spawn(MockProvider::udp());

    let info = h.handle.open_channel(request()).await.unwrap();
    assert_eq!(info.channel_type, ChannelType::Udp);

    // The negotiation request goes out sealed on the auth connection.
    let posted = h.wait_posted(1).await;
    let (frame, payload) = decode(&posted[0].1);
    assert_eq!(frame.flag, FrameFlag::Request);
    assert_eq!(frame.seq % 2, 0, "requester sequences are even");

    // The acceptor would reconstruct exactly what we sent.
    let sent = NegotiateRequest::from_bytes(&payload).unwrap();
    assert_eq!(sent.channel_id, info.channel_id);
    assert_eq!(sent.intent, ChannelIntent::Open);
    assert_eq!(sent.pkg_name, "com.example.cast");
    assert_eq!(sent.session_name, "cast.sink");
    assert!(SessionKey::from_hex(&sent.session_key).is_ok());

    // Peer replies on the same sequence with its port.
    let reply = NegotiateReply {
        udp_port: 45555,
        channel_id: 9,
        device_id: DeviceId::from("dev-peer"),
    };
    h.handle
        .auth_data_received(seal_frame(
            frame.conn_id,
            FrameFlag::Reply,
            frame.seq,
            &reply.to_bytes().unwrap(),
        ))
        .await;

    match h.next_event().await {
        ChannelEvent::ChannelOpened { info: opened, peer } => {
            assert_eq!(opened, info);
            assert_eq!(peer, DeviceId::from("dev-peer"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Outbound endpoint bound at the peer's negotiated address.
    let connects = h.sockets.connects();
    assert_eq!(
        connects,
        vec![(
            info.channel_id,
            "192.168.49.2".parse().unwrap(),
            45555u16
        )]
    );
    assert_eq!(h.handle.open_channels().await, vec![info]);

    // The negotiation record is gone: re-delivering the reply is a no-op.
    let reply_again = seal_frame(
        frame.conn_id,
        FrameFlag::Reply,
        frame.seq,
        &reply.to_bytes().unwrap(),
    );
    h.handle.auth_data_received(reply_again).await;
    h.assert_no_event().await;
}

#[tokio::test]
async fn stale_reply_mutates_nothing() {
    let mut h = spawn(MockProvider::udp());

    let reply = NegotiateReply {
        udp_port: 40001,
        channel_id: 3,
        device_id: DeviceId::from("dev-peer"),
    };
    h.handle
        .auth_data_received(seal_frame(1, FrameFlag::Reply, 998, &reply.to_bytes().unwrap()))
        .await;

    h.assert_no_event().await;
    // Engine is still live and empty.
    assert!(h.handle.open_channels().await.is_empty());
    assert!(h.sockets.connects().is_empty());
}

#[tokio::test]
async fn peer_unreachable_releases_everything() {
    let mut h = spawn(MockProvider::udp());
    h.auth.set_fail_opens(true);

    let info = h.handle.open_channel(request()).await.unwrap();

    match h.next_event().await {
        ChannelEvent::OpenFailed { info: failed, .. } => assert_eq!(failed, info),
        other => panic!("unexpected event: {other:?}"),
    }
    h.wait_released(1).await;

    // Exactly one failure notification.
    h.assert_no_event().await;

    // Channel id is back in the pool and the record is gone.
    assert!(h.handle.open_channels().await.is_empty());
    assert!(h
        .handle
        .close_channel(info.channel_id, ChannelType::Udp)
        .await
        .is_ok());
}

#[tokio::test]
async fn pool_exhaustion_is_a_typed_error() {
    let mut h = spawn_with(
        MockProvider::udp(),
        EngineConfig::new().id_pool_capacity(2),
    );
    h.auth.set_hang_opens(true);

    h.handle.open_channel(request()).await.unwrap();
    h.handle.open_channel(request()).await.unwrap();

    let err = h.handle.open_channel(request()).await.unwrap_err();
    assert!(matches!(
        err,
        ChannelError::IdPoolExhausted {
            channel_type: ChannelType::Udp
        }
    ));
    // The third lane was acquired before allocation failed; it must not
    // leak.
    h.wait_released(1).await;
}

#[tokio::test]
async fn negotiation_times_out() {
    let mut h = spawn_with(
        MockProvider::udp(),
        EngineConfig::new()
            .tick_interval(Duration::from_millis(20))
            .handshake_timeout_ticks(2),
    );
    h.auth.set_hang_opens(true);

    let info = h.handle.open_channel(request()).await.unwrap();

    match h.next_event().await {
        ChannelEvent::OpenFailed { info: failed, reason } => {
            assert_eq!(failed, info);
            assert!(reason.contains("timed out"), "reason: {reason}");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    h.wait_released(1).await;
}

#[tokio::test]
async fn udp_finish_failure_tears_down() {
    let mut h = spawn(MockProvider::udp());
    h.sockets.set_fail_connects(true);

    let info = h.handle.open_channel(request()).await.unwrap();
    let posted = h.wait_posted(1).await;
    let (frame, _) = decode(&posted[0].1);

    let reply = NegotiateReply {
        udp_port: 45555,
        channel_id: 9,
        device_id: DeviceId::from("dev-peer"),
    };
    h.handle
        .auth_data_received(seal_frame(
            frame.conn_id,
            FrameFlag::Reply,
            frame.seq,
            &reply.to_bytes().unwrap(),
        ))
        .await;

    match h.next_event().await {
        ChannelEvent::OpenFailed { info: failed, .. } => assert_eq!(failed, info),
        other => panic!("unexpected event: {other:?}"),
    }
    h.wait_released(1).await;
    assert!(h.handle.open_channels().await.is_empty());
}

#[tokio::test]
async fn close_during_negotiation_opens_then_closes() {
    let mut h = spawn(MockProvider::udp());

    let info = h.handle.open_channel(request()).await.unwrap();
    let posted = h.wait_posted(1).await;
    let (frame, _) = decode(&posted[0].1);

    // Close lands while the reply is still in flight.
    h.handle
        .close_channel(info.channel_id, ChannelType::Udp)
        .await
        .unwrap();
    h.assert_no_event().await;

    let reply = NegotiateReply {
        udp_port: 45555,
        channel_id: 9,
        device_id: DeviceId::from("dev-peer"),
    };
    h.handle
        .auth_data_received(seal_frame(
            frame.conn_id,
            FrameFlag::Reply,
            frame.seq,
            &reply.to_bytes().unwrap(),
        ))
        .await;

    // Open completes, then the deferred close runs.
    assert!(matches!(
        h.next_event().await,
        ChannelEvent::ChannelOpened { .. }
    ));
    assert!(matches!(
        h.next_event().await,
        ChannelEvent::ChannelClosed { .. }
    ));

    // The peer heard about the teardown.
    let posted = h.wait_posted(2).await;
    let (close_frame, close_payload) = decode(&posted[1].1);
    assert_eq!(close_frame.flag, FrameFlag::Request);
    let close = NegotiateRequest::from_bytes(&close_payload).unwrap();
    assert_eq!(close.intent, ChannelIntent::Close);
    assert_eq!(close.peer_channel_id, Some(9));

    h.wait_released(1).await;
    assert!(h.handle.open_channels().await.is_empty());
}

// ── Acceptor-side UDP ─────────────────────────────────────────────────

#[tokio::test]
async fn inbound_open_is_accepted_with_local_port() {
    let mut h = spawn(MockProvider::udp());

    let open = inbound_open_request(55);
    h.handle
        .auth_data_received(seal_frame(21, FrameFlag::Request, 100, &open.to_bytes().unwrap()))
        .await;

    let accepted = match h.next_event().await {
        ChannelEvent::ChannelAccepted {
            info,
            peer,
            session_name,
        } => {
            assert_eq!(info.channel_type, ChannelType::Udp);
            assert_eq!(peer, DeviceId::from("dev-peer"));
            assert_eq!(session_name, "cast.sink");
            info
        }
        other => panic!("unexpected event: {other:?}"),
    };

    // Reply goes back on the same sequence with the bound port.
    let posted = h.wait_posted(1).await;
    let (frame, payload) = decode(&posted[0].1);
    assert_eq!(frame.flag, FrameFlag::Reply);
    assert_eq!(frame.seq, 100);
    let reply = NegotiateReply::from_bytes(&payload).unwrap();
    assert_eq!(reply.udp_port, h.sockets.udp_port);
    assert_eq!(reply.channel_id, accepted.channel_id);
    assert_eq!(reply.device_id, DeviceId::from("dev-local"));
    assert_eq!(h.sockets.binds(), vec![accepted.channel_id]);
}

#[tokio::test]
async fn inbound_open_rolls_back_without_replying() {
    let mut h = spawn(MockProvider::udp());
    h.sockets.set_fail_binds(true);

    let open = inbound_open_request(55);
    h.handle
        .auth_data_received(seal_frame(21, FrameFlag::Request, 100, &open.to_bytes().unwrap()))
        .await;

    assert!(matches!(
        h.next_event().await,
        ChannelEvent::OpenFailed { .. }
    ));
    // Silent on the wire: the requester's reaper handles it.
    h.assert_no_event().await;
    assert!(h.auth.posted().is_empty());

    // The server-side id went back to the pool.
    h.sockets.set_fail_binds(false);
    h.handle
        .auth_data_received(seal_frame(21, FrameFlag::Request, 102, &open.to_bytes().unwrap()))
        .await;
    match h.next_event().await {
        ChannelEvent::ChannelAccepted { info, .. } => assert_eq!(info.channel_id, 1),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn remote_close_tears_down_accepted_channel() {
    let mut h = spawn(MockProvider::udp());

    let open = inbound_open_request(55);
    h.handle
        .auth_data_received(seal_frame(21, FrameFlag::Request, 100, &open.to_bytes().unwrap()))
        .await;
    let accepted = match h.next_event().await {
        ChannelEvent::ChannelAccepted { info, .. } => info,
        other => panic!("unexpected event: {other:?}"),
    };

    let mut close = inbound_open_request(55);
    close.intent = ChannelIntent::Close;
    close.peer_channel_id = Some(accepted.channel_id);
    h.handle
        .auth_data_received(seal_frame(21, FrameFlag::Request, 102, &close.to_bytes().unwrap()))
        .await;

    match h.next_event().await {
        ChannelEvent::ChannelClosed { info } => assert_eq!(info, accepted),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(h
        .sockets
        .closes()
        .contains(&(accepted.channel_id, ChannelType::Udp)));

    // Teardown is confirmed on the close sequence.
    let posted = h.wait_posted(2).await;
    let (frame, _) = decode(&posted[1].1);
    assert_eq!(frame.flag, FrameFlag::Reply);
    assert_eq!(frame.seq, 102);
}

// ── TCP-direct ────────────────────────────────────────────────────────

#[tokio::test]
async fn tcp_direct_lifecycle_and_close_idempotence() {
    let mut h = spawn(MockProvider::tcp());

    let info = h.handle.open_channel(request()).await.unwrap();
    assert_eq!(info.channel_type, ChannelType::TcpDirect);

    // Mid-handshake the channel refuses data.
    let err = h
        .handle
        .send_msg(info.channel_id, info.channel_type, b"early".to_vec(), MessageKind::Bytes)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::WrongChannelState { .. }));

    h.handle.tcp_handshake_done(info.channel_id, true).await;
    assert!(matches!(
        h.next_event().await,
        ChannelEvent::ChannelOpened { .. }
    ));

    h.handle
        .send_msg(info.channel_id, info.channel_type, b"hello".to_vec(), MessageKind::Bytes)
        .await
        .unwrap();
    assert_eq!(h.sockets.streams(), vec![(info.channel_id, b"hello".to_vec())]);

    h.handle
        .close_channel(info.channel_id, info.channel_type)
        .await
        .unwrap();
    assert!(matches!(
        h.next_event().await,
        ChannelEvent::ChannelClosed { .. }
    ));
    h.wait_released(1).await;
    assert!(h
        .sockets
        .closes()
        .contains(&(info.channel_id, ChannelType::TcpDirect)));

    // Second close: no-op, no double lane release, no event.
    h.handle
        .close_channel(info.channel_id, info.channel_type)
        .await
        .unwrap();
    h.assert_no_event().await;
    assert_eq!(h.provider.released().len(), 1);
}

#[tokio::test]
async fn tcp_handshake_failure_releases_lane() {
    let mut h = spawn(MockProvider::tcp());

    let info = h.handle.open_channel(request()).await.unwrap();
    h.handle.tcp_handshake_done(info.channel_id, false).await;

    match h.next_event().await {
        ChannelEvent::OpenFailed { info: failed, .. } => assert_eq!(failed, info),
        other => panic!("unexpected event: {other:?}"),
    }
    h.wait_released(1).await;
    assert!(h.handle.open_channels().await.is_empty());
}

#[tokio::test]
async fn connecting_channels_are_reaped() {
    let mut h = spawn_with(
        MockProvider::tcp(),
        EngineConfig::new()
            .tick_interval(Duration::from_millis(20))
            .handshake_timeout_ticks(2),
    );

    let info = h.handle.open_channel(request()).await.unwrap();
    // Never report the handshake: the reaper fails it.
    match h.next_event().await {
        ChannelEvent::OpenFailed { info: failed, reason } => {
            assert_eq!(failed, info);
            assert!(reason.contains("timed out"), "reason: {reason}");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    h.wait_released(1).await;
}

// ── Proxy and auth channels ───────────────────────────────────────────

#[tokio::test]
async fn proxy_open_routes_sends_through_gateway() {
    let mut h = spawn(MockProvider::proxy());

    let info = h.handle.open_channel(request()).await.unwrap();
    assert_eq!(info.channel_type, ChannelType::Proxy);
    assert!(matches!(
        h.next_event().await,
        ChannelEvent::ChannelOpened { .. }
    ));

    h.handle
        .send_msg(info.channel_id, info.channel_type, b"proxied".to_vec(), MessageKind::Message)
        .await
        .unwrap();

    let posted = h.wait_posted(1).await;
    let (frame, payload) = decode(&posted[0].1);
    assert_eq!(frame.module, ModuleId::Message);
    assert_eq!(payload, b"proxied");
}

#[tokio::test]
async fn auth_channel_lifecycle() {
    let mut h = spawn(MockProvider::tcp());

    let info = h
        .handle
        .open_auth_channel(DeviceId::from("dev-peer"))
        .await
        .unwrap();
    assert_eq!(info.channel_type, ChannelType::Auth);
    assert!(matches!(
        h.next_event().await,
        ChannelEvent::ChannelOpened { .. }
    ));

    h.handle
        .send_msg(info.channel_id, info.channel_type, b"control".to_vec(), MessageKind::Message)
        .await
        .unwrap();
    let posted = h.wait_posted(1).await;
    let conn = posted[0].0;

    // Inbound payloads on that connection surface as messages.
    let sealed = crypto::seal(&KEY, b"pong").unwrap();
    let inbound = AuthFrame::new(conn, ModuleId::Message, FrameFlag::Request, 0, &sealed)
        .to_bytes()
        .unwrap();
    h.handle.auth_data_received(inbound).await;
    match h.next_event().await {
        ChannelEvent::MessageReceived { info: on, payload } => {
            assert_eq!(on, info);
            assert_eq!(payload, b"pong");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    h.handle
        .close_channel(info.channel_id, info.channel_type)
        .await
        .unwrap();
    assert!(matches!(
        h.next_event().await,
        ChannelEvent::ChannelClosed { .. }
    ));
    assert!(h.auth.closed().contains(&conn));
}

// ── Lane and sweep behavior ───────────────────────────────────────────

#[tokio::test]
async fn no_path_creates_no_state() {
    let h = spawn(MockProvider::failing());

    let err = h.handle.open_channel(request()).await.unwrap_err();
    assert!(matches!(
        err,
        ChannelError::Link(LinkError::NoPath { .. })
    ));
    assert!(h.handle.open_channels().await.is_empty());
    assert!(h.provider.released().is_empty());
}

#[tokio::test]
async fn send_on_udp_channel_is_refused() {
    let mut h = spawn(MockProvider::udp());

    let info = h.handle.open_channel(request()).await.unwrap();
    let posted = h.wait_posted(1).await;
    let (frame, _) = decode(&posted[0].1);
    let reply = NegotiateReply {
        udp_port: 45555,
        channel_id: 9,
        device_id: DeviceId::from("dev-peer"),
    };
    h.handle
        .auth_data_received(seal_frame(
            frame.conn_id,
            FrameFlag::Reply,
            frame.seq,
            &reply.to_bytes().unwrap(),
        ))
        .await;
    assert!(matches!(
        h.next_event().await,
        ChannelEvent::ChannelOpened { .. }
    ));

    // UDP payloads flow on the negotiated socket, not through the engine.
    let err = h
        .handle
        .send_msg(info.channel_id, ChannelType::Udp, b"data".to_vec(), MessageKind::Bytes)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::WrongChannelType { .. }));
}

#[tokio::test]
async fn client_death_sweeps_open_channels() {
    let mut h = spawn(MockProvider::tcp());

    let info = h.handle.open_channel(request()).await.unwrap();
    h.handle.tcp_handshake_done(info.channel_id, true).await;
    assert!(matches!(
        h.next_event().await,
        ChannelEvent::ChannelOpened { .. }
    ));

    h.handle.client_death("com.example.cast").await;
    match h.next_event().await {
        ChannelEvent::ChannelClosed { info: closed } => assert_eq!(closed, info),
        other => panic!("unexpected event: {other:?}"),
    }
    h.wait_released(1).await;
    assert!(h.handle.open_channels().await.is_empty());
}

#[tokio::test]
async fn client_death_aborts_pending_negotiation() {
    let mut h = spawn(MockProvider::udp());
    h.auth.set_hang_opens(true);

    h.handle.open_channel(request()).await.unwrap();
    h.handle.client_death("com.example.cast").await;

    // Silent teardown: the client is gone, nobody to notify.
    h.wait_released(1).await;
    h.assert_no_event().await;

    // Id and lane are free again.
    h.auth.set_hang_opens(false);
    let info = h.handle.open_channel(request()).await.unwrap();
    assert_eq!(info.channel_id, 1);
}
