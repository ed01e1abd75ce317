/// Pure engine state — every channel table and negotiation record.
///
/// No I/O, no async. Handlers mutate the tables and return `Vec<Effect>`
/// for the executor. The loop performs socket and gateway calls between
/// handler steps and feeds the results back in, so every failure branch
/// runs through a handler that releases what was acquired.
use std::collections::HashMap;

use nearbus_link::{Lane, LaneId};

use crate::auth::AuthConnId;
use crate::error::ChannelError;
use crate::pool::{IdPool, SeqGenerator, SeqRole};
use crate::types::{
    AppInfo, AppKind, ChannelIntent, ChannelStatus, ChannelType, DataClass, DeviceId, RouteType,
    SessionKey, SessionRequest, TransInfo,
};
use crate::wire::{FrameFlag, NegotiateReply, NegotiateRequest, UdpConnKind};

use super::effect::Effect;
use super::{ChannelEvent, EngineConfig};

// ── Records ───────────────────────────────────────────────────────────

/// Setup stage of a UDP negotiation. Advances strictly forward; any
/// failure deletes the record instead of reaching `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum NegotiationStage {
    Init,
    OpenAuth,
    Negotiating,
    Done,
}

impl NegotiationStage {
    fn can_advance(self, to: NegotiationStage) -> bool {
        matches!(
            (self, to),
            (NegotiationStage::Init, NegotiationStage::OpenAuth)
                | (NegotiationStage::OpenAuth, NegotiationStage::Negotiating)
                | (NegotiationStage::Negotiating, NegotiationStage::Done)
        )
    }
}

/// In-flight UDP setup (or teardown) exchange, keyed by sequence.
#[derive(Debug)]
pub(super) struct UdpNegotiation {
    pub seq: u64,
    pub stage: NegotiationStage,
    /// Correlates the auth-open callback; the pending-auth table owns the
    /// reverse mapping.
    #[allow(dead_code)]
    pub request_id: u64,
    pub conn_id: Option<AuthConnId>,
    pub app: AppInfo,
    pub lane_id: Option<LaneId>,
    pub data_class: DataClass,
    pub group_id: String,
    pub ticks: u32,
    pub close_requested: bool,
}

impl UdpNegotiation {
    fn advance(&mut self, to: NegotiationStage) {
        debug_assert!(
            self.stage.can_advance(to),
            "illegal stage transition {:?} -> {to:?}",
            self.stage
        );
        self.stage = to;
    }
}

/// An established (or connecting) channel.
#[derive(Debug)]
pub(super) struct ChannelRecord {
    pub info: TransInfo,
    pub status: ChannelStatus,
    pub lane_id: Option<LaneId>,
    pub conn_id: Option<AuthConnId>,
    pub app: AppInfo,
    pub ticks: u32,
}

/// What an in-flight auth-connection open will complete.
enum PendingAuth {
    /// The requester side of a UDP channel setup.
    UdpOpen { seq: u64 },
    /// An auth control channel.
    AuthChannel { channel_id: i32 },
    /// Best-effort close notification for a UDP channel already cleaned
    /// up locally. One retry on auth-open failure, then give up.
    UdpClose {
        peer: DeviceId,
        seq: u64,
        payload: Vec<u8>,
        retried: bool,
    },
}

/// Where `send_msg` should route a payload.
pub(super) enum SendRoute {
    Auth(AuthConnId),
    Stream,
}

// ── EngineState ───────────────────────────────────────────────────────

pub(super) struct EngineState {
    local_device: DeviceId,
    timeout_ticks: u32,

    tcp_pool: IdPool,
    proxy_pool: IdPool,
    udp_pool: IdPool,
    auth_pool: IdPool,

    seq_requester: SeqGenerator,
    seq_acceptor: SeqGenerator,
    next_request_id: u64,

    /// Lane table: which lane a channel rides on.
    lanes: HashMap<(i32, ChannelType), LaneId>,
    /// Established channels, keyed by (id, type).
    records: HashMap<(i32, ChannelType), ChannelRecord>,
    /// In-flight UDP negotiations, keyed by sequence.
    negotiations: HashMap<u64, UdpNegotiation>,
    /// In-flight auth-connection opens, keyed by request id.
    pending_auth: HashMap<u64, PendingAuth>,
}

impl EngineState {
    pub fn new(local_device: DeviceId, config: &EngineConfig) -> Self {
        let capacity = config.id_pool_capacity;
        Self {
            local_device,
            timeout_ticks: config.handshake_timeout_ticks,
            tcp_pool: IdPool::new(ChannelType::TcpDirect, capacity),
            proxy_pool: IdPool::new(ChannelType::Proxy, capacity),
            udp_pool: IdPool::new(ChannelType::Udp, capacity),
            auth_pool: IdPool::new(ChannelType::Auth, capacity),
            seq_requester: SeqGenerator::new(SeqRole::Requester),
            seq_acceptor: SeqGenerator::new(SeqRole::Acceptor),
            next_request_id: 1,
            lanes: HashMap::new(),
            records: HashMap::new(),
            negotiations: HashMap::new(),
            pending_auth: HashMap::new(),
        }
    }

    fn pool(&self, channel_type: ChannelType) -> &IdPool {
        match channel_type {
            ChannelType::TcpDirect => &self.tcp_pool,
            ChannelType::Proxy => &self.proxy_pool,
            ChannelType::Udp => &self.udp_pool,
            ChannelType::Auth => &self.auth_pool,
        }
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn seq_for(&self, is_server: bool) -> u64 {
        if is_server {
            self.seq_acceptor.next()
        } else {
            self.seq_requester.next()
        }
    }

    // ── UDP open, requester side ──────────────────────────────────────

    /// Build the negotiation context for a UDP open and ask for the auth
    /// connection. On error nothing is registered; the caller still owns
    /// the lane.
    pub fn start_udp_open(
        &mut self,
        request: &SessionRequest,
        lane: &Lane,
    ) -> Result<(TransInfo, Vec<Effect>), ChannelError> {
        let Some(peer_ip) = lane.path.option.peer_ip() else {
            return Err(ChannelError::Link(nearbus_link::LinkError::Rejected {
                reason: "resolved path carries no peer address for udp".into(),
            }));
        };
        let channel_id = self.udp_pool.allocate()?;

        let app = AppInfo {
            local_device: self.local_device.clone(),
            peer_device: request.peer.clone(),
            local_session: request.local_session.clone(),
            peer_session: request.peer_session.clone(),
            pkg_name: request.pkg_name.clone(),
            session_key: SessionKey::generate(),
            channel_id,
            peer_channel_id: None,
            intent: ChannelIntent::Open,
            route: lane.path.option.route(),
            local_ip: Some(lane.path.local_ip),
            local_port: None,
            peer_ip: Some(peer_ip),
            peer_port: None,
            kind: AppKind::Normal,
            is_server: false,
            uid: request.uid,
            pid: request.pid,
        };

        let seq = self.seq_requester.next();
        let request_id = self.next_request_id();
        let mut negotiation = UdpNegotiation {
            seq,
            stage: NegotiationStage::Init,
            request_id,
            conn_id: None,
            app,
            lane_id: Some(lane.id),
            data_class: request.data_class,
            group_id: request.group_id.clone(),
            ticks: 0,
            close_requested: false,
        };
        negotiation.advance(NegotiationStage::OpenAuth);

        let info = TransInfo {
            channel_id,
            channel_type: ChannelType::Udp,
        };
        self.pending_auth
            .insert(request_id, PendingAuth::UdpOpen { seq });
        self.negotiations.insert(seq, negotiation);
        self.lanes.insert((channel_id, ChannelType::Udp), lane.id);

        tracing::debug!(channel_id, seq, "udp open started");
        Ok((
            info,
            vec![Effect::OpenAuth {
                peer: request.peer.clone(),
                request_id,
            }],
        ))
    }

    pub fn handle_auth_opened(&mut self, request_id: u64, conn: AuthConnId) -> Vec<Effect> {
        match self.pending_auth.remove(&request_id) {
            Some(PendingAuth::UdpOpen { seq }) => {
                let Some(negotiation) = self.negotiations.get_mut(&seq) else {
                    // Torn down (timeout or death sweep) before the open
                    // completed.
                    return vec![Effect::CloseAuth { conn }];
                };
                negotiation.conn_id = Some(conn);
                negotiation.advance(NegotiationStage::Negotiating);

                let payload = NegotiateRequest {
                    channel_id: negotiation.app.channel_id,
                    peer_channel_id: None,
                    session_key: negotiation.app.session_key.to_hex(),
                    business_type: negotiation.data_class,
                    pkg_name: negotiation.app.pkg_name.clone(),
                    session_name: negotiation.app.peer_session.clone(),
                    group_id: negotiation.group_id.clone(),
                    udp_conn_type: udp_conn_kind(negotiation.app.route),
                    intent: ChannelIntent::Open,
                    device_id: negotiation.app.local_device.clone(),
                };
                match payload.to_bytes() {
                    Ok(bytes) => vec![Effect::SendFrame {
                        conn,
                        flag: FrameFlag::Request,
                        seq,
                        payload: bytes,
                    }],
                    Err(e) => {
                        let mut effects = self.teardown_negotiation(seq, &e.to_string(), true);
                        effects.push(Effect::CloseAuth { conn });
                        effects
                    }
                }
            }
            Some(PendingAuth::AuthChannel { channel_id }) => {
                let key = (channel_id, ChannelType::Auth);
                let Some(record) = self.records.get_mut(&key) else {
                    return vec![Effect::CloseAuth { conn }];
                };
                record.status = ChannelStatus::Open;
                record.conn_id = Some(conn);
                vec![Effect::Emit(ChannelEvent::ChannelOpened {
                    info: record.info,
                    peer: record.app.peer_device.clone(),
                })]
            }
            Some(PendingAuth::UdpClose { seq, payload, .. }) => vec![
                Effect::SendFrame {
                    conn,
                    flag: FrameFlag::Request,
                    seq,
                    payload,
                },
                Effect::CloseAuth { conn },
            ],
            None => {
                tracing::debug!(request_id, "auth open completed for unknown request");
                vec![Effect::CloseAuth { conn }]
            }
        }
    }

    pub fn handle_auth_open_failed(&mut self, request_id: u64, reason: &str) -> Vec<Effect> {
        match self.pending_auth.remove(&request_id) {
            Some(PendingAuth::UdpOpen { seq }) => self.teardown_negotiation(seq, reason, true),
            Some(PendingAuth::AuthChannel { channel_id }) => {
                let key = (channel_id, ChannelType::Auth);
                let Some(record) = self.records.remove(&key) else {
                    return vec![];
                };
                self.auth_pool.release(channel_id);
                vec![Effect::Emit(ChannelEvent::OpenFailed {
                    info: record.info,
                    reason: reason.to_string(),
                })]
            }
            Some(PendingAuth::UdpClose {
                peer,
                seq,
                payload,
                retried,
            }) => {
                if retried {
                    tracing::debug!(seq, "close notification abandoned, peer unreachable");
                    return vec![];
                }
                let request_id = self.next_request_id();
                self.pending_auth.insert(
                    request_id,
                    PendingAuth::UdpClose {
                        peer: peer.clone(),
                        seq,
                        payload,
                        retried: true,
                    },
                );
                vec![Effect::OpenAuth { peer, request_id }]
            }
            None => {
                tracing::debug!(request_id, "auth open failure for unknown request");
                vec![]
            }
        }
    }

    /// Claim the negotiation a reply belongs to and apply the peer's
    /// endpoint data. Stale or duplicate replies return `None` and mutate
    /// nothing.
    pub fn take_reply_target(
        &mut self,
        seq: u64,
        reply: &NegotiateReply,
    ) -> Option<UdpNegotiation> {
        match self.negotiations.get(&seq).map(|n| n.stage) {
            Some(NegotiationStage::Negotiating) => {}
            Some(stage) => {
                tracing::debug!(seq, ?stage, "reply before request was sent, dropped");
                return None;
            }
            None => {
                tracing::debug!(seq, "stale reply dropped");
                return None;
            }
        }
        let mut negotiation = self
            .negotiations
            .remove(&seq)
            .expect("negotiation checked above");
        negotiation.advance(NegotiationStage::Done);
        negotiation.app.peer_port = Some(reply.udp_port);
        negotiation.app.peer_channel_id = Some(reply.channel_id);
        Some(negotiation)
    }

    /// Finalize a UDP open after the outbound endpoint is bound.
    pub fn complete_udp(&mut self, mut negotiation: UdpNegotiation, local_port: u16) -> Vec<Effect> {
        negotiation.app.local_port = Some(local_port);
        let info = TransInfo {
            channel_id: negotiation.app.channel_id,
            channel_type: ChannelType::Udp,
        };
        let peer = negotiation.app.peer_device.clone();
        let conn = negotiation.conn_id;

        let mut effects = vec![Effect::Emit(ChannelEvent::ChannelOpened { info, peer })];

        if negotiation.close_requested {
            // Close arrived mid-negotiation: open, then immediately close.
            tracing::debug!(channel_id = info.channel_id, "applying deferred close");
            let close_seq = self.seq_for(negotiation.app.is_server);
            if let (Some(conn), Ok(payload)) = (conn, self.build_close_request(&negotiation)) {
                effects.push(Effect::SendFrame {
                    conn,
                    flag: FrameFlag::Request,
                    seq: close_seq,
                    payload,
                });
            }
            self.udp_pool.release(info.channel_id);
            effects.push(Effect::CloseSocket {
                channel_id: info.channel_id,
                channel_type: ChannelType::Udp,
            });
            if let Some(lane_id) = self.lanes.remove(&(info.channel_id, ChannelType::Udp)) {
                effects.push(Effect::ReleaseLane { lane_id });
            }
            effects.push(Effect::Emit(ChannelEvent::ChannelClosed { info }));
        } else {
            self.records.insert(
                (info.channel_id, ChannelType::Udp),
                ChannelRecord {
                    info,
                    status: ChannelStatus::Open,
                    lane_id: negotiation.lane_id,
                    conn_id: None,
                    app: negotiation.app,
                    ticks: 0,
                },
            );
            tracing::info!(channel_id = info.channel_id, "udp channel open");
        }

        if let Some(conn) = conn {
            effects.push(Effect::CloseAuth { conn });
        }
        effects
    }

    /// Tear down a UDP open whose finish step failed.
    pub fn fail_udp(&mut self, negotiation: UdpNegotiation, reason: &str) -> Vec<Effect> {
        let info = TransInfo {
            channel_id: negotiation.app.channel_id,
            channel_type: ChannelType::Udp,
        };
        self.udp_pool.release(info.channel_id);
        self.lanes.remove(&(info.channel_id, ChannelType::Udp));

        let mut effects = Vec::new();
        if let Some(lane_id) = negotiation.lane_id {
            effects.push(Effect::ReleaseLane { lane_id });
        }
        effects.push(Effect::Emit(ChannelEvent::OpenFailed {
            info,
            reason: reason.to_string(),
        }));
        if let Some(conn) = negotiation.conn_id {
            effects.push(Effect::CloseAuth { conn });
        }
        effects
    }

    // ── UDP accept, acceptor side ─────────────────────────────────────

    /// Allocate the server-side channel id for an inbound open request.
    pub fn accept_begin(&mut self) -> Result<i32, ChannelError> {
        self.udp_pool.allocate()
    }

    /// Roll back an inbound open that failed after id allocation. No
    /// reply is sent; the requester's reaper fails the open.
    pub fn accept_abort(&mut self, channel_id: i32, reason: &str) -> Vec<Effect> {
        self.udp_pool.release(channel_id);
        vec![Effect::Emit(ChannelEvent::OpenFailed {
            info: TransInfo {
                channel_id,
                channel_type: ChannelType::Udp,
            },
            reason: reason.to_string(),
        })]
    }

    /// Register the accepted channel and reply with our endpoint.
    pub fn accept_finish(
        &mut self,
        conn: AuthConnId,
        seq: u64,
        request: NegotiateRequest,
        channel_id: i32,
        local_ip: std::net::IpAddr,
        local_port: u16,
    ) -> Vec<Effect> {
        let session_key = match SessionKey::from_hex(&request.session_key) {
            Ok(key) => key,
            Err(e) => return self.accept_abort(channel_id, &e.to_string()),
        };

        let info = TransInfo {
            channel_id,
            channel_type: ChannelType::Udp,
        };
        let reply = NegotiateReply {
            udp_port: local_port,
            channel_id,
            device_id: self.local_device.clone(),
        };
        let reply_bytes = match reply.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return self.accept_abort(channel_id, &e.to_string()),
        };

        let app = AppInfo {
            local_device: self.local_device.clone(),
            peer_device: request.device_id.clone(),
            local_session: request.session_name.clone(),
            peer_session: String::new(),
            pkg_name: request.pkg_name.clone(),
            session_key,
            channel_id,
            peer_channel_id: Some(request.channel_id),
            intent: ChannelIntent::Open,
            route: match request.udp_conn_type {
                UdpConnKind::P2p => RouteType::P2p,
                UdpConnKind::Wlan => RouteType::Wlan,
            },
            local_ip: Some(local_ip),
            local_port: Some(local_port),
            peer_ip: None,
            peer_port: None,
            kind: AppKind::Normal,
            is_server: true,
            uid: -1,
            pid: -1,
        };
        let peer = app.peer_device.clone();
        let session_name = app.local_session.clone();
        self.records.insert(
            (channel_id, ChannelType::Udp),
            ChannelRecord {
                info,
                status: ChannelStatus::Open,
                lane_id: None,
                conn_id: None,
                app,
                ticks: 0,
            },
        );

        tracing::info!(channel_id, seq, "udp channel accepted");
        vec![
            Effect::SendFrame {
                conn,
                flag: FrameFlag::Reply,
                seq,
                payload: reply_bytes,
            },
            Effect::Emit(ChannelEvent::ChannelAccepted {
                info,
                peer,
                session_name,
            }),
        ]
    }

    /// Peer asked us to tear down a channel we hold.
    pub fn handle_remote_close(
        &mut self,
        conn: AuthConnId,
        seq: u64,
        request: &NegotiateRequest,
    ) -> Vec<Effect> {
        let Some(target) = request.peer_channel_id else {
            tracing::debug!(seq, "close request without a target channel, dropped");
            return vec![];
        };

        let mut effects = Vec::new();
        if let Some(record) = self.records.remove(&(target, ChannelType::Udp)) {
            self.udp_pool.release(target);
            self.lanes.remove(&(target, ChannelType::Udp));
            effects.push(Effect::CloseSocket {
                channel_id: target,
                channel_type: ChannelType::Udp,
            });
            if let Some(lane_id) = record.lane_id {
                effects.push(Effect::ReleaseLane { lane_id });
            }
            effects.push(Effect::Emit(ChannelEvent::ChannelClosed { info: record.info }));
            tracing::info!(channel_id = target, "udp channel closed by peer");
        } else {
            tracing::debug!(channel_id = target, "close request for unknown channel");
        }

        // Confirm regardless: the peer's close is idempotent too.
        let confirm = NegotiateReply {
            udp_port: 0,
            channel_id: target,
            device_id: self.local_device.clone(),
        };
        if let Ok(payload) = confirm.to_bytes() {
            effects.push(Effect::SendFrame {
                conn,
                flag: FrameFlag::Reply,
                seq,
                payload,
            });
        }
        effects
    }

    // ── TCP-direct and proxy ──────────────────────────────────────────

    /// Register a connecting TCP-direct channel.
    pub fn open_tcp(
        &mut self,
        request: &SessionRequest,
        lane: &Lane,
    ) -> Result<TransInfo, ChannelError> {
        let channel_id = self.tcp_pool.allocate()?;
        let info = TransInfo {
            channel_id,
            channel_type: ChannelType::TcpDirect,
        };
        self.records.insert(
            (channel_id, ChannelType::TcpDirect),
            ChannelRecord {
                info,
                status: ChannelStatus::Connecting,
                lane_id: Some(lane.id),
                conn_id: None,
                app: direct_app_info(&self.local_device, request, lane, channel_id),
                ticks: 0,
            },
        );
        self.lanes
            .insert((channel_id, ChannelType::TcpDirect), lane.id);
        Ok(info)
    }

    /// Allocate a proxy channel id.
    pub fn proxy_begin(&mut self) -> Result<i32, ChannelError> {
        self.proxy_pool.allocate()
    }

    /// Register an opened proxy channel.
    pub fn proxy_finish(
        &mut self,
        request: &SessionRequest,
        lane: &Lane,
        channel_id: i32,
        conn: AuthConnId,
    ) -> (TransInfo, Vec<Effect>) {
        let info = TransInfo {
            channel_id,
            channel_type: ChannelType::Proxy,
        };
        let app = direct_app_info(&self.local_device, request, lane, channel_id);
        let peer = app.peer_device.clone();
        self.records.insert(
            (channel_id, ChannelType::Proxy),
            ChannelRecord {
                info,
                status: ChannelStatus::Open,
                lane_id: Some(lane.id),
                conn_id: Some(conn),
                app,
                ticks: 0,
            },
        );
        self.lanes.insert((channel_id, ChannelType::Proxy), lane.id);
        (
            info,
            vec![Effect::Emit(ChannelEvent::ChannelOpened { info, peer })],
        )
    }

    /// Release a proxy id claimed by `proxy_begin` after a failed open.
    pub fn proxy_abort(&mut self, channel_id: i32) {
        self.proxy_pool.release(channel_id);
    }

    /// Drop a registered channel whose transport open failed before the
    /// caller got an id back. Quiet: the caller receives the error
    /// directly instead of an event.
    pub fn abort_open(&mut self, info: TransInfo) -> Vec<Effect> {
        let key = (info.channel_id, info.channel_type);
        self.records.remove(&key);
        self.pool(info.channel_type).release(info.channel_id);
        match self.lanes.remove(&key) {
            Some(lane_id) => vec![Effect::ReleaseLane { lane_id }],
            None => vec![],
        }
    }

    pub fn handle_tcp_opened(&mut self, channel_id: i32, success: bool) -> Vec<Effect> {
        let key = (channel_id, ChannelType::TcpDirect);
        if success {
            let Some(record) = self.records.get_mut(&key) else {
                tracing::debug!(channel_id, "handshake completion for unknown channel");
                return vec![];
            };
            record.status = ChannelStatus::Open;
            tracing::info!(channel_id, "tcp-direct channel open");
            return vec![Effect::Emit(ChannelEvent::ChannelOpened {
                info: record.info,
                peer: record.app.peer_device.clone(),
            })];
        }

        let Some(record) = self.records.remove(&key) else {
            return vec![];
        };
        self.tcp_pool.release(channel_id);
        self.lanes.remove(&key);
        let mut effects = vec![Effect::CloseSocket {
            channel_id,
            channel_type: ChannelType::TcpDirect,
        }];
        if let Some(lane_id) = record.lane_id {
            effects.push(Effect::ReleaseLane { lane_id });
        }
        effects.push(Effect::Emit(ChannelEvent::OpenFailed {
            info: record.info,
            reason: "transport handshake failed".into(),
        }));
        effects
    }

    // ── Auth channels ─────────────────────────────────────────────────

    /// Open a control channel riding the auth link itself.
    pub fn open_auth_channel(
        &mut self,
        peer: &DeviceId,
    ) -> Result<(TransInfo, Vec<Effect>), ChannelError> {
        let channel_id = self.auth_pool.allocate()?;
        let info = TransInfo {
            channel_id,
            channel_type: ChannelType::Auth,
        };
        let request_id = self.next_request_id();
        self.pending_auth
            .insert(request_id, PendingAuth::AuthChannel { channel_id });
        self.records.insert(
            (channel_id, ChannelType::Auth),
            ChannelRecord {
                info,
                status: ChannelStatus::Connecting,
                lane_id: None,
                conn_id: None,
                app: AppInfo {
                    local_device: self.local_device.clone(),
                    peer_device: peer.clone(),
                    local_session: String::new(),
                    peer_session: String::new(),
                    pkg_name: String::new(),
                    session_key: SessionKey::generate(),
                    channel_id,
                    peer_channel_id: None,
                    intent: ChannelIntent::Open,
                    route: RouteType::Wlan,
                    local_ip: None,
                    local_port: None,
                    peer_ip: None,
                    peer_port: None,
                    kind: AppKind::Auth,
                    is_server: false,
                    uid: -1,
                    pid: -1,
                },
                ticks: 0,
            },
        );
        Ok((
            info,
            vec![Effect::OpenAuth {
                peer: peer.clone(),
                request_id,
            }],
        ))
    }

    // ── Close ─────────────────────────────────────────────────────────

    /// Close a channel. Local cleanup always happens; for UDP a
    /// best-effort close notification goes to the peer. Closing an
    /// unknown (already closed) channel is a no-op.
    pub fn close_channel(
        &mut self,
        channel_id: i32,
        channel_type: ChannelType,
    ) -> (Result<(), ChannelError>, Vec<Effect>) {
        let key = (channel_id, channel_type);
        let Some(record) = self.records.remove(&key) else {
            // Still negotiating? Defer the close until the open settles.
            if channel_type == ChannelType::Udp {
                if let Some(negotiation) = self
                    .negotiations
                    .values_mut()
                    .find(|n| n.app.channel_id == channel_id && !n.app.is_server)
                {
                    negotiation.close_requested = true;
                    tracing::debug!(channel_id, "close deferred until negotiation settles");
                    return (Ok(()), vec![]);
                }
            }
            tracing::debug!(channel_id, %channel_type, "close of unknown channel ignored");
            return (Ok(()), vec![]);
        };

        self.pool(channel_type).release(channel_id);
        self.lanes.remove(&key);
        let mut effects = Vec::new();

        match channel_type {
            ChannelType::TcpDirect | ChannelType::Proxy => {
                effects.push(Effect::CloseSocket {
                    channel_id,
                    channel_type,
                });
                if let Some(conn) = record.conn_id {
                    effects.push(Effect::CloseAuth { conn });
                }
            }
            ChannelType::Auth => {
                if let Some(conn) = record.conn_id {
                    effects.push(Effect::CloseAuth { conn });
                }
            }
            ChannelType::Udp => {
                // Remote teardown is best-effort over a fresh auth
                // connection; one retry, then the peer's own reaper wins.
                let seq = self.seq_for(record.app.is_server);
                let close = NegotiateRequest {
                    channel_id: record.app.channel_id,
                    peer_channel_id: record.app.peer_channel_id,
                    session_key: record.app.session_key.to_hex(),
                    business_type: DataClass::Bytes,
                    pkg_name: record.app.pkg_name.clone(),
                    session_name: record.app.peer_session.clone(),
                    group_id: String::new(),
                    udp_conn_type: udp_conn_kind(record.app.route),
                    intent: ChannelIntent::Close,
                    device_id: self.local_device.clone(),
                };
                match close.to_bytes() {
                    Ok(payload) => {
                        let request_id = self.next_request_id();
                        self.pending_auth.insert(
                            request_id,
                            PendingAuth::UdpClose {
                                peer: record.app.peer_device.clone(),
                                seq,
                                payload,
                                retried: false,
                            },
                        );
                        effects.push(Effect::OpenAuth {
                            peer: record.app.peer_device.clone(),
                            request_id,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(channel_id, "close notification dropped: {e}");
                    }
                }
                effects.push(Effect::CloseSocket {
                    channel_id,
                    channel_type,
                });
            }
        }

        if let Some(lane_id) = record.lane_id {
            effects.push(Effect::ReleaseLane { lane_id });
        }
        effects.push(Effect::Emit(ChannelEvent::ChannelClosed { info: record.info }));
        tracing::info!(channel_id, %channel_type, "channel closed");
        (Ok(()), effects)
    }

    fn build_close_request(&self, negotiation: &UdpNegotiation) -> Result<Vec<u8>, ChannelError> {
        NegotiateRequest {
            channel_id: negotiation.app.channel_id,
            peer_channel_id: negotiation.app.peer_channel_id,
            session_key: negotiation.app.session_key.to_hex(),
            business_type: negotiation.data_class,
            pkg_name: negotiation.app.pkg_name.clone(),
            session_name: negotiation.app.peer_session.clone(),
            group_id: negotiation.group_id.clone(),
            udp_conn_type: udp_conn_kind(negotiation.app.route),
            intent: ChannelIntent::Close,
            device_id: self.local_device.clone(),
        }
        .to_bytes()
    }

    // ── Send ──────────────────────────────────────────────────────────

    /// Validate a send and decide how to route it.
    pub fn prepare_send(
        &self,
        channel_id: i32,
        channel_type: ChannelType,
    ) -> Result<SendRoute, ChannelError> {
        let record = self
            .records
            .get(&(channel_id, channel_type))
            .ok_or(ChannelError::ChannelNotFound {
                channel_id,
                channel_type,
            })?;
        if record.status != ChannelStatus::Open {
            return Err(ChannelError::WrongChannelState { channel_id });
        }
        match channel_type {
            ChannelType::Auth | ChannelType::Proxy => record
                .conn_id
                .map(SendRoute::Auth)
                .ok_or(ChannelError::WrongChannelState { channel_id }),
            ChannelType::TcpDirect => Ok(SendRoute::Stream),
            // UDP data flows on the negotiated socket, owned by the
            // session layer.
            ChannelType::Udp => Err(ChannelError::WrongChannelType { channel_type }),
        }
    }

    /// Map an auth connection back to the channel riding it.
    pub fn find_by_conn(&self, conn: AuthConnId) -> Option<TransInfo> {
        self.records
            .values()
            .find(|r| r.conn_id == Some(conn))
            .map(|r| r.info)
    }

    // ── Sweeps ────────────────────────────────────────────────────────

    /// Drop every channel and pending negotiation owned by `pkg_name`.
    /// Local cleanup only: the dead client cannot observe events, and the
    /// peer's reaper handles its side.
    pub fn client_death(&mut self, pkg_name: &str) -> Vec<Effect> {
        let mut effects = Vec::new();

        let record_keys: Vec<_> = self
            .records
            .iter()
            .filter(|(_, r)| r.app.pkg_name == pkg_name)
            .map(|(k, _)| *k)
            .collect();
        for key in record_keys {
            let Some(record) = self.records.remove(&key) else {
                continue;
            };
            self.pool(key.1).release(key.0);
            self.lanes.remove(&key);
            if key.1 != ChannelType::Auth {
                effects.push(Effect::CloseSocket {
                    channel_id: key.0,
                    channel_type: key.1,
                });
            }
            if let Some(conn) = record.conn_id {
                effects.push(Effect::CloseAuth { conn });
            }
            if let Some(lane_id) = record.lane_id {
                effects.push(Effect::ReleaseLane { lane_id });
            }
            effects.push(Effect::Emit(ChannelEvent::ChannelClosed { info: record.info }));
        }

        let seqs: Vec<_> = self
            .negotiations
            .iter()
            .filter(|(_, n)| n.app.pkg_name == pkg_name)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in seqs {
            effects.extend(self.teardown_negotiation(seq, "client died", false));
        }

        if !effects.is_empty() {
            tracing::info!(pkg_name, "swept channels for dead client");
        }
        effects
    }

    /// Reaper tick: age every pending handshake and fail the expired.
    pub fn tick(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        let expired_seqs: Vec<_> = self
            .negotiations
            .values_mut()
            .filter_map(|negotiation| {
                negotiation.ticks += 1;
                (negotiation.ticks > self.timeout_ticks).then_some(negotiation.seq)
            })
            .collect();
        for seq in expired_seqs {
            tracing::warn!(seq, "udp negotiation timed out");
            effects.extend(self.teardown_negotiation(
                seq,
                &ChannelError::Timeout {
                    ticks: self.timeout_ticks,
                }
                .to_string(),
                true,
            ));
        }

        let expired_records: Vec<_> = self
            .records
            .values_mut()
            .filter_map(|record| {
                if record.status != ChannelStatus::Connecting {
                    return None;
                }
                record.ticks += 1;
                (record.ticks > self.timeout_ticks).then_some((record.info, record.lane_id))
            })
            .collect();
        for (info, lane_id) in expired_records {
            tracing::warn!(channel_id = info.channel_id, %info.channel_type, "handshake timed out");
            let key = (info.channel_id, info.channel_type);
            let record = self.records.remove(&key);
            self.pool(info.channel_type).release(info.channel_id);
            self.lanes.remove(&key);
            // Pending auth opens for this channel must not resurrect it.
            if info.channel_type == ChannelType::Auth {
                self.pending_auth.retain(|_, pending| {
                    !matches!(pending, PendingAuth::AuthChannel { channel_id } if *channel_id == info.channel_id)
                });
            }
            if info.channel_type != ChannelType::Auth {
                effects.push(Effect::CloseSocket {
                    channel_id: info.channel_id,
                    channel_type: info.channel_type,
                });
            }
            if let Some(conn) = record.and_then(|r| r.conn_id) {
                effects.push(Effect::CloseAuth { conn });
            }
            if let Some(lane_id) = lane_id {
                effects.push(Effect::ReleaseLane { lane_id });
            }
            effects.push(Effect::Emit(ChannelEvent::OpenFailed {
                info,
                reason: ChannelError::Timeout {
                    ticks: self.timeout_ticks,
                }
                .to_string(),
            }));
        }

        effects
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Channels currently ready for data.
    pub fn open_channels(&self) -> Vec<TransInfo> {
        let mut channels: Vec<_> = self
            .records
            .values()
            .filter(|r| r.status == ChannelStatus::Open)
            .map(|r| r.info)
            .collect();
        channels.sort_by_key(|info| (info.channel_type as u8, info.channel_id));
        channels
    }

    // ── Internal ──────────────────────────────────────────────────────

    /// Remove a negotiation and release everything it holds. `notify`
    /// controls whether the session layer hears an `OpenFailed`.
    fn teardown_negotiation(&mut self, seq: u64, reason: &str, notify: bool) -> Vec<Effect> {
        let Some(negotiation) = self.negotiations.remove(&seq) else {
            return vec![];
        };
        let channel_id = negotiation.app.channel_id;
        self.udp_pool.release(channel_id);
        self.lanes.remove(&(channel_id, ChannelType::Udp));
        self.pending_auth
            .retain(|_, pending| !matches!(pending, PendingAuth::UdpOpen { seq: s } if *s == seq));

        let mut effects = Vec::new();
        if let Some(conn) = negotiation.conn_id {
            effects.push(Effect::CloseAuth { conn });
        }
        if let Some(lane_id) = negotiation.lane_id {
            effects.push(Effect::ReleaseLane { lane_id });
        }
        if notify {
            effects.push(Effect::Emit(ChannelEvent::OpenFailed {
                info: TransInfo {
                    channel_id,
                    channel_type: ChannelType::Udp,
                },
                reason: reason.to_string(),
            }));
        }
        tracing::debug!(seq, channel_id, reason, "udp negotiation torn down");
        effects
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

fn udp_conn_kind(route: RouteType) -> UdpConnKind {
    match route {
        RouteType::P2p => UdpConnKind::P2p,
        RouteType::Wlan | RouteType::Bluetooth => UdpConnKind::Wlan,
    }
}

fn direct_app_info(
    local_device: &DeviceId,
    request: &SessionRequest,
    lane: &Lane,
    channel_id: i32,
) -> AppInfo {
    AppInfo {
        local_device: local_device.clone(),
        peer_device: request.peer.clone(),
        local_session: request.local_session.clone(),
        peer_session: request.peer_session.clone(),
        pkg_name: request.pkg_name.clone(),
        session_key: SessionKey::generate(),
        channel_id,
        peer_channel_id: None,
        intent: ChannelIntent::Open,
        route: lane.path.option.route(),
        local_ip: Some(lane.path.local_ip),
        local_port: None,
        peer_ip: lane.path.option.peer_ip(),
        peer_port: None,
        kind: AppKind::Normal,
        is_server: false,
        uid: request.uid,
        pid: request.pid,
    }
}
