/// The engine event loop.
///
/// A single async task that owns the [`EngineState`] and multiplexes over
/// session-layer commands, transport inputs, and the reaper tick. I/O for
/// the synchronous steps of an open (lane resolution, socket setup)
/// happens inline between state handler calls; everything asynchronous
/// flows back in as an [`EngineInput`].
use std::sync::Arc;

use tokio::sync::mpsc;

use nearbus_link::{Lane, LaneSelector};

use crate::auth::AuthGateway;
use crate::error::ChannelError;
use crate::sockets::SocketOps;
use crate::types::{ChannelIntent, ChannelType, DeviceId, SessionRequest, TransInfo};
use crate::wire::{FrameFlag, ModuleId, NegotiateReply, NegotiateRequest};

use super::effect::Effect;
use super::executor::{execute, Io};
use super::state::{EngineState, SendRoute};
use super::{ChannelCommand, ChannelEvent, EngineConfig, EngineInput};

#[allow(clippy::too_many_arguments)]
pub(super) async fn engine_loop(
    local_device: DeviceId,
    config: EngineConfig,
    selector: Arc<LaneSelector>,
    gateway: AuthGateway,
    sockets: Arc<dyn SocketOps>,
    mut cmd_rx: mpsc::Receiver<ChannelCommand>,
    mut input_rx: mpsc::Receiver<EngineInput>,
    input_tx: mpsc::Sender<EngineInput>,
    event_tx: mpsc::Sender<ChannelEvent>,
) {
    let mut state = EngineState::new(local_device, &config);
    let io = Io {
        selector,
        gateway,
        sockets,
        input_tx,
        event_tx,
    };

    let mut reaper = tokio::time::interval(config.tick_interval);
    // Skip the immediate first tick.
    reaper.tick().await;

    loop {
        tokio::select! {
            Some(cmd) = cmd_rx.recv() => {
                if matches!(cmd, ChannelCommand::Shutdown) {
                    break;
                }
                handle_command(cmd, &mut state, &io).await;
            }

            Some(input) = input_rx.recv() => {
                handle_input(input, &mut state, &io).await;
            }

            _ = reaper.tick() => {
                let effects = state.tick();
                execute(effects, &io).await;
            }
        }
    }

    tracing::info!("channel engine stopped");
}

// ── Commands ──────────────────────────────────────────────────────────

async fn handle_command(cmd: ChannelCommand, state: &mut EngineState, io: &Io) {
    match cmd {
        ChannelCommand::Open { request, reply } => {
            let result = handle_open(request, state, io).await;
            let _ = reply.send(result);
        }
        ChannelCommand::OpenAuth { peer, reply } => {
            let result = match state.open_auth_channel(&peer) {
                Ok((info, effects)) => {
                    execute(effects, io).await;
                    Ok(info)
                }
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        ChannelCommand::Close {
            channel_id,
            channel_type,
            reply,
        } => {
            let (result, effects) = state.close_channel(channel_id, channel_type);
            execute(effects, io).await;
            let _ = reply.send(result);
        }
        ChannelCommand::Send {
            channel_id,
            channel_type,
            data,
            kind,
            reply,
        } => {
            tracing::trace!(channel_id, %channel_type, ?kind, len = data.len(), "send");
            let result = match state.prepare_send(channel_id, channel_type) {
                Ok(SendRoute::Auth(conn)) => io.gateway.send_message(conn, &data).await,
                Ok(SendRoute::Stream) => io.sockets.send_stream(channel_id, &data).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        ChannelCommand::ClientDeath { pkg_name } => {
            let effects = state.client_death(&pkg_name);
            execute(effects, io).await;
        }
        ChannelCommand::OpenChannels { reply } => {
            let _ = reply.send(state.open_channels());
        }
        // Intercepted by the loop before dispatch.
        ChannelCommand::Shutdown => {}
    }
}

/// Resolve a lane and dispatch to the opener its capabilities select.
/// Every failure after lane acquisition releases the lane before the
/// error goes back.
async fn handle_open(
    request: SessionRequest,
    state: &mut EngineState,
    io: &Io,
) -> Result<TransInfo, ChannelError> {
    let lane = io
        .selector
        .request_lane(&request.peer, request.data_class, &request.preferred_links)
        .await?;

    if lane.path.supports_udp {
        match state.start_udp_open(&request, &lane) {
            Ok((info, effects)) => {
                execute(effects, io).await;
                Ok(info)
            }
            Err(e) => {
                io.selector.release(lane.id).await;
                Err(e)
            }
        }
    } else if lane.path.is_proxy {
        open_proxy(request, lane, state, io).await
    } else {
        open_tcp_direct(request, lane, state, io).await
    }
}

async fn open_tcp_direct(
    request: SessionRequest,
    lane: Lane,
    state: &mut EngineState,
    io: &Io,
) -> Result<TransInfo, ChannelError> {
    let (ip, port) = match &lane.path.option {
        nearbus_link::ConnectOption::Tcp { ip, port } => (*ip, *port),
        _ => {
            io.selector.release(lane.id).await;
            return Err(nearbus_link::LinkError::Rejected {
                reason: "resolved path is not addressable for tcp-direct".into(),
            }
            .into());
        }
    };

    let info = match state.open_tcp(&request, &lane) {
        Ok(info) => info,
        Err(e) => {
            io.selector.release(lane.id).await;
            return Err(e);
        }
    };

    match io.sockets.open_tcp_direct(info.channel_id, ip, port).await {
        Ok(()) => Ok(info),
        Err(e) => {
            let effects = state.abort_open(info);
            execute(effects, io).await;
            Err(e)
        }
    }
}

async fn open_proxy(
    request: SessionRequest,
    lane: Lane,
    state: &mut EngineState,
    io: &Io,
) -> Result<TransInfo, ChannelError> {
    let Some(peer_ip) = lane.path.option.peer_ip() else {
        io.selector.release(lane.id).await;
        return Err(nearbus_link::LinkError::Rejected {
            reason: "resolved proxy path carries no peer address".into(),
        }
        .into());
    };

    let channel_id = match state.proxy_begin() {
        Ok(id) => id,
        Err(e) => {
            io.selector.release(lane.id).await;
            return Err(e);
        }
    };

    if let Err(e) = io.sockets.open_proxy(channel_id, peer_ip).await {
        state.proxy_abort(channel_id);
        io.selector.release(lane.id).await;
        return Err(e);
    }

    let conn = match io.gateway.open_now(&request.peer).await {
        Ok(conn) => conn,
        Err(e) => {
            io.sockets.close(channel_id, ChannelType::Proxy).await;
            state.proxy_abort(channel_id);
            io.selector.release(lane.id).await;
            return Err(e);
        }
    };

    let (info, effects) = state.proxy_finish(&request, &lane, channel_id, conn);
    execute(effects, io).await;
    Ok(info)
}

// ── Inputs ────────────────────────────────────────────────────────────

async fn handle_input(input: EngineInput, state: &mut EngineState, io: &Io) {
    match input {
        EngineInput::AuthOpened {
            request_id,
            conn_id,
        } => {
            let effects = state.handle_auth_opened(request_id, conn_id);
            execute(effects, io).await;
        }
        EngineInput::AuthOpenFailed { request_id, reason } => {
            let effects = state.handle_auth_open_failed(request_id, &reason);
            execute(effects, io).await;
        }
        EngineInput::TcpOpened {
            channel_id,
            success,
        } => {
            let effects = state.handle_tcp_opened(channel_id, success);
            execute(effects, io).await;
        }
        EngineInput::AuthData { data } => {
            handle_auth_data(data, state, io).await;
        }
    }
}

async fn handle_auth_data(data: Vec<u8>, state: &mut EngineState, io: &Io) {
    let (frame, payload) = match io.gateway.decode_frame(&data) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::debug!("undecodable auth frame dropped: {e}");
            return;
        }
    };

    match frame.module {
        ModuleId::Message => {
            // Application payload for an auth or proxy channel.
            match state.find_by_conn(frame.conn_id) {
                Some(info) => {
                    execute(
                        vec![Effect::Emit(ChannelEvent::MessageReceived { info, payload })],
                        io,
                    )
                    .await;
                }
                None => {
                    tracing::debug!(conn = frame.conn_id, "message on unmapped connection dropped");
                }
            }
        }
        ModuleId::UdpInfo => match frame.flag {
            FrameFlag::Request => {
                let request = match NegotiateRequest::from_bytes(&payload) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::debug!(seq = frame.seq, "malformed negotiation request: {e}");
                        return;
                    }
                };
                if request.intent == ChannelIntent::Close {
                    let effects = state.handle_remote_close(frame.conn_id, frame.seq, &request);
                    execute(effects, io).await;
                } else {
                    accept_udp(frame.conn_id, frame.seq, request, state, io).await;
                }
            }
            FrameFlag::Reply => {
                let reply = match NegotiateReply::from_bytes(&payload) {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::debug!(seq = frame.seq, "malformed negotiation reply: {e}");
                        return;
                    }
                };
                let Some(negotiation) = state.take_reply_target(frame.seq, &reply) else {
                    return;
                };
                // Bind the outbound path now that the peer port is known.
                let (Some(local_ip), Some(peer_ip), Some(peer_port)) = (
                    negotiation.app.local_ip,
                    negotiation.app.peer_ip,
                    negotiation.app.peer_port,
                ) else {
                    let effects = state.fail_udp(negotiation, "negotiation lost endpoint data");
                    execute(effects, io).await;
                    return;
                };
                let channel_id = negotiation.app.channel_id;
                match io
                    .sockets
                    .connect_udp(channel_id, local_ip, peer_ip, peer_port)
                    .await
                {
                    Ok(local_port) => {
                        let effects = state.complete_udp(negotiation, local_port);
                        execute(effects, io).await;
                    }
                    Err(e) => {
                        let effects = state.fail_udp(negotiation, &e.to_string());
                        execute(effects, io).await;
                    }
                }
            }
        },
    }
}

/// Acceptor path for an inbound UDP open: allocate a server-side id,
/// bind a listening endpoint, and reply with the assigned port. Any
/// failure rolls everything back and stays silent on the wire.
async fn accept_udp(
    conn: crate::auth::AuthConnId,
    seq: u64,
    request: NegotiateRequest,
    state: &mut EngineState,
    io: &Io,
) {
    let channel_id = match state.accept_begin() {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(seq, "inbound udp open refused: {e}");
            return;
        }
    };

    let local_ip = match io.sockets.local_ip(request.udp_conn_type).await {
        Ok(ip) => ip,
        Err(e) => {
            let effects = state.accept_abort(channel_id, &e.to_string());
            execute(effects, io).await;
            return;
        }
    };

    let local_port = match io.sockets.bind_udp(channel_id, local_ip).await {
        Ok(port) => port,
        Err(e) => {
            let effects = state.accept_abort(channel_id, &e.to_string());
            execute(effects, io).await;
            return;
        }
    };

    let effects = state.accept_finish(conn, seq, request, channel_id, local_ip, local_port);
    execute(effects, io).await;
}
