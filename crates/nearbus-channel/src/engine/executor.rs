//! Effect executor — the only place engine decisions touch I/O.
//!
//! Takes a list of [`Effect`]s and performs them in order:
//! - `OpenAuth` → gateway open task (completion comes back as an input)
//! - `SendFrame` → seal + post on the auth connection
//! - `CloseAuth` / `CloseSocket` / `ReleaseLane` → collaborator teardown
//! - `Emit` → event channel (try_send: the engine never blocks on a slow
//!   consumer)

use std::sync::Arc;

use tokio::sync::mpsc;

use nearbus_link::LaneSelector;

use crate::auth::AuthGateway;
use crate::sockets::SocketOps;

use super::effect::Effect;
use super::{ChannelEvent, EngineInput};

/// Everything the executor needs to perform effects.
pub(super) struct Io {
    pub selector: Arc<LaneSelector>,
    pub gateway: AuthGateway,
    pub sockets: Arc<dyn SocketOps>,
    pub input_tx: mpsc::Sender<EngineInput>,
    pub event_tx: mpsc::Sender<ChannelEvent>,
}

pub(super) async fn execute(effects: Vec<Effect>, io: &Io) {
    for effect in effects {
        match effect {
            Effect::OpenAuth { peer, request_id } => {
                io.gateway.open(peer, request_id, io.input_tx.clone());
            }
            Effect::SendFrame {
                conn,
                flag,
                seq,
                payload,
            } => {
                // A lost frame is not fatal here: the reaper fails the
                // negotiation if the exchange never completes.
                if let Err(e) = io.gateway.send_frame(conn, flag, seq, &payload).await {
                    tracing::warn!(conn, seq, "negotiation frame not sent: {e}");
                }
            }
            Effect::CloseAuth { conn } => {
                io.gateway.close(conn).await;
            }
            Effect::ReleaseLane { lane_id } => {
                io.selector.release(lane_id).await;
            }
            Effect::CloseSocket {
                channel_id,
                channel_type,
            } => {
                io.sockets.close(channel_id, channel_type).await;
            }
            Effect::Emit(event) => {
                let _ = io.event_tx.try_send(event);
            }
        }
    }
}
