use nearbus_link::LaneId;

use crate::auth::AuthConnId;
use crate::types::{ChannelType, DeviceId};
use crate::wire::FrameFlag;

use super::ChannelEvent;

/// Intention produced by the pure engine state.
///
/// Handlers return `Vec<Effect>`; the executor performs them, in order,
/// against the gateway, the socket collaborator, the lane selector, and
/// the event channel. Sealing happens in the executor; the state only
/// ever holds clear payload bytes.
#[derive(Debug)]
pub enum Effect {
    /// Kick off an asynchronous auth-connection open for `request_id`.
    OpenAuth { peer: DeviceId, request_id: u64 },

    /// Seal and send a negotiation payload on an open auth connection.
    SendFrame {
        conn: AuthConnId,
        flag: FrameFlag,
        seq: u64,
        payload: Vec<u8>,
    },

    /// Close an auth connection (idempotent).
    CloseAuth { conn: AuthConnId },

    /// Drop one lane reference.
    ReleaseLane { lane_id: LaneId },

    /// Drop local socket state for a channel.
    CloseSocket {
        channel_id: i32,
        channel_type: ChannelType,
    },

    /// Surface an event to the session layer.
    Emit(ChannelEvent),
}
