//! nearbus channel layer.
//!
//! Builds typed channels (UDP, TCP-direct, proxy, auth) on top of lanes
//! from `nearbus-link`. UDP channel parameters are negotiated with the
//! peer over an authenticated side channel; negotiation payloads are
//! sealed with a per-connection key and exchanged as JSON frames.
//!
//! One engine task owns every channel table and negotiation record, so a
//! channel's state transitions are serialized by construction. The
//! session layer drives the engine through [`EngineHandle`] and observes
//! [`ChannelEvent`]s.

pub mod auth;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod pool;
pub mod sockets;
pub mod types;
pub mod wire;

pub use auth::{AuthConnId, AuthGateway, AuthLink};
pub use engine::{
    ChannelEngine, ChannelEvent, EngineChannels, EngineConfig, EngineHandle, EngineInput,
};
pub use error::ChannelError;
pub use pool::{IdPool, SeqGenerator, SeqRole, DEFAULT_POOL_CAPACITY};
pub use sockets::SocketOps;
pub use types::{
    AppInfo, AppKind, ChannelIntent, ChannelStatus, ChannelType, MessageKind, SessionKey,
    SessionRequest, TransInfo,
};
pub use wire::{AuthFrame, FrameFlag, ModuleId, NegotiateReply, NegotiateRequest, UdpConnKind};
