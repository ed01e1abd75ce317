/// Local socket operations (external collaborator).
///
/// The engine decides *what* to open; this trait is *how*. Production
/// implementations wrap the platform transport service; tests observe the
/// calls through a mock.
use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::types::ChannelType;
use crate::wire::UdpConnKind;

#[async_trait]
pub trait SocketOps: Send + Sync + 'static {
    /// Local interface address to advertise for the given UDP path kind.
    async fn local_ip(&self, kind: UdpConnKind) -> Result<IpAddr, ChannelError>;

    /// Start an outbound TCP-direct connection. The handshake completes
    /// asynchronously; completion arrives through
    /// [`EngineHandle::tcp_handshake_done`](crate::engine::EngineHandle::tcp_handshake_done).
    async fn open_tcp_direct(
        &self,
        channel_id: i32,
        ip: IpAddr,
        port: u16,
    ) -> Result<(), ChannelError>;

    /// Open a proxy channel. Ready when this returns.
    async fn open_proxy(&self, channel_id: i32, peer_ip: IpAddr) -> Result<(), ChannelError>;

    /// Bind a listening UDP endpoint for an accepted channel; returns the
    /// locally-assigned port.
    async fn bind_udp(&self, channel_id: i32, local_ip: IpAddr) -> Result<u16, ChannelError>;

    /// Bind and point an outbound UDP endpoint at the peer's negotiated
    /// address; returns the local port.
    async fn connect_udp(
        &self,
        channel_id: i32,
        local_ip: IpAddr,
        peer_ip: IpAddr,
        peer_port: u16,
    ) -> Result<u16, ChannelError>;

    /// Send bytes on an open TCP-direct channel.
    async fn send_stream(&self, channel_id: i32, data: &[u8]) -> Result<(), ChannelError>;

    /// Drop whatever socket state `channel_id` holds. Idempotent.
    async fn close(&self, channel_id: i32, channel_type: ChannelType);
}

// ── MockSocketOps (tests) ───────────────────────────────────────────
