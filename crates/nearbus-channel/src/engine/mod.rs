/// Channel engine — one task owning every channel table and negotiation.
///
/// The session layer talks to it through [`EngineHandle`]; transport glue
/// feeds inbound auth data and TCP handshake completions through the same
/// handle; outcomes come back as [`ChannelEvent`]s. All channel state
/// lives on the engine task, so per-channel transitions are serialized by
/// construction.
mod effect;
mod executor;
mod r#loop;
mod state;
#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use nearbus_link::{LaneSelector, LinkProvider};

use crate::auth::{AuthConnId, AuthGateway, AuthLink};
use crate::error::ChannelError;
use crate::pool::DEFAULT_POOL_CAPACITY;
use crate::sockets::SocketOps;
use crate::types::{ChannelType, DeviceId, MessageKind, SessionRequest, TransInfo};

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for the channel engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reaper tick period.
    pub tick_interval: Duration,
    /// Ticks a handshake may stay pending before it is failed.
    pub handshake_timeout_ticks: u32,
    /// Channel ids allocatable per channel type.
    pub id_pool_capacity: usize,
    /// Buffer size for the command, input, and event channels.
    pub channel_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            handshake_timeout_ticks: 19,
            id_pool_capacity: DEFAULT_POOL_CAPACITY,
            channel_buffer: 64,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reaper tick period.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set how many ticks a pending handshake survives.
    pub fn handshake_timeout_ticks(mut self, ticks: u32) -> Self {
        self.handshake_timeout_ticks = ticks;
        self
    }

    /// Set the per-type channel id capacity.
    pub fn id_pool_capacity(mut self, capacity: usize) -> Self {
        self.id_pool_capacity = capacity;
        self
    }

    /// Set the command/input/event channel buffer size.
    pub fn channel_buffer(mut self, capacity: usize) -> Self {
        self.channel_buffer = capacity;
        self
    }
}

// ── Commands (session layer → engine) ─────────────────────────────────

/// Commands the session layer sends to the engine task.
pub enum ChannelCommand {
    /// Resolve a lane and open the channel type it supports.
    Open {
        request: SessionRequest,
        reply: oneshot::Sender<Result<TransInfo, ChannelError>>,
    },
    /// Open a control channel riding the authenticated link itself.
    OpenAuth {
        peer: DeviceId,
        reply: oneshot::Sender<Result<TransInfo, ChannelError>>,
    },
    /// Close a channel. Idempotent; local cleanup always happens.
    Close {
        channel_id: i32,
        channel_type: ChannelType,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    /// Send a payload on an open channel.
    Send {
        channel_id: i32,
        channel_type: ChannelType,
        data: Vec<u8>,
        kind: MessageKind,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    /// Sweep every channel owned by a crashed client.
    ClientDeath { pkg_name: String },
    /// Query: currently open channels.
    OpenChannels {
        reply: oneshot::Sender<Vec<TransInfo>>,
    },
    /// Graceful shutdown.
    Shutdown,
}

// ── Inputs (transport glue → engine) ──────────────────────────────────

/// Asynchronous completions and inbound data from the transport side.
#[derive(Debug)]
pub enum EngineInput {
    /// An auth connection requested earlier is ready.
    AuthOpened { request_id: u64, conn_id: AuthConnId },
    /// An auth connection request failed.
    AuthOpenFailed { request_id: u64, reason: String },
    /// Raw bytes arrived on an auth connection.
    AuthData { data: Vec<u8> },
    /// A TCP-direct handshake finished.
    TcpOpened { channel_id: i32, success: bool },
}

// ── Events (engine → session layer) ───────────────────────────────────

/// Channel lifecycle events the session layer observes.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A locally-requested channel is ready for data.
    ChannelOpened { info: TransInfo, peer: DeviceId },
    /// A peer-requested channel was accepted and is ready for data.
    ChannelAccepted {
        info: TransInfo,
        peer: DeviceId,
        session_name: String,
    },
    /// A channel open failed after `open_channel` already returned.
    OpenFailed { info: TransInfo, reason: String },
    /// A channel was closed, locally or by the peer.
    ChannelClosed { info: TransInfo },
    /// Application payload arrived on an auth or proxy channel.
    MessageReceived { info: TransInfo, payload: Vec<u8> },
}

// ── EngineHandle ──────────────────────────────────────────────────────

/// Handle to a running channel engine.
///
/// Cheap to clone. Command methods resolve when the engine has processed
/// the command; input methods are non-blocking notifications.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<ChannelCommand>,
    input_tx: mpsc::Sender<EngineInput>,
    local_device: DeviceId,
}

impl EngineHandle {
    /// This device's identity.
    pub fn local_device(&self) -> &DeviceId {
        &self.local_device
    }

    /// Open a channel for `request`. Returns the channel id and chosen
    /// type once initiation succeeds; final readiness arrives as a
    /// [`ChannelEvent::ChannelOpened`] (or `OpenFailed`).
    pub async fn open_channel(&self, request: SessionRequest) -> Result<TransInfo, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCommand::Open { request, reply: tx })
            .await
            .map_err(|_| ChannelError::EngineShutdown)?;
        rx.await.map_err(|_| ChannelError::EngineShutdown)?
    }

    /// Open a control channel on the authenticated link to `peer`.
    pub async fn open_auth_channel(&self, peer: DeviceId) -> Result<TransInfo, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCommand::OpenAuth { peer, reply: tx })
            .await
            .map_err(|_| ChannelError::EngineShutdown)?;
        rx.await.map_err(|_| ChannelError::EngineShutdown)?
    }

    /// Close a channel. A second close of the same channel is a no-op.
    pub async fn close_channel(
        &self,
        channel_id: i32,
        channel_type: ChannelType,
    ) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCommand::Close {
                channel_id,
                channel_type,
                reply: tx,
            })
            .await
            .map_err(|_| ChannelError::EngineShutdown)?;
        rx.await.map_err(|_| ChannelError::EngineShutdown)?
    }

    /// Send a payload on an open channel.
    pub async fn send_msg(
        &self,
        channel_id: i32,
        channel_type: ChannelType,
        data: Vec<u8>,
        kind: MessageKind,
    ) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ChannelCommand::Send {
                channel_id,
                channel_type,
                data,
                kind,
                reply: tx,
            })
            .await
            .map_err(|_| ChannelError::EngineShutdown)?;
        rx.await.map_err(|_| ChannelError::EngineShutdown)?
    }

    /// Sweep all channels owned by a crashed client.
    pub async fn client_death(&self, pkg_name: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(ChannelCommand::ClientDeath {
                pkg_name: pkg_name.into(),
            })
            .await;
    }

    /// Currently open channels.
    pub async fn open_channels(&self) -> Vec<TransInfo> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(ChannelCommand::OpenChannels { reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    /// Feed raw bytes that arrived on an auth connection.
    pub async fn auth_data_received(&self, data: Vec<u8>) {
        let _ = self.input_tx.send(EngineInput::AuthData { data }).await;
    }

    /// Report a TCP-direct handshake outcome.
    pub async fn tcp_handshake_done(&self, channel_id: i32, success: bool) {
        let _ = self
            .input_tx
            .send(EngineInput::TcpOpened {
                channel_id,
                success,
            })
            .await;
    }

    /// Graceful shutdown.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ChannelCommand::Shutdown).await;
    }
}

// ── EngineChannels / ChannelEngine ────────────────────────────────────

/// Channels returned to the session layer when the engine starts.
pub struct EngineChannels {
    /// Handle to drive the engine.
    pub handle: EngineHandle,
    /// Channel lifecycle events.
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// The channel engine — spawn it and communicate via channels.
pub struct ChannelEngine;

impl ChannelEngine {
    /// Create and start the engine as a tokio task.
    ///
    /// Takes the three external collaborators: the link-layer capability
    /// provider, the auth-connection service, and the local socket
    /// service.
    pub fn spawn(
        local_device: DeviceId,
        provider: Arc<dyn LinkProvider>,
        auth_link: Arc<dyn AuthLink>,
        sockets: Arc<dyn SocketOps>,
        config: EngineConfig,
    ) -> EngineChannels {
        let (cmd_tx, cmd_rx) = mpsc::channel::<ChannelCommand>(config.channel_buffer);
        let (input_tx, input_rx) = mpsc::channel::<EngineInput>(config.channel_buffer);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(config.channel_buffer);

        let selector = Arc::new(LaneSelector::new(provider));
        let gateway = AuthGateway::new(auth_link);

        tokio::spawn(r#loop::engine_loop(
            local_device.clone(),
            config,
            selector,
            gateway,
            sockets,
            cmd_rx,
            input_rx,
            input_tx.clone(),
            event_tx,
        ));

        EngineChannels {
            handle: EngineHandle {
                cmd_tx,
                input_tx,
                local_device,
            },
            events: event_rx,
        }
    }
}
