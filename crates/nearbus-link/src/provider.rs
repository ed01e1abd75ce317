use async_trait::async_trait;

use crate::error::LinkError;
use crate::types::{ConnectOption, DataClass, DeviceId, LinkType};

/// A resolved network path plus its capability flags.
#[derive(Debug, Clone)]
pub struct PathInfo {
    /// Provider-assigned identity, quoted back on release.
    pub path_id: u64,
    /// Endpoint data for the chosen link.
    pub option: ConnectOption,
    /// Local interface address on this path.
    pub local_ip: std::net::IpAddr,
    /// The path can carry a negotiated UDP channel.
    pub supports_udp: bool,
    /// The path reaches the peer through a proxy hop.
    pub is_proxy: bool,
}

/// Link-layer capability provider (external collaborator).
///
/// Production implementations talk to the platform's connection service;
/// tests substitute an in-memory mock.
#[async_trait]
pub trait LinkProvider: Send + Sync + 'static {
    /// Resolve a best-effort path to `peer` matching the ranked preference
    /// list. At least one concrete connect option must come back, or a
    /// typed failure: [`LinkError::NoPath`] when the peer is unreachable,
    /// [`LinkError::Rejected`] when the link layer refuses the class.
    async fn request_path(
        &self,
        peer: &DeviceId,
        data_class: DataClass,
        ranked: &[LinkType],
    ) -> Result<PathInfo, LinkError>;

    /// Tear down a previously resolved path.
    async fn release_path(&self, path_id: u64);
}
