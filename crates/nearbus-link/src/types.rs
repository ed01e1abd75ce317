use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Stable identity of a device on the bus: the authenticated device UID
/// handed out by the platform's identity service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(uid: &str) -> Self {
        Self(uid.to_string())
    }
}

/// What kind of traffic the session intends to move.
///
/// Drives link selection: a `File` session prefers high-bandwidth links,
/// a `Message` session prefers low-latency ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    Message,
    Bytes,
    File,
    Stream,
}

/// Physical link flavor, ranked by the caller when requesting a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// Infrastructure Wi-Fi (direct TCP between peers on the same network).
    Wlan,
    /// Peer-to-peer Wi-Fi (group owner / client addressing).
    P2p,
    /// Bluetooth classic.
    Bluetooth,
}

/// Route classification carried into channel negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    Wlan,
    P2p,
    Bluetooth,
}

/// Concrete endpoint data for a resolved path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOption {
    Tcp { ip: IpAddr, port: u16 },
    P2p { local_ip: IpAddr, peer_ip: IpAddr },
    Bluetooth { mac: String },
}

impl ConnectOption {
    /// Route classification for this option.
    pub fn route(&self) -> RouteType {
        match self {
            ConnectOption::Tcp { .. } => RouteType::Wlan,
            ConnectOption::P2p { .. } => RouteType::P2p,
            ConnectOption::Bluetooth { .. } => RouteType::Bluetooth,
        }
    }

    /// The peer's network address, where the option carries one.
    pub fn peer_ip(&self) -> Option<IpAddr> {
        match self {
            ConnectOption::Tcp { ip, .. } => Some(*ip),
            ConnectOption::P2p { peer_ip, .. } => Some(*peer_ip),
            ConnectOption::Bluetooth { .. } => None,
        }
    }
}
