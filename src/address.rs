use serde::{Deserialize, Serialize};
use std::{fmt, net::SocketAddr, time::Duration};

/// Transport address of a peer. IPv6 link-local addresses carry their scope id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress(pub SocketAddr);

impl PeerAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UDP:{}", self.0)
    }
}

/// Message reliability protocol timing advertised by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrpConfig {
    /// SII - retransmission interval while the peer is idle
    pub idle_interval_ms: u32,
    /// SAI - retransmission interval while the peer is active
    pub active_interval_ms: u32,
    /// SAT - how long the peer stays active after last activity
    pub active_threshold_ms: u16,
}

impl MrpConfig {
    pub const DEFAULT_IDLE_INTERVAL_MS: u32 = 500;
    pub const DEFAULT_ACTIVE_INTERVAL_MS: u32 = 300;
    pub const DEFAULT_ACTIVE_THRESHOLD_MS: u16 = 4000;

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms.into())
    }

    pub fn active_interval(&self) -> Duration {
        Duration::from_millis(self.active_interval_ms.into())
    }

    pub fn active_threshold(&self) -> Duration {
        Duration::from_millis(self.active_threshold_ms.into())
    }
}

impl Default for MrpConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: Self::DEFAULT_IDLE_INTERVAL_MS,
            active_interval_ms: Self::DEFAULT_ACTIVE_INTERVAL_MS,
            active_threshold_ms: Self::DEFAULT_ACTIVE_THRESHOLD_MS,
        }
    }
}

/// Outcome of a successful node lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveResult {
    pub address: PeerAddress,
    pub mrp: MrpConfig,
}
