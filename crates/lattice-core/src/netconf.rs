//! Virtual network configuration snapshots.
//!
//! The overlay engine delivers one of these with every network config
//! callback. The service stores the most recent snapshot per network and
//! derives managed addresses, routes, and status events from it.

use std::net::IpAddr;

use crate::inet::InetCidr;
use crate::types::{Mac, MulticastGroup, NetworkId};

/// Network status as reported by the overlay controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtualNetworkStatus {
    RequestingConfiguration,
    Ok,
    AccessDenied,
    NotFound,
    PortError,
    ClientTooOld,
}

/// Whether the network is access-controlled or open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualNetworkType {
    Private,
    Public,
}

/// The four lifecycle operations delivered through the network config
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOp {
    Up,
    Update,
    Down,
    Destroy,
}

/// A route assigned by the network controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRoute {
    pub target: InetCidr,
    /// Next hop, or `None` for a directly connected route.
    pub via: Option<IpAddr>,
    pub flags: u16,
    pub metric: u16,
}

/// Snapshot of a virtual network's configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualNetworkConfig {
    pub nwid: NetworkId,
    pub mac: Mac,
    pub name: String,
    pub status: VirtualNetworkStatus,
    pub kind: VirtualNetworkType,
    pub mtu: u16,
    pub dhcp: bool,
    pub bridge: bool,
    pub broadcast_enabled: bool,
    /// Error code from the port (tap) layer, zero when healthy.
    pub port_error: i32,
    pub netconf_revision: u64,
    pub assigned_addresses: Vec<InetCidr>,
    pub routes: Vec<VirtualRoute>,
    pub multicast_subscriptions: Vec<MulticastGroup>,
}

impl VirtualNetworkConfig {
    /// A minimal config in the "requesting configuration" state, as seen
    /// right after joining a network.
    pub fn requesting(nwid: NetworkId, mac: Mac, mtu: u16) -> Self {
        Self {
            nwid,
            mac,
            name: String::new(),
            status: VirtualNetworkStatus::RequestingConfiguration,
            kind: VirtualNetworkType::Private,
            mtu,
            dhcp: false,
            bridge: false,
            broadcast_enabled: true,
            port_error: 0,
            netconf_revision: 0,
            assigned_addresses: Vec::new(),
            routes: Vec::new(),
            multicast_subscriptions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requesting_config_is_empty() {
        let cfg = VirtualNetworkConfig::requesting(NetworkId(1), Mac::new(2), 2800);
        assert_eq!(cfg.status, VirtualNetworkStatus::RequestingConfiguration);
        assert!(cfg.assigned_addresses.is_empty());
        assert!(cfg.routes.is_empty());
        assert_eq!(cfg.mtu, 2800);
    }
}
