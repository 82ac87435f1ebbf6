//! The seam between the node service and the overlay protocol engine.
//!
//! The engine owns crypto, peer state, and routing decisions; the service
//! owns sockets, taps, persistence, and scheduling. [`Engine`] is the
//! surface the service drives, and [`NodeHost`] is the capability object
//! the engine is handed once at construction and calls back into for
//! everything it cannot do itself. Both sides are synchronous: the
//! service's control loop is the sole caller of [`Engine`] methods, and
//! engine callbacks run on that same call stack.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::inet::IpFamily;
use crate::netconf::{ConfigOp, VirtualNetworkConfig};
use crate::types::{Mac, MulticastGroup, NetworkId, NodeAddr};

/// Result codes returned by engine entry points.
///
/// Codes in [100, 1000) are fatal: the service must terminate when it
/// sees one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    FatalOutOfMemory = 100,
    FatalDataStoreFailed = 101,
    FatalInternal = 102,
    NetworkNotFound = 1000,
    UnsupportedOperation = 1001,
    BadParameter = 1002,
}

impl ResultCode {
    pub fn is_fatal(self) -> bool {
        let code = self as i32;
        (100..1000).contains(&code)
    }
}

/// Events the engine reports through the host's `event` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Up,
    Online,
    Offline,
    Down,
    FatalIdentityCollision,
    Trace(String),
}

/// The kinds of opaque state objects the engine persists through the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateObjectKind {
    IdentityPublic,
    IdentitySecret,
    Planet,
    NetworkConfig(NetworkId),
    Peer(NodeAddr),
}

/// Role of a peer in the overlay topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Leaf,
    Moon,
    Planet,
}

/// One physical path to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPath {
    pub address: SocketAddr,
    pub last_send: i64,
    pub last_receive: i64,
    pub preferred: bool,
}

/// Snapshot of one peer from the engine's peer table.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub address: NodeAddr,
    pub role: PeerRole,
    /// Round-trip latency in milliseconds, negative when unknown.
    pub latency: i32,
    pub paths: Vec<PeerPath>,
}

impl Peer {
    /// Number of live direct paths to this peer.
    pub fn direct_path_count(&self) -> u32 {
        self.paths.len() as u32
    }
}

/// The overlay protocol engine, as seen by the node service.
///
/// All times are monotonic milliseconds on the service's clock. Methods
/// that process traffic return the result code together with the updated
/// background-task deadline.
pub trait Engine: Send + Sync {
    /// This node's 40-bit overlay address.
    fn address(&self) -> NodeAddr;

    /// Whether the node currently has connectivity to its planet.
    fn online(&self) -> bool;

    /// Feed one received UDP datagram into the engine.
    fn process_wire_packet(
        &self,
        now: i64,
        local_socket: i64,
        from: SocketAddr,
        data: &[u8],
    ) -> (ResultCode, i64);

    /// Feed one Ethernet frame read from a tap into the engine.
    #[allow(clippy::too_many_arguments)]
    fn process_virtual_network_frame(
        &self,
        now: i64,
        nwid: NetworkId,
        src: Mac,
        dst: Mac,
        ethertype: u16,
        vlan_id: u16,
        data: &[u8],
    ) -> (ResultCode, i64);

    /// Run periodic housekeeping; returns the next deadline.
    fn process_background_tasks(&self, now: i64) -> (ResultCode, i64);

    fn join(&self, nwid: NetworkId) -> ResultCode;
    fn leave(&self, nwid: NetworkId) -> ResultCode;

    fn multicast_subscribe(&self, nwid: NetworkId, group: MulticastGroup) -> ResultCode;
    fn multicast_unsubscribe(&self, nwid: NetworkId, group: MulticastGroup) -> ResultCode;

    /// Snapshot of the engine's peer table.
    fn peers(&self) -> Vec<Peer>;

    fn clear_local_interface_addresses(&self);
    fn add_local_interface_address(&self, addr: SocketAddr);

    fn set_multipath_mode(&self, mode: u32);

    /// The engine's internal PRNG, used for hint selection so that path
    /// choices stay deterministic under the engine's own seeding.
    fn prng(&self) -> u64;
}

/// The capability object the service hands to the engine at construction.
///
/// Implementations must be thread-safe; the engine may invoke callbacks
/// from within any of its entry points.
pub trait NodeHost: Send + Sync {
    /// Persist (or with `None`, delete) an opaque state object.
    fn state_put(&self, kind: StateObjectKind, data: Option<&[u8]>);

    /// Load an opaque state object, truncated to `max_len` bytes.
    fn state_get(&self, kind: StateObjectKind, max_len: usize) -> Option<Vec<u8>>;

    /// Send a datagram. `local_socket` ≤ 0 means "any bound socket".
    /// Returns 0 on success, -1 on failure.
    fn wire_send(&self, local_socket: i64, addr: SocketAddr, data: &[u8], ttl: u32) -> i32;

    /// Deliver a decrypted Ethernet frame to the network's tap.
    fn virtual_network_frame(
        &self,
        nwid: NetworkId,
        src: Mac,
        dst: Mac,
        ethertype: u16,
        vlan_id: u16,
        data: &[u8],
    );

    /// Apply a network lifecycle operation. `config` is present for
    /// `Up`/`Update`. Returns 0 on success or a negative error code.
    fn virtual_network_config(
        &self,
        nwid: NetworkId,
        op: ConfigOp,
        config: Option<&VirtualNetworkConfig>,
    ) -> i32;

    /// Report an engine event.
    fn event(&self, event: EngineEvent);

    /// Whether a (peer, local socket, remote address) triple may be used.
    fn path_check(&self, peer: NodeAddr, local_socket: i64, remote: SocketAddr) -> bool;

    /// Operator-configured hint address for a peer, chosen with the
    /// engine's PRNG. `family` of `None` means "either".
    fn path_lookup(
        &self,
        peer: NodeAddr,
        family: Option<IpFamily>,
        prng: &mut dyn FnMut() -> u64,
    ) -> Option<SocketAddr>;
}

/// Constructor for an engine bound to a host capability.
pub type EngineFactory = Box<dyn FnOnce(Arc<dyn NodeHost>) -> Box<dyn Engine> + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_codes_are_the_100_range() {
        assert!(!ResultCode::Ok.is_fatal());
        assert!(ResultCode::FatalOutOfMemory.is_fatal());
        assert!(ResultCode::FatalDataStoreFailed.is_fatal());
        assert!(ResultCode::FatalInternal.is_fatal());
        assert!(!ResultCode::NetworkNotFound.is_fatal());
        assert!(!ResultCode::BadParameter.is_fatal());
    }

    #[test]
    fn direct_path_count_tracks_paths() {
        let mut peer = Peer {
            address: NodeAddr::new(0x1122334455),
            role: PeerRole::Leaf,
            latency: -1,
            paths: Vec::new(),
        };
        assert_eq!(peer.direct_path_count(), 0);
        peer.paths.push(PeerPath {
            address: "192.0.2.1:9993".parse().unwrap(),
            last_send: 0,
            last_receive: 0,
            preferred: true,
        });
        assert_eq!(peer.direct_path_count(), 1);
    }
}
