//! Shared types and trait seams for the lattice overlay network.
//!
//! This crate defines the vocabulary the node service and the overlay
//! protocol engine speak to each other: network and node identifiers,
//! CIDR-bearing addresses with scope classification, virtual network
//! configuration snapshots, and the capability traits through which the
//! service drives the engine, tap devices, the userspace IP stack, and
//! the port mapper.

pub mod engine;
pub mod inet;
pub mod netconf;
pub mod tap;
pub mod types;

pub use engine::{Engine, EngineEvent, EngineFactory, NodeHost, Peer, PeerPath, PeerRole, ResultCode, StateObjectKind};
pub use inet::{InetCidr, IpFamily, IpScope, scope_of};
pub use netconf::{ConfigOp, VirtualNetworkConfig, VirtualNetworkStatus, VirtualNetworkType, VirtualRoute};
pub use tap::{FrameSink, NetStack, PortMapper, TapFactory, TapFrame, TapParams, VirtualTap};
pub use types::{Mac, MulticastGroup, NetworkId, NodeAddr};
