//! Trait seams for the service's external collaborators: virtual tap
//! devices, the userspace IP stack, and the uPnP/NAT-PMP port mapper.

use std::io;
use std::net::SocketAddr;

use crate::inet::{InetCidr, IpFamily};
use crate::types::{Mac, MulticastGroup, NetworkId};

/// An Ethernet frame read from a tap, on its way into the engine.
#[derive(Debug, Clone)]
pub struct TapFrame {
    pub nwid: NetworkId,
    pub src: Mac,
    pub dst: Mac,
    pub ethertype: u16,
    pub vlan_id: u16,
    pub data: Vec<u8>,
}

/// Where a tap delivers frames it reads from the IP stack.
///
/// The service hands each tap a sink that feeds its control loop; sinks
/// must never block.
pub type FrameSink = Box<dyn Fn(TapFrame) + Send + Sync>;

/// Parameters for creating a tap device.
#[derive(Debug, Clone)]
pub struct TapParams {
    pub nwid: NetworkId,
    pub mac: Mac,
    pub mtu: u16,
    pub friendly_name: String,
}

/// A virtual Ethernet device bridging one overlay network into the
/// userspace IP stack.
pub trait VirtualTap: Send {
    /// Install an address. Failures are transient: the reconciler logs
    /// and retries on the next config update.
    fn add_ip(&mut self, ip: InetCidr) -> io::Result<()>;

    /// Remove an address.
    fn remove_ip(&mut self, ip: InetCidr) -> io::Result<()>;

    fn set_mtu(&mut self, mtu: u16);

    /// Return multicast groups (subscribed, unsubscribed) since the last
    /// scan.
    fn scan_multicast_groups(&mut self) -> (Vec<MulticastGroup>, Vec<MulticastGroup>);

    /// Inject a frame received from the overlay into the IP stack.
    fn put(&mut self, src: Mac, dst: Mac, ethertype: u16, data: &[u8]);

    /// Addresses currently installed on this device.
    fn ips(&self) -> Vec<InetCidr>;

    fn device_name(&self) -> String;

    fn has_ipv4_addr(&self) -> bool;
    fn has_ipv6_addr(&self) -> bool;
}

/// Creates tap devices on demand as networks come up.
pub trait TapFactory: Send + Sync {
    fn open(&self, params: TapParams, frames: FrameSink) -> io::Result<Box<dyn VirtualTap>>;
}

/// Readiness probe against the userspace IP stack.
///
/// The service never drives the stack's lifecycle; it only gates
/// network-ready events on these predicates.
pub trait NetStack: Send + Sync {
    /// Whether the stack as a whole is up.
    fn is_up(&self) -> bool;

    /// Whether the stack's netif for the given tap device and family is up.
    fn is_netif_up(&self, device: &str, family: IpFamily) -> bool;
}

/// uPnP/NAT-PMP port mapper, opaque to the service.
pub trait PortMapper: Send + Sync {
    /// Begin mapping the given local port, advertising `unique_name`.
    fn start(&self, port: u16, unique_name: &str);

    /// Externally observed addresses for current mappings.
    fn get(&self) -> Vec<SocketAddr>;
}
