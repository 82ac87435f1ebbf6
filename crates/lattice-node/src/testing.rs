//! In-memory doubles for the service's external collaborators, used by
//! the test suites and by the stand-alone binary.
//!
//! [`MockEngine`] is a scripted overlay engine: tests queue
//! [`MockAction`]s on its shared state and the engine replays them from
//! inside `process_background_tasks`, which is exactly where a real
//! engine invokes its host callbacks. [`TestTapFactory`] hands out
//! in-memory taps whose state stays observable through [`TapProbe`]s
//! after ownership moves into the service.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lattice_core::{
    ConfigOp, Engine, EngineEvent, EngineFactory, FrameSink, InetCidr, IpFamily, Mac,
    MulticastGroup, NetStack, NetworkId, NodeAddr, NodeHost, Peer, PortMapper, ResultCode,
    StateObjectKind, TapFactory, TapFrame, TapParams, VirtualNetworkConfig, VirtualTap,
};

// ---------------------------------------------------------------------------
// Mock engine
// ---------------------------------------------------------------------------

/// One scripted step the mock engine performs on its next background tick.
pub enum MockAction {
    /// Report an engine event through the host.
    Event(EngineEvent),
    /// Deliver a network config callback.
    NetworkConfig(NetworkId, ConfigOp, Option<VirtualNetworkConfig>),
    /// Replace the peer snapshot returned by `peers()`.
    SetPeers(Vec<Peer>),
    /// Ask the host whether a path is usable; the answer is recorded in
    /// [`MockEngineState::path_results`].
    PathProbe {
        peer: NodeAddr,
        local_socket: i64,
        remote: SocketAddr,
    },
    /// Ask the host for a hint address; the answer is recorded in
    /// [`MockEngineState::lookup_results`].
    LookupProbe {
        peer: NodeAddr,
        family: Option<IpFamily>,
    },
    /// Ask the host to send a datagram on the wire.
    WireSend {
        local_socket: i64,
        addr: SocketAddr,
        data: Vec<u8>,
        ttl: u32,
    },
}

/// Shared, observable state of a [`MockEngine`].
#[derive(Default)]
pub struct MockEngineState {
    addr: u64,
    online: AtomicBool,
    prng: AtomicU64,
    fatal_on_wire: AtomicBool,
    actions: Mutex<VecDeque<MockAction>>,
    peers: Mutex<Vec<Peer>>,

    pub background_runs: AtomicU64,
    pub wire_packets: Mutex<Vec<(i64, SocketAddr, Vec<u8>)>>,
    pub frames: Mutex<Vec<TapFrame>>,
    pub joined: Mutex<Vec<NetworkId>>,
    pub left: Mutex<Vec<NetworkId>>,
    pub subscribed: Mutex<Vec<(NetworkId, MulticastGroup)>>,
    pub unsubscribed: Mutex<Vec<(NetworkId, MulticastGroup)>>,
    pub local_addrs: Mutex<Vec<SocketAddr>>,
    pub multipath_updates: Mutex<Vec<u32>>,
    pub path_results: Mutex<Vec<bool>>,
    pub lookup_results: Mutex<Vec<Option<SocketAddr>>>,
}

impl MockEngineState {
    /// Queue an action for the next background tick.
    pub fn queue(&self, action: MockAction) {
        self.actions.lock().unwrap().push_back(action);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Make the next `process_wire_packet` return a fatal code.
    pub fn set_fatal_on_wire(&self) {
        self.fatal_on_wire.store(true, Ordering::SeqCst);
    }
}

/// A scripted engine bound to a host capability.
pub struct MockEngine {
    host: Arc<dyn NodeHost>,
    state: Arc<MockEngineState>,
}

/// Interval the mock reports until its next background deadline.
pub const MOCK_DEADLINE_STEP_MS: i64 = 25;

/// Build a mock engine factory plus the shared state handle tests keep.
///
/// At construction the factory reports `Up` and persists placeholder
/// identity objects, the way a real engine initializes a fresh home.
pub fn mock_engine(addr: NodeAddr) -> (EngineFactory, Arc<MockEngineState>) {
    let state = Arc::new(MockEngineState {
        addr: addr.as_u64(),
        ..Default::default()
    });
    let shared = Arc::clone(&state);
    let factory: EngineFactory = Box::new(move |host| {
        host.event(EngineEvent::Up);
        host.state_put(StateObjectKind::IdentityPublic, Some(b"identity-public"));
        host.state_put(StateObjectKind::IdentitySecret, Some(b"identity-secret"));
        Box::new(MockEngine {
            host,
            state: shared,
        })
    });
    (factory, state)
}

impl MockEngine {
    fn drain_actions(&self) {
        loop {
            let action = self.state.actions.lock().unwrap().pop_front();
            let Some(action) = action else { break };
            match action {
                MockAction::Event(event) => {
                    match event {
                        EngineEvent::Online => self.state.online.store(true, Ordering::SeqCst),
                        EngineEvent::Offline | EngineEvent::Down => {
                            self.state.online.store(false, Ordering::SeqCst)
                        }
                        _ => {}
                    }
                    self.host.event(event);
                }
                MockAction::NetworkConfig(nwid, op, config) => {
                    self.host.virtual_network_config(nwid, op, config.as_ref());
                }
                MockAction::SetPeers(peers) => {
                    *self.state.peers.lock().unwrap() = peers;
                }
                MockAction::PathProbe {
                    peer,
                    local_socket,
                    remote,
                } => {
                    let ok = self.host.path_check(peer, local_socket, remote);
                    self.state.path_results.lock().unwrap().push(ok);
                }
                MockAction::LookupProbe { peer, family } => {
                    let mut prng = || self.state.prng.fetch_add(1, Ordering::Relaxed);
                    let found = self.host.path_lookup(peer, family, &mut prng);
                    self.state.lookup_results.lock().unwrap().push(found);
                }
                MockAction::WireSend {
                    local_socket,
                    addr,
                    data,
                    ttl,
                } => {
                    self.host.wire_send(local_socket, addr, &data, ttl);
                }
            }
        }
    }
}

impl Engine for MockEngine {
    fn address(&self) -> NodeAddr {
        NodeAddr::new(self.state.addr)
    }

    fn online(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }

    fn process_wire_packet(
        &self,
        now: i64,
        local_socket: i64,
        from: SocketAddr,
        data: &[u8],
    ) -> (ResultCode, i64) {
        self.state
            .wire_packets
            .lock()
            .unwrap()
            .push((local_socket, from, data.to_vec()));
        let code = if self.state.fatal_on_wire.load(Ordering::SeqCst) {
            ResultCode::FatalInternal
        } else {
            ResultCode::Ok
        };
        (code, now + MOCK_DEADLINE_STEP_MS)
    }

    fn process_virtual_network_frame(
        &self,
        now: i64,
        nwid: NetworkId,
        src: Mac,
        dst: Mac,
        ethertype: u16,
        vlan_id: u16,
        data: &[u8],
    ) -> (ResultCode, i64) {
        self.state.frames.lock().unwrap().push(TapFrame {
            nwid,
            src,
            dst,
            ethertype,
            vlan_id,
            data: data.to_vec(),
        });
        (ResultCode::Ok, now + MOCK_DEADLINE_STEP_MS)
    }

    fn process_background_tasks(&self, now: i64) -> (ResultCode, i64) {
        self.state.background_runs.fetch_add(1, Ordering::Relaxed);
        self.drain_actions();
        (ResultCode::Ok, now + MOCK_DEADLINE_STEP_MS)
    }

    fn join(&self, nwid: NetworkId) -> ResultCode {
        self.state.joined.lock().unwrap().push(nwid);
        ResultCode::Ok
    }

    fn leave(&self, nwid: NetworkId) -> ResultCode {
        self.state.left.lock().unwrap().push(nwid);
        ResultCode::Ok
    }

    fn multicast_subscribe(&self, nwid: NetworkId, group: MulticastGroup) -> ResultCode {
        self.state.subscribed.lock().unwrap().push((nwid, group));
        ResultCode::Ok
    }

    fn multicast_unsubscribe(&self, nwid: NetworkId, group: MulticastGroup) -> ResultCode {
        self.state.unsubscribed.lock().unwrap().push((nwid, group));
        ResultCode::Ok
    }

    fn peers(&self) -> Vec<Peer> {
        self.state.peers.lock().unwrap().clone()
    }

    fn clear_local_interface_addresses(&self) {
        self.state.local_addrs.lock().unwrap().clear();
    }

    fn add_local_interface_address(&self, addr: SocketAddr) {
        self.state.local_addrs.lock().unwrap().push(addr);
    }

    fn set_multipath_mode(&self, mode: u32) {
        self.state.multipath_updates.lock().unwrap().push(mode);
    }

    fn prng(&self) -> u64 {
        self.state.prng.fetch_add(1, Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Test tap
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TapInner {
    device: String,
    mtu: u16,
    ips: Vec<InetCidr>,
    put_frames: Vec<(Mac, Mac, u16, Vec<u8>)>,
    pending_added: Vec<MulticastGroup>,
    pending_removed: Vec<MulticastGroup>,
    fail_ip_ops: bool,
}

/// In-memory tap device.
pub struct TestTap {
    inner: Arc<Mutex<TapInner>>,
}

impl VirtualTap for TestTap {
    fn add_ip(&mut self, ip: InetCidr) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_ip_ops {
            return Err(io::Error::other("tap refused address"));
        }
        if !inner.ips.contains(&ip) {
            inner.ips.push(ip);
            inner.ips.sort();
        }
        Ok(())
    }

    fn remove_ip(&mut self, ip: InetCidr) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_ip_ops {
            return Err(io::Error::other("tap refused address"));
        }
        inner.ips.retain(|existing| *existing != ip);
        Ok(())
    }

    fn set_mtu(&mut self, mtu: u16) {
        self.inner.lock().unwrap().mtu = mtu;
    }

    fn scan_multicast_groups(&mut self) -> (Vec<MulticastGroup>, Vec<MulticastGroup>) {
        let mut inner = self.inner.lock().unwrap();
        (
            std::mem::take(&mut inner.pending_added),
            std::mem::take(&mut inner.pending_removed),
        )
    }

    fn put(&mut self, src: Mac, dst: Mac, ethertype: u16, data: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .put_frames
            .push((src, dst, ethertype, data.to_vec()));
    }

    fn ips(&self) -> Vec<InetCidr> {
        self.inner.lock().unwrap().ips.clone()
    }

    fn device_name(&self) -> String {
        self.inner.lock().unwrap().device.clone()
    }

    fn has_ipv4_addr(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .ips
            .iter()
            .any(|ip| ip.family() == IpFamily::V4)
    }

    fn has_ipv6_addr(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .ips
            .iter()
            .any(|ip| ip.family() == IpFamily::V6)
    }
}

/// Observer handle onto a tap owned by the service.
#[derive(Clone)]
pub struct TapProbe {
    inner: Arc<Mutex<TapInner>>,
    sink: Arc<dyn Fn(TapFrame) + Send + Sync>,
}

impl TapProbe {
    pub fn ips(&self) -> Vec<InetCidr> {
        self.inner.lock().unwrap().ips.clone()
    }

    pub fn mtu(&self) -> u16 {
        self.inner.lock().unwrap().mtu
    }

    pub fn device_name(&self) -> String {
        self.inner.lock().unwrap().device.clone()
    }

    /// Frames the service pushed into this tap from the overlay.
    pub fn frames_from_overlay(&self) -> Vec<(Mac, Mac, u16, Vec<u8>)> {
        self.inner.lock().unwrap().put_frames.clone()
    }

    /// Queue multicast membership changes for the next scan.
    pub fn queue_multicast(&self, added: Vec<MulticastGroup>, removed: Vec<MulticastGroup>) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_added.extend(added);
        inner.pending_removed.extend(removed);
    }

    /// Make subsequent add/remove IP calls fail.
    pub fn fail_ip_ops(&self) {
        self.inner.lock().unwrap().fail_ip_ops = true;
    }

    /// Deliver a frame from the IP stack into the service, as the tap
    /// would.
    pub fn send_frame(&self, frame: TapFrame) {
        (self.sink)(frame);
    }
}

/// Factory handing out [`TestTap`]s and recording probes per network.
#[derive(Default)]
pub struct TestTapFactory {
    taps: Mutex<HashMap<NetworkId, TapProbe>>,
    fail_next: AtomicBool,
    next_device: AtomicU64,
}

impl TestTapFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `open` fail, as a platform tap driver might.
    pub fn fail_next_open(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// The probe for a network's tap, if one was created.
    pub fn tap(&self, nwid: NetworkId) -> Option<TapProbe> {
        self.taps.lock().unwrap().get(&nwid).cloned()
    }
}

impl TapFactory for TestTapFactory {
    fn open(&self, params: TapParams, frames: FrameSink) -> io::Result<Box<dyn VirtualTap>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(io::Error::other("no tap devices available"));
        }
        let n = self.next_device.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(Mutex::new(TapInner {
            device: format!("testtap{n}"),
            mtu: params.mtu,
            ..Default::default()
        }));
        let probe = TapProbe {
            inner: Arc::clone(&inner),
            sink: Arc::from(frames),
        };
        self.taps.lock().unwrap().insert(params.nwid, probe);
        Ok(Box::new(TestTap { inner }))
    }
}

// ---------------------------------------------------------------------------
// Stack probe and port mapper
// ---------------------------------------------------------------------------

/// A [`NetStack`] whose readiness is a settable flag (up by default).
pub struct UpStack {
    up: AtomicBool,
}

impl UpStack {
    pub fn new() -> Self {
        Self {
            up: AtomicBool::new(true),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

impl Default for UpStack {
    fn default() -> Self {
        Self::new()
    }
}

impl NetStack for UpStack {
    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn is_netif_up(&self, _device: &str, _family: IpFamily) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

/// A [`PortMapper`] with a fixed external address list.
#[derive(Default)]
pub struct FixedMapper {
    pub started: Mutex<Vec<(u16, String)>>,
    pub external: Mutex<Vec<SocketAddr>>,
}

impl FixedMapper {
    pub fn with_external(addrs: Vec<SocketAddr>) -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            external: Mutex::new(addrs),
        }
    }
}

impl PortMapper for FixedMapper {
    fn start(&self, port: u16, unique_name: &str) {
        self.started
            .lock()
            .unwrap()
            .push((port, unique_name.to_string()));
    }

    fn get(&self) -> Vec<SocketAddr> {
        self.external.lock().unwrap().clone()
    }
}
