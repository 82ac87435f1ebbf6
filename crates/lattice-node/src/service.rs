//! The node service: construction, the host capability the engine calls
//! back into, and the main control loop.
//!
//! One task runs the control loop and is the sole caller of the engine's
//! synchronous APIs. Binder read tasks and tap frame sinks feed it over
//! bounded channels; everything else (periodic binding refresh, multicast
//! sync, interface address sync, peer cache cleanup, status and peer
//! events, background-task pulsing) happens inline on loop ticks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

use lattice_core::{
    ConfigOp, EngineEvent, EngineFactory, InetCidr, IpFamily, Mac, MulticastGroup, NetStack,
    NetworkId, NodeAddr, NodeHost, PortMapper, StateObjectKind, TapFactory, TapFrame,
    VirtualNetworkConfig,
};

use crate::binder::{Binder, Datagram};
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::events::{EventCode, EventPayload, EventSink, NodeInfo};
use crate::networks::{self, ConfigOpCtx, ManagedRoute, NetworkSettings, NetworkTable};
use crate::paths::{self, LocalConfig};
use crate::peers;
use crate::ports;
use crate::store::StateStore;
use crate::wire;

/// How often bindings are refreshed; divided by 8 under multipath.
const BINDER_REFRESH_PERIOD_MS: i64 = 30_000;

/// How often the multipath mode is re-pushed into the engine.
const MULTIPATH_PUSH_PERIOD_MS: i64 = BINDER_REFRESH_PERIOD_MS / 8;

/// How often tap multicast subscriptions are synced into the engine.
const TAP_MULTICAST_INTERVAL_MS: i64 = 5_000;

/// How often local interface addresses are re-announced to the engine;
/// divided by 8 under multipath.
const LOCAL_INTERFACE_CHECK_INTERVAL_MS: i64 = 60_000;

/// Delay before the first interface address sync, giving the port mapper
/// time to configure.
const LOCAL_INTERFACE_CHECK_INITIAL_DELAY_MS: i64 = 15_000;

/// How often stale peer cache files are reaped.
const PEER_REAP_INTERVAL_MS: i64 = 3_600_000;

/// Peer cache files older than this are deleted.
const PEER_CACHE_MAX_AGE: Duration = Duration::from_secs(30 * 86_400);

/// A tick arriving this far past its expected time means the host slept.
const RESTART_GAP_MS: i64 = 10_000;

/// Bounds on the loop's sleep between ticks. The ceiling keeps periodic
/// work on schedule even when the engine's deadline is far out.
const TICK_FLOOR_MS: i64 = 100;
const TICK_CEILING_MS: i64 = 500;

/// Depth of the inbound datagram and tap frame queues. Overflow drops.
const INBOUND_QUEUE_DEPTH: usize = 1024;
const FRAME_QUEUE_DEPTH: usize = 1024;

/// Why the service stopped (or that it has not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    StillRunning,
    NormalTermination,
    UnrecoverableError,
    IdentityCollision,
}

/// External collaborators handed to the service at construction.
pub struct ServiceDeps {
    pub engine: EngineFactory,
    pub taps: Arc<dyn TapFactory>,
    pub stack: Arc<dyn NetStack>,
    pub mapper: Option<Arc<dyn PortMapper>>,
}

struct TermState {
    reason: Termination,
    fatal_message: String,
}

/// Shared service state: the host capability implementation plus
/// everything callbacks and the control loop both touch.
struct ServiceInner {
    home: PathBuf,
    config: ServiceConfig,
    store: StateStore,
    events: EventSink,
    binder: Binder,
    nets: Mutex<NetworkTable>,
    local: Mutex<LocalConfig>,
    initial_settings: HashMap<NetworkId, NetworkSettings>,
    explicit_bind: Vec<SocketAddr>,
    term: Mutex<TermState>,
    run: AtomicBool,
    wake_tx: watch::Sender<bool>,
    ports: Mutex<[u16; 3]>,
    node_addr: AtomicU64,
    last_global_receive_ms: AtomicI64,
    start: Instant,
    taps: Arc<dyn TapFactory>,
    stack: Arc<dyn NetStack>,
    mapper: Option<Arc<dyn PortMapper>>,
    frame_tx: mpsc::Sender<TapFrame>,
}

impl ServiceInner {
    /// Monotonic milliseconds since service construction.
    fn now_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    /// Record a termination reason, first writer wins.
    fn set_reason(&self, reason: Termination, message: &str) {
        let mut term = self.term.lock().unwrap();
        if term.reason == Termination::StillRunning {
            term.reason = reason;
            term.fatal_message = message.to_string();
        }
    }

    /// Clear the run flag and wake the control loop. Idempotent.
    fn terminate(&self) {
        self.run.store(false, Ordering::SeqCst);
        let _ = self.wake_tx.send(true);
    }

    fn node_info(&self) -> NodeInfo {
        let ports = *self.ports.lock().unwrap();
        NodeInfo {
            address: NodeAddr::new(self.node_addr.load(Ordering::SeqCst)),
            primary_port: ports[0],
            secondary_port: ports[1],
            mapping_port: ports[2],
        }
    }

    fn tap_ips(&self) -> Vec<InetCidr> {
        networks::all_tap_ips(&self.nets.lock().unwrap())
    }
}

impl NodeHost for ServiceInner {
    fn state_put(&self, kind: StateObjectKind, data: Option<&[u8]>) {
        match data {
            Some(bytes) => self.store.put(kind, bytes),
            None => self.store.delete(kind),
        }
    }

    fn state_get(&self, kind: StateObjectKind, max_len: usize) -> Option<Vec<u8>> {
        self.store.get(kind, max_len)
    }

    fn wire_send(&self, local_socket: i64, addr: SocketAddr, data: &[u8], ttl: u32) -> i32 {
        wire::send(&self.binder, local_socket, addr, data, ttl)
    }

    fn virtual_network_frame(
        &self,
        nwid: NetworkId,
        src: Mac,
        dst: Mac,
        ethertype: u16,
        _vlan_id: u16,
        data: &[u8],
    ) {
        let mut nets = self.nets.lock().unwrap();
        if let Some(state) = nets.get_mut(&nwid)
            && let Some(tap) = state.tap.as_mut()
        {
            tap.put(src, dst, ethertype, data);
        }
    }

    fn virtual_network_config(
        &self,
        nwid: NetworkId,
        op: ConfigOp,
        config: Option<&VirtualNetworkConfig>,
    ) -> i32 {
        let ctx = ConfigOpCtx {
            taps: self.taps.as_ref(),
            frame_tx: &self.frame_tx,
            store: &self.store,
            events: &self.events,
            initial_settings: &self.initial_settings,
        };
        let mut nets = self.nets.lock().unwrap();
        networks::apply_config_op(&mut nets, &ctx, nwid, op, config)
    }

    fn event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Up => {
                self.events.send(EventCode::NodeUp, EventPayload::None);
            }
            EngineEvent::Online => {
                self.events
                    .send(EventCode::NodeOnline, EventPayload::Node(self.node_info()));
            }
            EngineEvent::Offline => {
                self.events
                    .send(EventCode::NodeOffline, EventPayload::Node(self.node_info()));
            }
            EngineEvent::Down => {
                self.events
                    .send(EventCode::NodeDown, EventPayload::Node(self.node_info()));
            }
            EngineEvent::FatalIdentityCollision => {
                self.set_reason(Termination::IdentityCollision, "identity/address collision");
                self.terminate();
            }
            EngineEvent::Trace(message) => {
                debug!(target: "engine", "{message}");
            }
        }
    }

    fn path_check(&self, peer: NodeAddr, _local_socket: i64, remote: SocketAddr) -> bool {
        let tap_ips = self.tap_ips();
        let local = self.local.lock().unwrap();
        paths::path_check(&local, &tap_ips, peer, remote)
    }

    fn path_lookup(
        &self,
        peer: NodeAddr,
        family: Option<IpFamily>,
        prng: &mut dyn FnMut() -> u64,
    ) -> Option<SocketAddr> {
        let local = self.local.lock().unwrap();
        paths::path_lookup(&local, peer, family, prng)
    }
}

/// Cloneable control handle: termination, reasons, and introspection.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<ServiceInner>,
}

impl ServiceHandle {
    /// Ask the service to stop. Idempotent; shutdown completes within
    /// one loop tick plus wake latency.
    pub fn terminate(&self) {
        self.inner.terminate();
    }

    pub fn reason(&self) -> Termination {
        self.inner.term.lock().unwrap().reason
    }

    pub fn fatal_error_message(&self) -> String {
        self.inner.term.lock().unwrap().fatal_message.clone()
    }

    /// The three service ports: primary, secondary, mapping. Zero means
    /// unallocated.
    pub fn ports(&self) -> [u16; 3] {
        *self.inner.ports.lock().unwrap()
    }

    /// The home directory the service was given.
    pub fn home_path(&self) -> PathBuf {
        self.inner.home.clone()
    }

    /// OS device name of a network's tap.
    pub fn device_name(&self, nwid: NetworkId) -> Option<String> {
        let nets = self.inner.nets.lock().unwrap();
        nets.get(&nwid)
            .and_then(|state| state.tap.as_ref().map(|tap| tap.device_name()))
    }

    /// A network's managed-address policy.
    pub fn network_settings(&self, nwid: NetworkId) -> Option<NetworkSettings> {
        let nets = self.inner.nets.lock().unwrap();
        nets.get(&nwid).map(|state| state.settings.clone())
    }

    /// Routes currently tracked for a network.
    pub fn routes(&self, nwid: NetworkId) -> Vec<ManagedRoute> {
        let nets = self.inner.nets.lock().unwrap();
        nets.get(&nwid)
            .map(|state| state.managed_routes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Local addresses of every socket the binder currently has bound.
    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.inner.binder.bound_addresses()
    }

    /// Datagrams dropped because the inbound queue was full.
    pub fn dropped_datagrams(&self) -> u64 {
        self.inner.binder.dropped_datagrams()
    }

    /// When we last heard from a globally routable address, in service
    /// monotonic milliseconds; zero if never.
    pub fn last_direct_receive_from_global(&self) -> i64 {
        self.inner.last_global_receive_ms.load(Ordering::SeqCst)
    }
}

/// The node service. Construct, optionally keep a [`ServiceHandle`],
/// then drive with [`run`](Self::run) until termination.
pub struct NodeService {
    inner: Arc<ServiceInner>,
    engine: Box<dyn lattice_core::Engine>,
    inbound_rx: mpsc::Receiver<Datagram>,
    frame_rx: mpsc::Receiver<TapFrame>,
    wake_rx: watch::Receiver<bool>,
    peer_cache: HashMap<NodeAddr, u32>,
    next_deadline: i64,
}

impl NodeService {
    /// Build the service: home directory, state store, local config
    /// tables, channels, binder, and finally the engine (which receives
    /// the host capability and may call back during construction).
    pub fn new(
        config: ServiceConfig,
        deps: ServiceDeps,
        events: EventSink,
    ) -> Result<Self, ServiceError> {
        let home = config.home_path();
        std::fs::create_dir_all(&home)
            .map_err(|e| ServiceError::Config(format!("cannot create home directory: {e}")))?;

        let store = StateStore::new(
            &home,
            config.service.allow_network_caching,
            config.service.allow_peer_caching,
        );
        let local = config.local_config()?;
        let initial_settings = config.network_settings()?;
        let explicit_bind = config.explicit_bind()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (wake_tx, wake_rx) = watch::channel(false);

        let inner = Arc::new(ServiceInner {
            home,
            config,
            store,
            events,
            binder: Binder::new(inbound_tx),
            nets: Mutex::new(NetworkTable::new()),
            local: Mutex::new(local),
            initial_settings,
            explicit_bind,
            term: Mutex::new(TermState {
                reason: Termination::StillRunning,
                fatal_message: String::new(),
            }),
            run: AtomicBool::new(true),
            wake_tx,
            ports: Mutex::new([0; 3]),
            node_addr: AtomicU64::new(0),
            last_global_receive_ms: AtomicI64::new(0),
            start: Instant::now(),
            taps: deps.taps,
            stack: deps.stack,
            mapper: deps.mapper,
            frame_tx,
        });

        let engine = (deps.engine)(Arc::clone(&inner) as Arc<dyn NodeHost>);
        inner
            .node_addr
            .store(engine.address().as_u64(), Ordering::SeqCst);

        Ok(Self {
            inner,
            engine,
            inbound_rx,
            frame_rx,
            wake_rx,
            peer_cache: HashMap::new(),
            next_deadline: 0,
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Run until terminated. Consumes the service; sockets, taps, and
    /// the engine are all released before returning the reason.
    pub async fn run(mut self) -> Termination {
        match self.startup().await {
            Ok(()) => {
                info!(home = %self.inner.home.display(), "service started");
                self.main_loop().await;
            }
            Err(e) => {
                error!("startup failed: {e}");
                self.inner
                    .set_reason(Termination::UnrecoverableError, &e.to_string());
            }
        }
        self.teardown();
        let reason = self.inner.term.lock().unwrap().reason;
        info!(reason = ?reason, "service stopped");
        reason
    }

    async fn startup(&mut self) -> Result<(), ServiceError> {
        self.inner.store.load_or_create_auth_token()?;

        // Port selection. The secondary and mapping ports are optional;
        // the primary is not.
        let primary = ports::pick_primary(self.inner.config.service.primary_port)
            .ok_or(ServiceError::PrimaryPortUnavailable)?;

        let node_addr = self.engine.address();
        let secondary_start = if self.inner.config.service.secondary_port != 0 {
            self.inner.config.service.secondary_port
        } else {
            ports::derive_secondary(node_addr)
        };
        let secondary = ports::probe_from(secondary_start);

        let mut mapping = 0;
        if self.inner.config.service.port_mapping && secondary != 0 {
            let mapping_start = if self.inner.config.service.mapping_port != 0 {
                self.inner.config.service.mapping_port
            } else {
                secondary
            };
            mapping = ports::probe_from(mapping_start);
            if mapping != 0
                && let Some(mapper) = &self.inner.mapper
            {
                mapper.start(mapping, &format!("Overlay/{node_addr}@{mapping}"));
            }
        }

        *self.inner.ports.lock().unwrap() = [primary, secondary, mapping];
        info!(primary, secondary, mapping, "service ports selected");

        // Rejoin networks cached from previous runs.
        for nwid in self.inner.store.cached_networks() {
            debug!(nwid = %nwid, "rejoining cached network");
            self.engine.join(nwid);
        }

        self.refresh_bindings().await;
        Ok(())
    }

    async fn main_loop(&mut self) {
        let now0 = self.inner.now_ms();
        let multipath = self.inner.config.service.multipath_mode != 0;

        let mut last_bind_refresh = now0;
        let mut last_multipath_push = now0 - MULTIPATH_PUSH_PERIOD_MS;
        let mut last_multicast_check = now0 - TAP_MULTICAST_INTERVAL_MS;
        let mut last_interface_check =
            now0 - LOCAL_INTERFACE_CHECK_INTERVAL_MS + LOCAL_INTERFACE_CHECK_INITIAL_DELAY_MS;
        let mut last_peer_reap = now0 - PEER_REAP_INTERVAL_MS;
        let mut expected_tick = now0;

        loop {
            if !self.inner.run.load(Ordering::SeqCst) {
                self.inner
                    .set_reason(Termination::NormalTermination, "");
                break;
            }

            let now = self.inner.now_ms();

            // A tick long past its expected time means the host slept or
            // the process was suspended; treat it as interface churn.
            let restarted = now - expected_tick > RESTART_GAP_MS;
            if restarted {
                info!("delay overrun detected, assuming sleep/wake cycle");
            }

            let bind_period = if multipath {
                BINDER_REFRESH_PERIOD_MS / 8
            } else {
                BINDER_REFRESH_PERIOD_MS
            };
            if now - last_bind_refresh >= bind_period || restarted {
                last_bind_refresh = now;
                self.refresh_bindings().await;
            }

            if now - last_multipath_push >= MULTIPATH_PUSH_PERIOD_MS || restarted {
                last_multipath_push = now;
                self.engine
                    .set_multipath_mode(self.inner.config.service.multipath_mode);
            }

            self.generate_event_msgs();

            if self.next_deadline <= now {
                let (_code, deadline) = self.engine.process_background_tasks(now);
                self.next_deadline = deadline;
            }

            if now - last_multicast_check >= TAP_MULTICAST_INTERVAL_MS {
                last_multicast_check = now;
                self.sync_multicast_groups();
            }

            let interface_period = if multipath {
                LOCAL_INTERFACE_CHECK_INTERVAL_MS / 8
            } else {
                LOCAL_INTERFACE_CHECK_INTERVAL_MS
            };
            if now - last_interface_check >= interface_period {
                last_interface_check = now;
                self.sync_local_interface_addresses();
            }

            if now - last_peer_reap >= PEER_REAP_INTERVAL_MS {
                last_peer_reap = now;
                let removed = self.inner.store.reap_stale_peers(PEER_CACHE_MAX_AGE);
                if removed > 0 {
                    info!(removed, "reaped stale peer cache files");
                }
            }

            let delay = (self.next_deadline - now).clamp(TICK_FLOOR_MS, TICK_CEILING_MS);
            expected_tick = now + delay;

            tokio::select! {
                biased;

                _ = self.wake_rx.changed() => {}

                datagram = self.inbound_rx.recv() => {
                    if let Some(datagram) = datagram {
                        self.handle_datagram(datagram);
                    }
                }

                frame = self.frame_rx.recv() => {
                    if let Some(frame) = frame {
                        self.handle_frame(frame);
                    }
                }

                _ = tokio::time::sleep(Duration::from_millis(delay as u64)) => {}
            }
        }
    }

    fn handle_datagram(&mut self, datagram: Datagram) {
        let now = self.inner.now_ms();
        if wire::is_global_receive(&datagram.from, datagram.data.len()) {
            self.inner
                .last_global_receive_ms
                .store(now, Ordering::SeqCst);
        }
        let (code, deadline) = self.engine.process_wire_packet(
            now,
            datagram.socket_id,
            datagram.from,
            &datagram.data,
        );
        self.next_deadline = deadline;
        if code.is_fatal() {
            let message = format!("fatal error code from process_wire_packet: {}", code as i32);
            error!("{message}");
            self.inner
                .set_reason(Termination::UnrecoverableError, &message);
            self.inner.terminate();
        }
    }

    fn handle_frame(&mut self, frame: TapFrame) {
        let now = self.inner.now_ms();
        let (_code, deadline) = self.engine.process_virtual_network_frame(
            now,
            frame.nwid,
            frame.src,
            frame.dst,
            frame.ethertype,
            frame.vlan_id,
            &frame.data,
        );
        self.next_deadline = deadline;
    }

    /// Network status edges and peer connectivity deltas. Only useful
    /// once the engine is online and the IP stack is serving.
    fn generate_event_msgs(&mut self) {
        if !self.engine.online() || !self.inner.stack.is_up() {
            return;
        }
        {
            let mut nets = self.inner.nets.lock().unwrap();
            networks::emit_status_events(&mut nets, self.inner.stack.as_ref(), &self.inner.events);
        }
        let snapshot = self.engine.peers();
        peers::detect_peer_deltas(&mut self.peer_cache, &snapshot, &self.inner.events);
    }

    /// Collect multicast membership changes under the table lock, then
    /// apply them to the engine outside it.
    fn sync_multicast_groups(&mut self) {
        let changes: Vec<(NetworkId, Vec<MulticastGroup>, Vec<MulticastGroup>)> = {
            let mut nets = self.inner.nets.lock().unwrap();
            nets.iter_mut()
                .filter_map(|(nwid, state)| {
                    state.tap.as_mut().map(|tap| {
                        let (added, removed) = tap.scan_multicast_groups();
                        (*nwid, added, removed)
                    })
                })
                .collect()
        };
        for (nwid, added, removed) in changes {
            for group in added {
                self.engine.multicast_subscribe(nwid, group);
            }
            for group in removed {
                self.engine.multicast_unsubscribe(nwid, group);
            }
        }
    }

    /// Re-announce reachable local addresses: port-mapper externals first,
    /// then everything the binder has bound.
    fn sync_local_interface_addresses(&mut self) {
        self.engine.clear_local_interface_addresses();
        if let Some(mapper) = &self.inner.mapper {
            for addr in mapper.get() {
                self.engine.add_local_interface_address(addr);
            }
        }
        for addr in self.inner.binder.bound_addresses() {
            self.engine.add_local_interface_address(addr);
        }
    }

    async fn refresh_bindings(&self) {
        let ports: Vec<u16> = self
            .inner
            .ports
            .lock()
            .unwrap()
            .iter()
            .copied()
            .filter(|p| *p != 0)
            .collect();
        let local = self.inner.local.lock().unwrap().clone();
        let tap_ips = self.inner.tap_ips();
        self.inner
            .binder
            .refresh(&ports, &self.inner.explicit_bind, &local, &tap_ips)
            .await;
    }

    fn teardown(&mut self) {
        self.inner.binder.close_all();
        // Dropping the states drops their taps.
        self.inner.nets.lock().unwrap().clear();
    }
}
