//! Per-network state: config snapshots, tap lifecycle, and managed
//! address/route reconciliation.
//!
//! The engine drives everything here through a single config callback
//! with four operations (UP, UPDATE, DOWN, DESTROY). The service holds
//! the network-table lock across each operation, so per-network lifecycle
//! is serialized.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use tokio::sync::mpsc;

use lattice_core::{
    ConfigOp, InetCidr, IpFamily, IpScope, NetStack, NetworkId, StateObjectKind, TapFactory,
    TapFrame, TapParams, VirtualNetworkConfig, VirtualNetworkStatus, VirtualTap,
};

use crate::events::{EventCode, EventPayload, EventSink};
use crate::store::StateStore;

/// User policy for managed addresses and routes on one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub allow_managed: bool,
    pub allow_global: bool,
    pub allow_default: bool,
    pub allow_managed_whitelist: Vec<InetCidr>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            allow_managed: true,
            allow_global: false,
            allow_default: false,
            allow_managed_whitelist: Vec::new(),
        }
    }
}

/// A route mirrored from the controller config, admitted by policy.
///
/// The set is tracked for reconciliation and introspection; programming
/// OS routing tables is the tap/stack layer's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ManagedRoute {
    pub target: InetCidr,
    pub via: Option<IpAddr>,
    pub metric: u16,
}

/// Everything the service knows about one joined network.
pub struct NetworkState {
    pub config: VirtualNetworkConfig,
    pub tap: Option<Box<dyn VirtualTap>>,
    pub managed_ips: Vec<InetCidr>,
    pub managed_routes: BTreeSet<ManagedRoute>,
    pub settings: NetworkSettings,
    pub last_observed_status: Option<VirtualNetworkStatus>,
}

/// The network table, keyed by network ID. Guarded by one mutex in the
/// service.
pub type NetworkTable = BTreeMap<NetworkId, NetworkState>;

impl NetworkState {
    fn new(config: VirtualNetworkConfig, settings: NetworkSettings) -> Self {
        Self {
            config,
            tap: None,
            managed_ips: Vec::new(),
            managed_routes: BTreeSet::new(),
            settings,
            last_observed_status: None,
        }
    }

    /// Reconcile tap-installed addresses and the tracked route set with
    /// the current config under this network's policy. Assumes the
    /// network-table lock is held; does nothing without a tap.
    pub fn sync_managed(&mut self, events: &EventSink) {
        let Some(tap) = self.tap.as_mut() else {
            return;
        };
        let nwid = self.config.nwid;

        let mut target: Vec<InetCidr> = self
            .config
            .assigned_addresses
            .iter()
            .filter(|ip| check_if_managed_is_allowed(&self.settings, ip))
            .copied()
            .collect();
        target.sort();
        target.dedup();

        for ip in &self.managed_ips {
            if !target.contains(ip) {
                match tap.remove_ip(*ip) {
                    Ok(()) => emit_addr_event(events, false, nwid, ip),
                    Err(e) => tracing::error!("unable to remove ip address {ip}: {e}"),
                }
            }
        }
        for ip in &target {
            if !self.managed_ips.contains(ip) {
                match tap.add_ip(*ip) {
                    Ok(()) => emit_addr_event(events, true, nwid, ip),
                    Err(e) => tracing::error!("unable to add ip address {ip}: {e}"),
                }
            }
        }
        self.managed_ips = target;

        let routes: BTreeSet<ManagedRoute> = self
            .config
            .routes
            .iter()
            .filter(|r| check_if_managed_is_allowed(&self.settings, &r.target))
            .map(|r| ManagedRoute {
                target: r.target,
                via: r.via,
                metric: r.metric,
            })
            .collect();
        for gone in self.managed_routes.difference(&routes) {
            tracing::debug!(nwid = %nwid, "managed route withdrawn: {}", gone.target);
        }
        for new in routes.difference(&self.managed_routes) {
            tracing::debug!(nwid = %nwid, "managed route tracked: {}", new.target);
        }
        self.managed_routes = routes;
    }
}

fn emit_addr_event(events: &EventSink, added: bool, nwid: NetworkId, ip: &InetCidr) {
    let code = match (added, ip.family()) {
        (true, IpFamily::V4) => EventCode::AddrAddedIp4,
        (true, IpFamily::V6) => EventCode::AddrAddedIp6,
        (false, IpFamily::V4) => EventCode::AddrRemovedIp4,
        (false, IpFamily::V6) => EventCode::AddrRemovedIp6,
    };
    events.send(
        code,
        EventPayload::Addr {
            nwid,
            addr: ip.addr(),
        },
    );
}

/// Whether local policy admits a controller-assigned address or route
/// target.
pub fn check_if_managed_is_allowed(settings: &NetworkSettings, target: &InetCidr) -> bool {
    if !settings.allow_managed {
        return false;
    }

    if !settings.allow_managed_whitelist.is_empty() {
        let covered = settings.allow_managed_whitelist.iter().any(|entry| {
            entry.contains(&target.addr()) && entry.prefix() <= target.prefix()
        });
        if !covered {
            return false;
        }
    }

    if target.is_default_route() {
        return settings.allow_default;
    }
    match target.scope() {
        IpScope::None | IpScope::Multicast | IpScope::Loopback | IpScope::LinkLocal => false,
        IpScope::Global => settings.allow_global,
        IpScope::Shared | IpScope::Private => true,
    }
}

/// Shared context for applying config callbacks against the table.
pub(crate) struct ConfigOpCtx<'a> {
    pub taps: &'a dyn TapFactory,
    pub frame_tx: &'a mpsc::Sender<TapFrame>,
    pub store: &'a StateStore,
    pub events: &'a EventSink,
    pub initial_settings: &'a HashMap<NetworkId, NetworkSettings>,
}

/// Apply one network lifecycle operation. Returns 0 on success, -999 when
/// an UP/UPDATE arrives for an entry whose tap could not be created.
pub(crate) fn apply_config_op(
    nets: &mut NetworkTable,
    ctx: &ConfigOpCtx<'_>,
    nwid: NetworkId,
    op: ConfigOp,
    config: Option<&VirtualNetworkConfig>,
) -> i32 {
    match op {
        ConfigOp::Up | ConfigOp::Update => {
            let Some(config) = config else {
                return -1;
            };

            let state = nets.entry(nwid).or_insert_with(|| {
                let settings = ctx.initial_settings.get(&nwid).cloned().unwrap_or_default();
                NetworkState::new(config.clone(), settings)
            });

            if op == ConfigOp::Up && state.tap.is_none() {
                let params = TapParams {
                    nwid,
                    mac: config.mac,
                    mtu: config.mtu,
                    friendly_name: format!("Overlay [{nwid}]"),
                };
                let tx = ctx.frame_tx.clone();
                let sink: lattice_core::FrameSink = Box::new(move |frame| {
                    // Full queue means the control loop is saturated; the
                    // stack will retransmit.
                    let _ = tx.try_send(frame);
                });
                match ctx.taps.open(params, sink) {
                    Ok(tap) => state.tap = Some(tap),
                    Err(e) => tracing::error!(nwid = %nwid, "tap creation failed: {e}"),
                }
            }

            state.config = config.clone();
            if state.tap.is_none() {
                nets.remove(&nwid);
                return -999;
            }

            if op == ConfigOp::Update {
                ctx.events.send(
                    EventCode::NetworkUpdate,
                    EventPayload::Network(Box::new(config.clone())),
                );
            }
            state.sync_managed(ctx.events);
            if let Some(tap) = state.tap.as_mut() {
                tap.set_mtu(config.mtu);
            }
            0
        }

        ConfigOp::Down | ConfigOp::Destroy => {
            // Dropping the state drops the tap with it.
            nets.remove(&nwid);
            if op == ConfigOp::Destroy {
                ctx.store.delete(StateObjectKind::NetworkConfig(nwid));
            }
            0
        }
    }
}

/// Emit edge-triggered network status events. Called each loop tick once
/// the engine is online and the IP stack is up.
pub(crate) fn emit_status_events(
    nets: &mut NetworkTable,
    stack: &dyn NetStack,
    events: &EventSink,
) {
    for state in nets.values_mut() {
        let Some(tap) = state.tap.as_ref() else {
            continue;
        };
        let status = state.config.status;
        if state.last_observed_status == Some(status) {
            continue;
        }
        let info = EventPayload::Network(Box::new(state.config.clone()));
        match status {
            VirtualNetworkStatus::NotFound => {
                events.send(EventCode::NetworkNotFound, info);
            }
            VirtualNetworkStatus::ClientTooOld => {
                events.send(EventCode::NetworkClientTooOld, info);
            }
            VirtualNetworkStatus::RequestingConfiguration => {
                events.send(EventCode::NetworkReqConfig, info);
            }
            VirtualNetworkStatus::AccessDenied => {
                events.send(EventCode::NetworkAccessDenied, info);
            }
            VirtualNetworkStatus::Ok => {
                events.send(EventCode::NetworkOk, info);
                let device = tap.device_name();
                if tap.has_ipv4_addr() && stack.is_netif_up(&device, IpFamily::V4) {
                    events.send(
                        EventCode::NetworkReadyIp4,
                        EventPayload::Network(Box::new(state.config.clone())),
                    );
                }
                if tap.has_ipv6_addr() && stack.is_netif_up(&device, IpFamily::V6) {
                    events.send(
                        EventCode::NetworkReadyIp6,
                        EventPayload::Network(Box::new(state.config.clone())),
                    );
                }
            }
            VirtualNetworkStatus::PortError => {}
        }
        state.last_observed_status = Some(status);
    }
}

/// Snapshot of every address installed on any owned tap. Used by the
/// path checker and the interface filter for anti-recursion.
pub(crate) fn all_tap_ips(nets: &NetworkTable) -> Vec<InetCidr> {
    let mut out = Vec::new();
    for state in nets.values() {
        if let Some(tap) = state.tap.as_ref() {
            out.extend(tap.ips());
        }
    }
    out
}
