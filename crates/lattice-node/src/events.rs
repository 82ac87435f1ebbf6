//! Event codes and the sink through which state-change records reach the
//! external consumer.
//!
//! Events are delivered FIFO through a single queue. The service thread
//! and engine callbacks both post to the same sink, so consumers observe
//! causally ordered records without further synchronization.

use std::net::IpAddr;

use tokio::sync::mpsc;

use lattice_core::{NetworkId, NodeAddr, Peer, VirtualNetworkConfig};

/// Event codes delivered to the external consumer.
///
/// The wire names returned by [`EventCode::name`] are fixed for API
/// compatibility with existing consumers; do not rename them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCode {
    NodeUp,
    NodeOnline,
    NodeOffline,
    NodeDown,
    NodeNormalTermination,
    NodeUnrecoverableError,
    NodeIdentityCollision,
    NetworkNotFound,
    NetworkClientTooOld,
    NetworkReqConfig,
    NetworkOk,
    NetworkAccessDenied,
    NetworkReadyIp4,
    NetworkReadyIp6,
    NetworkUpdate,
    AddrAddedIp4,
    AddrAddedIp6,
    AddrRemovedIp4,
    AddrRemovedIp6,
    PeerDirect,
    PeerRelay,
    PeerPathDiscovered,
    PeerPathDead,
}

impl EventCode {
    pub fn name(self) -> &'static str {
        match self {
            EventCode::NodeUp => "NODE_UP",
            EventCode::NodeOnline => "NODE_ONLINE",
            EventCode::NodeOffline => "NODE_OFFLINE",
            EventCode::NodeDown => "NODE_DOWN",
            EventCode::NodeNormalTermination => "NODE_NORMAL_TERMINATION",
            EventCode::NodeUnrecoverableError => "NODE_UNRECOVERABLE_ERROR",
            EventCode::NodeIdentityCollision => "NODE_IDENTITY_COLLISION",
            EventCode::NetworkNotFound => "NETWORK_NOT_FOUND",
            EventCode::NetworkClientTooOld => "NETWORK_CLIENT_TOO_OLD",
            EventCode::NetworkReqConfig => "NETWORK_REQ_CONFIG",
            EventCode::NetworkOk => "NETWORK_OK",
            EventCode::NetworkAccessDenied => "NETWORK_ACCESS_DENIED",
            EventCode::NetworkReadyIp4 => "NETWORK_READY_IP4",
            EventCode::NetworkReadyIp6 => "NETWORK_READY_IP6",
            EventCode::NetworkUpdate => "NETWORK_UPDATE",
            EventCode::AddrAddedIp4 => "ADDR_ADDED_IP4",
            EventCode::AddrAddedIp6 => "ADDR_ADDED_IP6",
            EventCode::AddrRemovedIp4 => "ADDR_REMOVED_IP4",
            EventCode::AddrRemovedIp6 => "ADDR_REMOVED_IP6",
            EventCode::PeerDirect => "PEER_DIRECT",
            EventCode::PeerRelay => "PEER_RELAY",
            EventCode::PeerPathDiscovered => "PEER_PATH_DISCOVERED",
            EventCode::PeerPathDead => "PEER_PATH_DEAD",
        }
    }
}

/// Node identity and port information attached to node-level events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub address: NodeAddr,
    pub primary_port: u16,
    pub secondary_port: u16,
    pub mapping_port: u16,
}

/// Payload attached to an event record.
#[derive(Debug, Clone)]
pub enum EventPayload {
    None,
    Node(NodeInfo),
    Network(Box<VirtualNetworkConfig>),
    Addr { nwid: NetworkId, addr: IpAddr },
    Peer(Box<Peer>),
}

/// One state-change record.
#[derive(Debug, Clone)]
pub struct Event {
    pub code: EventCode,
    pub payload: EventPayload,
}

/// Producer handle for the event queue. Cheap to clone; every producer
/// appends to the same FIFO stream.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn send(&self, code: EventCode, payload: EventPayload) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(Event { code, payload });
    }
}

/// Create the event queue, returning the producer and consumer ends.
pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_stable() {
        assert_eq!(EventCode::NodeUp.name(), "NODE_UP");
        assert_eq!(EventCode::NetworkReqConfig.name(), "NETWORK_REQ_CONFIG");
        assert_eq!(EventCode::AddrAddedIp4.name(), "ADDR_ADDED_IP4");
        assert_eq!(EventCode::AddrRemovedIp6.name(), "ADDR_REMOVED_IP6");
        assert_eq!(EventCode::PeerPathDiscovered.name(), "PEER_PATH_DISCOVERED");
        assert_eq!(
            EventCode::NodeNormalTermination.name(),
            "NODE_NORMAL_TERMINATION"
        );
    }

    #[test]
    fn sink_preserves_fifo_order() {
        let (sink, mut rx) = channel();
        sink.send(EventCode::NodeUp, EventPayload::None);
        sink.send(EventCode::NodeOnline, EventPayload::None);
        sink.send(EventCode::NodeOffline, EventPayload::None);

        assert_eq!(rx.try_recv().unwrap().code, EventCode::NodeUp);
        assert_eq!(rx.try_recv().unwrap().code, EventCode::NodeOnline);
        assert_eq!(rx.try_recv().unwrap().code, EventCode::NodeOffline);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_receiver_drop_is_harmless() {
        let (sink, rx) = channel();
        drop(rx);
        sink.send(EventCode::NodeDown, EventPayload::None);
    }
}
