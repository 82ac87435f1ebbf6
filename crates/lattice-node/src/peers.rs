//! Edge-triggered peer connectivity events.
//!
//! Each tick the control loop snapshots the engine's peer table and
//! compares every peer's direct-path count against the last value seen.
//! The rules below are evaluated first-match so that exactly one event is
//! emitted per peer per tick; a peer whose count is unchanged emits
//! nothing.

use std::collections::HashMap;

use lattice_core::{NodeAddr, Peer};

use crate::events::{EventCode, EventPayload, EventSink};

/// Compare a peer snapshot against the cache, emit transition events, and
/// update the cache with the observed counts.
pub fn detect_peer_deltas(cache: &mut HashMap<NodeAddr, u32>, peers: &[Peer], events: &EventSink) {
    for peer in peers {
        let count = peer.direct_path_count();
        let code = match cache.get(&peer.address) {
            None if count > 0 => Some(EventCode::PeerDirect),
            None => Some(EventCode::PeerRelay),
            Some(&prev) if prev < count => Some(EventCode::PeerPathDiscovered),
            Some(&prev) if prev > count => Some(EventCode::PeerPathDead),
            Some(&prev) if prev == 0 && count > 0 => Some(EventCode::PeerDirect),
            Some(&prev) if prev > 0 && count == 0 => Some(EventCode::PeerRelay),
            Some(_) => None,
        };
        if let Some(code) = code {
            events.send(code, EventPayload::Peer(Box::new(peer.clone())));
        }
        cache.insert(peer.address, count);
    }
}
