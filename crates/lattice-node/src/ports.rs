//! UDP port selection via trial binding.
//!
//! To survive NAT and gateway quirks the service uses up to three local
//! UDP ports:
//!
//! - primary: user-chosen, or hunted at random in [20000, 65500)
//! - secondary: derived from the node's overlay address, for NATs that
//!   misbehave when two devices share an internal port number
//! - mapping: probed separately for uPnP/NAT-PMP, because some gateways
//!   break when an explicitly mapped port is also used for normal NAT-t
//!
//! A port is considered usable only if both a UDP bind and a TCP listen
//! succeed on it, on at least one address family.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, UdpSocket};

use rand::Rng;

use lattice_core::NodeAddr;

/// Inclusive lower bound of the hunted port range.
pub const PORT_RANGE_START: u16 = 20000;

/// Exclusive upper bound of randomly drawn primary ports.
pub const PORT_RANGE_END: u16 = 65500;

const PRIMARY_RANDOM_TRIALS: u32 = 256;
const PROBE_ATTEMPTS: u32 = 1000;

/// Whether `port` can be bound right now.
///
/// Tries a UDP bind followed by a TCP listen on `0.0.0.0:port`, then on
/// `[::]:port`; all sockets are closed immediately. True iff both
/// protocols succeeded on at least one family.
pub fn trial_bind(port: u16) -> bool {
    trial_bind_on(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))
        || trial_bind_on(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port))
}

fn trial_bind_on(addr: SocketAddr) -> bool {
    match UdpSocket::bind(addr) {
        Ok(udp) => {
            drop(udp);
            TcpListener::bind(addr).is_ok()
        }
        Err(_) => false,
    }
}

/// Pick the primary port. A configured port of zero means "hunt": draw
/// random candidates in [20000, 65500) until one binds, up to 256 tries.
/// A nonzero configured port gets exactly one try.
pub fn pick_primary(configured: u16) -> Option<u16> {
    let trials = if configured == 0 { PRIMARY_RANDOM_TRIALS } else { 1 };
    for _ in 0..trials {
        let candidate = if configured == 0 {
            rand::thread_rng().gen_range(PORT_RANGE_START..PORT_RANGE_END)
        } else {
            configured
        };
        if trial_bind(candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Starting point for the secondary port: the node's overlay address
/// folded into the hunted range.
pub fn derive_secondary(addr: NodeAddr) -> u16 {
    PORT_RANGE_START + (addr.as_u64() % 45500) as u16
}

/// Probe upward from `start` (wrapping to 20000 past 65535) until a port
/// binds. Returns 0 after 1000 failed attempts.
pub fn probe_from(start: u16) -> u16 {
    let mut port = start;
    for _ in 0..PROBE_ATTEMPTS {
        port = if port == u16::MAX { PORT_RANGE_START } else { port + 1 };
        if trial_bind(port) {
            return port;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trial_bind_succeeds_on_free_port() {
        // Find a port the OS considers free, release it, and trial it.
        let probe = UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        assert!(trial_bind(port));
    }

    #[test]
    fn trial_bind_fails_when_tcp_side_is_held() {
        // Hold TCP listeners on both families so only the UDP half can
        // succeed.
        let l4 = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = l4.local_addr().unwrap().port();
        let _l6 = TcpListener::bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port)).ok();
        assert!(!trial_bind(port));
    }

    #[test]
    fn pick_primary_honors_configured_port() {
        let probe = UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        assert_eq!(pick_primary(port), Some(port));
    }

    #[test]
    fn pick_primary_random_lands_in_range() {
        let port = pick_primary(0).expect("some port in the range should bind");
        assert!((PORT_RANGE_START..PORT_RANGE_END).contains(&port));
    }

    #[test]
    fn derive_secondary_is_in_range() {
        for raw in [0u64, 1, 45499, 45500, 0xff_ffff_ffff] {
            let port = derive_secondary(NodeAddr::new(raw));
            assert!((PORT_RANGE_START..PORT_RANGE_END).contains(&port));
        }
    }

    #[test]
    fn derive_secondary_is_deterministic() {
        let a = NodeAddr::new(0xa1b2c3d4e5);
        assert_eq!(derive_secondary(a), derive_secondary(a));
    }

    #[test]
    fn probe_from_returns_a_bindable_port() {
        let port = probe_from(PORT_RANGE_START);
        assert_ne!(port, 0);
        assert!(trial_bind(port));
    }

    #[test]
    fn probe_wraps_at_port_space_end() {
        // Starting at the top of the port space must wrap into the hunted
        // range rather than overflow.
        let port = probe_from(u16::MAX);
        assert!(port == 0 || port >= PORT_RANGE_START);
    }
}
