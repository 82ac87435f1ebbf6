//! Physical path policy: operator hints and blacklists.
//!
//! The engine asks two questions through its host callbacks: "may I use
//! this (peer, local, remote) path?" and "do you have a preferred remote
//! address for this peer?". Both are answered from the operator's local
//! configuration plus the current set of tap-held addresses.

use std::collections::HashMap;
use std::net::SocketAddr;

use lattice_core::{InetCidr, IpFamily, NodeAddr};

/// Memoized local configuration: per-peer hints and blacklists plus the
/// family-wide blacklists and interface binding exclusions.
#[derive(Debug, Default, Clone)]
pub struct LocalConfig {
    pub v4_hints: HashMap<NodeAddr, Vec<SocketAddr>>,
    pub v6_hints: HashMap<NodeAddr, Vec<SocketAddr>>,
    pub v4_blacklists: HashMap<NodeAddr, Vec<InetCidr>>,
    pub v6_blacklists: HashMap<NodeAddr, Vec<InetCidr>>,
    pub global_v4_blacklist: Vec<InetCidr>,
    pub global_v6_blacklist: Vec<InetCidr>,
    pub interface_prefix_blacklist: Vec<String>,
    pub allow_management_from: Vec<InetCidr>,
}

impl LocalConfig {
    pub fn global_blacklist(&self, family: IpFamily) -> &[InetCidr] {
        match family {
            IpFamily::V4 => &self.global_v4_blacklist,
            IpFamily::V6 => &self.global_v6_blacklist,
        }
    }

    fn peer_blacklist(&self, family: IpFamily, peer: NodeAddr) -> Option<&Vec<InetCidr>> {
        match family {
            IpFamily::V4 => self.v4_blacklists.get(&peer),
            IpFamily::V6 => self.v6_blacklists.get(&peer),
        }
    }

    fn hints(&self, family: IpFamily, peer: NodeAddr) -> Option<&Vec<SocketAddr>> {
        match family {
            IpFamily::V4 => self.v4_hints.get(&peer),
            IpFamily::V6 => self.v6_hints.get(&peer),
        }
    }
}

/// Whether a remote path may be used to reach `peer`.
///
/// Rejects remotes that fall inside any address installed on an owned tap
/// (overlay-over-overlay recursion), then remotes blacklisted for this
/// peer, then remotes in the family-wide blacklist.
pub fn path_check(
    local: &LocalConfig,
    tap_ips: &[InetCidr],
    peer: NodeAddr,
    remote: SocketAddr,
) -> bool {
    let remote_ip = remote.ip();

    if tap_ips.iter().any(|cidr| cidr.contains(&remote_ip)) {
        return false;
    }

    let family = IpFamily::of(&remote_ip);
    if let Some(list) = local.peer_blacklist(family, peer)
        && list.iter().any(|cidr| cidr.contains(&remote_ip))
    {
        return false;
    }
    if local
        .global_blacklist(family)
        .iter()
        .any(|cidr| cidr.contains(&remote_ip))
    {
        return false;
    }

    true
}

/// An operator-configured hint address for `peer`, or `None`.
///
/// With no family restriction the table is chosen by a coin flip from the
/// engine's PRNG; within a table the entry is chosen uniformly with the
/// same PRNG.
pub fn path_lookup(
    local: &LocalConfig,
    peer: NodeAddr,
    family: Option<IpFamily>,
    prng: &mut dyn FnMut() -> u64,
) -> Option<SocketAddr> {
    let family = family.unwrap_or_else(|| {
        if prng() & 1 == 0 {
            IpFamily::V4
        } else {
            IpFamily::V6
        }
    });
    let hints = local.hints(family, peer)?;
    if hints.is_empty() {
        return None;
    }
    let idx = (prng() % hints.len() as u64) as usize;
    Some(hints[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> InetCidr {
        s.parse().unwrap()
    }

    fn peer() -> NodeAddr {
        NodeAddr::new(0xa1b2c3d4e5)
    }

    #[test]
    fn path_check_accepts_by_default() {
        let local = LocalConfig::default();
        assert!(path_check(
            &local,
            &[],
            peer(),
            "203.0.113.9:9993".parse().unwrap()
        ));
    }

    #[test]
    fn path_check_rejects_tap_held_prefixes() {
        let local = LocalConfig::default();
        let taps = vec![cidr("10.147.20.5/24")];
        assert!(!path_check(
            &local,
            &taps,
            peer(),
            "10.147.20.7:9993".parse().unwrap()
        ));
        assert!(path_check(
            &local,
            &taps,
            peer(),
            "10.148.0.1:9993".parse().unwrap()
        ));
    }

    #[test]
    fn path_check_rejects_per_peer_blacklist_for_that_peer_only() {
        let mut local = LocalConfig::default();
        local
            .v4_blacklists
            .insert(peer(), vec![cidr("198.51.100.0/24")]);

        let remote: SocketAddr = "198.51.100.7:9993".parse().unwrap();
        assert!(!path_check(&local, &[], peer(), remote));
        assert!(path_check(&local, &[], NodeAddr::new(0x1), remote));
    }

    #[test]
    fn path_check_rejects_global_blacklist_for_matching_family() {
        let mut local = LocalConfig::default();
        local.global_v4_blacklist.push(cidr("192.0.2.0/24"));

        assert!(!path_check(
            &local,
            &[],
            peer(),
            "192.0.2.55:9993".parse().unwrap()
        ));
        // The v6 side of the same peer is unaffected.
        assert!(path_check(
            &local,
            &[],
            peer(),
            "[2001:db8::1]:9993".parse().unwrap()
        ));
    }

    #[test]
    fn path_lookup_restricted_family_hits_that_table() {
        let mut local = LocalConfig::default();
        let hint: SocketAddr = "203.0.113.1:9993".parse().unwrap();
        local.v4_hints.insert(peer(), vec![hint]);

        let mut prng = || 0u64;
        assert_eq!(
            path_lookup(&local, peer(), Some(IpFamily::V4), &mut prng),
            Some(hint)
        );
        assert_eq!(path_lookup(&local, peer(), Some(IpFamily::V6), &mut prng), None);
    }

    #[test]
    fn path_lookup_unrestricted_flips_a_coin() {
        let mut local = LocalConfig::default();
        let v4: SocketAddr = "203.0.113.1:9993".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:9993".parse().unwrap();
        local.v4_hints.insert(peer(), vec![v4]);
        local.v6_hints.insert(peer(), vec![v6]);

        let mut even = || 0u64;
        assert_eq!(path_lookup(&local, peer(), None, &mut even), Some(v4));
        let mut odd = || 1u64;
        assert_eq!(path_lookup(&local, peer(), None, &mut odd), Some(v6));
    }

    #[test]
    fn path_lookup_empty_tables_return_none() {
        let local = LocalConfig::default();
        let mut prng = || 7u64;
        assert_eq!(path_lookup(&local, peer(), None, &mut prng), None);
        assert_eq!(path_lookup(&local, peer(), Some(IpFamily::V4), &mut prng), None);
    }

    #[test]
    fn path_lookup_selects_uniformly_by_prng() {
        let mut local = LocalConfig::default();
        let a: SocketAddr = "203.0.113.1:9993".parse().unwrap();
        let b: SocketAddr = "203.0.113.2:9993".parse().unwrap();
        local.v4_hints.insert(peer(), vec![a, b]);

        let mut pick_second = || 1u64;
        assert_eq!(
            path_lookup(&local, peer(), Some(IpFamily::V4), &mut pick_second),
            Some(b)
        );
    }
}
