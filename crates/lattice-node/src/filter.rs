//! Eligibility of local interface addresses for outbound binding.
//!
//! The binder asks this filter about every (interface name, address) pair
//! it discovers. Rejections keep the service off loopbacks, off other
//! tunnel software, off operator-blacklisted ranges, and off its own taps
//! (which would route overlay traffic over the overlay).

use std::net::IpAddr;

use lattice_core::{InetCidr, IpFamily};

use crate::paths::LocalConfig;

/// Interface name prefixes that are never eligible.
#[cfg(target_os = "macos")]
const PLATFORM_PREFIX_BLACKLIST: &[&str] = &["lo", "zt", "tun", "tap", "feth", "utun"];

#[cfg(not(target_os = "macos"))]
const PLATFORM_PREFIX_BLACKLIST: &[&str] = &["lo", "zt", "tun", "tap"];

/// Whether the binder may bind to `addr` on the interface named `name`.
///
/// `tap_ips` is a snapshot of every address currently installed on an
/// owned tap.
pub fn should_bind_interface(
    name: &str,
    addr: &IpAddr,
    local: &LocalConfig,
    tap_ips: &[InetCidr],
) -> bool {
    if PLATFORM_PREFIX_BLACKLIST
        .iter()
        .any(|p| name.starts_with(p))
    {
        return false;
    }

    if local
        .interface_prefix_blacklist
        .iter()
        .any(|p| name.starts_with(p.as_str()))
    {
        return false;
    }

    if local
        .global_blacklist(IpFamily::of(addr))
        .iter()
        .any(|cidr| cidr.contains(addr))
    {
        return false;
    }

    if tap_ips.iter().any(|cidr| cidr.same_ip(addr)) {
        return false;
    }

    true
}
