//! Outbound wire sends and inbound datagram classification.
//!
//! Inbound datagrams arrive through the binder's read tasks; the control
//! loop hands them to the engine. Outbound sends arrive through the
//! engine's `wire_send` callback and go out through the binder, either on
//! the specific socket the engine names or on every bound socket when it
//! leaves the choice open.

use std::net::SocketAddr;

use lattice_core::{IpScope, scope_of};

use crate::binder::Binder;

/// Minimum datagram length that counts as real overlay traffic when
/// deciding whether we heard from a globally routable address.
pub const MIN_GLOBAL_PAYLOAD: usize = 16;

/// Send a datagram on behalf of the engine. A `local_socket` of -1 or 0
/// (or one that has since been closed) means "any bound socket". Returns
/// 0 on success, -1 otherwise.
pub fn send(binder: &Binder, local_socket: i64, addr: SocketAddr, data: &[u8], ttl: u32) -> i32 {
    let sent = if local_socket > 0 && binder.is_valid(local_socket) {
        binder.send(local_socket, addr, data, ttl)
    } else {
        binder.send_all(addr, data, ttl)
    };
    if sent { 0 } else { -1 }
}

/// Whether a received datagram should refresh the last-global-receive
/// timestamp: globally scoped source and a payload long enough to be a
/// real overlay packet.
pub fn is_global_receive(from: &SocketAddr, len: usize) -> bool {
    len >= MIN_GLOBAL_PAYLOAD && scope_of(&from.ip()) == IpScope::Global
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::LocalConfig;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn global_receive_needs_length_and_scope() {
        let global: SocketAddr = "203.0.113.9:9993".parse().unwrap();
        let private: SocketAddr = "10.0.0.9:9993".parse().unwrap();

        assert!(is_global_receive(&global, 16));
        assert!(is_global_receive(&global, 1000));
        assert!(!is_global_receive(&global, 15));
        assert!(!is_global_receive(&private, 16));
        assert!(!is_global_receive(&"[fe80::1]:9993".parse().unwrap(), 64));
    }

    #[tokio::test]
    async fn send_falls_back_to_all_sockets_for_unspecified_handle() {
        let (tx, _rx) = mpsc::channel(16);
        let binder = Binder::new(tx);
        binder
            .refresh(
                &[],
                &["127.0.0.1:0".parse().unwrap()],
                &LocalConfig::default(),
                &[],
            )
            .await;

        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let target = receiver.local_addr().unwrap();

        for handle in [-1i64, 0, 424242] {
            assert_eq!(send(&binder, handle, target, b"fallback", 0), 0);
            let mut buf = [0u8; 16];
            let (n, _) = receiver.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"fallback");
        }

        binder.close_all();
    }

    #[tokio::test]
    async fn send_with_no_sockets_reports_failure() {
        let (tx, _rx) = mpsc::channel(16);
        let binder = Binder::new(tx);
        assert_eq!(
            send(&binder, 0, "127.0.0.1:9993".parse().unwrap(), b"x", 0),
            -1
        );
    }
}
