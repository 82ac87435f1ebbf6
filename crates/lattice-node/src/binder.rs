//! The set of bound UDP endpoints.
//!
//! The binder owns one UDP socket per (eligible local address, service
//! port) pair and keeps that set current as interfaces churn. Each socket
//! gets a background read task that bridges datagrams into the control
//! loop over a bounded channel; when the channel is full the datagram is
//! dropped and counted rather than buffered without bound.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lattice_core::{InetCidr, IpScope, scope_of};

use crate::filter::should_bind_interface;
use crate::paths::LocalConfig;

/// Receive buffer size for wire datagrams.
const RECV_BUFFER: usize = 10 * 1024;

/// Default TTL restored after a per-packet TTL send.
const DEFAULT_TTL: u32 = 255;

/// One datagram received from the physical network.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub socket_id: i64,
    pub from: SocketAddr,
    pub data: Vec<u8>,
}

struct BoundSocket {
    id: i64,
    /// The address as requested at bind time; used for set diffing.
    requested: SocketAddr,
    socket: Arc<UdpSocket>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Maintains the set of bound UDP endpoints and their read tasks.
pub struct Binder {
    sockets: Mutex<Vec<BoundSocket>>,
    next_id: AtomicI64,
    inbound_tx: mpsc::Sender<Datagram>,
    dropped: Arc<AtomicU64>,
}

impl Binder {
    pub fn new(inbound_tx: mpsc::Sender<Datagram>) -> Self {
        Self {
            sockets: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            inbound_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reconcile bound sockets with the currently desired endpoint set.
    ///
    /// When `explicit_bind` is non-empty it replaces interface
    /// enumeration entirely; otherwise every eligible local interface
    /// address is bound on every service port.
    pub async fn refresh(
        &self,
        ports: &[u16],
        explicit_bind: &[SocketAddr],
        local: &LocalConfig,
        tap_ips: &[InetCidr],
    ) {
        let mut desired: Vec<SocketAddr> = if explicit_bind.is_empty() {
            let mut out = Vec::new();
            for (name, ip) in enumerate_interface_addresses() {
                if !should_bind_interface(&name, &ip, local, tap_ips) {
                    continue;
                }
                // Link-local v6 would need a scope ID to bind.
                if ip.is_ipv6() && scope_of(&ip) == IpScope::LinkLocal {
                    continue;
                }
                for &port in ports {
                    out.push(SocketAddr::new(ip, port));
                }
            }
            out
        } else {
            explicit_bind.to_vec()
        };
        desired.sort();
        desired.dedup();

        self.close_not_in(&desired);

        // Bind endpoints that are newly desired.
        let current: Vec<SocketAddr> = {
            let sockets = self.sockets.lock().unwrap();
            sockets.iter().map(|s| s.requested).collect()
        };
        for addr in desired {
            if current.contains(&addr) {
                continue;
            }
            match bind_udp(addr).await {
                Ok(socket) => self.adopt(addr, socket),
                Err(e) => debug!("could not bind {addr}: {e}"),
            }
        }
    }

    fn close_not_in(&self, desired: &[SocketAddr]) {
        let removed: Vec<BoundSocket> = {
            let mut sockets = self.sockets.lock().unwrap();
            let mut removed = Vec::new();
            let mut i = 0;
            while i < sockets.len() {
                if desired.contains(&sockets[i].requested) {
                    i += 1;
                } else {
                    removed.push(sockets.swap_remove(i));
                }
            }
            removed
        };
        for entry in removed {
            debug!("closing binding {}", entry.requested);
            let _ = entry.stop_tx.send(true);
            entry.task.abort();
        }
    }

    fn adopt(&self, requested: SocketAddr, socket: UdpSocket) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let socket = Arc::new(socket);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(read_loop(
            id,
            Arc::clone(&socket),
            self.inbound_tx.clone(),
            Arc::clone(&self.dropped),
            stop_rx,
        ));

        info!(
            "bound to {}",
            socket.local_addr().unwrap_or(requested)
        );
        self.sockets.lock().unwrap().push(BoundSocket {
            id,
            requested,
            socket,
            stop_tx,
            task,
        });
    }

    /// Whether `socket_id` refers to a currently bound socket.
    pub fn is_valid(&self, socket_id: i64) -> bool {
        self.sockets
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.id == socket_id)
    }

    /// Send through one specific bound socket. Honors a per-packet TTL
    /// for IPv4 targets.
    pub fn send(&self, socket_id: i64, target: SocketAddr, data: &[u8], ttl: u32) -> bool {
        let socket = {
            let sockets = self.sockets.lock().unwrap();
            match sockets.iter().find(|s| s.id == socket_id) {
                Some(entry) => Arc::clone(&entry.socket),
                None => return false,
            }
        };
        send_on(&socket, target, data, ttl)
    }

    /// Send through every bound socket of the target's family; true if
    /// any send succeeded.
    pub fn send_all(&self, target: SocketAddr, data: &[u8], ttl: u32) -> bool {
        let sockets: Vec<Arc<UdpSocket>> = {
            let guard = self.sockets.lock().unwrap();
            guard
                .iter()
                .filter(|s| s.requested.is_ipv4() == target.is_ipv4())
                .map(|s| Arc::clone(&s.socket))
                .collect()
        };
        let mut sent = false;
        for socket in sockets {
            sent |= send_on(&socket, target, data, ttl);
        }
        sent
    }

    /// Local addresses of every currently bound socket.
    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.sockets
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.socket.local_addr().unwrap_or(s.requested))
            .collect()
    }

    /// Datagrams dropped because the inbound queue was full.
    pub fn dropped_datagrams(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop all read tasks and close every socket.
    pub fn close_all(&self) {
        let removed: Vec<BoundSocket> = self.sockets.lock().unwrap().drain(..).collect();
        for entry in removed {
            let _ = entry.stop_tx.send(true);
            entry.task.abort();
        }
    }
}

fn send_on(socket: &UdpSocket, target: SocketAddr, data: &[u8], ttl: u32) -> bool {
    let retune_ttl = ttl != 0 && ttl != DEFAULT_TTL && target.is_ipv4();
    if retune_ttl && let Err(e) = socket.set_ttl(ttl) {
        debug!("could not set per-packet ttl {ttl}: {e}");
    }
    let result = socket.try_send_to(data, target);
    if retune_ttl && let Err(e) = socket.set_ttl(DEFAULT_TTL) {
        debug!("could not restore default ttl: {e}");
    }
    match result {
        Ok(n) => n == data.len(),
        Err(e) => {
            debug!("udp send to {target} failed: {e}");
            false
        }
    }
}

async fn read_loop(
    socket_id: i64,
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<Datagram>,
    dropped: Arc<AtomicU64>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, from)) => {
                        let datagram = Datagram {
                            socket_id,
                            from,
                            data: buf[..n].to_vec(),
                        };
                        if tx.try_send(datagram).is_err() {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        // UDP receive errors are transient; keep going
                        // unless we're stopping.
                        warn!(id = socket_id, "recv error: {e}");
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            _ = stop_rx.changed() => {
                break;
            }
        }
    }
}

async fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// All (interface name, address) pairs currently configured on the host.
#[cfg(unix)]
fn enumerate_interface_addresses() -> Vec<(String, IpAddr)> {
    let Ok(addrs) = nix::ifaddrs::getifaddrs() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for ifaddr in addrs {
        let Some(sa) = ifaddr.address else { continue };
        if let Some(sin) = sa.as_sockaddr_in() {
            out.push((ifaddr.interface_name.clone(), IpAddr::V4(sin.ip())));
        } else if let Some(sin6) = sa.as_sockaddr_in6() {
            out.push((ifaddr.interface_name.clone(), IpAddr::V6(sin6.ip())));
        }
    }
    out
}

#[cfg(not(unix))]
fn enumerate_interface_addresses() -> Vec<(String, IpAddr)> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn explicit_binder(cap: usize) -> (Binder, mpsc::Receiver<Datagram>, SocketAddr) {
        let (tx, rx) = mpsc::channel(cap);
        let binder = Binder::new(tx);
        binder
            .refresh(
                &[],
                &["127.0.0.1:0".parse().unwrap()],
                &LocalConfig::default(),
                &[],
            )
            .await;
        let addr = binder.bound_addresses()[0];
        (binder, rx, addr)
    }

    #[tokio::test]
    async fn explicit_bind_receives_datagrams() {
        let (binder, mut rx, addr) = explicit_binder(16).await;

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"hello overlay", addr).unwrap();

        let datagram = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel open");
        assert_eq!(datagram.data, b"hello overlay");
        assert!(binder.is_valid(datagram.socket_id));

        binder.close_all();
    }

    #[tokio::test]
    async fn send_through_specific_socket() {
        let (binder, mut rx, addr) = explicit_binder(16).await;

        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        // Learn our socket id by poking ourselves.
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.send_to(b"probe", addr).unwrap();
        let id = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .socket_id;

        assert!(binder.send(id, receiver.local_addr().unwrap(), b"outbound", 0));
        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"outbound");

        binder.close_all();
    }

    #[tokio::test]
    async fn send_with_stale_id_fails() {
        let (binder, _rx, _addr) = explicit_binder(16).await;
        assert!(!binder.send(9999, "127.0.0.1:1234".parse().unwrap(), b"x", 0));
        assert!(!binder.is_valid(9999));
        binder.close_all();
    }

    #[tokio::test]
    async fn send_all_reaches_family_sockets() {
        let (binder, _rx, _addr) = explicit_binder(16).await;

        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        assert!(binder.send_all(receiver.local_addr().unwrap(), b"broadcast", 64));
        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"broadcast");

        binder.close_all();
    }

    #[tokio::test]
    async fn refresh_closes_undesired_bindings() {
        let (binder, _rx, _addr) = explicit_binder(16).await;
        assert_eq!(binder.bound_addresses().len(), 1);

        // With no ports and no explicit binds nothing stays desired.
        binder.refresh(&[], &[], &LocalConfig::default(), &[]).await;
        assert!(binder.bound_addresses().is_empty());
        binder.close_all();
    }

    #[tokio::test]
    async fn full_queue_counts_drops() {
        let (binder, rx, addr) = explicit_binder(1).await;

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..20 {
            sender.send_to(&[i], addr).unwrap();
        }
        // Give the read task time to drain the socket into the size-1
        // queue.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(binder.dropped_datagrams() > 0);

        drop(rx);
        binder.close_all();
    }

    #[tokio::test]
    async fn close_all_invalidates_sockets() {
        let (binder, _rx, _addr) = explicit_binder(16).await;
        let ids: Vec<i64> = binder
            .bound_addresses()
            .iter()
            .enumerate()
            .map(|(i, _)| i as i64 + 1)
            .collect();
        binder.close_all();
        assert!(binder.bound_addresses().is_empty());
        for id in ids {
            assert!(!binder.is_valid(id));
        }
    }
}
