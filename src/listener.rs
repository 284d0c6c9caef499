//! One receive thread per bound UDP socket. Grounded on the teacher's
//! `src/v4/worker.rs` blocking `recv_from` loop with exponential backoff
//! on repeated socket errors; generalized to hand every datagram to a
//! `TaskDispatcher` instead of handling it inline, per SPEC_FULL.md §4.6.
//!
//! A listener binds one `interface_address`, never a specific scope —
//! multiple scopes configured with `0.0.0.0` are served by the same
//! listener for free, since `find_scope` resolves the right one per
//! datagram from the registry.

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::dispatch::TaskDispatcher;
use crate::dns::ZoneStore;
use crate::engine::{self, ReplyDestination};
use crate::registry::ScopeRegistry;
use crate::wire::DhcpMessage;

const RECV_BUF_LEN: usize = 576;
const MAX_BACKOFF_MS: u64 = 1000;
const READ_TIMEOUT: Duration = Duration::from_millis(500);

pub struct ListenerHandle {
    pub interface_address: Ipv4Addr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn activate(
    interface_address: Ipv4Addr,
    registry: Arc<ScopeRegistry>,
    dispatcher: Arc<dyn TaskDispatcher>,
    zone_store: Option<Arc<dyn ZoneStore>>,
) -> io::Result<ListenerHandle> {
    let socket = UdpSocket::bind(SocketAddrV4::new(interface_address, 67))?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(READ_TIMEOUT))?;
    let socket = Arc::new(socket);
    let shutdown = Arc::new(AtomicBool::new(false));

    let thread_socket = Arc::clone(&socket);
    let thread_shutdown = Arc::clone(&shutdown);
    let thread = thread::Builder::new()
        .name(format!("dhcp4d-listen-{interface_address}"))
        .spawn(move || receive_loop(thread_socket, interface_address, registry, dispatcher, zone_store, thread_shutdown))
        .map_err(|err| io::Error::new(ErrorKind::Other, err))?;

    Ok(ListenerHandle {
        interface_address,
        shutdown,
        thread: Some(thread),
    })
}

fn receive_loop(
    socket: Arc<UdpSocket>,
    interface_address: Ipv4Addr,
    registry: Arc<ScopeRegistry>,
    dispatcher: Arc<dyn TaskDispatcher>,
    zone_store: Option<Arc<dyn ZoneStore>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut backoff_ms = 10u64;
    let mut buf = [0u8; RECV_BUF_LEN];

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match socket.recv_from(&mut buf) {
            Ok((n, SocketAddr::V4(from))) => {
                backoff_ms = 10;
                if from.port() != 67 && from.port() != 68 {
                    continue;
                }
                let data = buf[..n].to_vec();
                let socket = Arc::clone(&socket);
                let registry = Arc::clone(&registry);
                let zone_store = zone_store.clone();
                dispatcher.submit(Box::new(move || {
                    process_datagram(&data, from, interface_address, &registry, zone_store.as_ref(), &socket);
                }));
            }
            Ok((_, SocketAddr::V6(_))) => continue,
            Err(err) => match err.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut => continue,
                ErrorKind::Interrupted => continue,
                ErrorKind::ConnectionReset => continue,
                ErrorKind::AddrNotAvailable | ErrorKind::NotConnected | ErrorKind::PermissionDenied => {
                    warn!(%err, %interface_address, "fatal socket error; receive thread exiting");
                    return;
                }
                _ => {
                    warn!(%err, %interface_address, backoff_ms, "transient socket error");
                    thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
            },
        }
    }
}

fn process_datagram(
    data: &[u8],
    from: SocketAddrV4,
    interface_address: Ipv4Addr,
    registry: &ScopeRegistry,
    zone_store: Option<&Arc<dyn ZoneStore>>,
    socket: &UdpSocket,
) {
    let request = match DhcpMessage::decode(data) {
        Ok(msg) => msg,
        Err(err) => {
            debug!(%err, %from, "dropping malformed datagram");
            return;
        }
    };

    let Some((reply, destination)) = engine::handle_message(&request, from, interface_address, registry, zone_store)
    else {
        return;
    };

    let dest_addr: SocketAddr = match destination {
        ReplyDestination::Broadcast => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, 68)),
        ReplyDestination::Unicast(addr) => SocketAddr::V4(addr),
    };

    let bytes = reply.encode();
    if let Err(err) = socket.send_to(&bytes, dest_addr) {
        warn!(%err, %dest_addr, "failed to send DHCP reply");
    }
}
