//! The server's single receive loop: pulls datagrams off one `UdpSocket`,
//! hands them to a [`ProtocolEngine`], and drives periodic reconciliation.

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::ProtocolEngine;
use crate::registry::ClientRegistry;
use crate::sendqueue::SendQueue;
use crate::store::SlotStore;

const T: &str = "dsuwu_core::dispatcher";

/// How long `recv_from` blocks between polls; purely a wakeup granularity so
/// the loop can notice `stop` and a dirty store promptly, independent of
/// `update_timeout`.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Runs the receive/reconcile loop on the calling thread until `stop` is set.
///
/// `update_timeout`, when `Some`, reconciles on that fixed cadence in
/// addition to whenever the store is marked dirty; `None` means
/// reconciliation only happens in response to a dirty store.
pub fn run(
    socket: UdpSocket,
    engine: &mut ProtocolEngine,
    registry: Arc<ClientRegistry>,
    store: Arc<SlotStore>,
    send_queue: SendQueue,
    update_timeout: Option<Duration>,
    stop: Arc<AtomicBool>,
) {
    socket
        .set_read_timeout(Some(POLL_INTERVAL))
        .expect("read timeout is a valid duration");

    let mut buf = [0u8; 1024];
    let mut last_reconcile = Instant::now();

    while !stop.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((n, addr)) => {
                engine.handle_packet(addr, &buf[..n], &registry, &store, &send_queue, Instant::now());
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
            Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                log::warn!(target: T, "socket reported a connection reset, clearing client registry");
                registry.clear();
            }
            Err(err) => {
                log::warn!(target: T, "receive error: {err}");
            }
        }

        let due_for_tick = update_timeout.is_some_and(|t| last_reconcile.elapsed() >= t);
        if store.is_dirty() || due_for_tick {
            engine.reconcile(&registry, &store, &send_queue, Instant::now());
            last_reconcile = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ClientRegistry, RegistrationMode};
    use crate::sendqueue::SendQueue;
    use crate::store::{self, DEFAULT_STICK_DEADZONE};
    use dsuwu_device::ConnectionType;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn dirty_store_triggers_a_reconcile_pass() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let client_addr = client.local_addr().unwrap();

        let store = Arc::new(SlotStore::new());
        let registry = Arc::new(ClientRegistry::new());
        registry.touch(client_addr, 1001, Instant::now());
        registry.register(client_addr, RegistrationMode::All, Instant::now(), |_| false);

        let send_socket = Arc::new(socket.try_clone().unwrap());
        let (send_queue, _sender_handle) = SendQueue::spawn(send_socket, registry.clone(), 32);
        let mut engine = ProtocolEngine::new(1, DEFAULT_STICK_DEADZONE, HashSet::new());

        store::set_connection_type(&store, 0, ConnectionType::Usb);

        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let dispatcher_store = store.clone();
        let dispatcher_registry = registry.clone();
        let handle = thread::spawn(move || {
            run(socket, &mut engine, dispatcher_registry, dispatcher_store, send_queue, None, stop_clone);
        });

        let mut buf = [0u8; 256];
        let (n, _) = client.recv_from(&mut buf).expect("port info arrives");
        assert!(n > 0);

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }
}
