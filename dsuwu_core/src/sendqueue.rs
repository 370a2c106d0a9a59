//! Bounded, asynchronous outbound packet queue.
//!
//! Protocol handlers only ever push onto this queue; a single sender thread
//! drains it and calls `sendto`, so handlers never block on the network.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::registry::ClientRegistry;

const T: &str = "dsuwu_core::sendqueue";

struct SendItem {
    packet: Vec<u8>,
    addr: SocketAddr,
    desc: String,
}

/// Producer-side handle; cheaply `Clone`able (wraps a channel `Sender`).
#[derive(Clone)]
pub struct SendQueue {
    tx: Sender<SendItem>,
}

impl SendQueue {
    /// Spawns the single sender thread draining a `capacity`-bounded queue.
    pub fn spawn(
        socket: Arc<UdpSocket>,
        registry: Arc<ClientRegistry>,
        capacity: usize,
    ) -> (SendQueue, JoinHandle<()>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);

        let handle = std::thread::Builder::new()
            .name("dsuwu-sender".into())
            .spawn(move || sender_loop(socket, registry, rx))
            .expect("failed to spawn sender thread");

        (SendQueue { tx }, handle)
    }

    /// Queues `packet` for `addr`. If the queue is full, back-pressure is
    /// resolved by dropping this newest send and logging a warning — the
    /// dispatcher never blocks waiting on the network.
    pub fn enqueue(&self, packet: Vec<u8>, addr: SocketAddr, desc: impl Into<String>) {
        let desc = desc.into();
        match self.tx.try_send(SendItem {
            packet,
            addr,
            desc: desc.clone(),
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!(target: T, "send queue full, dropping {desc} for {addr}");
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!(target: T, "send queue closed, dropping {desc} for {addr}");
            }
        }
    }
}

fn sender_loop(socket: Arc<UdpSocket>, registry: Arc<ClientRegistry>, rx: Receiver<SendItem>) {
    for item in rx {
        if let Err(err) = socket.send_to(&item.packet, item.addr) {
            log::warn!(
                target: T,
                "failed to send {} to {}: {}", item.desc, item.addr, err
            );
            registry.drop_client(item.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as StdUdpSocket;
    use std::time::Duration;

    #[test]
    fn delivers_queued_packet_to_destination() {
        let server = Arc::new(StdUdpSocket::bind("127.0.0.1:0").unwrap());
        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let client_addr = client.local_addr().unwrap();

        let registry = Arc::new(ClientRegistry::new());
        let (queue, _handle) = SendQueue::spawn(server, registry, 8);
        queue.enqueue(vec![1, 2, 3], client_addr, "test packet");

        let mut buf = [0u8; 16];
        let (n, _) = client.recv_from(&mut buf).expect("packet arrives");
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }
}
