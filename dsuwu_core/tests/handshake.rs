//! End-to-end tests over real loopback UDP sockets: a client speaks the wire
//! protocol against a dispatcher thread exactly as a real DSU client would,
//! while a producer-like caller drives slot state through the public store API.

use std::collections::HashSet;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dsuwu_core::codec::{self, MAGIC_CLIENT, MAGIC_SERVER, MSG_BUTTON, MSG_LIST_PORTS, MSG_VERSION};
use dsuwu_core::{dispatcher, store, ClientRegistry, ProtocolEngine, SendQueue, SlotStore};
use dsuwu_device::ConnectionType;

struct Server {
    client: UdpSocket,
    server_addr: std::net::SocketAddr,
    store: Arc<SlotStore>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Server {
    fn start(server_id: u32) -> Server {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = socket.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let store = Arc::new(SlotStore::new());
        let registry = Arc::new(ClientRegistry::new());
        let send_socket = Arc::new(socket.try_clone().unwrap());
        let (send_queue, _sender_handle) = SendQueue::spawn(send_socket, registry.clone(), 32);
        let mut engine = ProtocolEngine::new(server_id, store::DEFAULT_STICK_DEADZONE, HashSet::new());

        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let dispatcher_store = store.clone();
        let handle = thread::spawn(move || {
            dispatcher::run(socket, &mut engine, registry, dispatcher_store, send_queue, None, stop_clone);
        });

        Server {
            client,
            server_addr,
            store,
            stop,
            handle: Some(handle),
        }
    }

    fn send(&self, msg_type: u32, payload: &[u8]) {
        let packet = codec::encode(MAGIC_CLIENT, 1001, 0, msg_type, payload);
        self.client.send_to(&packet, self.server_addr).unwrap();
    }

    fn recv(&self) -> codec::ParsedPacket {
        let mut buf = [0u8; 1024];
        let (n, _) = self.client.recv_from(&mut buf).expect("server responds");
        codec::validate_and_parse(&buf[..n], MAGIC_SERVER).expect("valid response frame")
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn version_handshake_round_trips_and_negotiates_down() {
    let server = Server::start(0xAABBCCDD);

    server.send(MSG_VERSION, &[]);
    let parsed = server.recv();

    assert_eq!(parsed.msg_type, MSG_VERSION);
    assert_eq!(parsed.protocol_version, 1001);
    assert_eq!(u16::from_le_bytes([parsed.payload[0], parsed.payload[1]]), 1001);
}

#[test]
fn list_ports_reports_disconnected_slots_as_zeroed_payloads() {
    let server = Server::start(1);

    let mut payload = vec![4, 0, 0, 0];
    payload.extend_from_slice(&[0, 1, 2, 3]);
    server.send(MSG_LIST_PORTS, &payload);

    for expected_slot in 0..4u8 {
        let parsed = server.recv();
        assert_eq!(parsed.msg_type, MSG_LIST_PORTS);
        assert_eq!(parsed.payload.len(), 11);
        assert_eq!(parsed.payload[0], expected_slot);
        assert_eq!(parsed.payload[1], 0, "disconnected slot_state must be 0");
    }
}

#[test]
fn subscribed_client_sees_port_info_before_the_first_button_response() {
    let server = Server::start(7);

    // Subscribe to every slot before the slot comes up.
    server.send(MSG_BUTTON, &[0u8, 0, 0, 0, 0, 0, 0, 0]);
    let _registration_has_no_reply = ();

    // A producer thread would do exactly this: write through the shared
    // store and let the store's dirty flag wake the dispatcher.
    store::set_connection_type(&server.store, 0, ConnectionType::Usb);
    server.store.with_slot_mut(0, |state, _mac| state.buttons1 = 0x01);

    let first = server.recv();
    assert_eq!(first.msg_type, MSG_LIST_PORTS, "port info must precede the first button response");
    assert_eq!(first.payload[0], 0);

    let second = server.recv();
    assert_eq!(second.msg_type, MSG_BUTTON);
}

#[test]
fn disconnecting_a_slot_emits_a_zeroed_port_info_and_stops_button_responses() {
    let server = Server::start(3);

    server.send(MSG_BUTTON, &[0u8, 0, 0, 0, 0, 0, 0, 0]);
    store::set_connection_type(&server.store, 2, ConnectionType::Bluetooth);

    let connect = server.recv();
    assert_eq!(connect.msg_type, MSG_LIST_PORTS);
    assert_eq!(connect.payload[0], 2);
    assert_ne!(connect.payload[1], 0);

    let button = server.recv();
    assert_eq!(button.msg_type, MSG_BUTTON);

    store::set_connection_type(&server.store, 2, ConnectionType::Disconnected);

    let disconnect = server.recv();
    assert_eq!(disconnect.msg_type, MSG_LIST_PORTS);
    assert_eq!(disconnect.payload[0], 2);
    assert_eq!(disconnect.payload[1], 0);
}
