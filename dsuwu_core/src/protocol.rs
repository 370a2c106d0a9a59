//! Request classification, per-request handlers, port-info diffing and
//! input fan-out.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use dsuwu_device::{Battery, ConnectionType, MacAddress, SlotState};

use crate::codec::{self, MAGIC_CLIENT, MAGIC_SERVER, MSG_BUTTON, MSG_LIST_PORTS, MSG_MOTOR_COMMAND, MSG_MOTOR_REQUEST, MSG_VERSION};
use crate::registry::{ClientRegistry, RegistrationMode, PROTOCOL_VERSION_MAX};
use crate::sendqueue::SendQueue;
use crate::store::{self, SlotStore, DSU_TIMEOUT};

const T: &str = "dsuwu_core::protocol";

/// `slot_state` / `device_model` bytes used throughout the port-info and
/// button-response payloads: always 2 ("connected" / "full gyro").
const SLOT_STATE_CONNECTED: u8 = 2;
const DEVICE_MODEL_FULL_GYRO: u8 = 2;

fn port_info_payload(slot: u8, mac: MacAddress, connection_type: ConnectionType, battery: Battery) -> [u8; 11] {
    let mut out = [0u8; 11];
    out[0] = slot;
    out[1] = SLOT_STATE_CONNECTED;
    out[2] = DEVICE_MODEL_FULL_GYRO;
    out[3] = connection_type.as_i8() as u8;
    out[4..10].copy_from_slice(&mac.0);
    out[10] = battery.0;
    out
}

fn port_disconnect_payload(slot: u8) -> [u8; 11] {
    let mut out = [0u8; 11];
    out[0] = slot;
    out
}

fn button_response_payload(slot: u8, mac: MacAddress, state: &SlotState) -> Vec<u8> {
    let mut out = Vec::with_capacity(80);
    out.extend_from_slice(&port_info_payload(slot, mac, state.connection_type, state.battery));
    out.push(u8::from(state.connected));
    out.extend_from_slice(&state.packet_num.to_le_bytes());

    out.push(state.buttons1);
    out.push(state.buttons2);
    out.push(u8::from(state.home));
    out.push(u8::from(state.touch_button));

    out.push(state.l_stick.0);
    out.push(255 - state.l_stick.1);
    out.push(state.r_stick.0);
    out.push(255 - state.r_stick.1);

    // dpad ordering on the wire: left, down, right, up.
    let [up, right, down, left] = state.dpad_analog;
    out.push(left);
    out.push(down);
    out.push(right);
    out.push(up);

    out.extend_from_slice(&state.face_analog);

    out.push(state.analog_r1);
    out.push(state.analog_l1);
    out.push(state.analog_r2);
    out.push(state.analog_l2);

    for touch in [state.touch1, state.touch2] {
        let t = touch.unwrap_or_default();
        out.push(u8::from(t.active));
        out.push(t.id);
        out.extend_from_slice(&t.x.to_le_bytes());
        out.extend_from_slice(&t.y.to_le_bytes());
    }

    out.extend_from_slice(&state.motion_timestamp_us.to_le_bytes());
    out.extend_from_slice(&state.accel.0.to_le_bytes());
    out.extend_from_slice(&state.accel.1.to_le_bytes());
    out.extend_from_slice(&(-state.accel.2).to_le_bytes());
    out.extend_from_slice(&state.gyro.0.to_le_bytes());
    out.extend_from_slice(&state.gyro.1.to_le_bytes());
    out.extend_from_slice(&state.gyro.2.to_le_bytes());

    out
}

fn motor_response_payload(slot: u8, mac: MacAddress, connection_type: ConnectionType, battery: Battery, motor_count: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&port_info_payload(slot, mac, connection_type, battery));
    out.push(motor_count);
    out
}

fn motor_response_disconnected_payload(slot: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&port_disconnect_payload(slot));
    out.push(0);
    out
}

/// Soft cap the wire format imposes: `slot` is a `u8`, so no producer or
/// configuration may address slot 256 or above.
pub const SOFT_SLOT_LIMIT: u32 = 256;

/// Request classification + per-request handlers + reconciliation.
///
/// Owned exclusively by the dispatcher thread; the `known_slots` and
/// `prev_connection_type` fields it tracks are server-global state, distinct
/// from a given client's own per-client `known_slots` in [`ClientInfo`].
pub struct ProtocolEngine {
    server_id: u32,
    stick_deadzone: u8,
    known_slots: HashSet<u8>,
    prev_connection_type: HashMap<u8, ConnectionType>,
    idle_slots: HashSet<u8>,
    warned_slot_limit: bool,
}

impl ProtocolEngine {
    pub fn new(server_id: u32, stick_deadzone: u8, idle_slots: HashSet<u8>) -> Self {
        ProtocolEngine {
            server_id,
            stick_deadzone,
            known_slots: HashSet::new(),
            prev_connection_type: HashMap::new(),
            idle_slots,
            warned_slot_limit: false,
        }
    }

    fn send(&self, send_queue: &SendQueue, addr: SocketAddr, protocol_version: u16, msg_type: u32, payload: &[u8], desc: &str) {
        let packet = codec::encode(MAGIC_SERVER, protocol_version, self.server_id, msg_type, payload);
        send_queue.enqueue(packet, addr, desc.to_owned());
    }

    /// Parses and dispatches one inbound datagram. Malformed or unknown
    /// packets are silently dropped.
    pub fn handle_packet(&mut self, addr: SocketAddr, buf: &[u8], registry: &ClientRegistry, store: &SlotStore, send_queue: &SendQueue, now: Instant) {
        let Some(parsed) = codec::validate_and_parse(buf, MAGIC_CLIENT) else {
            return;
        };

        match parsed.msg_type {
            MSG_VERSION => self.handle_version(addr, parsed.protocol_version, registry, send_queue, now),
            MSG_LIST_PORTS => self.handle_list_ports(addr, parsed.protocol_version, &parsed.payload, registry, store, send_queue, now),
            MSG_BUTTON => self.handle_button_request(addr, &parsed.payload, registry, now),
            MSG_MOTOR_REQUEST => self.handle_motor_request(addr, parsed.protocol_version, &parsed.payload, registry, store, send_queue, now),
            MSG_MOTOR_COMMAND => self.handle_motor_command(addr, &parsed.payload, registry, store, now),
            other => {
                log::trace!(target: T, "ignoring unknown msg_type 0x{other:08X} from {addr}");
            }
        }
    }

    fn handle_version(&self, addr: SocketAddr, protocol_version: u16, registry: &ClientRegistry, send_queue: &SendQueue, now: Instant) {
        registry.touch(addr, protocol_version, now);
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&PROTOCOL_VERSION_MAX.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        self.send(send_queue, addr, protocol_version, MSG_VERSION, &payload, "version response");
    }

    fn handle_list_ports(
        &self,
        addr: SocketAddr,
        protocol_version: u16,
        payload: &[u8],
        registry: &ClientRegistry,
        store: &SlotStore,
        send_queue: &SendQueue,
        now: Instant,
    ) {
        if payload.len() < 4 {
            return;
        }
        registry.touch(addr, protocol_version, now);

        let count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        let slots = &payload[4..payload.len().min(4 + count)];

        for &slot in slots {
            if self.known_slots.contains(&slot) {
                let snap = store.snapshot(slot);
                let info = port_info_payload(slot, snap.mac, snap.state.connection_type, snap.state.battery);
                self.send(send_queue, addr, protocol_version, MSG_LIST_PORTS, &info, "port info");
            } else {
                let info = port_disconnect_payload(slot);
                self.send(send_queue, addr, protocol_version, MSG_LIST_PORTS, &info, "port disconnect");
            }
        }
    }

    fn handle_button_request(&self, addr: SocketAddr, payload: &[u8], registry: &ClientRegistry, now: Instant) {
        if payload.len() < 8 {
            return;
        }
        registry.touch(addr, registry.negotiated_protocol_version(addr).unwrap_or(PROTOCOL_VERSION_MAX), now);

        let reg_flags = payload[0];
        let slot = payload[1];
        let mut mac_bytes = [0u8; 6];
        mac_bytes.copy_from_slice(&payload[2..8]);
        let mac = MacAddress(mac_bytes);

        for mode in RegistrationMode::from_flags(reg_flags, slot, mac) {
            registry.register(addr, mode, now, |slot| self.known_slots.contains(&slot));
        }
    }

    fn handle_motor_request(
        &self,
        addr: SocketAddr,
        protocol_version: u16,
        payload: &[u8],
        registry: &ClientRegistry,
        store: &SlotStore,
        send_queue: &SendQueue,
        now: Instant,
    ) {
        if payload.is_empty() {
            return;
        }
        registry.touch(addr, protocol_version, now);

        let slot = payload[0];

        // Slots no producer ever created are never in `known_slots`; report
        // them disconnected without materializing store state for them.
        if !self.known_slots.contains(&slot) {
            let resp = motor_response_disconnected_payload(slot);
            self.send(send_queue, addr, protocol_version, MSG_MOTOR_REQUEST, &resp, "motor response (disconnected)");
            return;
        }

        let snap = store.snapshot(slot);
        let disconnected = snap.state.connection_type == ConnectionType::Disconnected || !snap.state.connected;

        if disconnected {
            let resp = motor_response_disconnected_payload(slot);
            self.send(send_queue, addr, protocol_version, MSG_MOTOR_REQUEST, &resp, "motor response (disconnected)");
        } else {
            let resp = motor_response_payload(slot, snap.mac, snap.state.connection_type, snap.state.battery, snap.state.motor_count);
            self.send(send_queue, addr, protocol_version, MSG_MOTOR_REQUEST, &resp, "motor response");
        }
    }

    fn handle_motor_command(&self, addr: SocketAddr, payload: &[u8], registry: &ClientRegistry, store: &SlotStore, now: Instant) {
        if payload.len() < 10 {
            return;
        }
        registry.touch(addr, registry.negotiated_protocol_version(addr).unwrap_or(PROTOCOL_VERSION_MAX), now);

        let slot = payload[0];
        if !self.known_slots.contains(&slot) {
            return;
        }

        let motor_id = payload[8] as usize;
        let intensity = payload[9];

        store.with_slot_mut(slot, |state, _mac| {
            if motor_id < state.motor_count as usize && motor_id < state.motors.len() {
                state.motors[motor_id] = intensity;
                state.motor_timestamps[motor_id] = Some(now);
            }
        });
    }

    /// Periodic reconciliation: garbage-collects clients, diffs port
    /// visibility, and fans out input packets to every eligible subscriber,
    /// then advances `packet_num` and zeroes stale motors.
    pub fn reconcile(&mut self, registry: &ClientRegistry, store: &SlotStore, send_queue: &SendQueue, now: Instant) {
        registry.garbage_collect(now, DSU_TIMEOUT);

        for slot in store.known_slot_ids() {
            let (mac, state, prev_connected) = store.with_slot_mut(slot, |state, mac| {
                let prev_connected = state.connected;
                if self.idle_slots.contains(&slot) {
                    state.idle = true;
                }
                store::update_connection(state, self.stick_deadzone);
                (*mac, state.clone(), prev_connected)
            });

            self.diff_and_dispatch(slot, mac, &state, prev_connected, registry, send_queue, now);
        }

        for slot in store.known_slot_ids() {
            store.with_slot_mut(slot, |state, _mac| {
                state.packet_num = state.packet_num.wrapping_add(1);
                state.zero_stale_motors(now, DSU_TIMEOUT);
            });
        }

        store.clear_dirty();
    }

    fn diff_and_dispatch(
        &mut self,
        slot: u8,
        mac: MacAddress,
        state: &SlotState,
        prev_connected: bool,
        registry: &ClientRegistry,
        send_queue: &SendQueue,
        now: Instant,
    ) {
        if slot as u32 >= SOFT_SLOT_LIMIT {
            if !self.warned_slot_limit {
                log::warn!(target: T, "slots above 255 cannot be reported to the client");
                self.warned_slot_limit = true;
            }
            return;
        }

        let prev_type = self.prev_connection_type.get(&slot).copied().unwrap_or(state.connection_type);

        if state.connection_type != prev_type {
            self.prev_connection_type.insert(slot, state.connection_type);

            if state.connection_type == ConnectionType::Disconnected {
                self.known_slots.remove(&slot);
                for addr in registry.addresses() {
                    registry.unmark_slot_known(addr, slot);
                    let protocol_version = registry.negotiated_protocol_version(addr).unwrap_or(PROTOCOL_VERSION_MAX);
                    let payload = port_disconnect_payload(slot);
                    self.send(send_queue, addr, protocol_version, MSG_LIST_PORTS, &payload, "port disconnect");
                }
            } else {
                self.known_slots.insert(slot);
                for addr in registry.addresses() {
                    registry.mark_slot_known(addr, slot);
                    let protocol_version = registry.negotiated_protocol_version(addr).unwrap_or(PROTOCOL_VERSION_MAX);
                    let payload = port_info_payload(slot, mac, state.connection_type, state.battery);
                    self.send(send_queue, addr, protocol_version, MSG_LIST_PORTS, &payload, "port info");
                }
            }
        }

        if state.connection_type != ConnectionType::Disconnected
            && !prev_connected
            && state.connected
            && !self.known_slots.contains(&slot)
        {
            self.known_slots.insert(slot);
            for addr in registry.addresses() {
                registry.mark_slot_known(addr, slot);
                let protocol_version = registry.negotiated_protocol_version(addr).unwrap_or(PROTOCOL_VERSION_MAX);
                let payload = port_info_payload(slot, mac, state.connection_type, state.battery);
                self.send(send_queue, addr, protocol_version, MSG_LIST_PORTS, &payload, "port info");
            }
        }

        if state.connection_type != ConnectionType::Disconnected && self.known_slots.contains(&slot) {
            for addr in registry.addresses() {
                if registry.subscribed(addr, slot, mac, now, DSU_TIMEOUT) {
                    let protocol_version = registry.negotiated_protocol_version(addr).unwrap_or(PROTOCOL_VERSION_MAX);
                    let payload = button_response_payload(slot, mac, state);
                    self.send(send_queue, addr, protocol_version, MSG_BUTTON, &payload, "button response");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn bit_exact_stick_and_dpad_layout() {
        let mut state = SlotState::default();
        state.l_stick = (200, 60);
        state.dpad_analog = [0, 0, 0, 0];
        let payload = button_response_payload(0, MacAddress::ZERO, &state);
        // header(11) + connected(1) + packet_num(4) = 16, then buttons1,buttons2,home,touch (4) = offset 20
        assert_eq!(payload[20], 200);
        assert_eq!(payload[21], 255 - 60);
    }

    #[test]
    fn disconnect_sentinel_stops_button_responses() {
        let store = SlotStore::new();
        let registry = ClientRegistry::new();
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let send_queue_socket = std::sync::Arc::new(socket);
        let (send_queue, _h) = SendQueue::spawn(send_queue_socket, std::sync::Arc::new(ClientRegistry::new()), 8);

        let now = Instant::now();
        registry.touch(addr(1), PROTOCOL_VERSION_MAX, now);
        registry.register(addr(1), RegistrationMode::All, now, |_| false);

        let mut engine = ProtocolEngine::new(0xAABBCCDD, store::DEFAULT_STICK_DEADZONE, HashSet::new());
        store.with_slot_mut(2, |state, _| state.connection_type = ConnectionType::Bluetooth);
        engine.reconcile(&registry, &store, &send_queue, now);
        assert!(engine.known_slots.contains(&2));

        store::set_connection_type(&store, 2, ConnectionType::Disconnected);
        engine.reconcile(&registry, &store, &send_queue, now);
        assert!(!engine.known_slots.contains(&2));
    }

    #[test]
    fn client_timeout_removes_subscription() {
        let registry = ClientRegistry::new();
        let old = Instant::now() - Duration::from_secs(10);
        registry.touch(addr(5), PROTOCOL_VERSION_MAX, old);
        registry.register(addr(5), RegistrationMode::All, old, |_| false);
        registry.garbage_collect(Instant::now(), DSU_TIMEOUT);
        assert!(registry.is_empty());
    }
}
