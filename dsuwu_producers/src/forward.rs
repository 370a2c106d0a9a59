//! Forwarded DSU producer: acts as a DSU client against a remote server and
//! mirrors one of its slots' button-response packets into a local slot.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dsuwu_core::codec::{self, MAGIC_CLIENT, MAGIC_SERVER, MSG_BUTTON, MSG_LIST_PORTS, MSG_VERSION};
use dsuwu_core::{Producer, SlotStore};
use dsuwu_device::{ConnectionType, MacAddress, Touchpad};

const T: &str = "dsuwu_producers::forward";

struct RemoteButtonResponse {
    slot: u8,
    mac: MacAddress,
    connection_type: ConnectionType,
    connected: bool,
    packet_num: u32,
    buttons1: u8,
    buttons2: u8,
    home: bool,
    touch_button: bool,
    l_stick: (u8, u8),
    r_stick: (u8, u8),
    dpad_analog: [u8; 4],
    face_analog: [u8; 4],
    analog_r1: u8,
    analog_l1: u8,
    analog_r2: u8,
    analog_l2: u8,
    touch1: Touchpad,
    touch2: Touchpad,
    motion_timestamp_us: u64,
    accel: (f32, f32, f32),
    gyro: (f32, f32, f32),
}

fn decode_button_response(payload: &[u8]) -> Option<RemoteButtonResponse> {
    if payload.len() < 80 {
        return None;
    }

    let mut mac_bytes = [0u8; 6];
    mac_bytes.copy_from_slice(&payload[4..10]);
    let touch = |base: usize| Touchpad {
        active: payload[base] != 0,
        id: payload[base + 1],
        x: u16::from_le_bytes([payload[base + 2], payload[base + 3]]),
        y: u16::from_le_bytes([payload[base + 4], payload[base + 5]]),
    };
    let f32_at = |base: usize| f32::from_le_bytes([payload[base], payload[base + 1], payload[base + 2], payload[base + 3]]);

    Some(RemoteButtonResponse {
        slot: payload[0],
        connection_type: ConnectionType::try_from(payload[3] as i8).unwrap_or(ConnectionType::NotApplicable),
        mac: MacAddress(mac_bytes),
        connected: payload[11] != 0,
        packet_num: u32::from_le_bytes([payload[12], payload[13], payload[14], payload[15]]),
        buttons1: payload[16],
        buttons2: payload[17],
        home: payload[18] != 0,
        touch_button: payload[19] != 0,
        l_stick: (payload[20], 255 - payload[21]),
        r_stick: (payload[22], 255 - payload[23]),
        dpad_analog: [payload[27], payload[26], payload[25], payload[24]],
        face_analog: [payload[28], payload[29], payload[30], payload[31]],
        analog_r1: payload[32],
        analog_l1: payload[33],
        analog_r2: payload[34],
        analog_l2: payload[35],
        touch1: touch(36),
        touch2: touch(42),
        motion_timestamp_us: u64::from_le_bytes(payload[48..56].try_into().unwrap()),
        accel: (f32_at(56), f32_at(60), -f32_at(64)),
        gyro: (f32_at(68), f32_at(72), f32_at(76)),
    })
}

fn apply(store: &SlotStore, slot: u8, remote: &RemoteButtonResponse) {
    store.with_slot_mut(slot, |state, mac| {
        *mac = remote.mac;
        state.connection_type = remote.connection_type;
        state.connected = remote.connected;
        state.packet_num = remote.packet_num;
        state.buttons1 = remote.buttons1;
        state.buttons2 = remote.buttons2;
        state.home = remote.home;
        state.touch_button = remote.touch_button;
        state.l_stick = remote.l_stick;
        state.r_stick = remote.r_stick;
        state.dpad_analog = remote.dpad_analog;
        state.face_analog = remote.face_analog;
        state.analog_r1 = remote.analog_r1;
        state.analog_l1 = remote.analog_l1;
        state.analog_r2 = remote.analog_r2;
        state.analog_l2 = remote.analog_l2;
        state.touch1 = Some(remote.touch1);
        state.touch2 = Some(remote.touch2);
        state.motion_timestamp_us = remote.motion_timestamp_us;
        state.accel = remote.accel;
        state.gyro = remote.gyro;
    });
}

/// Mirrors `remote_slot` on `remote_addr` into this producer's assigned slot.
pub struct ForwardProducer {
    remote_addr: SocketAddr,
    remote_slot: u8,
    request_interval: Duration,
}

impl ForwardProducer {
    pub fn new(remote_addr: SocketAddr, remote_slot: u8, request_interval: Duration) -> Self {
        ForwardProducer {
            remote_addr,
            remote_slot,
            request_interval,
        }
    }
}

impl Producer for ForwardProducer {
    fn run(&self, stop: Arc<AtomicBool>, store: Arc<SlotStore>, assigned_slot: u8) {
        let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
            log::warn!(target: T, "could not bind forwarding socket for remote {}", self.remote_addr);
            return;
        };
        let _ = socket.set_read_timeout(Some(Duration::from_millis(500)));

        let mut protocol_version: u16 = 1001;
        let mut send = |socket: &UdpSocket, msg_type: u32, payload: &[u8], protocol_version: u16| {
            let packet = codec::encode(MAGIC_CLIENT, protocol_version, 0, msg_type, payload);
            let _ = socket.send_to(&packet, self.remote_addr);
        };

        send(&socket, MSG_VERSION, &[], protocol_version);
        let mut list_payload = vec![16, 0, 0, 0];
        list_payload.extend(0u8..16);
        send(&socket, MSG_LIST_PORTS, &list_payload, protocol_version);

        let mut last_request = Instant::now() - self.request_interval;
        let mut buf = [0u8; 2048];

        while !stop.load(Ordering::Acquire) {
            if last_request.elapsed() >= self.request_interval {
                let mut payload = vec![0x01, self.remote_slot];
                payload.extend_from_slice(&[0u8; 6]);
                send(&socket, MSG_BUTTON, &payload, protocol_version);
                last_request = Instant::now();
            }

            let Ok((n, _)) = socket.recv_from(&mut buf) else {
                continue;
            };
            let Some(parsed) = codec::validate_and_parse(&buf[..n], MAGIC_SERVER) else {
                continue;
            };
            if parsed.msg_type != MSG_BUTTON {
                continue;
            }
            protocol_version = protocol_version.min(parsed.protocol_version);

            if let Some(remote) = decode_button_response(&parsed.payload) {
                if remote.slot == self.remote_slot {
                    apply(&store, assigned_slot, &remote);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_round_tripped_button_response() {
        let mut state = dsuwu_device::SlotState::default();
        state.buttons1 = 0x01;
        state.l_stick = (200, 60);
        let mac = MacAddress([1, 2, 3, 4, 5, 6]);

        // Build the same payload shape the protocol engine emits.
        let payload = build_test_payload(0, mac, &state);
        let decoded = decode_button_response(&payload).expect("valid payload");
        assert_eq!(decoded.slot, 0);
        assert_eq!(decoded.mac, mac);
        assert_eq!(decoded.buttons1, 0x01);
        assert_eq!(decoded.l_stick, (200, 60));
    }

    fn build_test_payload(slot: u8, mac: MacAddress, state: &dsuwu_device::SlotState) -> Vec<u8> {
        let mut out = vec![0u8; 80];
        out[0] = slot;
        out[1] = 2;
        out[2] = 2;
        out[3] = state.connection_type.as_i8() as u8;
        out[4..10].copy_from_slice(&mac.0);
        out[10] = state.battery.0;
        out[11] = u8::from(state.connected);
        out[12..16].copy_from_slice(&state.packet_num.to_le_bytes());
        out[16] = state.buttons1;
        out[17] = state.buttons2;
        out[18] = u8::from(state.home);
        out[19] = u8::from(state.touch_button);
        out[20] = state.l_stick.0;
        out[21] = 255 - state.l_stick.1;
        out[22] = state.r_stick.0;
        out[23] = 255 - state.r_stick.1;
        let [up, right, down, left] = state.dpad_analog;
        out[24] = left;
        out[25] = down;
        out[26] = right;
        out[27] = up;
        out[28..32].copy_from_slice(&state.face_analog);
        out
    }
}
