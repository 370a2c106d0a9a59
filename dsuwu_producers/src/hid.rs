//! Seed HID producer (`hid` feature): proves the producer contract against
//! real hardware without per-device report-descriptor parsing, which is out
//! of scope here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hidapi::HidApi;

use dsuwu_core::{Producer, SlotStore};
use dsuwu_device::ConnectionType;

const T: &str = "dsuwu_producers::hid";

/// Opens the first HID device matching `vendor_id`/`product_id` and marks
/// its slot connected for as long as reads keep succeeding. Report bytes are
/// read but not decoded into buttons/axes.
pub struct HidProducer {
    vendor_id: u16,
    product_id: u16,
}

impl HidProducer {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        HidProducer { vendor_id, product_id }
    }
}

impl Producer for HidProducer {
    fn run(&self, stop: Arc<AtomicBool>, store: Arc<SlotStore>, assigned_slot: u8) {
        let api = match HidApi::new() {
            Ok(api) => api,
            Err(err) => {
                log::warn!(target: T, "hidapi init failed: {err}");
                return;
            }
        };

        let device = match api.open(self.vendor_id, self.product_id) {
            Ok(device) => device,
            Err(err) => {
                log::warn!(target: T, "could not open HID device {:04x}:{:04x}: {err}", self.vendor_id, self.product_id);
                return;
            }
        };
        let _ = device.set_blocking_mode(false);

        dsuwu_core::store::set_connection_type(&store, assigned_slot, ConnectionType::Usb);

        let mut buf = [0u8; 64];
        while !stop.load(Ordering::Acquire) {
            match device.read_timeout(&mut buf, 50) {
                Ok(0) => {}
                Ok(_) => {
                    store.with_slot_mut(assigned_slot, |state, _mac| {
                        state.packet_num = state.packet_num.wrapping_add(1);
                    });
                }
                Err(err) => {
                    log::warn!(target: T, "HID read failed, stopping: {err}");
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        dsuwu_core::store::set_connection_type(&store, assigned_slot, ConnectionType::Disconnected);
    }
}
