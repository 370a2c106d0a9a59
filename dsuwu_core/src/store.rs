//! The shared slot-state store.
//!
//! One [`parking_lot::Mutex`] per slot serializes the field groups that must
//! be read back as a self-consistent snapshot (buttons with their sticks and
//! analogs); readers of different slots never block on each other, thanks to
//! `dashmap::DashMap`'s per-entry locking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use dsuwu_device::{ConnectionType, MacAddress, SlotState};

/// Tolerance for analog stick drift when detecting connection status.
pub const DEFAULT_STICK_DEADZONE: u8 = 3;

/// Client liveness / registration / motor-auto-zero timeout.
pub const DSU_TIMEOUT: Duration = Duration::from_secs(5);

struct SlotEntry {
    state: SlotState,
    mac: MacAddress,
}

/// A snapshot of one slot's MAC and state, taken under its lock.
pub struct SlotSnapshot {
    pub mac: MacAddress,
    pub state: SlotState,
}

/// Shared, per-slot-locked store of [`SlotState`] plus a coalescing
/// store-wide dirty signal.
pub struct SlotStore {
    slots: DashMap<u8, Mutex<SlotEntry>>,
    dirty: AtomicBool,
    dirty_cv: Condvar,
    dirty_lock: Mutex<()>,
}

impl SlotStore {
    pub fn new() -> Self {
        SlotStore {
            slots: DashMap::new(),
            dirty: AtomicBool::new(false),
            dirty_cv: Condvar::new(),
            dirty_lock: Mutex::new(()),
        }
    }

    /// Creates a default `SlotState` and a generated MAC if the slot is
    /// absent. Idempotent.
    pub fn ensure_slot(&self, slot: u8) {
        self.slots.entry(slot).or_insert_with(|| {
            Mutex::new(SlotEntry {
                state: SlotState::default(),
                mac: MacAddress::generated(slot as u32),
            })
        });
    }

    /// Runs `f` with exclusive access to `slot`'s state, creating it first if
    /// absent. Marks the store dirty after `f` returns.
    pub fn with_slot_mut<R>(&self, slot: u8, f: impl FnOnce(&mut SlotState, &mut MacAddress) -> R) -> R {
        self.ensure_slot(slot);
        let entry = self.slots.get(&slot).expect("just ensured");
        let mut guard: MutexGuard<SlotEntry> = entry.lock();
        let result = f(&mut guard.state, &mut guard.mac);
        drop(guard);
        self.mark_dirty();
        result
    }

    /// Takes a consistent snapshot of `slot`, creating it first if absent.
    pub fn snapshot(&self, slot: u8) -> SlotSnapshot {
        self.ensure_slot(slot);
        let entry = self.slots.get(&slot).expect("just ensured");
        let guard = entry.lock();
        SlotSnapshot {
            mac: guard.mac,
            state: guard.state.clone(),
        }
    }

    /// All currently materialized slot ids, in ascending order.
    pub fn known_slot_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.slots.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    fn mark_dirty(&self) {
        if !self.dirty.swap(true, Ordering::AcqRel) {
            let _guard = self.dirty_lock.lock();
            self.dirty_cv.notify_all();
        }
    }

    /// True if the store has been written to since the last [`SlotStore::clear_dirty`].
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Blocks until the store is dirty or `timeout` elapses. Returns whether
    /// the store was observed dirty.
    pub fn wait_dirty(&self, timeout: Duration) -> bool {
        if self.is_dirty() {
            return true;
        }
        let mut guard = self.dirty_lock.lock();
        if self.is_dirty() {
            return true;
        }
        let _ = self.dirty_cv.wait_for(&mut guard, timeout);
        self.is_dirty()
    }
}

impl Default for SlotStore {
    fn default() -> Self {
        Self::new()
    }
}

/// True when every input is at rest: buttons, home, touch_button clear,
/// sticks within `deadzone` of 128, dpad/face zero, triggers zero, touches
/// inactive.
pub fn is_idle(state: &SlotState, deadzone: u8) -> bool {
    let centered = |v: u8| v.abs_diff(128) <= deadzone;

    state.buttons1 == 0
        && state.buttons2 == 0
        && !state.home
        && !state.touch_button
        && centered(state.l_stick.0)
        && centered(state.l_stick.1)
        && centered(state.r_stick.0)
        && centered(state.r_stick.1)
        && state.dpad_analog == [0; 4]
        && state.face_analog == [0; 4]
        && state.analog_l1 == 0
        && state.analog_r1 == 0
        && state.analog_l2 == 0
        && state.analog_r2 == 0
        && state.touch1.map_or(true, |t| !t.active)
        && state.touch2.map_or(true, |t| !t.active)
}

/// Recomputes `connected`: `idle == true` forces `connected`; otherwise
/// `connected` follows the negation of the idle test.
pub fn update_connection(state: &mut SlotState, deadzone: u8) {
    if state.idle {
        state.connected = true;
    } else {
        state.connected = !is_idle(state, deadzone);
    }
}

/// Clamps any motor stale beyond `DSU_TIMEOUT` to zero for every known slot.
/// Returns the slots whose motors changed.
pub fn zero_stale_motors(store: &SlotStore, now: Instant) -> Vec<u8> {
    let mut changed = Vec::new();
    for slot in store.known_slot_ids() {
        store.with_slot_mut(slot, |state, _mac| {
            if state.zero_stale_motors(now, DSU_TIMEOUT) {
                changed.push(slot);
            }
        });
    }
    changed
}

/// Sets `connection_type`, the only supported way to connect/disconnect a
/// slot out-of-band from the idle test (`Disconnected` is the sole
/// disconnect mechanism).
pub fn set_connection_type(store: &SlotStore, slot: u8, conn_type: ConnectionType) {
    store.with_slot_mut(slot, |state, _mac| {
        state.connection_type = conn_type;
        if conn_type == ConnectionType::Disconnected {
            state.connected = false;
        }
    });
}

/// Errors from the typed slot-state setters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotStateError {
    #[error("invalid MAC address: {0}")]
    InvalidMac(#[from] dsuwu_device::InvalidMacAddress),
}

/// Overwrites a slot's MAC with an already-parsed address, replacing the
/// generated default.
pub fn set_mac(store: &SlotStore, slot: u8, mac: MacAddress) {
    store.with_slot_mut(slot, |_state, slot_mac| {
        *slot_mac = mac;
    });
}

/// Parses `raw` as a MAC address and assigns it to `slot`.
pub fn set_mac_str(store: &SlotStore, slot: u8, raw: &str) -> Result<(), SlotStateError> {
    let mac: MacAddress = raw.parse()?;
    set_mac(store, slot, mac);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsuwu_device::SlotState;

    #[test]
    fn idle_centered_state_is_idle() {
        let state = SlotState::default();
        assert!(is_idle(&state, DEFAULT_STICK_DEADZONE));
    }

    #[test]
    fn idle_flag_forces_connected() {
        let mut state = SlotState::default();
        state.idle = true;
        update_connection(&mut state, DEFAULT_STICK_DEADZONE);
        assert!(state.connected);
    }

    #[test]
    fn activity_marks_connected() {
        let mut state = SlotState::default();
        state.buttons1 = 0x01;
        update_connection(&mut state, DEFAULT_STICK_DEADZONE);
        assert!(state.connected);
    }

    #[test]
    fn store_ensure_slot_generates_mac_once() {
        let store = SlotStore::new();
        let snap1 = store.snapshot(3);
        let snap2 = store.snapshot(3);
        assert_eq!(snap1.mac, snap2.mac);
        assert_eq!(snap1.mac, MacAddress::generated(3));
    }

    #[test]
    fn mutation_marks_store_dirty() {
        let store = SlotStore::new();
        assert!(!store.is_dirty());
        store.with_slot_mut(0, |state, _| state.buttons1 = 1);
        assert!(store.is_dirty());
    }

    #[test]
    fn set_mac_str_accepts_colon_form_and_overwrites_generated_mac() {
        let store = SlotStore::new();
        store.ensure_slot(1);
        set_mac_str(&store, 1, "AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(store.snapshot(1).mac, MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
    }

    #[test]
    fn set_mac_str_rejects_malformed_input() {
        let store = SlotStore::new();
        assert!(set_mac_str(&store, 1, "not-a-mac").is_err());
    }
}
