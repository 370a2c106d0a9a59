//! Per-remote subscription state, registration modes and timeouts.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use dashmap::DashMap;
use dsuwu_device::MacAddress;

/// Highest protocol version this server understands.
pub const PROTOCOL_VERSION_MAX: u16 = 1001;

/// Which registration mode a button request declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationMode {
    All,
    Slot(u8),
    Mac(MacAddress),
}

impl RegistrationMode {
    /// Classifies a request's `reg_flags` byte and slot/mac fields.
    ///
    /// `reg_flags == 0` means "all slots". Otherwise bits 0x01 (slot) and
    /// 0x02 (mac) are independent: either, both, or neither may be set, and
    /// each set bit contributes its own registration. A flags byte with
    /// neither bit set yields no registration at all.
    pub fn from_flags(reg_flags: u8, slot: u8, mac: MacAddress) -> Vec<RegistrationMode> {
        if reg_flags == 0 {
            return vec![RegistrationMode::All];
        }
        let mut modes = Vec::new();
        if reg_flags & 0x01 != 0 {
            modes.push(RegistrationMode::Slot(slot));
        }
        if reg_flags & 0x02 != 0 {
            modes.push(RegistrationMode::Mac(mac));
        }
        modes
    }
}

#[derive(Debug, Default, Clone)]
struct Registrations {
    all: Option<Instant>,
    per_slot: HashMap<u8, Instant>,
    per_mac: HashMap<MacAddress, Instant>,
}

/// Per-remote bookkeeping: when it was last heard from, which slots it has
/// been told about, its active registrations and negotiated version.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub last_seen: Instant,
    pub known_slots: HashSet<u8>,
    registrations: Registrations,
    pub negotiated_protocol_version: u16,
}

impl ClientInfo {
    fn new(now: Instant, negotiated_protocol_version: u16) -> Self {
        ClientInfo {
            last_seen: now,
            known_slots: HashSet::new(),
            registrations: Registrations::default(),
            negotiated_protocol_version,
        }
    }
}

/// Registry of active DSU clients, keyed by remote address.
///
/// Per-entry locking comes from `DashMap`'s sharded internals; the
/// dispatcher thread is the sole writer, with [`ClientRegistry::drop_client`]
/// as the one operation the sender thread also performs, on send failure.
pub struct ClientRegistry {
    clients: DashMap<SocketAddr, ClientInfo>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry {
            clients: DashMap::new(),
        }
    }

    /// Creates or refreshes `last_seen` for `addr`; negotiates the protocol
    /// version as `min(seen_version, PROTOCOL_VERSION_MAX)`.
    pub fn touch(&self, addr: SocketAddr, seen_version: u16, now: Instant) {
        let negotiated = seen_version.min(PROTOCOL_VERSION_MAX);
        self.clients
            .entry(addr)
            .and_modify(|info| {
                info.last_seen = now;
                info.negotiated_protocol_version = negotiated;
            })
            .or_insert_with(|| ClientInfo::new(now, negotiated));
    }

    /// Applies a registration declared by a button request.
    ///
    /// `slot_connected` tells us whether to add `slot` to `known_slots`
    /// immediately for a `Slot` registration.
    pub fn register(
        &self,
        addr: SocketAddr,
        mode: RegistrationMode,
        now: Instant,
        slot_connected: impl FnOnce(u8) -> bool,
    ) {
        let Some(mut info) = self.clients.get_mut(&addr) else {
            return;
        };

        match mode {
            RegistrationMode::All => {
                info.registrations.all = Some(now);
            }
            RegistrationMode::Slot(slot) => {
                info.registrations.per_slot.insert(slot, now);
                if slot_connected(slot) {
                    info.known_slots.insert(slot);
                }
            }
            RegistrationMode::Mac(mac) => {
                if !mac.is_zero() {
                    info.registrations.per_mac.insert(mac, now);
                }
            }
        }
    }

    /// Evicts clients beyond `ttl`; prunes expired per-slot/per-mac entries
    /// and the `all` timestamp for the survivors.
    pub fn garbage_collect(&self, now: Instant, ttl: std::time::Duration) {
        self.clients
            .retain(|_, info| now.saturating_duration_since(info.last_seen) <= ttl);

        for mut entry in self.clients.iter_mut() {
            let info = entry.value_mut();
            if let Some(ts) = info.registrations.all {
                if now.saturating_duration_since(ts) > ttl {
                    info.registrations.all = None;
                }
            }
            info.registrations
                .per_slot
                .retain(|_, ts| now.saturating_duration_since(*ts) <= ttl);
            info.registrations
                .per_mac
                .retain(|_, ts| now.saturating_duration_since(*ts) <= ttl);
        }
    }

    /// True iff `all`, the per-slot, or the per-mac timestamp for `addr` is
    /// within `ttl`.
    pub fn subscribed(&self, addr: SocketAddr, slot: u8, mac: MacAddress, now: Instant, ttl: std::time::Duration) -> bool {
        let Some(info) = self.clients.get(&addr) else {
            return false;
        };
        let within = |ts: &Instant| now.saturating_duration_since(*ts) <= ttl;

        info.registrations.all.as_ref().is_some_and(within)
            || info.registrations.per_slot.get(&slot).is_some_and(within)
            || info.registrations.per_mac.get(&mac).is_some_and(within)
    }

    /// Removes `addr` on send failure.
    pub fn drop_client(&self, addr: SocketAddr) {
        self.clients.remove(&addr);
    }

    /// Removes every client (used after a connection-reset receive error).
    pub fn clear(&self) {
        self.clients.clear();
    }

    pub fn mark_slot_known(&self, addr: SocketAddr, slot: u8) {
        if let Some(mut info) = self.clients.get_mut(&addr) {
            info.known_slots.insert(slot);
        }
    }

    pub fn unmark_slot_known(&self, addr: SocketAddr, slot: u8) {
        if let Some(mut info) = self.clients.get_mut(&addr) {
            info.known_slots.remove(&slot);
        }
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.clients.iter().map(|e| *e.key()).collect()
    }

    pub fn negotiated_protocol_version(&self, addr: SocketAddr) -> Option<u16> {
        self.clients.get(&addr).map(|info| info.negotiated_protocol_version)
    }

    pub fn knows_slot(&self, addr: SocketAddr, slot: u8) -> bool {
        self.clients
            .get(&addr)
            .is_some_and(|info| info.known_slots.contains(&slot))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
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
    fn touch_negotiates_minimum_version() {
        let reg = ClientRegistry::new();
        let now = Instant::now();
        reg.touch(addr(1), 9999, now);
        assert_eq!(reg.negotiated_protocol_version(addr(1)), Some(PROTOCOL_VERSION_MAX));
    }

    #[test]
    fn all_registration_subscribes_every_slot() {
        let reg = ClientRegistry::new();
        let now = Instant::now();
        reg.touch(addr(1), 1001, now);
        reg.register(addr(1), RegistrationMode::All, now, |_| false);
        assert!(reg.subscribed(addr(1), 7, MacAddress::ZERO, now, Duration::from_secs(5)));
    }

    #[test]
    fn timeout_removes_client_and_subscription() {
        let reg = ClientRegistry::new();
        let old = Instant::now() - Duration::from_secs(10);
        reg.touch(addr(1), 1001, old);
        reg.register(addr(1), RegistrationMode::All, old, |_| false);
        reg.garbage_collect(Instant::now(), Duration::from_secs(5));
        assert!(reg.is_empty());
    }

    #[test]
    fn expired_registration_is_pruned_but_client_survives_if_recently_seen() {
        let reg = ClientRegistry::new();
        let old = Instant::now() - Duration::from_secs(10);
        let now = Instant::now();
        reg.touch(addr(1), 1001, old);
        reg.register(addr(1), RegistrationMode::Slot(2), old, |_| true);
        reg.touch(addr(1), 1001, now);
        reg.garbage_collect(now, Duration::from_secs(5));
        assert!(!reg.subscribed(addr(1), 2, MacAddress::ZERO, now, Duration::from_secs(5)));
    }
}
