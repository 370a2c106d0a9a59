//! Shared data model for the dsuwu server: the per-slot virtual controller
//! state, its button vocabulary, and the small value types the wire
//! protocol and the store both need (connection type, battery, MAC).
//!
//! This crate has no network or concurrency code in it; it only defines
//! what a slot *is*.

mod battery;
mod button;
mod connection;
mod mac;
mod slot;

pub use battery::Battery;
pub use button::{buttons1_mask, buttons2_mask, ButtonGroup, ButtonName};
pub use connection::{ConnectionType, InvalidConnectionType};
pub use mac::{InvalidMacAddress, MacAddress};
pub use slot::{SlotState, Touchpad, MAX_MOTORS};
