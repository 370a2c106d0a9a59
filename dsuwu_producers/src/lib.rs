//! Concrete [`dsuwu_core::Producer`] implementations: fixed button-pulse
//! shapes, JSON-Lines replay, and mirroring a remote DSU server's slot.

pub mod forward;
pub mod replay;
pub mod shape;

#[cfg(feature = "hid")]
pub mod hid;

pub use forward::ForwardProducer;
pub use replay::{ReplayProducer, ReplayTarget};
pub use shape::{Shape, ShapeProducer};
