//! Engine crate: wire codec, slot store, release scheduler, client registry,
//! protocol handlers, dispatcher loop, producer lifecycle and send queue for
//! a DSU (CemuHook-compatible) UDP input server.

pub mod codec;
pub mod dispatcher;
pub mod producer;
pub mod protocol;
pub mod pulse;
pub mod registry;
pub mod scheduler;
pub mod sendqueue;
pub mod store;

pub use producer::{Producer, ProducerError, ProducerHost, ProducerSpec};
pub use protocol::ProtocolEngine;
pub use registry::ClientRegistry;
pub use scheduler::ReleaseScheduler;
pub use sendqueue::SendQueue;
pub use store::SlotStore;
