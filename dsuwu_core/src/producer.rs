//! Producer lifecycle: the trait a controller data source implements, and
//! the host that spawns, tracks, and cancels them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::store::SlotStore;

/// A long-running task that mutates one assigned slot's state.
///
/// `run` must return promptly after `stop` is observed set, and is expected
/// to check it between producer-defined work units and before any blocking
/// wait.
pub trait Producer: Send + Sync {
    fn run(&self, stop: Arc<AtomicBool>, store: Arc<SlotStore>, assigned_slot: u8);
}

/// One slot's configuration: a real producer, the `IDLE` sentinel (force
/// connected, no task), or `None` (slot stays absent/disconnected).
pub enum ProducerSpec {
    None,
    Idle,
    Producer(Box<dyn Producer>),
}

/// Lifecycle of every producer task in a running server.
pub struct ProducerHost {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl ProducerHost {
    /// Spawns one thread per real producer and materializes idle/`NONE`
    /// slots in `store`. Returns the host plus the set of idle slot ids the
    /// protocol engine should force-connect every reconciliation pass.
    pub fn spawn(specs: Vec<(u8, ProducerSpec)>, store: Arc<SlotStore>) -> (ProducerHost, HashSet<u8>) {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        let mut idle_slots = HashSet::new();

        for (slot, spec) in specs {
            store.ensure_slot(slot);
            match spec {
                ProducerSpec::None => {
                    crate::store::set_connection_type(&store, slot, dsuwu_device::ConnectionType::Disconnected);
                }
                ProducerSpec::Idle => {
                    idle_slots.insert(slot);
                }
                ProducerSpec::Producer(producer) => {
                    let stop = stop.clone();
                    let store = store.clone();
                    let handle = std::thread::Builder::new()
                        .name(format!("dsuwu-producer-{slot}"))
                        .spawn(move || producer.run(stop, store, slot))
                        .expect("failed to spawn producer thread");
                    handles.push(handle);
                }
            }
        }

        (ProducerHost { stop, handles }, idle_slots)
    }

    /// Sets the stop signal and joins every producer thread.
    pub fn stop_and_join(self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles {
            if handle.join().is_err() {
                log::error!(target: "dsuwu_core::producer", "a producer thread panicked");
            }
        }
    }

    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("failed to load producer for slot {slot}: {reason}")]
    Load { slot: u8, reason: String },
}
