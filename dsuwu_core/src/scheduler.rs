//! The release scheduler: a deadline-ordered priority queue of deferred
//! slot-state mutations, used by the pulse helpers to time-bound synthetic
//! button presses.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type Callback = Box<dyn FnOnce() + Send + 'static>;

const T: &str = "dsuwu_core::scheduler";

struct Shared {
    heap: Mutex<BinaryHeap<Reverse<(Instant, u64)>>>,
    callbacks: Mutex<HashMap<u64, Callback>>,
    next_seq: Mutex<u64>,
    condvar: Condvar,
    stop: AtomicBool,
}

/// Handle to a running release-scheduler worker thread.
///
/// Callbacks run with no additional locking of their own; callers that
/// mutate slot state are expected to take the store's per-slot lock inside
/// the callback.
#[derive(Clone)]
pub struct ReleaseScheduler {
    shared: Arc<Shared>,
}

impl ReleaseScheduler {
    /// Spawns the scheduler's single worker thread.
    pub fn spawn() -> (ReleaseScheduler, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            callbacks: Mutex::new(HashMap::new()),
            next_seq: Mutex::new(0),
            condvar: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("dsuwu-release-scheduler".into())
            .spawn(move || worker_loop(worker_shared))
            .expect("failed to spawn release scheduler thread");

        (ReleaseScheduler { shared }, handle)
    }

    /// Inserts `(now + max(delay, 0), callback)` and wakes the worker.
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        let deadline = Instant::now() + delay;
        let seq = {
            let mut next_seq = self.shared.next_seq.lock();
            let seq = *next_seq;
            *next_seq += 1;
            seq
        };

        self.shared.callbacks.lock().insert(seq, Box::new(callback));
        self.shared.heap.lock().push(Reverse((deadline, seq)));
        self.shared.condvar.notify_all();
    }

    /// Signals the worker to stop after draining no further than its current wait.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.stop.load(Ordering::Acquire) {
            return;
        }

        let next_deadline = shared.heap.lock().peek().map(|Reverse((d, _))| *d);

        let due_seq = match next_deadline {
            None => {
                let mut guard = shared.heap.lock();
                // Re-check under lock before waiting, avoiding a lost wakeup
                // if `schedule` raced us between the peek above and here.
                if guard.peek().is_none() {
                    shared.condvar.wait(&mut guard);
                }
                continue;
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    let mut guard = shared.heap.lock();
                    let wait = deadline - now;
                    let _ = shared.condvar.wait_for(&mut guard, wait);
                    continue;
                }

                let mut heap = shared.heap.lock();
                match heap.peek() {
                    Some(Reverse((d, seq))) if *d <= Instant::now() => {
                        let seq = *seq;
                        heap.pop();
                        seq
                    }
                    _ => continue,
                }
            }
        };

        let callback = shared.callbacks.lock().remove(&due_seq);
        if let Some(callback) = callback {
            callback();
        } else {
            log::warn!(target: T, "scheduled callback {due_seq} missing at fire time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_no_earlier_than_deadline() {
        let (scheduler, _handle) = ReleaseScheduler::spawn();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        scheduler.schedule(Duration::from_millis(30), move || {
            tx.send(Instant::now()).unwrap();
        });

        let fired_at = rx.recv_timeout(Duration::from_secs(1)).expect("callback fired");
        assert!(fired_at - start >= Duration::from_millis(30));
        scheduler.stop();
    }

    #[test]
    fn fires_in_deadline_order() {
        let (scheduler, _handle) = ReleaseScheduler::spawn();
        let (tx, rx) = mpsc::channel();

        let tx2 = tx.clone();
        scheduler.schedule(Duration::from_millis(40), move || tx2.send("second").unwrap());
        scheduler.schedule(Duration::from_millis(10), move || tx.send("first").unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "first");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "second");
        scheduler.stop();
    }
}
