//! Shape producers: periodic face-button pulses for slot liveness testing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dsuwu_core::{Producer, SlotStore};
use dsuwu_device::{buttons1_mask, buttons2_mask, ButtonName};

const FRAME_DELAY: Duration = Duration::from_nanos(1_000_000_000 / 60);
const CYCLE_FRAMES: u64 = 60;
const PRESS_FRAMES: u64 = 3;

/// Which face button a [`ShapeProducer`] pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Circle,
    Square,
    Cross,
    Triangle,
}

impl Shape {
    fn button(self) -> ButtonName {
        match self {
            Shape::Circle => ButtonName::Circle,
            Shape::Square => ButtonName::Square,
            Shape::Cross => ButtonName::Cross,
            Shape::Triangle => ButtonName::Triangle,
        }
    }
}

/// Pulses a single face button on a fixed 60-frame cycle: pressed for the
/// first [`PRESS_FRAMES`] frames of each cycle, released for the rest.
pub struct ShapeProducer {
    shape: Shape,
}

impl ShapeProducer {
    pub fn new(shape: Shape) -> Self {
        ShapeProducer { shape }
    }
}

impl Producer for ShapeProducer {
    fn run(&self, stop: Arc<AtomicBool>, store: Arc<SlotStore>, assigned_slot: u8) {
        let mask1 = buttons1_mask([self.shape.button()]);
        let mask2 = buttons2_mask([self.shape.button()]);
        let mut frame: u64 = 0;

        while !stop.load(Ordering::Acquire) {
            let pressed = frame % CYCLE_FRAMES < PRESS_FRAMES;
            store.with_slot_mut(assigned_slot, |state, _mac| {
                if pressed {
                    state.buttons1 |= mask1;
                    state.buttons2 |= mask2;
                } else {
                    state.buttons1 &= !mask1;
                    state.buttons2 &= !mask2;
                }
            });
            frame = frame.wrapping_add(1);
            std::thread::sleep(FRAME_DELAY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn pulses_circle_then_releases_within_one_cycle() {
        let store = Arc::new(SlotStore::new());
        let stop = Arc::new(AtomicBool::new(false));
        let producer = ShapeProducer::new(Shape::Circle);

        let run_store = store.clone();
        let run_stop = stop.clone();
        let handle = thread::spawn(move || producer.run(run_stop, run_store, 0));

        thread::sleep(FRAME_DELAY * 2);
        assert_eq!(store.snapshot(0).state.buttons2, 0x20);

        thread::sleep(StdDuration::from_millis(80));
        assert_eq!(store.snapshot(0).state.buttons2, 0x00);

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }
}
