//! Timed button pulse helpers offered to producers: press now, release (or
//! toggle back) after a fixed number of frames.

use std::sync::Arc;
use std::time::Duration;

use dsuwu_device::{buttons1_mask, buttons2_mask, ButtonGroup, ButtonName};

use crate::scheduler::ReleaseScheduler;
use crate::store::SlotStore;

/// One 60 Hz frame, used to convert a pulse's frame count into a delay.
pub const FRAME_DURATION: Duration = Duration::from_nanos(1_000_000_000 / 60);

fn frame_delay(frames: u32) -> Duration {
    FRAME_DURATION * frames
}

/// Sets `buttons` immediately; if `frames > 0`, schedules a release after
/// `frames / 60` seconds that clears exactly the bits/home/touch that were
/// set here.
pub fn pulse_button(scheduler: &ReleaseScheduler, store: Arc<SlotStore>, frames: u32, slot: u8, buttons: &[ButtonName]) {
    let mask1 = buttons1_mask(buttons.iter().copied());
    let mask2 = buttons2_mask(buttons.iter().copied());
    let home = buttons.contains(&ButtonName::Home);
    let touch = buttons.contains(&ButtonName::Touch);

    store.with_slot_mut(slot, |state, _mac| {
        state.buttons1 |= mask1;
        state.buttons2 |= mask2;
        if home {
            state.home = true;
        }
        if touch {
            state.touch_button = true;
        }
    });

    if frames > 0 {
        let delay = frame_delay(frames);
        scheduler.schedule(delay, move || {
            store.with_slot_mut(slot, |state, _mac| {
                state.buttons1 &= !mask1;
                state.buttons2 &= !mask2;
                if home {
                    state.home = false;
                }
                if touch {
                    state.touch_button = false;
                }
            });
        });
    }
}

/// Toggles `buttons` immediately via XOR; if `frames > 0`, schedules a
/// second XOR toggle after `frames / 60` seconds so the net effect is a
/// pulse regardless of the starting state.
pub fn pulse_button_xor(scheduler: &ReleaseScheduler, store: Arc<SlotStore>, frames: u32, slot: u8, buttons: &[ButtonName]) {
    let mask1 = buttons1_mask(buttons.iter().copied());
    let mask2 = buttons2_mask(buttons.iter().copied());
    let home = buttons.contains(&ButtonName::Home);
    let touch = buttons.contains(&ButtonName::Touch);

    let toggle = {
        let store = store.clone();
        move || {
            store.with_slot_mut(slot, |state, _mac| {
                state.buttons1 ^= mask1;
                state.buttons2 ^= mask2;
                if home {
                    state.home = !state.home;
                }
                if touch {
                    state.touch_button = !state.touch_button;
                }
            });
        }
    };

    toggle();

    if frames > 0 {
        let delay = frame_delay(frames);
        scheduler.schedule(delay, toggle);
    }
}

/// Convenience: build a `Vec<ButtonName>` from a slice, filtering by group,
/// used by callers that enumerate [`ButtonGroup`] classifications directly.
pub fn classify(buttons: &[ButtonName]) -> Vec<(ButtonName, ButtonGroup)> {
    buttons.iter().map(|&b| (b, b.group())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ReleaseScheduler;
    use std::time::Duration as StdDuration;

    #[test]
    fn pulse_button_releases_after_frames() {
        let (scheduler, _handle) = ReleaseScheduler::spawn();
        let store = Arc::new(SlotStore::new());

        pulse_button(&scheduler, store.clone(), 3, 0, &[ButtonName::Circle]);
        assert_eq!(store.snapshot(0).state.buttons2, 0x20);

        std::thread::sleep(frame_delay(3) + StdDuration::from_millis(30));
        assert_eq!(store.snapshot(0).state.buttons2, 0x00);
        scheduler.stop();
    }

    #[test]
    fn pulse_xor_nets_to_a_single_pulse() {
        let (scheduler, _handle) = ReleaseScheduler::spawn();
        let store = Arc::new(SlotStore::new());

        pulse_button_xor(&scheduler, store.clone(), 2, 1, &[ButtonName::Cross]);
        assert_eq!(store.snapshot(1).state.buttons2, 0x40);

        std::thread::sleep(frame_delay(2) + StdDuration::from_millis(30));
        assert_eq!(store.snapshot(1).state.buttons2, 0x00);
        scheduler.stop();
    }
}
