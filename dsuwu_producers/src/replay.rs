//! Replay producer: replays a captured JSON-Lines log of input and motion
//! samples at their recorded relative timestamps.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use dsuwu_core::{Producer, SlotStore};
use dsuwu_device::{ConnectionType, Touchpad};

const T: &str = "dsuwu_producers::replay";

#[derive(Debug, Deserialize)]
struct TouchRecord {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    id: u8,
    #[serde(default)]
    pos: (u16, u16),
}

#[derive(Debug, Deserialize)]
struct InputRecord {
    #[serde(default)]
    time: f64,
    #[serde(default)]
    slot: u8,
    #[serde(default)]
    connected: bool,
    #[serde(default)]
    buttons1: u8,
    #[serde(default)]
    buttons2: u8,
    #[serde(default)]
    home: bool,
    #[serde(default)]
    touch_button: bool,
    ls: Option<(u8, u8)>,
    rs: Option<(u8, u8)>,
    dpad: Option<[u8; 4]>,
    face: Option<[u8; 4]>,
    #[serde(default)]
    analog_r1: u8,
    #[serde(default)]
    analog_l1: u8,
    #[serde(default)]
    analog_r2: u8,
    #[serde(default)]
    analog_l2: u8,
    touch1: Option<TouchRecord>,
    touch2: Option<TouchRecord>,
}

#[derive(Debug, Deserialize)]
struct MotionRecord {
    #[serde(default)]
    time: f64,
    #[serde(default)]
    slot: u8,
    motion_ts: Option<u64>,
    accel: Option<(f32, f32, f32)>,
    gyro: Option<(f32, f32, f32)>,
}

/// Which slot(s) a replay targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayTarget {
    /// Replay only entries whose recorded `slot` equals the assigned slot.
    Assigned,
    /// Replay every slot named in the file, onto the slot it names.
    All,
}

/// Replays line-delimited input (and, optionally, motion) records at their
/// recorded relative timestamps.
pub struct ReplayProducer {
    inputs_path: PathBuf,
    motion_path: Option<PathBuf>,
    target: ReplayTarget,
}

impl ReplayProducer {
    pub fn new(inputs_path: impl Into<PathBuf>, motion_path: Option<PathBuf>, target: ReplayTarget) -> Self {
        ReplayProducer {
            inputs_path: inputs_path.into(),
            motion_path,
            target,
        }
    }
}

fn next_line(reader: &mut Option<BufReader<File>>) -> Option<String> {
    let reader = reader.as_mut()?;
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return None,
            Ok(_) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_owned());
                }
            }
            Err(_) => return None,
        }
    }
}

fn target_slot(target: ReplayTarget, assigned_slot: u8, entry_slot: u8) -> Option<u8> {
    match target {
        ReplayTarget::Assigned if entry_slot == assigned_slot => Some(assigned_slot),
        ReplayTarget::Assigned => None,
        ReplayTarget::All => Some(entry_slot),
    }
}

fn apply_input(store: &SlotStore, slot: u8, entry: &InputRecord) {
    store.with_slot_mut(slot, |state, _mac| {
        state.connected = entry.connected;
        state.buttons1 = entry.buttons1;
        state.buttons2 = entry.buttons2;
        state.home = entry.home;
        state.touch_button = entry.touch_button;
        state.l_stick = entry.ls.unwrap_or((128, 128));
        state.r_stick = entry.rs.unwrap_or((128, 128));
        state.dpad_analog = entry.dpad.unwrap_or([0; 4]);
        state.face_analog = entry.face.unwrap_or([0; 4]);
        state.analog_r1 = entry.analog_r1;
        state.analog_l1 = entry.analog_l1;
        state.analog_r2 = entry.analog_r2;
        state.analog_l2 = entry.analog_l2;
        state.touch1 = entry.touch1.as_ref().map(|t| Touchpad {
            active: t.active,
            id: t.id,
            x: t.pos.0,
            y: t.pos.1,
        });
        state.touch2 = entry.touch2.as_ref().map(|t| Touchpad {
            active: t.active,
            id: t.id,
            x: t.pos.0,
            y: t.pos.1,
        });
        if state.connection_type == ConnectionType::NotApplicable {
            state.connection_type = ConnectionType::Usb;
        }
    });
}

fn apply_motion(store: &SlotStore, slot: u8, entry: &MotionRecord) {
    store.with_slot_mut(slot, |state, _mac| {
        state.motion_timestamp_us = entry.motion_ts.unwrap_or(0);
        state.accel = entry.accel.unwrap_or((0.0, 0.0, 0.0));
        state.gyro = entry.gyro.unwrap_or((0.0, 0.0, 0.0));
    });
}

impl Producer for ReplayProducer {
    fn run(&self, stop: Arc<AtomicBool>, store: Arc<SlotStore>, assigned_slot: u8) {
        let Ok(input_file) = File::open(&self.inputs_path) else {
            log::warn!(target: T, "could not open replay input file {:?}", self.inputs_path);
            return;
        };
        let mut input_reader = Some(BufReader::new(input_file));
        let mut motion_reader = self
            .motion_path
            .as_ref()
            .and_then(|p| File::open(p).ok())
            .map(BufReader::new);

        let mut next_input = next_line(&mut input_reader).and_then(|l| serde_json::from_str::<InputRecord>(&l).ok());
        let mut next_motion = next_line(&mut motion_reader).and_then(|l| serde_json::from_str::<MotionRecord>(&l).ok());
        let mut prev_time: Option<f64> = None;

        while !stop.load(Ordering::Acquire) && (next_input.is_some() || next_motion.is_some()) {
            let use_motion = match (&next_input, &next_motion) {
                (None, Some(_)) => true,
                (Some(_), None) => false,
                (Some(i), Some(m)) => m.time <= i.time,
                (None, None) => break,
            };

            let entry_time = if use_motion {
                let entry = next_motion.take().expect("checked above");
                let time = entry.time;
                if let Some(slot) = target_slot(self.target, assigned_slot, entry.slot) {
                    apply_motion(&store, slot, &entry);
                }
                next_motion = next_line(&mut motion_reader).and_then(|l| serde_json::from_str::<MotionRecord>(&l).ok());
                time
            } else {
                let entry = next_input.take().expect("checked above");
                let time = entry.time;
                if let Some(slot) = target_slot(self.target, assigned_slot, entry.slot) {
                    apply_input(&store, slot, &entry);
                }
                next_input = next_line(&mut input_reader).and_then(|l| serde_json::from_str::<InputRecord>(&l).ok());
                time
            };

            if let Some(prev) = prev_time {
                let delay = (entry_time - prev).max(0.0);
                let end = Instant::now() + Duration::from_secs_f64(delay);
                while !stop.load(Ordering::Acquire) {
                    let remaining = end.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    std::thread::sleep(remaining.min(Duration::from_millis(5)));
                }
            }
            prev_time = Some(entry_time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn replays_assigned_slot_only() {
        let path = std::env::temp_dir().join(format!("dsuwu-replay-test-{:?}.jsonl", std::thread::current().id()));
        File::create(&path)
            .unwrap()
            .write_all(b"{\"time\":0.0,\"slot\":0,\"buttons1\":1}\n{\"time\":0.0,\"slot\":1,\"buttons1\":2}\n")
            .unwrap();

        let producer = ReplayProducer::new(path.clone(), None, ReplayTarget::Assigned);
        let store = Arc::new(SlotStore::new());
        let stop = Arc::new(AtomicBool::new(false));
        producer.run(stop, store.clone(), 0);

        assert_eq!(store.snapshot(0).state.buttons1, 1);
        assert_eq!(store.snapshot(1).state.buttons1, 0);

        let _ = std::fs::remove_file(&path);
    }
}
