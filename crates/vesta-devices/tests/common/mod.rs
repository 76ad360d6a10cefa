#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use vesta_devices::i8254::{PIT_CONTROL, I8254};
use vesta_time::{ManualClock, SystemClock};

/// Edges recorded as `(system time, level)`.
pub type EdgeLog = Rc<RefCell<Vec<(u64, bool)>>>;

/// PIT whose counters run at the system clock rate, so one system cycle is one counter clock.
pub fn pit_1to1() -> (ManualClock, I8254<ManualClock>) {
    let clock = ManualClock::new(1_000_000);
    let pit = I8254::new(clock.clone(), 1_000_000);
    (clock, pit)
}

pub fn record_edges(pit: &mut I8254<ManualClock>, channel: usize) -> EdgeLog {
    let log: EdgeLog = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    let clock = pit.clock().clone();
    pit.connect_output(channel, move |level| {
        sink.borrow_mut().push((clock.system_time(), level));
    });
    log
}

/// Programs `channel` with LSB-then-MSB access in `mode` and writes `count`.
pub fn program(pit: &mut I8254<ManualClock>, channel: u8, mode: u8, count: u16) {
    pit.write(PIT_CONTROL, (channel << 6) | 0x30 | (mode << 1));
    let [lo, hi] = count.to_le_bytes();
    pit.write(u16::from(channel), lo);
    pit.write(u16::from(channel), hi);
}

/// Advances the clock to `time`, servicing every deferred timeout at its exact deadline.
pub fn run_until(clock: &ManualClock, pit: &mut I8254<ManualClock>, time: u64) {
    while let Some(deadline) = pit.next_deadline() {
        if deadline > time {
            break;
        }
        clock.advance_to(deadline);
        pit.poll();
    }
    clock.advance_to(time);
}

pub fn read_word(pit: &mut I8254<ManualClock>, channel: u16) -> u16 {
    let lo = pit.read(channel);
    let hi = pit.read(channel);
    u16::from_le_bytes([lo, hi])
}
