//! Emulated-time primitives shared by the board and its peripherals.
//!
//! The board owns a single **system clock** (monotonic CPU cycles since power-on) that is the
//! source of truth for every timed device. Peripherals never tick on every cycle; instead they:
//! - measure how much of their own local time has passed with a [`Counter`], and
//! - arm a [`Timer`] for the next moment their externally visible state changes.
//!
//! Both primitives are plain values with explicit `save_state`/`restore_state` pairs so device
//! snapshots can reproduce future timing exactly.

#![forbid(unsafe_code)]

mod clock;
mod counter;
mod timer;

pub use clock::{ManualClock, SystemClock};
pub use counter::{Counter, CounterState};
pub use timer::{Timer, TimerState};
