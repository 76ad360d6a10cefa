use std::cell::Cell;
use std::rc::Rc;

/// Read-only view of the board's global clock.
pub trait SystemClock {
    /// Current system time, in system cycles since power-on.
    fn system_time(&self) -> u64;

    /// Number of system cycles per emulated second.
    fn system_frequency(&self) -> u64;
}

impl<T: SystemClock + ?Sized> SystemClock for &T {
    fn system_time(&self) -> u64 {
        (**self).system_time()
    }

    fn system_frequency(&self) -> u64 {
        (**self).system_frequency()
    }
}

impl<T: SystemClock + ?Sized> SystemClock for Rc<T> {
    fn system_time(&self) -> u64 {
        (**self).system_time()
    }

    fn system_frequency(&self) -> u64 {
        (**self).system_frequency()
    }
}

/// Deterministic clock advanced explicitly by its owner.
///
/// Clones share the same underlying time, so the board can keep one handle to advance time
/// while devices hold another to observe it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
    frequency: u64,
}

impl ManualClock {
    /// # Panics
    ///
    /// Panics if `frequency` is zero.
    pub fn new(frequency: u64) -> Self {
        assert!(frequency != 0, "system clock frequency must be non-zero");
        Self {
            now: Rc::new(Cell::new(0)),
            frequency,
        }
    }

    /// # Panics
    ///
    /// Panics if advancing would overflow `u64`.
    pub fn advance(&self, cycles: u64) {
        let now = self
            .now
            .get()
            .checked_add(cycles)
            .expect("system clock overflowed u64::MAX");
        self.now.set(now);
    }

    /// Moves time forward to `time`. Targets in the past are ignored.
    pub fn advance_to(&self, time: u64) {
        if time > self.now.get() {
            self.now.set(time);
        }
    }

    /// Sets the current time, intended for save/restore.
    ///
    /// This may move time backwards; callers must restore every device that observes this clock
    /// from the same snapshot.
    pub fn set_system_time(&self, time: u64) {
        self.now.set(time);
    }
}

impl SystemClock for ManualClock {
    fn system_time(&self) -> u64 {
        self.now.get()
    }

    fn system_frequency(&self) -> u64 {
        self.frequency
    }
}
