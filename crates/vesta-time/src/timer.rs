/// Single-slot deferred wake-up at an absolute system time.
///
/// A timer does not own a callback. The device that owns it reports [`Timer::deadline`] to the
/// board, and the board calls back into the device once the system clock reaches it. This keeps
/// timer state a plain value that can be snapshotted and restored.
#[derive(Debug, Clone)]
pub struct Timer {
    name: &'static str,
    deadline: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerState {
    pub deadline: Option<u64>,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            deadline: None,
        }
    }

    /// Arms the timer, replacing any pending deadline.
    pub fn set_timeout(&mut self, time: u64) {
        tracing::trace!(timer = self.name, time, "arm");
        self.deadline = Some(time);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    pub fn is_due(&self, now: u64) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Disarms and returns the deadline if it has been reached.
    pub fn take_due(&mut self, now: u64) -> Option<u64> {
        if !self.is_due(now) {
            return None;
        }
        self.deadline.take()
    }

    pub fn save_state(&self) -> TimerState {
        TimerState {
            deadline: self.deadline,
        }
    }

    pub fn restore_state(&mut self, state: TimerState) {
        self.deadline = state.deadline;
    }
}
