use crate::SystemClock;

/// Converts elapsed system time into a device-local time unit.
///
/// Conversion is exact: the fractional part of a device unit is carried in `remainder`
/// (measured in `system cycles * device frequency`), so splitting an interval into many small
/// queries yields the same total as one large query.
#[derive(Debug, Clone)]
pub struct Counter {
    name: &'static str,
    frequency: u64,
    reference: u64,
    remainder: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterState {
    pub reference: u64,
    pub remainder: u64,
}

impl Counter {
    /// # Panics
    ///
    /// Panics if `frequency` is zero.
    pub fn new(name: &'static str, frequency: u64, clock: &impl SystemClock) -> Self {
        assert!(frequency != 0, "{name}: counter frequency must be non-zero");
        Self {
            name,
            frequency,
            reference: clock.system_time(),
            remainder: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// Moves the reference point to "now" and drops any partial unit.
    pub fn reset(&mut self, clock: &impl SystemClock) {
        self.reference = clock.system_time();
        self.remainder = 0;
    }

    /// Returns the number of whole device units since the previous call and consumes them.
    ///
    /// Calling this twice without the clock advancing returns `0` the second time.
    pub fn elapsed(&mut self, clock: &impl SystemClock) -> u64 {
        let now = clock.system_time();
        let system_frequency = u128::from(clock.system_frequency().max(1));
        let delta = now.saturating_sub(self.reference);

        let total = u128::from(delta) * u128::from(self.frequency) + u128::from(self.remainder);
        self.reference = now;
        self.remainder = (total % system_frequency) as u64;
        u64::try_from(total / system_frequency).unwrap_or(u64::MAX)
    }

    /// Earliest system time at which [`Counter::elapsed`] reports at least `units`.
    ///
    /// Only meaningful right after `elapsed()` has consumed everything up to the current time.
    pub fn system_time_after(&self, units: u64, clock: &impl SystemClock) -> u64 {
        let system_frequency = u128::from(clock.system_frequency().max(1));
        let needed = (u128::from(units) * system_frequency).saturating_sub(u128::from(self.remainder));
        let frequency = u128::from(self.frequency);
        let delta = needed.div_ceil(frequency);
        let delta = u64::try_from(delta).unwrap_or(u64::MAX);
        self.reference.saturating_add(delta)
    }

    pub fn save_state(&self) -> CounterState {
        CounterState {
            reference: self.reference,
            remainder: self.remainder,
        }
    }

    pub fn restore_state(&mut self, state: CounterState) {
        self.reference = state.reference;
        self.remainder = state.remainder;
    }
}
