//! One counting element of the 8254.
//!
//! The channel never ticks on its own. Every observation or mutation first catches up with the
//! system clock (`sync`), which advances the output phase machine by exactly the elapsed number
//! of channel clocks. A [`Timer`] is armed for the next output edge so that edges reach the
//! [`EdgeSink`] on time even when nobody touches the ports.

use crate::output::{EdgeSink, NoEdge};
use vesta_io_snapshot::io::state::codec::{Decoder, Encoder};
use vesta_io_snapshot::io::state::SnapshotResult;
use vesta_time::{Counter, CounterState, SystemClock, Timer, TimerState};

/// Control word loaded at power-on: LSB-then-MSB access, mode 0, binary.
pub(crate) const CONTROL_POWER_ON: u8 = 0x30;

const ACCESS_MASK: u8 = 0x30;
const ACCESS_LATCH: u8 = 0x00;
const ACCESS_LSB: u8 = 0x10;
const ACCESS_MSB: u8 = 0x20;

const STATUS_OUTPUT: u8 = 0x80;
const STATUS_CONTROL_MASK: u8 = 0x3F;

const COUNT_MODULUS: i64 = 0x1_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountingMode {
    InterruptOnTerminalCount = 0,
    HardwareOneShot = 1,
    RateGenerator = 2,
    SquareWave = 3,
    SoftwareStrobe = 4,
    HardwareStrobe = 5,
}

impl CountingMode {
    /// Decodes the 3-bit mode field (control word bits 1..=3).
    ///
    /// When bit 1 of the field is set, bit 2 is a don't-care, so 6 and 7 alias 2 and 3.
    pub fn from_bits(bits: u8) -> Self {
        let mut bits = bits & 0b111;
        if bits & 0b010 != 0 {
            bits &= 0b011;
        }
        match bits {
            0 => Self::InterruptOnTerminalCount,
            1 => Self::HardwareOneShot,
            2 => Self::RateGenerator,
            3 => Self::SquareWave,
            4 => Self::SoftwareStrobe,
            _ => Self::HardwareStrobe,
        }
    }

    pub fn from_control(control: u8) -> Self {
        Self::from_bits(control >> 1)
    }

    /// Modes where a low gate freezes the counting element.
    fn gate_disables_counting(self) -> bool {
        !matches!(self, Self::HardwareOneShot | Self::HardwareStrobe)
    }
}

/// Which byte of a 16-bit access comes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BytePhase {
    Low = 0,
    High = 1,
}

impl BytePhase {
    fn from_u8(raw: u8) -> Self {
        if raw == Self::High as u8 {
            Self::High
        } else {
            Self::Low
        }
    }
}

/// Position in the output waveform of the active mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutPhase {
    /// Terminal behaviour reached (or no count loaded yet); only a reload leaves this phase.
    Expired = 0,
    /// Counting down towards `end_out_phase1`.
    First = 1,
    /// Counting down towards `end_out_phase2`.
    Second = 2,
}

impl OutPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::First,
            2 => Self::Second,
            _ => Self::Expired,
        }
    }
}

/// Serialized form of one channel, including its elapsed-time and timeout sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelState {
    pub count_register: u16,
    pub counting_element: i32,
    pub output_latch: u16,
    pub status_latch: u8,
    pub output_latched: bool,
    pub status_latched: bool,
    pub read_phase: BytePhase,
    pub write_phase: BytePhase,
    pub control_word: u8,
    pub mode: CountingMode,
    pub gate: bool,
    pub output: bool,
    pub out_phase: OutPhase,
    pub end_out_phase1: i32,
    pub end_out_phase2: i32,
    pub counter: CounterState,
    pub timer: TimerState,
}

impl ChannelState {
    pub(crate) fn encode(&self, enc: Encoder) -> Encoder {
        let enc = enc
            .u16(self.count_register)
            .i32(self.counting_element)
            .u16(self.output_latch)
            .u8(self.status_latch)
            .bool(self.output_latched)
            .bool(self.status_latched)
            .u8(self.read_phase as u8)
            .u8(self.write_phase as u8)
            .u8(self.control_word)
            .u8(self.mode as u8)
            .bool(self.gate)
            .bool(self.output)
            .u8(self.out_phase as u8)
            .i32(self.end_out_phase1)
            .i32(self.end_out_phase2)
            .u64(self.counter.reference)
            .u64(self.counter.remainder);
        match self.timer.deadline {
            Some(deadline) => enc.bool(true).u64(deadline),
            None => enc.bool(false).u64(0),
        }
    }

    /// Enumerated fields are masked into range rather than rejected.
    pub(crate) fn decode(d: &mut Decoder<'_>) -> SnapshotResult<Self> {
        let count_register = d.u16()?;
        let counting_element = d.i32()?;
        let output_latch = d.u16()?;
        let status_latch = d.u8()?;
        let output_latched = d.bool()?;
        let status_latched = d.bool()?;
        let read_phase = BytePhase::from_u8(d.u8()?);
        let write_phase = BytePhase::from_u8(d.u8()?);
        let control_word = d.u8()?;
        let mode = CountingMode::from_bits(d.u8()?);
        let gate = d.bool()?;
        let output = d.bool()?;
        let out_phase = OutPhase::from_u8(d.u8()?);
        let end_out_phase1 = d.i32()?;
        let end_out_phase2 = d.i32()?;
        let counter = CounterState {
            reference: d.u64()?,
            remainder: d.u64()?,
        };
        let armed = d.bool()?;
        let deadline = d.u64()?;

        Ok(Self {
            count_register,
            counting_element,
            output_latch,
            status_latch,
            output_latched,
            status_latched,
            read_phase,
            write_phase,
            control_word,
            mode,
            gate,
            output,
            out_phase,
            end_out_phase1,
            end_out_phase2,
            counter,
            timer: TimerState {
                deadline: armed.then_some(deadline),
            },
        })
    }
}

pub struct InternalCounter {
    count_register: u16,
    counting_element: i32,
    output_latch: u16,
    status_latch: u8,
    output_latched: bool,
    status_latched: bool,
    read_phase: BytePhase,
    write_phase: BytePhase,
    control_word: u8,
    mode: CountingMode,
    gate: bool,
    output: bool,
    out_phase: OutPhase,
    end_out_phase1: i32,
    end_out_phase2: i32,
    /// Set while catching up with the system clock; nested syncs return immediately.
    inside_timer_loop: bool,
    counter: Counter,
    timer: Timer,
    edge: Box<dyn EdgeSink>,
}

impl InternalCounter {
    pub fn new(name: &'static str, frequency: u64, clock: &impl SystemClock) -> Self {
        Self {
            count_register: 0,
            counting_element: 0,
            output_latch: 0,
            status_latch: 0,
            output_latched: false,
            status_latched: false,
            read_phase: BytePhase::Low,
            write_phase: BytePhase::Low,
            control_word: CONTROL_POWER_ON,
            mode: CountingMode::from_control(CONTROL_POWER_ON),
            gate: true,
            output: false,
            out_phase: OutPhase::Expired,
            end_out_phase1: 0,
            end_out_phase2: 0,
            inside_timer_loop: false,
            counter: Counter::new(name, frequency, clock),
            timer: Timer::new(name),
            edge: Box::new(NoEdge),
        }
    }

    pub fn name(&self) -> &'static str {
        self.counter.name()
    }

    pub fn frequency(&self) -> u64 {
        self.counter.frequency()
    }

    pub fn connect(&mut self, edge: Box<dyn EdgeSink>) {
        self.edge = edge;
    }

    pub fn gate(&self) -> bool {
        self.gate
    }

    pub fn deadline(&self) -> Option<u64> {
        self.timer.deadline()
    }

    /// Power-on state. The gate input is driven externally and keeps its level.
    pub fn reset(&mut self, clock: &impl SystemClock) {
        self.count_register = 0;
        self.counting_element = 0;
        self.output_latch = 0;
        self.status_latch = 0;
        self.output_latched = false;
        self.status_latched = false;
        self.read_phase = BytePhase::Low;
        self.write_phase = BytePhase::Low;
        self.control_word = CONTROL_POWER_ON;
        self.mode = CountingMode::from_control(CONTROL_POWER_ON);
        self.out_phase = OutPhase::Expired;
        self.end_out_phase1 = 0;
        self.end_out_phase2 = 0;
        self.inside_timer_loop = false;
        self.counter.reset(clock);
        self.timer.cancel();
        self.set_output(false);
    }

    pub fn output(&mut self, clock: &impl SystemClock) -> bool {
        self.sync(clock);
        self.output
    }

    pub fn write(&mut self, value: u8, clock: &impl SystemClock) {
        self.sync(clock);
        let value = u16::from(value);
        match self.control_word & ACCESS_MASK {
            ACCESS_LSB => {
                self.count_register = (self.count_register & 0xFF00) | value;
                self.write_load(clock);
            }
            ACCESS_MSB => {
                self.count_register = (self.count_register & 0x00FF) | (value << 8);
                self.write_load(clock);
            }
            _ => match self.write_phase {
                BytePhase::Low => {
                    self.count_register = (self.count_register & 0xFF00) | value;
                    self.write_phase = BytePhase::High;
                }
                BytePhase::High => {
                    self.count_register = (self.count_register & 0x00FF) | (value << 8);
                    self.write_phase = BytePhase::Low;
                    self.write_load(clock);
                }
            },
        }
    }

    pub fn read(&mut self, clock: &impl SystemClock) -> u8 {
        self.sync(clock);
        if self.status_latched {
            self.status_latched = false;
            return self.status_latch;
        }

        let value = if self.output_latched {
            self.output_latch
        } else {
            self.visible_count()
        };
        let [lo, hi] = value.to_le_bytes();
        match self.control_word & ACCESS_MASK {
            ACCESS_LSB => {
                self.output_latched = false;
                lo
            }
            ACCESS_MSB => {
                self.output_latched = false;
                hi
            }
            _ => match self.read_phase {
                BytePhase::Low => {
                    self.read_phase = BytePhase::High;
                    lo
                }
                BytePhase::High => {
                    self.read_phase = BytePhase::Low;
                    self.output_latched = false;
                    hi
                }
            },
        }
    }

    /// Handles a control word addressed to this channel.
    ///
    /// An access field of `00` is the counter-latch command and leaves the programming untouched.
    pub fn set_control(&mut self, value: u8, clock: &impl SystemClock) {
        self.sync(clock);
        if value & ACCESS_MASK == ACCESS_LATCH {
            self.latch_output_synced();
            return;
        }

        self.control_word = value & STATUS_CONTROL_MASK;
        self.mode = CountingMode::from_control(value);
        self.write_phase = BytePhase::Low;
        self.read_phase = BytePhase::Low;

        // Counting output stays idle until the next count is loaded.
        self.out_phase = OutPhase::Expired;
        self.timer.cancel();
        self.set_output(self.mode != CountingMode::InterruptOnTerminalCount);
    }

    pub fn set_gate(&mut self, level: bool, clock: &impl SystemClock) {
        self.sync(clock);
        if self.gate == level {
            return;
        }
        self.gate = level;

        if level {
            match self.mode {
                CountingMode::HardwareOneShot
                | CountingMode::RateGenerator
                | CountingMode::SquareWave
                | CountingMode::HardwareStrobe => self.load(clock),
                CountingMode::InterruptOnTerminalCount | CountingMode::SoftwareStrobe => {
                    self.schedule(clock)
                }
            }
        } else {
            if matches!(
                self.mode,
                CountingMode::RateGenerator | CountingMode::SquareWave
            ) {
                self.set_output(true);
            }
            self.schedule(clock);
        }
    }

    pub fn latch_output(&mut self, clock: &impl SystemClock) {
        self.sync(clock);
        self.latch_output_synced();
    }

    pub fn latch_status(&mut self, clock: &impl SystemClock) {
        self.sync(clock);
        if self.status_latched {
            return;
        }
        let output = if self.output { STATUS_OUTPUT } else { 0 };
        self.status_latch = output | (self.control_word & STATUS_CONTROL_MASK);
        self.status_latched = true;
    }

    /// Deferred-timeout callback. Returns whether the timeout was due.
    pub fn on_timer(&mut self, clock: &impl SystemClock) -> bool {
        if self.timer.take_due(clock.system_time()).is_none() {
            return false;
        }
        self.sync(clock);
        true
    }

    pub fn save_state(&self) -> ChannelState {
        ChannelState {
            count_register: self.count_register,
            counting_element: self.counting_element,
            output_latch: self.output_latch,
            status_latch: self.status_latch,
            output_latched: self.output_latched,
            status_latched: self.status_latched,
            read_phase: self.read_phase,
            write_phase: self.write_phase,
            control_word: self.control_word,
            mode: self.mode,
            gate: self.gate,
            output: self.output,
            out_phase: self.out_phase,
            end_out_phase1: self.end_out_phase1,
            end_out_phase2: self.end_out_phase2,
            counter: self.counter.save_state(),
            timer: self.timer.save_state(),
        }
    }

    /// Restores a saved channel. The output level is restored silently; the edge sink is not
    /// notified.
    ///
    /// The counting element and phase boundaries are clamped to `0..=0x10000` so a corrupt
    /// snapshot yields a wrong count rather than arithmetic overflow.
    pub fn restore_state(&mut self, state: ChannelState) {
        const MAX_COUNT: i32 = COUNT_MODULUS as i32;

        self.count_register = state.count_register;
        self.counting_element = state.counting_element.clamp(0, MAX_COUNT);
        self.output_latch = state.output_latch;
        self.status_latch = state.status_latch;
        self.output_latched = state.output_latched;
        self.status_latched = state.status_latched;
        self.read_phase = state.read_phase;
        self.write_phase = state.write_phase;
        self.control_word = state.control_word;
        self.mode = state.mode;
        self.gate = state.gate;
        self.output = state.output;
        self.out_phase = state.out_phase;
        self.end_out_phase1 = state.end_out_phase1.clamp(0, MAX_COUNT);
        self.end_out_phase2 = state.end_out_phase2.clamp(0, MAX_COUNT);
        self.inside_timer_loop = false;
        self.counter.restore_state(state.counter);
        self.timer.restore_state(state.timer);
    }

    fn counting_enabled(&self) -> bool {
        self.gate || !self.mode.gate_disables_counting()
    }

    /// Reload value; a written 0 stands for 65536.
    fn period(&self) -> i32 {
        let n = match self.count_register {
            0 => COUNT_MODULUS as i32,
            n => i32::from(n),
        };
        match self.mode {
            // A count of 1 is illegal for the periodic modes; treat it as the shortest
            // period that still has two non-empty halves.
            CountingMode::RateGenerator | CountingMode::SquareWave => n.max(2),
            _ => n,
        }
    }

    fn sync(&mut self, clock: &impl SystemClock) {
        if self.inside_timer_loop {
            return;
        }
        self.inside_timer_loop = true;
        let ticks = self.counter.elapsed(clock);
        if self.counting_enabled() {
            self.advance(ticks);
        }
        self.inside_timer_loop = false;
        self.schedule(clock);
    }

    fn write_load(&mut self, clock: &impl SystemClock) {
        match self.mode {
            // Wait for a gate trigger.
            CountingMode::HardwareOneShot | CountingMode::HardwareStrobe => {}
            _ => self.load(clock),
        }
    }

    fn load(&mut self, clock: &impl SystemClock) {
        self.reload_period();
        let output = !matches!(
            self.mode,
            CountingMode::InterruptOnTerminalCount | CountingMode::HardwareOneShot
        );
        self.set_output(output);
        // Settle zero-width phases right away.
        self.advance(0);
        self.schedule(clock);
    }

    fn reload_period(&mut self) {
        let n = self.period();
        let (end1, end2) = match self.mode {
            CountingMode::InterruptOnTerminalCount | CountingMode::HardwareOneShot => (0, 0),
            CountingMode::RateGenerator => (1, 0),
            CountingMode::SquareWave => (n / 2, 0),
            CountingMode::SoftwareStrobe | CountingMode::HardwareStrobe => (1, 0),
        };
        self.counting_element = n;
        self.end_out_phase1 = end1;
        self.end_out_phase2 = end2;
        self.out_phase = OutPhase::First;
    }

    fn advance(&mut self, mut ticks: u64) {
        loop {
            let boundary = match self.out_phase {
                OutPhase::Expired => {
                    // The element keeps wrapping through 0xFFFF without further output changes.
                    let step = (ticks % COUNT_MODULUS as u64) as i64;
                    let next = (i64::from(self.counting_element) - step).rem_euclid(COUNT_MODULUS);
                    self.counting_element = next as i32;
                    return;
                }
                OutPhase::First => self.end_out_phase1,
                OutPhase::Second => self.end_out_phase2,
            };

            let remaining = u64::try_from(self.counting_element - boundary).unwrap_or(0);
            if ticks < remaining {
                self.counting_element -= ticks as i32;
                return;
            }
            ticks -= remaining;
            self.counting_element = boundary;
            self.end_of_phase();
        }
    }

    fn end_of_phase(&mut self) {
        match (self.out_phase, self.mode) {
            (OutPhase::Expired, _) => {}
            (
                OutPhase::First,
                CountingMode::InterruptOnTerminalCount | CountingMode::HardwareOneShot,
            ) => {
                self.set_output(true);
                self.out_phase = OutPhase::Expired;
            }
            (OutPhase::First, _) => {
                self.set_output(false);
                self.out_phase = OutPhase::Second;
            }
            (OutPhase::Second, CountingMode::RateGenerator | CountingMode::SquareWave) => {
                self.set_output(true);
                self.reload_period();
            }
            (OutPhase::Second, _) => {
                self.set_output(true);
                self.out_phase = OutPhase::Expired;
            }
        }
    }

    fn schedule(&mut self, clock: &impl SystemClock) {
        let boundary = match self.out_phase {
            OutPhase::Expired => None,
            OutPhase::First => Some(self.end_out_phase1),
            OutPhase::Second => Some(self.end_out_phase2),
        };
        match boundary.filter(|_| self.counting_enabled()) {
            Some(boundary) => {
                let remaining = u64::try_from(self.counting_element - boundary).unwrap_or(0);
                let at = self.counter.system_time_after(remaining, clock);
                self.timer.set_timeout(at);
            }
            None => self.timer.cancel(),
        }
    }

    fn latch_output_synced(&mut self) {
        if self.output_latched {
            return;
        }
        self.output_latch = self.visible_count();
        self.output_latched = true;
    }

    /// Count as the CPU would read it.
    ///
    /// In mode 3 the hardware decrements by two per clock, so the element (which here counts one
    /// per clock towards the half-period boundary) is doubled; odd reloads lose one step in the
    /// high half.
    fn visible_count(&self) -> u16 {
        let value = match (self.mode, self.out_phase) {
            (CountingMode::SquareWave, OutPhase::First) => {
                let odd = self.period() & 1;
                2 * (self.counting_element - self.end_out_phase1) - 2 * odd
            }
            (CountingMode::SquareWave, OutPhase::Second) => {
                2 * (self.counting_element - self.end_out_phase2)
            }
            _ => self.counting_element,
        };
        i64::from(value).rem_euclid(COUNT_MODULUS) as u16
    }

    fn set_output(&mut self, level: bool) {
        if self.output == level {
            return;
        }
        self.output = level;
        tracing::trace!(channel = self.name(), level, "output edge");
        self.edge.on_edge(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use vesta_time::ManualClock;

    const WORD_MODE0: u8 = 0x30;
    const WORD_MODE3: u8 = 0x36;

    fn channel(clock: &ManualClock) -> InternalCounter {
        InternalCounter::new("test", clock.system_frequency(), clock)
    }

    fn load_word(ch: &mut InternalCounter, control: u8, count: u16, clock: &ManualClock) {
        ch.set_control(control, clock);
        let [lo, hi] = count.to_le_bytes();
        ch.write(lo, clock);
        ch.write(hi, clock);
    }

    #[test]
    fn mode_field_aliases_collapse() {
        assert_eq!(CountingMode::from_bits(6), CountingMode::RateGenerator);
        assert_eq!(CountingMode::from_bits(7), CountingMode::SquareWave);
        assert_eq!(CountingMode::from_bits(5), CountingMode::HardwareStrobe);
        assert_eq!(CountingMode::from_control(0x3E), CountingMode::SquareWave);
    }

    #[test]
    fn load_computes_phase_boundaries() {
        let clock = ManualClock::new(1_000);
        let mut ch = channel(&clock);

        load_word(&mut ch, WORD_MODE3, 5, &clock);
        assert_eq!(ch.out_phase, OutPhase::First);
        assert_eq!(ch.counting_element, 5);
        assert_eq!(ch.end_out_phase1, 2);
        assert_eq!(ch.end_out_phase2, 0);

        load_word(&mut ch, 0x34, 10, &clock);
        assert_eq!((ch.end_out_phase1, ch.end_out_phase2), (1, 0));

        load_word(&mut ch, WORD_MODE0, 0, &clock);
        assert_eq!(ch.counting_element, 0x1_0000);
        assert_eq!(ch.end_out_phase1, 0);
    }

    #[test]
    fn nested_sync_does_not_consume_elapsed_time() {
        let clock = ManualClock::new(1_000);
        let mut ch = channel(&clock);
        load_word(&mut ch, WORD_MODE0, 100, &clock);

        clock.advance(10);
        // Simulate an observation that arrives while a catch-up is already running.
        ch.inside_timer_loop = true;
        ch.sync(&clock);
        assert_eq!(ch.counting_element, 100);

        ch.inside_timer_loop = false;
        ch.sync(&clock);
        assert_eq!(ch.counting_element, 90);

        // The second sync must not count the same ten clocks again.
        ch.sync(&clock);
        assert_eq!(ch.counting_element, 90);
    }

    #[test]
    fn expired_mode0_wraps_through_ffff() {
        let clock = ManualClock::new(1_000);
        let mut ch = channel(&clock);
        load_word(&mut ch, WORD_MODE0, 2, &clock);

        clock.advance(3);
        assert!(ch.output(&clock));
        assert_eq!(ch.out_phase, OutPhase::Expired);
        assert_eq!(ch.visible_count(), 0xFFFF);
    }

    #[test]
    fn square_wave_visible_count_steps_by_two() {
        let clock = ManualClock::new(1_000);
        let mut ch = channel(&clock);
        load_word(&mut ch, WORD_MODE3, 6, &clock);

        let mut seen = Vec::new();
        for _ in 0..6 {
            ch.sync(&clock);
            seen.push(ch.visible_count());
            clock.advance(1);
        }
        assert_eq!(seen, vec![6, 4, 2, 6, 4, 2]);
    }

    #[test]
    fn control_word_forces_output_level() {
        let clock = ManualClock::new(1_000);
        let mut ch = channel(&clock);
        let edges = Rc::new(RefCell::new(Vec::new()));
        let sink = edges.clone();
        ch.connect(Box::new(move |level| sink.borrow_mut().push(level)));

        ch.set_control(0x34, &clock);
        ch.set_control(WORD_MODE0, &clock);
        assert_eq!(*edges.borrow(), vec![true, false]);
    }

    #[test]
    fn restore_clamps_out_of_range_counts() {
        let clock = ManualClock::new(1_000);
        let mut ch = channel(&clock);

        let mut state = ch.save_state();
        state.control_word = WORD_MODE3;
        state.mode = CountingMode::SquareWave;
        state.out_phase = OutPhase::First;
        state.counting_element = i32::MIN;
        state.end_out_phase1 = i32::MAX;
        state.end_out_phase2 = -5;
        ch.restore_state(state);
        assert_eq!(ch.counting_element, 0);
        assert_eq!((ch.end_out_phase1, ch.end_out_phase2), (0x1_0000, 0));

        clock.advance(1);
        ch.read(&clock);
        ch.read(&clock);
        clock.advance(100_000);
        ch.output(&clock);

        load_word(&mut ch, WORD_MODE3, 6, &clock);
        assert_eq!(ch.visible_count(), 6);
    }
}
