//! Intel 8254 Programmable Interval Timer.
//!
//! Three independent 16-bit down counters share one control port:
//!
//! | Offset | Read | Write |
//! |---|---|---|
//! | 0..=2 | counter data | counter data |
//! | 3 | open bus (`0xFF`) | control word / read-back command |
//!
//! Counters are evaluated lazily against the board clock; see [`channel`] for the timing model.
//! Output edges are delivered to the sink connected with [`I8254::connect_output`] once the
//! board calls [`I8254::poll`] at (or after) [`I8254::next_deadline`].

mod channel;

pub use channel::{BytePhase, ChannelState, CountingMode, InternalCounter, OutPhase};

use crate::output::EdgeSink;
use std::cell::RefCell;
use std::rc::Rc;
use vesta_io_snapshot::io::state::codec::{Decoder, Encoder};
use vesta_io_snapshot::io::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use vesta_platform::io::{IoPortBus, PortIoDevice, OPEN_BUS};
use vesta_time::SystemClock;

/// Input clock of the counters on the reference board.
pub const PIT_FREQUENCY_HZ: u64 = 1_193_182;

pub const PIT_COUNTER0: u16 = 0;
pub const PIT_COUNTER1: u16 = 1;
pub const PIT_COUNTER2: u16 = 2;
pub const PIT_CONTROL: u16 = 3;

pub const PIT_CHANNELS: usize = 3;

const SELECT_SHIFT: u8 = 6;
const SELECT_READ_BACK: u8 = 0b11;
const READ_BACK_NO_COUNT: u8 = 1 << 5;
const READ_BACK_NO_STATUS: u8 = 1 << 4;

const CHANNEL_NAMES: [&str; PIT_CHANNELS] = ["i8254.counter0", "i8254.counter1", "i8254.counter2"];

pub struct I8254<C: SystemClock> {
    clock: C,
    counters: [InternalCounter; PIT_CHANNELS],
}

impl<C: SystemClock> I8254<C> {
    pub fn new(clock: C, frequency: u64) -> Self {
        Self::with_frequencies(clock, [frequency; PIT_CHANNELS])
    }

    /// # Panics
    ///
    /// Panics if any frequency is zero.
    pub fn with_frequencies(clock: C, frequencies: [u64; PIT_CHANNELS]) -> Self {
        let counters = std::array::from_fn(|idx| {
            InternalCounter::new(CHANNEL_NAMES[idx], frequencies[idx], &clock)
        });
        Self { clock, counters }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Wires the output pin of `channel` to `sink`, replacing any previous sink.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is not 0, 1 or 2.
    pub fn connect_output(&mut self, channel: usize, sink: impl EdgeSink + 'static) {
        self.counters[channel].connect(Box::new(sink));
    }

    /// # Panics
    ///
    /// Panics if `channel` is not 0, 1 or 2.
    pub fn frequency(&self, channel: usize) -> u64 {
        self.counters[channel].frequency()
    }

    /// Drives the gate input of `channel`.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is not 0, 1 or 2.
    pub fn set_gate(&mut self, channel: usize, level: bool) {
        self.counters[channel].set_gate(level, &self.clock);
    }

    pub fn gate(&self, channel: usize) -> bool {
        self.counters[channel].gate()
    }

    /// Output pin level of `channel` as of the current system time.
    pub fn output(&mut self, channel: usize) -> bool {
        self.counters[channel].output(&self.clock)
    }

    pub fn read(&mut self, port: u16) -> u8 {
        match port {
            PIT_COUNTER0..=PIT_COUNTER2 => self.counters[usize::from(port)].read(&self.clock),
            _ => OPEN_BUS,
        }
    }

    pub fn write(&mut self, port: u16, value: u8) {
        match port {
            PIT_COUNTER0..=PIT_COUNTER2 => {
                self.counters[usize::from(port)].write(value, &self.clock)
            }
            PIT_CONTROL => self.write_control(value),
            _ => {}
        }
    }

    fn write_control(&mut self, value: u8) {
        let select = value >> SELECT_SHIFT;
        if select == SELECT_READ_BACK {
            self.read_back(value);
            return;
        }

        tracing::debug!(
            channel = select,
            control = format_args!("{value:#04x}"),
            "i8254 control word"
        );
        self.counters[usize::from(select)].set_control(value, &self.clock);
    }

    /// Read-back command: bits 1..=3 select counters 0..=2, bit 5 (low active) latches the
    /// count and bit 4 (low active) latches the status of every selected counter.
    fn read_back(&mut self, value: u8) {
        let latch_count = value & READ_BACK_NO_COUNT == 0;
        let latch_status = value & READ_BACK_NO_STATUS == 0;
        tracing::debug!(
            select = (value >> 1) & 0b111,
            latch_count,
            latch_status,
            "i8254 read-back"
        );

        for (idx, counter) in self.counters.iter_mut().enumerate() {
            if value & (2 << idx) == 0 {
                continue;
            }
            if latch_count {
                counter.latch_output(&self.clock);
            }
            if latch_status {
                counter.latch_status(&self.clock);
            }
        }
    }

    pub fn reset(&mut self) {
        tracing::debug!("i8254 reset");
        for counter in &mut self.counters {
            counter.reset(&self.clock);
        }
    }

    /// Earliest pending deferred timeout across all counters.
    pub fn next_deadline(&self) -> Option<u64> {
        self.counters.iter().filter_map(|c| c.deadline()).min()
    }

    /// Runs the timeout callback of every counter whose deadline has been reached.
    ///
    /// Returns the number of counters serviced.
    pub fn poll(&mut self) -> usize {
        let mut fired = 0;
        for counter in &mut self.counters {
            if counter.on_timer(&self.clock) {
                fired += 1;
            }
        }
        if fired != 0 {
            tracing::trace!(fired, now = self.clock.system_time(), "i8254 timers");
        }
        fired
    }
}

impl<C: SystemClock> IoSnapshot for I8254<C> {
    const DEVICE_ID: [u8; 4] = *b"8254";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_CHANNELS: u16 = 1;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        let mut enc = Encoder::new().u32(self.counters.len() as u32);
        for counter in &self.counters {
            enc = counter.save_state().encode(enc);
        }
        w.field_bytes(TAG_CHANNELS, enc.finish());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_CHANNELS: u16 = 1;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        if let Some(buf) = r.bytes(TAG_CHANNELS) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > PIT_CHANNELS {
                return Err(SnapshotError::InvalidFieldEncoding("i8254 channel count"));
            }

            // Decode everything before touching live state so a truncated blob leaves the
            // device unchanged.
            let mut states = Vec::with_capacity(count);
            for _ in 0..count {
                states.push(channel::ChannelState::decode(&mut d)?);
            }
            d.finish()?;

            for (counter, state) in self.counters.iter_mut().zip(states) {
                counter.restore_state(state);
            }
        }

        tracing::debug!(now = self.clock.system_time(), "i8254 state restored");
        Ok(())
    }
}

pub type SharedI8254<C> = Rc<RefCell<I8254<C>>>;

/// I/O-port view of a shared [`I8254`] mapped at `base..base + 4`.
///
/// Edge sinks run while the PIT is mutably borrowed, so they must not access the PIT through
/// the same `Rc<RefCell<_>>`.
pub struct I8254Port<C: SystemClock> {
    pit: SharedI8254<C>,
    base: u16,
}

impl<C: SystemClock> I8254Port<C> {
    pub fn new(pit: SharedI8254<C>, base: u16) -> Self {
        Self { pit, base }
    }
}

impl<C: SystemClock> PortIoDevice for I8254Port<C> {
    fn read(&mut self, port: u16) -> u8 {
        self.pit.borrow_mut().read(port.wrapping_sub(self.base))
    }

    fn write(&mut self, port: u16, value: u8) {
        self.pit
            .borrow_mut()
            .write(port.wrapping_sub(self.base), value);
    }

    fn reset(&mut self) {
        self.pit.borrow_mut().reset();
    }
}

/// Registers the four PIT ports starting at `base` on an [`IoPortBus`].
pub fn register_i8254<C: SystemClock + 'static>(
    bus: &mut IoPortBus,
    base: u16,
    pit: SharedI8254<C>,
) {
    bus.register_range(base, 4, Box::new(I8254Port::new(pit, base)));
}
