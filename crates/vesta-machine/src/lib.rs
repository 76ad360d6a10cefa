//! Board wiring for the timer subsystem.
//!
//! The [`Machine`] owns the global clock, the I/O port bus and the 8254. It is the only place
//! that moves time forward: [`Machine::run_until`] walks the clock from one deferred timeout to
//! the next so every PIT output edge is delivered at its exact system time.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::rc::Rc;
use vesta_devices::i8254::{self, SharedI8254, I8254, PIT_FREQUENCY_HZ};
use vesta_devices::EdgeSink;
use vesta_io_snapshot::io::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use vesta_platform::io::IoPortBus;
use vesta_time::{ManualClock, SystemClock};

/// System clock of the reference board (NTSC colour burst).
pub const SYSTEM_FREQUENCY_HZ: u64 = 3_579_545;

pub const DEFAULT_PIT_BASE_PORT: u16 = 0x40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// System cycles per emulated second.
    pub system_frequency: u64,
    /// Input clock of all three PIT counters, in Hz.
    pub pit_frequency: u64,
    /// First of the four consecutive PIT ports.
    pub pit_base_port: u16,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            system_frequency: SYSTEM_FREQUENCY_HZ,
            pit_frequency: PIT_FREQUENCY_HZ,
            pit_base_port: DEFAULT_PIT_BASE_PORT,
        }
    }
}

pub struct Machine {
    cfg: MachineConfig,
    clock: ManualClock,
    io: IoPortBus,
    pit: SharedI8254<ManualClock>,
}

impl Machine {
    /// # Panics
    ///
    /// Panics if either frequency is zero, or if the PIT ports would wrap past `0xFFFF`.
    pub fn new(cfg: MachineConfig) -> Self {
        let clock = ManualClock::new(cfg.system_frequency);
        let pit = Rc::new(RefCell::new(I8254::new(clock.clone(), cfg.pit_frequency)));

        let mut io = IoPortBus::new();
        i8254::register_i8254(&mut io, cfg.pit_base_port, pit.clone());

        tracing::debug!(
            system_frequency = cfg.system_frequency,
            pit_frequency = cfg.pit_frequency,
            pit_base_port = format_args!("{:#x}", cfg.pit_base_port),
            "machine created"
        );
        Self {
            cfg,
            clock,
            io,
            pit,
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.cfg
    }

    /// Current system time in system cycles.
    pub fn now(&self) -> u64 {
        self.clock.system_time()
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn pit(&self) -> SharedI8254<ManualClock> {
        self.pit.clone()
    }

    pub fn io_read(&mut self, port: u16) -> u8 {
        self.io.read(port)
    }

    pub fn io_write(&mut self, port: u16, value: u8) {
        self.io.write(port, value);
    }

    /// # Panics
    ///
    /// Panics if `channel` is not 0, 1 or 2.
    pub fn set_pit_gate(&mut self, channel: usize, level: bool) {
        self.pit.borrow_mut().set_gate(channel, level);
    }

    /// Wires a PIT output pin. The sink runs while the PIT is borrowed and must not call back
    /// into this machine.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is not 0, 1 or 2.
    pub fn connect_pit_output(&mut self, channel: usize, sink: impl EdgeSink + 'static) {
        self.pit.borrow_mut().connect_output(channel, sink);
    }

    /// Runs for `cycles` system cycles. See [`Machine::run_until`].
    pub fn run_for(&mut self, cycles: u64) -> usize {
        let target = self.now().saturating_add(cycles);
        self.run_until(target)
    }

    /// Advances the clock to `time`, dispatching every deferred timeout that falls due on the
    /// way at its own deadline and in time order.
    ///
    /// Returns the number of timeouts dispatched. A `time` in the past only services timeouts
    /// that are already overdue.
    pub fn run_until(&mut self, time: u64) -> usize {
        let mut dispatched = 0;
        loop {
            let deadline = self.pit.borrow().next_deadline();
            match deadline {
                Some(deadline) if deadline <= time => {
                    self.clock.advance_to(deadline);
                    dispatched += self.pit.borrow_mut().poll();
                }
                _ => break,
            }
        }
        self.clock.advance_to(time);
        dispatched
    }

    /// Returns every device to its power-on state. System time keeps running.
    pub fn reset(&mut self) {
        tracing::debug!(now = self.now(), "machine reset");
        self.io.reset();
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(MachineConfig::default())
    }
}

impl IoSnapshot for Machine {
    const DEVICE_ID: [u8; 4] = *b"VMCH";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_SYSTEM_TIME: u16 = 1;
        const TAG_SYSTEM_FREQUENCY: u16 = 2;
        const TAG_PIT_FREQUENCY: u16 = 3;
        const TAG_PIT: u16 = 4;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u64(TAG_SYSTEM_TIME, self.now());
        w.field_u64(TAG_SYSTEM_FREQUENCY, self.cfg.system_frequency);
        w.field_u64(TAG_PIT_FREQUENCY, self.cfg.pit_frequency);
        w.field_bytes(TAG_PIT, self.pit.borrow().save_state());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_SYSTEM_TIME: u16 = 1;
        const TAG_SYSTEM_FREQUENCY: u16 = 2;
        const TAG_PIT_FREQUENCY: u16 = 3;
        const TAG_PIT: u16 = 4;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        // Counter remainders are only meaningful for the clock ratio they were taken with.
        if let Some(freq) = r.u64(TAG_SYSTEM_FREQUENCY)? {
            if freq != self.cfg.system_frequency {
                return Err(SnapshotError::Corrupt("system frequency mismatch"));
            }
        }
        if let Some(freq) = r.u64(TAG_PIT_FREQUENCY)? {
            if freq != self.cfg.pit_frequency {
                return Err(SnapshotError::Corrupt("pit frequency mismatch"));
            }
        }
        let time = r
            .u64(TAG_SYSTEM_TIME)?
            .ok_or(SnapshotError::Corrupt("missing system time"))?;

        if let Some(pit) = r.bytes(TAG_PIT) {
            self.pit.borrow_mut().load_state(pit)?;
        }
        self.clock.set_system_time(time);

        tracing::debug!(now = time, "machine state restored");
        Ok(())
    }
}
