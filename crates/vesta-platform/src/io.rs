use std::collections::HashMap;

/// Value returned for reads from unmapped ports (the data bus floats high).
pub const OPEN_BUS: u8 = 0xFF;

pub trait PortIoDevice {
    fn read(&mut self, port: u16) -> u8;
    fn write(&mut self, port: u16, value: u8);

    /// Reset the device back to its power-on state.
    fn reset(&mut self) {}
}

struct RangeDevice {
    start: u16,
    len: u16,
    dev: Box<dyn PortIoDevice>,
}

impl RangeDevice {
    fn end_exclusive(&self) -> u32 {
        u32::from(self.start) + u32::from(self.len)
    }

    fn contains(&self, port: u16) -> bool {
        let p = u32::from(port);
        p >= u32::from(self.start) && p < self.end_exclusive()
    }
}

/// Byte-wide I/O port dispatcher.
///
/// Exact-port handlers take precedence over range handlers. Reads from unmapped ports return
/// [`OPEN_BUS`]; writes to unmapped ports are dropped.
pub struct IoPortBus {
    devices: HashMap<u16, Box<dyn PortIoDevice>>,
    ranges: Vec<RangeDevice>,
}

impl IoPortBus {
    pub fn new() -> Self {
        Self {
            devices: HashMap::new(),
            ranges: Vec::new(),
        }
    }

    pub fn register(&mut self, port: u16, device: Box<dyn PortIoDevice>) {
        self.devices.insert(port, device);
    }

    /// Registers a single device over a contiguous I/O port range.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty, wraps past `0xFFFF`, or overlaps an existing range.
    pub fn register_range(&mut self, start: u16, len: u16, dev: Box<dyn PortIoDevice>) {
        assert!(len != 0, "I/O port range length must be non-zero");

        let end_exclusive = u32::from(start) + u32::from(len);
        assert!(
            end_exclusive <= 0x1_0000,
            "I/O port range wraps past 0xFFFF: start={start:#x} len={len:#x}"
        );

        let idx = self.ranges.partition_point(|r| r.start < start);

        if let Some(prev) = idx.checked_sub(1).and_then(|i| self.ranges.get(i)) {
            assert!(
                u32::from(start) >= prev.end_exclusive(),
                "overlapping I/O port ranges: new=[{start:#x}..{end_exclusive:#x}) prev=[{:#x}..{:#x})",
                prev.start,
                prev.end_exclusive()
            );
        }
        if let Some(next) = self.ranges.get(idx) {
            assert!(
                end_exclusive <= u32::from(next.start),
                "overlapping I/O port ranges: new=[{start:#x}..{end_exclusive:#x}) next=[{:#x}..{:#x})",
                next.start,
                next.end_exclusive()
            );
        }

        self.ranges.insert(idx, RangeDevice { start, len, dev });
    }

    fn find_range(&mut self, port: u16) -> Option<&mut RangeDevice> {
        let idx = self.ranges.partition_point(|r| r.start <= port);
        let cand = idx.checked_sub(1)?;
        self.ranges.get_mut(cand).filter(|r| r.contains(port))
    }

    pub fn read(&mut self, port: u16) -> u8 {
        if let Some(dev) = self.devices.get_mut(&port) {
            return dev.read(port);
        }
        if let Some(range) = self.find_range(port) {
            return range.dev.read(port);
        }
        tracing::trace!(port, "read from unmapped I/O port");
        OPEN_BUS
    }

    pub fn write(&mut self, port: u16, value: u8) {
        if let Some(dev) = self.devices.get_mut(&port) {
            dev.write(port, value);
            return;
        }
        if let Some(range) = self.find_range(port) {
            range.dev.write(port, value);
            return;
        }
        tracing::trace!(port, value, "write to unmapped I/O port dropped");
    }

    /// Resets every registered device.
    pub fn reset(&mut self) {
        for dev in self.devices.values_mut() {
            dev.reset();
        }
        for range in &mut self.ranges {
            range.dev.reset();
        }
    }
}

impl Default for IoPortBus {
    fn default() -> Self {
        Self::new()
    }
}
