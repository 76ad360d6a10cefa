//! Output-pin notifications from timed devices to the rest of the board.

/// Receives level changes of a device output pin.
///
/// Sinks are only called when the level actually changes, never for repeated writes of the same
/// level.
pub trait EdgeSink {
    fn on_edge(&mut self, level: bool);
}

impl<F: FnMut(bool)> EdgeSink for F {
    fn on_edge(&mut self, level: bool) {
        self(level)
    }
}

/// Output pin that is not wired to anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEdge;

impl EdgeSink for NoEdge {
    fn on_edge(&mut self, _level: bool) {}
}
