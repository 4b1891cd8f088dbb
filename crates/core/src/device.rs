//! Contracts for the hardware collaborators the pipeline drives.
//!
//! The core never talks to a bus directly; it is handed objects implementing
//! these traits. The simulator in the application crate and the test doubles
//! in this crate are the two stock implementations.

/// Wait policy for device calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Return immediately with whatever is available, possibly nothing.
    NonBlocking,
    /// Block until the full request can be satisfied.
    Forever,
}

/// A source of capture audio (microphone or reference input).
///
/// `receive` copies samples into `buf` and returns how many were copied.
/// With [`Timeout::Forever`] that is always `buf.len()`; with
/// [`Timeout::NonBlocking`] a block-granular device returns either a whole
/// block or zero. Sample layout (interleaved or channel-major) is a property
/// of the concrete device and is documented where the source is wired up.
pub trait CaptureSource: Send {
    fn receive(&mut self, buf: &mut [i32], timeout: Timeout) -> usize;
}

/// A sink for rendered audio with a visible send buffer.
pub trait OutputSink: Send {
    /// Queues interleaved samples for transmission, returning how many were
    /// accepted. [`Timeout::Forever`] accepts the whole slice.
    fn transmit(&mut self, buf: &[i32], timeout: Timeout) -> usize;

    /// Samples currently queued and not yet clocked out.
    fn level(&self) -> usize;

    /// Total capacity of the send buffer in samples.
    fn capacity(&self) -> usize;

    /// Opens or closes the gate between the send buffer and the bus. While
    /// closed the device outputs silence and the buffer holds its level.
    /// Devices without a gate ignore this.
    fn set_gate_open(&mut self, _open: bool) {}
}

/// The tunable audio clock. `set_numerator` writes the fractional-N
/// numerator of the clock's feedback divider; the write takes effect on the
/// next divider cycle.
pub trait ClockGenerator: Send {
    fn set_numerator(&mut self, numerator: i32);
}

/// A free-running edge counter attached to a clock pin.
///
/// Only the low [`PORT_COUNTER_BITS`](crate::constants::PORT_COUNTER_BITS)
/// bits are meaningful; the counter wraps silently. Callers diff successive
/// readings with [`TriggerDelta`](crate::assembler::TriggerDelta).
pub trait EdgeCounter: Send {
    fn trigger_time(&mut self) -> u32;
}
