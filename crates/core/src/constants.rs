//! Structural constants shared across the front-end.
//!
//! These mirror the fixed geometry of the capture hardware: the microphone
//! interface delivers audio in blocks of [`FRAME_ADVANCE`] samples per
//! channel, and every downstream stage is built around that advance.

/// Samples per channel in one pipeline frame.
pub const FRAME_ADVANCE: usize = 240;

/// Channels carried through the pipeline (stereo capture and reference).
pub const PIPELINE_CHANNELS: usize = 2;

/// Input block length handed to the sample-rate converter, in samples per
/// channel. Kept equal to the frame advance so one capture block maps to one
/// conversion call.
pub const ASRC_BLOCK_LENGTH: usize = FRAME_ADVANCE;

/// Working-area multiplier for rate-converter kernels. Filter-bank kernels
/// size their inter-stage scratch as this many times the block length; see
/// [`crate::kernel::AsrcKernel`] for the contract.
pub const ASRC_STACK_LENGTH_MULT: usize = 4;

/// Depth of the frame queues between pipeline stages. Two in flight keeps a
/// stage from stalling its upstream while it finishes the previous frame.
pub const PIPELINE_QUEUE_DEPTH: usize = 2;

/// Internal pipeline rate in Hz. The microphone interface runs here; the
/// reference path is rate-converted to match.
pub const PIPELINE_SAMPLE_RATE: u32 = 48_000;

/// Width in bits of the free-running edge counters on the clock ports.
pub const PORT_COUNTER_BITS: u32 = 16;

/// Modulus of the port edge counters.
pub const PORT_COUNTER_RANGE: u32 = 1 << PORT_COUNTER_BITS;

/// Samples accumulated per send-buffer level average. A power of two so the
/// divide reduces to a shift.
pub const LEVEL_AVG_WINDOW: u32 = 1 << 16;

/// Q1.31 full scale as a float, for normalizing device samples.
pub const SAMPLE_FULL_SCALE: f64 = 2_147_483_648.0;
