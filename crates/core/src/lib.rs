//! Core of the driftmic audio front-end: sample-rate conversion between
//! free-running clock domains, fixed-advance frame assembly, metadata-gated
//! leveling, clock recovery from transport timing events, and playback
//! bridging with drain-and-prime buffer policy.
//!
//! Hardware never appears directly; everything the core drives is behind
//! the traits in [`device`], so the same pipeline runs against silicon or
//! against the simulator in the application crate.

pub mod assembler;
pub mod bridge;
pub mod clock;
pub mod constants;
pub mod device;
pub mod frame;
pub mod gain;
pub mod kernel;
pub mod pipeline;
pub mod rate;
pub mod resampler;

pub use assembler::{FrameAssembler, TriggerDelta};
pub use bridge::{LevelMonitor, OutputGate, PlaybackBlock, PlaybackBridge};
pub use clock::{
    pll_numerator, ClockEvent, ClockEventProducer, ClockRecovery, RateEstimator,
    TransferDirection, WindowedRateEstimator, USB_AUDIO_ENDPOINT,
};
pub use device::{CaptureSource, ClockGenerator, EdgeCounter, OutputSink, Timeout};
pub use frame::{Frame, FrameMetadata};
pub use gain::{GainController, GainKernel};
pub use kernel::{
    linear_kernel_factory, AsrcKernel, AsrcProfile, DitherMode, KernelFactory, LinearAsrc,
};
pub use pipeline::{AudioPipeline, PipelineConfig, PipelineTelemetry};
pub use rate::{RateCode, SampleRate, UnsupportedRate};
pub use resampler::{DualResampleCoordinator, ResamplerUnit};
