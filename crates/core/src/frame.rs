//! The frame passed between pipeline stages.

use crate::constants::{FRAME_ADVANCE, PIPELINE_CHANNELS};

/// Per-frame analysis metadata, filled in by the stages that compute it and
/// read by the ones downstream. Fresh frames carry the conservative
/// defaults: no voice, silent reference, no correlation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameMetadata {
    /// Whether the current frame likely contains near-end speech.
    pub voice_activity: bool,
    /// Energy of the rate-converted reference, normalized to full scale.
    pub reference_energy: f32,
    /// Correlation between the capture and reference paths; high values mean
    /// the microphones are mostly hearing the loudspeaker.
    pub echo_correlation: f32,
}

/// One pipeline frame: `FRAME_ADVANCE` samples per channel of capture audio
/// and of rate-converted reference audio, channel-major, plus metadata.
///
/// Frames are heap-allocated once per iteration and moved through the stage
/// queues by pointer; nothing copies the payload after assembly.
pub struct Frame {
    channels: usize,
    frame_advance: usize,
    capture: Vec<i32>,
    reference: Vec<i32>,
    pub metadata: FrameMetadata,
}

impl Frame {
    pub fn new(channels: usize, frame_advance: usize) -> Box<Frame> {
        Box::new(Frame {
            channels,
            frame_advance,
            capture: vec![0; channels * frame_advance],
            reference: vec![0; channels * frame_advance],
            metadata: FrameMetadata::default(),
        })
    }

    /// A frame with the standard pipeline geometry.
    pub fn standard() -> Box<Frame> {
        Frame::new(PIPELINE_CHANNELS, FRAME_ADVANCE)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frame_advance(&self) -> usize {
        self.frame_advance
    }

    pub fn capture(&self, channel: usize) -> &[i32] {
        let start = channel * self.frame_advance;
        &self.capture[start..start + self.frame_advance]
    }

    pub fn capture_mut(&mut self, channel: usize) -> &mut [i32] {
        let start = channel * self.frame_advance;
        &mut self.capture[start..start + self.frame_advance]
    }

    /// The whole capture buffer, channel-major, for block receives.
    pub fn capture_all_mut(&mut self) -> &mut [i32] {
        &mut self.capture
    }

    pub fn reference(&self, channel: usize) -> &[i32] {
        let start = channel * self.frame_advance;
        &self.reference[start..start + self.frame_advance]
    }

    pub fn reference_mut(&mut self, channel: usize) -> &mut [i32] {
        let start = channel * self.frame_advance;
        &mut self.reference[start..start + self.frame_advance]
    }
}
