//! Frame assembly across the clock-domain boundary.
//!
//! The capture interface and the reference input run on unrelated clocks,
//! and the rate converter emits a slightly different sample count from one
//! block to the next. The assembler absorbs that: it pulls whole converter
//! blocks, fills fixed-advance frames from them, and parks whatever spills
//! past the frame boundary for the next iteration. The capture interface is
//! the timing authority; every iteration blocks on it exactly once.

use anyhow::{bail, Result};

use crate::constants::PORT_COUNTER_RANGE;
use crate::device::{CaptureSource, EdgeCounter, Timeout};
use crate::frame::Frame;
use crate::kernel::{AsrcProfile, KernelFactory};
use crate::resampler::DualResampleCoordinator;

/// Wrap-correct delta reader over a free-running edge counter.
///
/// Counters wrap at [`PORT_COUNTER_RANGE`]; deltas are taken modulo that
/// range so a reading that crosses the wrap still counts every edge.
pub struct TriggerDelta {
    counter: Box<dyn EdgeCounter>,
    prev: u32,
}

impl TriggerDelta {
    pub fn new(mut counter: Box<dyn EdgeCounter>) -> Self {
        let prev = counter.trigger_time() & (PORT_COUNTER_RANGE - 1);
        Self { counter, prev }
    }

    /// Edges since the previous call.
    pub fn delta(&mut self) -> u32 {
        let cur = self.counter.trigger_time() & (PORT_COUNTER_RANGE - 1);
        let delta = if cur >= self.prev {
            cur - self.prev
        } else {
            PORT_COUNTER_RANGE - self.prev + cur
        };
        self.prev = cur;
        delta
    }
}

/// Converter output that spilled past the last frame boundary: `count`
/// samples per channel starting at `offset` in the staging buffer.
#[derive(Debug, Default, Clone, Copy)]
struct Carryover {
    count: usize,
    offset: usize,
}

/// The capture source buffers freely while the rest of the pipeline comes
/// up; the first iteration discards that backlog so frame one is fresh.
enum FlushState {
    Flushing,
    Steady,
}

pub struct FrameAssembler {
    capture: Box<dyn CaptureSource>,
    reference: Box<dyn CaptureSource>,
    coordinator: DualResampleCoordinator,
    channels: usize,
    frame_advance: usize,
    /// Reference block as received, interleaved.
    interleaved: Vec<i32>,
    /// Reference block split per channel, converter input layout.
    split: Vec<Vec<i32>>,
    /// Converter output per channel, also the carryover backing store.
    staging: Vec<Vec<i32>>,
    carryover: Carryover,
    flush: FlushState,
    bit_clock: TriggerDelta,
    master_clock: TriggerDelta,
    last_deltas: (u32, u32),
    frames_assembled: u64,
}

impl FrameAssembler {
    /// `capture` must deliver channel-major blocks of `channels *
    /// frame_advance` samples; `reference` delivers interleaved blocks of
    /// `channels * block_length`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile: &AsrcProfile,
        channels: usize,
        frame_advance: usize,
        capture: Box<dyn CaptureSource>,
        reference: Box<dyn CaptureSource>,
        bit_clock: Box<dyn EdgeCounter>,
        master_clock: Box<dyn EdgeCounter>,
        factory: KernelFactory,
    ) -> Result<Self> {
        if channels != 2 {
            bail!("frame assembly is stereo only, got {} channels", channels);
        }
        if frame_advance == 0 {
            bail!("frame advance must be non-zero");
        }
        let coordinator = DualResampleCoordinator::spawn(profile, factory)?;
        let block_length = profile.block_length;
        let staging_len = profile.max_block_output();
        Ok(Self {
            capture,
            reference,
            coordinator,
            channels,
            frame_advance,
            interleaved: vec![0; block_length * channels],
            split: vec![vec![0; block_length]; channels],
            staging: vec![vec![0; staging_len]; channels],
            carryover: Carryover::default(),
            flush: FlushState::Flushing,
            bit_clock: TriggerDelta::new(bit_clock),
            master_clock: TriggerDelta::new(master_clock),
            last_deltas: (0, 0),
            frames_assembled: 0,
        })
    }

    /// Trims the conversion ratio for both reference channels.
    pub fn set_fs_ratio(&mut self, fs_ratio: u32) {
        self.coordinator.set_fs_ratio(fs_ratio);
    }

    pub fn nominal_fs_ratio(&self) -> u32 {
        self.coordinator.nominal_fs_ratio()
    }

    /// Reference samples parked for the next frame.
    pub fn carryover_samples(&self) -> usize {
        self.carryover.count
    }

    pub fn frames_assembled(&self) -> u64 {
        self.frames_assembled
    }

    /// Bit-clock and master-clock edge counts over the last frame.
    pub fn clock_deltas(&self) -> (u32, u32) {
        self.last_deltas
    }

    /// Blocks until one full frame of capture and converted reference audio
    /// is ready.
    pub fn assemble_frame(&mut self) -> Box<Frame> {
        let mut frame = Frame::new(self.channels, self.frame_advance);

        // Parked converter output goes in first. It can span more than one
        // frame after an upconverting block, so drain at most one advance.
        let take = self.carryover.count.min(self.frame_advance);
        if take > 0 {
            let offset = self.carryover.offset;
            for ch in 0..self.channels {
                frame.reference_mut(ch)[..take]
                    .copy_from_slice(&self.staging[ch][offset..offset + take]);
            }
            if take < self.carryover.count {
                self.carryover.count -= take;
                self.carryover.offset += take;
            } else {
                self.carryover = Carryover::default();
            }
        }
        let mut produced = take;

        self.receive_capture(&mut frame);

        while produced < self.frame_advance {
            let n = self.reference.receive(&mut self.interleaved, Timeout::Forever);
            assert_eq!(n, self.interleaved.len(), "reference source returned a short block");
            for (i, chunk) in self.interleaved.chunks_exact(self.channels).enumerate() {
                for (ch, &sample) in chunk.iter().enumerate() {
                    self.split[ch][i] = sample;
                }
            }

            let (left, right) = self.staging.split_at_mut(1);
            let n_out = self.coordinator.process_block(
                &self.split[0],
                &self.split[1],
                &mut left[0],
                &mut right[0],
            );

            let fit = (self.frame_advance - produced).min(n_out);
            for ch in 0..self.channels {
                frame.reference_mut(ch)[produced..produced + fit]
                    .copy_from_slice(&self.staging[ch][..fit]);
            }
            if fit < n_out {
                self.carryover = Carryover {
                    count: n_out - fit,
                    offset: fit,
                };
            }
            produced += fit;
        }
        debug_assert_eq!(produced, self.frame_advance);

        self.last_deltas = (self.bit_clock.delta(), self.master_clock.delta());
        self.frames_assembled += 1;
        log::trace!(
            "frame {}: bclk edges {}, mclk edges {}, carryover {}",
            self.frames_assembled,
            self.last_deltas.0,
            self.last_deltas.1,
            self.carryover.count
        );
        frame
    }

    fn receive_capture(&mut self, frame: &mut Frame) {
        let buf = frame.capture_all_mut();
        if let FlushState::Flushing = self.flush {
            // Drain the backlog, then take one blocking receive so the
            // steady-state loop starts aligned to a fresh block.
            let mut discarded = 0usize;
            loop {
                let n = self.capture.receive(buf, Timeout::NonBlocking);
                if n == 0 {
                    break;
                }
                discarded += n;
            }
            let n = self.capture.receive(buf, Timeout::Forever);
            assert_eq!(n, buf.len(), "capture source returned a short block");
            discarded += n;
            log::info!("discarded {} stale capture samples at startup", discarded);
            self.flush = FlushState::Steady;
        }
        // Every iteration blocks here, even when carryover alone could fill
        // the reference side: the capture interface paces the pipeline.
        let n = self.capture.receive(buf, Timeout::Forever);
        assert_eq!(n, buf.len(), "capture source returned a short block");
    }
}
