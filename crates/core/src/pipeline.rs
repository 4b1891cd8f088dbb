//! The staged audio pipeline.
//!
//! Three threads connected by shallow bounded queues: the assembler thread
//! produces frames paced by the capture interface, the gain stage analyzes
//! and levels them, and the output stage interleaves and transmits. Queue
//! depth is deliberately small; if a stage falls behind, back-pressure
//! reaches the assembler within two frames instead of hiding behind a deep
//! buffer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::assembler::FrameAssembler;
use crate::constants::{
    ASRC_BLOCK_LENGTH, FRAME_ADVANCE, PIPELINE_CHANNELS, PIPELINE_QUEUE_DEPTH, SAMPLE_FULL_SCALE,
};
use crate::device::{OutputSink, Timeout};
use crate::frame::{Frame, FrameMetadata};
use crate::gain::GainKernel;
use crate::kernel::{AsrcProfile, DitherMode};
use crate::rate::SampleRate;

/// Capture RMS below this (of full scale) is treated as silence when
/// deciding voice activity.
const VOICE_RMS_FLOOR: f64 = 1e-4;

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub channels: usize,
    pub frame_advance: usize,
    pub block_length: usize,
    /// Rate of the incoming reference stream.
    pub reference_rate: SampleRate,
    /// Fixed internal rate the capture interface runs at.
    pub pipeline_rate: SampleRate,
    pub dither: DitherMode,
    /// Conversion-ratio trim in parts per million, signed. Stands in for a
    /// rate servo: positive means the reference clock runs fast relative to
    /// nominal.
    pub fs_ratio_trim_ppm: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channels: PIPELINE_CHANNELS,
            frame_advance: FRAME_ADVANCE,
            block_length: ASRC_BLOCK_LENGTH,
            reference_rate: SampleRate::Hz96000,
            pipeline_rate: SampleRate::Hz48000,
            dither: DitherMode::Off,
            fs_ratio_trim_ppm: 0,
        }
    }
}

impl PipelineConfig {
    /// The kernel profile for the reference conversion path.
    pub fn profile(&self) -> AsrcProfile {
        AsrcProfile {
            input: self.reference_rate,
            output: self.pipeline_rate,
            channels: 1,
            block_length: self.block_length,
            dither: self.dither,
        }
    }

    /// The nominal conversion ratio with the configured trim applied.
    pub fn trimmed_fs_ratio(&self) -> u32 {
        let nominal = self.profile().nominal_fs_ratio() as i64;
        (nominal + nominal * self.fs_ratio_trim_ppm as i64 / 1_000_000) as u32
    }
}

/// Shared counters published by the pipeline threads. Cheap enough to read
/// from a status loop every few hundred milliseconds.
#[derive(Clone)]
pub struct PipelineTelemetry {
    pub frames_assembled: Arc<AtomicU32>,
    pub frames_delivered: Arc<AtomicU32>,
    pub carryover_samples: Arc<AtomicU32>,
    pub bit_clock_delta: Arc<AtomicU32>,
    pub master_clock_delta: Arc<AtomicU32>,
    gain_bits: Arc<AtomicU32>,
}

impl PipelineTelemetry {
    fn new() -> Self {
        Self {
            frames_assembled: Arc::new(AtomicU32::new(0)),
            frames_delivered: Arc::new(AtomicU32::new(0)),
            carryover_samples: Arc::new(AtomicU32::new(0)),
            bit_clock_delta: Arc::new(AtomicU32::new(0)),
            master_clock_delta: Arc::new(AtomicU32::new(0)),
            gain_bits: Arc::new(AtomicU32::new(1.0f32.to_bits())),
        }
    }

    /// Gain currently applied by the leveling stage, linear.
    pub fn current_gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }
}

/// Fills in the frame metadata the downstream stages key off: a coarse
/// voice-activity decision, reference energy, and the zero-lag normalized
/// correlation between capture and reference. All from channel 0; the
/// second channel is a diagnostics tap.
fn analyze_frame(frame: &mut Frame) {
    let capture = frame.capture(0);
    let reference = frame.reference(0);
    let mut cap_sq = 0.0f64;
    let mut ref_sq = 0.0f64;
    let mut dot = 0.0f64;
    for (&c, &r) in capture.iter().zip(reference.iter()) {
        let c = c as f64 / SAMPLE_FULL_SCALE;
        let r = r as f64 / SAMPLE_FULL_SCALE;
        cap_sq += c * c;
        ref_sq += r * r;
        dot += c * r;
    }
    let len = capture.len().max(1) as f64;
    let cap_rms = (cap_sq / len).sqrt();
    let ref_rms = (ref_sq / len).sqrt();
    let correlation = if cap_sq > 0.0 && ref_sq > 0.0 {
        (dot.abs() / (cap_sq * ref_sq).sqrt()).min(1.0)
    } else {
        0.0
    };
    frame.metadata = FrameMetadata {
        voice_activity: cap_rms > VOICE_RMS_FLOOR,
        reference_energy: ref_rms as f32,
        echo_correlation: correlation as f32,
    };
}

fn assembler_loop(
    mut assembler: FrameAssembler,
    tx: Sender<Box<Frame>>,
    telemetry: PipelineTelemetry,
) {
    loop {
        let frame = assembler.assemble_frame();
        telemetry
            .frames_assembled
            .store(assembler.frames_assembled() as u32, Ordering::Relaxed);
        telemetry
            .carryover_samples
            .store(assembler.carryover_samples() as u32, Ordering::Relaxed);
        let (bclk, mclk) = assembler.clock_deltas();
        telemetry.bit_clock_delta.store(bclk, Ordering::Relaxed);
        telemetry.master_clock_delta.store(mclk, Ordering::Relaxed);
        if tx.send(frame).is_err() {
            // Downstream stages are gone; the pipeline is shutting down.
            break;
        }
    }
}

fn gain_stage_loop(
    rx: Receiver<Box<Frame>>,
    tx: Sender<Box<Frame>>,
    mut gain: Box<dyn GainKernel>,
    telemetry: PipelineTelemetry,
) {
    let mut scratch: Vec<i32> = Vec::new();
    for mut frame in rx.iter() {
        analyze_frame(&mut frame);
        // Channel 0 is the voice path; level it in place via the scratch
        // copy. Channel 1 passes through untouched.
        scratch.clear();
        scratch.extend_from_slice(frame.capture(0));
        let metadata = frame.metadata;
        gain.process(frame.capture_mut(0), &scratch, &metadata);
        telemetry
            .gain_bits
            .store(gain.current_gain().to_bits(), Ordering::Relaxed);
        if tx.send(frame).is_err() {
            break;
        }
    }
}

fn output_stage_loop(
    rx: Receiver<Box<Frame>>,
    mut output: Box<dyn OutputSink>,
    telemetry: PipelineTelemetry,
) {
    let mut interleaved: Vec<i32> = Vec::new();
    for frame in rx.iter() {
        let advance = frame.frame_advance();
        interleaved.resize(advance * frame.channels(), 0);
        for ch in 0..frame.channels() {
            let samples = frame.capture(ch);
            for i in 0..advance {
                interleaved[i * frame.channels() + ch] = samples[i];
            }
        }
        let sent = output.transmit(&interleaved, Timeout::Forever);
        assert_eq!(sent, interleaved.len(), "output sink dropped samples");
        telemetry.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }
}

/// A running pipeline: three named threads and the counters they publish.
///
/// The stage threads exit when their upstream disconnects; the assembler
/// thread runs for the life of the capture source. There is no pause or
/// cancel path, matching the underlying devices, so `join` only returns
/// once the sources do.
pub struct AudioPipeline {
    telemetry: PipelineTelemetry,
    threads: Vec<JoinHandle<()>>,
}

impl AudioPipeline {
    pub fn start(
        assembler: FrameAssembler,
        output: Box<dyn OutputSink>,
        gain: Box<dyn GainKernel>,
    ) -> Result<Self> {
        let telemetry = PipelineTelemetry::new();
        let (stage_tx, mut threads) = spawn_stages(output, gain, telemetry.clone())?;
        let t = telemetry.clone();
        threads.push(
            thread::Builder::new()
                .name("driftmic-frame".into())
                .spawn(move || assembler_loop(assembler, stage_tx, t))
                .context("spawning frame assembler thread")?,
        );
        log::info!("audio pipeline started");
        Ok(Self { telemetry, threads })
    }

    pub fn telemetry(&self) -> &PipelineTelemetry {
        &self.telemetry
    }

    /// Blocks until every pipeline thread has exited.
    pub fn join(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

/// Spawns the gain and output stages, returning the frame inlet.
fn spawn_stages(
    output: Box<dyn OutputSink>,
    gain: Box<dyn GainKernel>,
    telemetry: PipelineTelemetry,
) -> Result<(Sender<Box<Frame>>, Vec<JoinHandle<()>>)> {
    let (in_tx, in_rx) = bounded::<Box<Frame>>(PIPELINE_QUEUE_DEPTH);
    let (out_tx, out_rx) = bounded::<Box<Frame>>(PIPELINE_QUEUE_DEPTH);

    let t = telemetry.clone();
    let gain_thread = thread::Builder::new()
        .name("driftmic-gain".into())
        .spawn(move || gain_stage_loop(in_rx, out_tx, gain, t))
        .context("spawning gain stage thread")?;
    let output_thread = thread::Builder::new()
        .name("driftmic-out".into())
        .spawn(move || output_stage_loop(out_rx, output, telemetry))
        .context("spawning output stage thread")?;

    Ok((in_tx, vec![gain_thread, output_thread]))
}
