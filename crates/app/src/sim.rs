//! Simulated devices for running the pipeline without hardware.
//!
//! Each simulator implements one of the core device traits with the timing
//! quirks of the real part it stands in for: the microphone pre-buffers
//! before the pipeline is up, the reference input free-runs at its own
//! (possibly offset) rate, the send buffer drains in real time only while
//! its bus gate is open, and the host generates one timing event per
//! service interval.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapProd, HeapRb,
};

use driftmic_core::constants::{PIPELINE_CHANNELS, SAMPLE_FULL_SCALE};
use driftmic_core::{
    CaptureSource, ClockEvent, ClockEventProducer, ClockGenerator, EdgeCounter, OutputSink,
    Timeout, TransferDirection, USB_AUDIO_ENDPOINT,
};

/// Channel-major microphone source: a tone on channel 0 with a copy at
/// reduced level on channel 1, paced to real time.
///
/// Starts with a few blocks of backlog, the way the real interface keeps
/// capturing while the rest of the system boots.
pub struct SimMicrophone {
    rate_hz: f64,
    tone_hz: f64,
    amplitude: f64,
    sample_clock: u64,
    backlog_blocks: usize,
}

impl SimMicrophone {
    pub fn new(rate_hz: u32) -> Self {
        Self {
            rate_hz: rate_hz as f64,
            tone_hz: 440.0,
            amplitude: 0.05,
            sample_clock: 0,
            backlog_blocks: 3,
        }
    }

    fn fill(&mut self, buf: &mut [i32]) {
        let advance = buf.len() / PIPELINE_CHANNELS;
        for i in 0..advance {
            let t = (self.sample_clock + i as u64) as f64 / self.rate_hz;
            let s = (self.amplitude
                * SAMPLE_FULL_SCALE
                * (std::f64::consts::TAU * self.tone_hz * t).sin()) as i32;
            buf[i] = s;
            buf[advance + i] = s / 2;
        }
        self.sample_clock += advance as u64;
    }
}

impl CaptureSource for SimMicrophone {
    fn receive(&mut self, buf: &mut [i32], timeout: Timeout) -> usize {
        match timeout {
            Timeout::NonBlocking => {
                if self.backlog_blocks == 0 {
                    return 0;
                }
                self.backlog_blocks -= 1;
                self.fill(buf);
                buf.len()
            }
            Timeout::Forever => {
                // One block of real time per block of samples.
                let advance = buf.len() / PIPELINE_CHANNELS;
                let micros = advance as f64 / self.rate_hz * 1_000_000.0;
                thread::sleep(Duration::from_micros(micros as u64));
                self.fill(buf);
                buf.len()
            }
        }
    }
}

/// Interleaved reference input at its own rate, optionally offset a few
/// hundred ppm from nominal to model a free-running source clock.
pub struct SimReferenceInput {
    rate_hz: f64,
    sample_clock: u64,
}

impl SimReferenceInput {
    pub fn new(rate_hz: u32, offset_ppm: i32) -> Self {
        Self {
            rate_hz: rate_hz as f64 * (1.0 + offset_ppm as f64 * 1e-6),
            sample_clock: 0,
        }
    }
}

impl CaptureSource for SimReferenceInput {
    fn receive(&mut self, buf: &mut [i32], _timeout: Timeout) -> usize {
        for (i, pair) in buf.chunks_exact_mut(PIPELINE_CHANNELS).enumerate() {
            let t = (self.sample_clock + i as u64) as f64 / self.rate_hz;
            let s = (0.2 * SAMPLE_FULL_SCALE * (std::f64::consts::TAU * 1000.0 * t).sin()) as i32;
            pair[0] = s;
            pair[1] = -s;
        }
        self.sample_clock += (buf.len() / PIPELINE_CHANNELS) as u64;
        buf.len()
    }
}

/// Pipeline output: counts what arrives and discards it.
pub struct SimLineOut {
    delivered_samples: Arc<AtomicU64>,
}

impl SimLineOut {
    pub fn new() -> (Self, Arc<AtomicU64>) {
        let delivered = Arc::new(AtomicU64::new(0));
        (Self { delivered_samples: delivered.clone() }, delivered)
    }
}

impl OutputSink for SimLineOut {
    fn transmit(&mut self, buf: &[i32], _timeout: Timeout) -> usize {
        self.delivered_samples.fetch_add(buf.len() as u64, Ordering::Relaxed);
        buf.len()
    }

    fn level(&self) -> usize {
        0
    }

    fn capacity(&self) -> usize {
        usize::MAX
    }
}

/// Ring-buffered send buffer with a bus gate.
///
/// A bus thread clocks samples out in real time while the gate is open,
/// whether or not the host keeps queuing; while the gate is closed the
/// buffer holds its level. Draining therefore makes progress even when
/// every arriving packet is being discarded upstream.
pub struct SimSendBuffer {
    prod: HeapProd<i32>,
    level: Arc<AtomicUsize>,
    gate_open: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    capacity: usize,
}

impl SimSendBuffer {
    /// `capacity` is in samples; the bus consumes `channels * rate_hz`
    /// samples per second while the gate is open, fractional samples
    /// carried between service intervals.
    pub fn new(capacity: usize, channels: usize, rate_hz: u32) -> Result<Self> {
        let (prod, mut cons) = HeapRb::<i32>::new(capacity).split();
        let level = Arc::new(AtomicUsize::new(0));
        let gate_open = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let l = level.clone();
        let g = gate_open.clone();
        let s = stop.clone();
        let thread = thread::Builder::new()
            .name("driftmic-bus".into())
            .spawn(move || {
                let per_interval = channels as f64 * rate_hz as f64 / 1000.0;
                let mut carry = 0.0f64;
                let mut scratch = [0i32; 256];
                while !s.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(1));
                    if !g.load(Ordering::Relaxed) {
                        carry = 0.0;
                        continue;
                    }
                    let exact = per_interval + carry;
                    let mut due = exact.floor() as usize;
                    carry = exact - due as f64;
                    while due > 0 {
                        let take = due.min(scratch.len());
                        let popped = cons.pop_slice(&mut scratch[..take]);
                        if popped == 0 {
                            break;
                        }
                        l.fetch_sub(popped, Ordering::Relaxed);
                        due -= popped;
                    }
                }
            })?;

        Ok(Self {
            prod,
            level,
            gate_open,
            stop,
            thread: Some(thread),
            capacity,
        })
    }
}

impl OutputSink for SimSendBuffer {
    fn transmit(&mut self, buf: &[i32], _timeout: Timeout) -> usize {
        // Claimed before publishing; the level mirror never understates
        // what the bus may already have consumed.
        self.level.fetch_add(buf.len(), Ordering::Relaxed);
        let pushed = self.prod.push_slice(buf);
        if pushed < buf.len() {
            self.level.fetch_sub(buf.len() - pushed, Ordering::Relaxed);
        }
        pushed
    }

    fn level(&self) -> usize {
        self.level.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn set_gate_open(&mut self, open: bool) {
        self.gate_open.store(open, Ordering::Relaxed);
    }
}

impl Drop for SimSendBuffer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Clock generator double: announces what the controller writes.
#[derive(Default)]
pub struct SimClockGenerator;

impl ClockGenerator for SimClockGenerator {
    fn set_numerator(&mut self, numerator: i32) {
        log::info!("pll numerator -> {}", numerator);
    }
}

/// Free-running edge counter stepping a fixed count per reading.
pub struct SimEdgeCounter {
    value: u32,
    step: u32,
}

impl SimEdgeCounter {
    /// `edges_per_frame` is how far the counter moves between successive
    /// reads, i.e. per pipeline frame.
    pub fn new(start: u32, edges_per_frame: u32) -> Self {
        Self { value: start, step: edges_per_frame }
    }
}

impl EdgeCounter for SimEdgeCounter {
    fn trigger_time(&mut self) -> u32 {
        let v = self.value;
        self.value = self.value.wrapping_add(self.step);
        v
    }
}

/// Drives timing events at the transport's service interval from a thread,
/// with the payload rate offset by `offset_ppm`. Fractional bytes carry
/// between intervals so the long-run average hits the offset exactly.
pub struct SimUsbHost {
    thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl SimUsbHost {
    pub fn start(
        producer: ClockEventProducer,
        nominal_bytes_per_interval: u32,
        offset_ppm: i32,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let s = stop.clone();
        let thread = thread::Builder::new()
            .name("driftmic-usb".into())
            .spawn(move || {
                let per_interval =
                    nominal_bytes_per_interval as f64 * (1.0 + offset_ppm as f64 * 1e-6);
                let mut carry = 0.0f64;
                let mut timestamp = 0u32;
                while !s.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(1));
                    let exact = per_interval + carry;
                    let length = exact.floor() as usize;
                    carry = exact - length as f64;
                    producer.submit(ClockEvent {
                        timestamp,
                        endpoint: USB_AUDIO_ENDPOINT,
                        direction: TransferDirection::Out,
                        length,
                    });
                    // 100 MHz reference timer, 1 ms service interval.
                    timestamp = timestamp.wrapping_add(100_000);
                }
            })?;
        Ok(Self { thread: Some(thread), stop })
    }

    /// Stops the event stream and joins the thread, disconnecting the
    /// producer so the controller can wind down.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
