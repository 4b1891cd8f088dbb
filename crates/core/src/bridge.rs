//! Host playback to output-bus bridging.
//!
//! Playback arrives in host-sized packets on the host's schedule and leaves
//! on the audio bus clock. The bridge owns the hand-off policy: after any
//! discontinuity (stream reopened, rate renegotiated) the send buffer is
//! run dry, then refilled to half capacity before the bus gate reopens, so
//! steady state always starts centered with equal room for drift in either
//! direction.

use crossbeam_channel::Receiver;

use crate::constants::LEVEL_AVG_WINDOW;
use crate::device::{OutputSink, Timeout};

/// Windowed average of the send-buffer level.
///
/// Accumulates [`LEVEL_AVG_WINDOW`] readings, then publishes their mean and
/// starts over. The published average is what a rate servo or an operator
/// watches to judge long-term drift; block-to-block wobble cancels out.
#[derive(Default)]
pub struct LevelMonitor {
    accumulated: i64,
    count: u32,
    average: i32,
    previous: i32,
}

impl LevelMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one reading; `reset` restarts the window and zeroes both
    /// published averages, for use while the stream is not steady. Returns
    /// the current published average.
    pub fn update(&mut self, level: i32, reset: bool) -> i32 {
        if reset {
            self.accumulated = 0;
            self.count = 0;
            self.average = 0;
            self.previous = 0;
        }
        self.accumulated += level as i64;
        self.count += 1;
        if self.count == LEVEL_AVG_WINDOW {
            self.previous = self.average;
            self.average = (self.accumulated >> 16) as i32;
            self.accumulated = 0;
            self.count = 0;
            log::debug!(
                "send buffer level average {} (previous {})",
                self.average,
                self.previous
            );
        }
        self.average
    }

    pub fn average(&self) -> i32 {
        self.average
    }

    pub fn previous(&self) -> i32 {
        self.previous
    }
}

/// Where the bridge is in the drain-prime-send cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputGate {
    /// Letting stale audio clock out; incoming blocks are discarded.
    Draining,
    /// Bus gate closed, refilling toward half capacity.
    Priming,
    /// Steady state.
    Sending,
}

/// One interleaved playback packet with its stream context.
pub struct PlaybackBlock {
    pub samples: Vec<i32>,
    /// The host's current nominal rate for this stream.
    pub rate_hz: u32,
    /// True on the first packet after the host reopened the interface.
    pub interface_reopened: bool,
}

pub struct PlaybackBridge {
    sink: Box<dyn OutputSink>,
    gate: OutputGate,
    monitor: LevelMonitor,
    channels: usize,
    stream_rate_hz: u32,
}

impl PlaybackBridge {
    pub fn new(mut sink: Box<dyn OutputSink>, channels: usize, nominal_rate_hz: u32) -> Self {
        // Nothing queued at construction; hold the bus gate until primed.
        sink.set_gate_open(false);
        Self {
            sink,
            gate: OutputGate::Priming,
            monitor: LevelMonitor::new(),
            channels: channels.max(1),
            stream_rate_hz: nominal_rate_hz,
        }
    }

    pub fn gate(&self) -> OutputGate {
        self.gate
    }

    /// Published send-buffer level average, samples per channel relative to
    /// half capacity.
    pub fn average_level(&self) -> i32 {
        self.monitor.average()
    }

    /// Feeds one playback packet through the gate policy.
    pub fn handle_block(&mut self, samples: &[i32], rate_hz: u32, interface_reopened: bool) {
        if samples.is_empty() {
            return;
        }
        if interface_reopened {
            self.rearm("stream reopened");
        }
        if rate_hz != self.stream_rate_hz {
            self.rearm("stream rate changed");
            self.stream_rate_hz = rate_hz;
        }

        if self.gate == OutputGate::Draining {
            if self.sink.level() > 0 {
                // Keep the bus clocking so the stale audio leaves; this
                // packet is sacrificed to the discontinuity.
                self.sink.set_gate_open(true);
                return;
            }
            self.sink.set_gate_open(false);
            self.gate = OutputGate::Priming;
            log::debug!("send buffer drained, priming");
        }

        let sent = self.sink.transmit(samples, Timeout::Forever);
        assert_eq!(sent, samples.len(), "output sink dropped playback samples");

        let level = self.sink.level() as i64;
        let from_half = level - (self.sink.capacity() / 2) as i64;
        let per_channel = (from_half / self.channels as i64) as i32;
        self.monitor.update(per_channel, self.gate == OutputGate::Priming);

        if self.gate == OutputGate::Priming && from_half >= 0 {
            log::info!("send buffer primed to half capacity, output resumed");
            self.sink.set_gate_open(true);
            self.gate = OutputGate::Sending;
        }
    }

    /// Consumes packets until the producer disconnects.
    pub fn run(mut self, rx: Receiver<PlaybackBlock>) {
        for block in rx.iter() {
            self.handle_block(&block.samples, block.rate_hz, block.interface_reopened);
        }
    }

    fn rearm(&mut self, reason: &str) {
        if self.gate != OutputGate::Draining {
            log::info!("draining send buffer: {}", reason);
            self.gate = OutputGate::Draining;
        }
    }
}
