//! Clock recovery from transport timing events.
//!
//! The playback host and the audio master clock free-run against each
//! other. Every audio transfer completion is reported here with a timestamp
//! and payload size; a rate estimator turns that stream into the host's
//! effective rate, and the controller retunes the fractional-N clock
//! generator whenever the required numerator actually changes. Events are
//! handed over through a single-slot channel: the producer runs in the
//! transport's callback context and must never block, and a full slot means
//! the controller missed a whole service interval, after which the clocks
//! are adrift with no way to know by how much.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::device::ClockGenerator;

/// Endpoint whose traffic carries the audio timing signal.
pub const USB_AUDIO_ENDPOINT: u8 = 0x01;

const PLL_NUMERATOR_SCALE: i64 = 102_400;
const PLL_NUMERATOR_OFFSET: i64 = 102_251;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Host to device: playback data, the direction that paces the clock.
    Out,
    In,
}

/// One transfer-complete notification from the transport.
#[derive(Debug, Clone, Copy)]
pub struct ClockEvent {
    /// Completion time in reference-timer ticks; wraps freely.
    pub timestamp: u32,
    pub endpoint: u8,
    pub direction: TransferDirection,
    /// Payload bytes moved by this transfer.
    pub length: usize,
}

/// Estimates the far clock's rate from the event stream, as a Q31 fraction
/// of nominal (`1 << 31` is exactly nominal).
pub trait RateEstimator: Send {
    fn data_rate(&mut self, event: &ClockEvent) -> u32;
}

/// The feedback-divider numerator that makes the audio master clock track a
/// measured rate of `rate_q31` times nominal.
///
/// The master clock comes off a fractional-N PLL whose divider equation
/// resolves, for this part's fixed dividers, to `f = 102400·s − 102251`
/// with `s` the rate as a fraction of nominal. `s` arrives in Q31, so the
/// affine part is evaluated at Q31 and brought back to an integer in two
/// steps: truncate thirty bits, then halve with round-half-up.
pub fn pll_numerator(rate_q31: u32) -> i32 {
    let delta = PLL_NUMERATOR_SCALE * rate_q31 as i64 - (PLL_NUMERATOR_OFFSET << 31);
    (((delta >> 30) + 1) >> 1) as i32
}

/// Rates the stream by averaging payload sizes over a fixed window of
/// events against the nominal payload per interval. Returns the previous
/// estimate (starting at nominal) until a window completes.
pub struct WindowedRateEstimator {
    nominal_bytes: u32,
    window: u32,
    accumulated: u64,
    count: u32,
    rate: u32,
}

impl WindowedRateEstimator {
    pub fn new(nominal_bytes: u32, window: u32) -> Self {
        Self {
            nominal_bytes,
            window: window.max(1),
            accumulated: 0,
            count: 0,
            rate: 1 << 31,
        }
    }
}

impl RateEstimator for WindowedRateEstimator {
    fn data_rate(&mut self, event: &ClockEvent) -> u32 {
        self.accumulated += event.length as u64;
        self.count += 1;
        if self.count == self.window {
            let expected = self.nominal_bytes as u64 * self.window as u64;
            self.rate = ((self.accumulated << 31) / expected) as u32;
            self.accumulated = 0;
            self.count = 0;
        }
        self.rate
    }
}

/// Hands timing events to the controller from callback context.
///
/// There is exactly one producer per controller; the slot sizing depends on
/// it, so this handle is deliberately not cloneable.
pub struct ClockEventProducer {
    tx: Sender<ClockEvent>,
}

impl ClockEventProducer {
    /// Filters and enqueues one event. Never blocks. Traffic for other
    /// endpoints or directions is ignored; a full slot is fatal, because it
    /// means the previous event was never serviced and the clock is now
    /// free-running. A stopped controller is tolerated so transports can
    /// outlive it during teardown.
    pub fn submit(&self, event: ClockEvent) {
        if event.endpoint != USB_AUDIO_ENDPOINT || event.direction != TransferDirection::Out {
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::error!("clock recovery missed a timing event deadline");
                panic!("clock recovery missed a timing event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// A running clock-recovery loop.
///
/// Dropping this joins the control thread, so disconnect the producer
/// first; the thread exits when the event stream does.
pub struct ClockRecovery {
    thread: Option<JoinHandle<()>>,
    writes: Arc<AtomicU32>,
    last_numerator: Arc<AtomicI32>,
}

impl ClockRecovery {
    pub fn start(
        estimator: Box<dyn RateEstimator>,
        generator: Box<dyn ClockGenerator>,
    ) -> Result<(ClockEventProducer, ClockRecovery)> {
        let (tx, rx) = bounded::<ClockEvent>(1);
        let writes = Arc::new(AtomicU32::new(0));
        let last_numerator = Arc::new(AtomicI32::new(0));
        let w = writes.clone();
        let l = last_numerator.clone();
        let thread = thread::Builder::new()
            .name("driftmic-clock".into())
            .spawn(move || control_loop(rx, estimator, generator, w, l))
            .context("spawning clock recovery thread")?;
        Ok((
            ClockEventProducer { tx },
            ClockRecovery {
                thread: Some(thread),
                writes,
                last_numerator,
            },
        ))
    }

    /// Register writes issued so far.
    pub fn numerator_writes(&self) -> u32 {
        self.writes.load(Ordering::Relaxed)
    }

    /// The numerator most recently written, or zero if none yet.
    pub fn last_numerator(&self) -> i32 {
        self.last_numerator.load(Ordering::Relaxed)
    }
}

impl Drop for ClockRecovery {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn control_loop(
    rx: Receiver<ClockEvent>,
    mut estimator: Box<dyn RateEstimator>,
    mut generator: Box<dyn ClockGenerator>,
    writes: Arc<AtomicU32>,
    last_numerator: Arc<AtomicI32>,
) {
    // The generator register is only touched when the numerator moves;
    // repeated writes of the same value would still glitch the divider on
    // some parts.
    let mut applied: Option<i32> = None;
    for event in rx.iter() {
        let rate = estimator.data_rate(&event);
        let numerator = pll_numerator(rate);
        if applied != Some(numerator) {
            generator.set_numerator(numerator);
            writes.fetch_add(1, Ordering::Relaxed);
            last_numerator.store(numerator, Ordering::Relaxed);
            log::debug!("clock numerator set to {} at rate {:#010x}", numerator, rate);
        }
        applied = Some(numerator);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    const NOMINAL: u32 = 1 << 31;

    fn out_event(length: usize) -> ClockEvent {
        ClockEvent {
            timestamp: 0,
            endpoint: USB_AUDIO_ENDPOINT,
            direction: TransferDirection::Out,
            length,
        }
    }

    #[test]
    fn test_numerator_at_nominal_rate() {
        assert_eq!(pll_numerator(NOMINAL), 149);
    }

    #[test]
    fn test_numerator_rounding_matches_closed_form() {
        // Sweep a few thousand ppm around nominal in odd steps; the shifted
        // two-step rounding must agree with round-half-up everywhere.
        let mut prev = i32::MIN;
        for ppm in (-4000i64..=4000).step_by(37) {
            let rate = (NOMINAL as i64 + NOMINAL as i64 * ppm / 1_000_000) as u32;
            let delta = PLL_NUMERATOR_SCALE * rate as i64 - (PLL_NUMERATOR_OFFSET << 31);
            let reference = ((delta + (1 << 30)) >> 31) as i32;
            let got = pll_numerator(rate);
            assert_eq!(got, reference, "rounding diverged at {} ppm", ppm);
            assert!(got >= prev, "numerator must be monotonic in rate");
            prev = got;
        }
    }

    #[test]
    fn test_numerator_slope_is_about_ten_per_hundred_ppm() {
        let fast = (NOMINAL as u64 + NOMINAL as u64 / 10_000) as u32;
        let delta = pll_numerator(fast) - pll_numerator(NOMINAL);
        assert!(
            (10..=11).contains(&delta),
            "100 ppm should move the numerator by ~10, got {}",
            delta
        );
    }

    #[test]
    fn test_estimator_tracks_payload_over_window() {
        let mut est = WindowedRateEstimator::new(192, 8);
        // Until a window completes, the estimate holds at nominal.
        for _ in 0..7 {
            assert_eq!(est.data_rate(&out_event(200)), NOMINAL);
        }
        let rate = est.data_rate(&out_event(200));
        let expected = ((200u64 * 8) << 31) / (192 * 8);
        assert_eq!(rate as u64, expected);
    }

    struct RecordingGenerator {
        written: Arc<Mutex<Vec<i32>>>,
    }

    impl ClockGenerator for RecordingGenerator {
        fn set_numerator(&mut self, numerator: i32) {
            self.written.lock().unwrap().push(numerator);
        }
    }

    /// Reports a scripted sequence of rates, one per event.
    struct ScriptedEstimator {
        rates: Vec<u32>,
        next: usize,
    }

    impl RateEstimator for ScriptedEstimator {
        fn data_rate(&mut self, _event: &ClockEvent) -> u32 {
            let rate = self.rates[self.next.min(self.rates.len() - 1)];
            self.next += 1;
            rate
        }
    }

    fn run_control_loop(rates: Vec<u32>) -> Vec<i32> {
        let written = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = bounded::<ClockEvent>(rates.len().max(1));
        for _ in 0..rates.len() {
            tx.send(out_event(192)).unwrap();
        }
        drop(tx);
        control_loop(
            rx,
            Box::new(ScriptedEstimator { rates, next: 0 }),
            Box::new(RecordingGenerator { written: written.clone() }),
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicI32::new(0)),
        );
        let written = written.lock().unwrap();
        written.clone()
    }

    #[test]
    fn test_constant_rate_writes_once() {
        let writes = run_control_loop(vec![NOMINAL; 6]);
        assert_eq!(writes, vec![149], "steady rate must touch the register once");
    }

    #[test]
    fn test_register_written_only_on_change() {
        let shifted = (NOMINAL as u64 + NOMINAL as u64 / 1000) as u32;
        let writes = run_control_loop(vec![NOMINAL, NOMINAL, shifted, shifted, NOMINAL]);
        // 1000 ppm moves the numerator by ~102.
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0], 149);
        assert!(writes[1] > 149);
        assert_eq!(writes[2], 149);
    }

    #[test]
    fn test_started_controller_services_events() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let (producer, recovery) = ClockRecovery::start(
            Box::new(WindowedRateEstimator::new(192, 1)),
            Box::new(RecordingGenerator { written: written.clone() }),
        )
        .unwrap();
        producer.submit(out_event(192));
        for _ in 0..200 {
            if recovery.numerator_writes() == 1 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(recovery.numerator_writes(), 1);
        assert_eq!(recovery.last_numerator(), 149);
        drop(producer);
        drop(recovery); // joins the control thread
        assert_eq!(written.lock().unwrap().as_slice(), &[149]);
    }

    #[test]
    fn test_unrelated_traffic_is_ignored() {
        let (tx, _rx) = bounded::<ClockEvent>(1);
        let producer = ClockEventProducer { tx };
        // None of these may land in the slot; a second enqueue would abort.
        for _ in 0..4 {
            producer.submit(ClockEvent {
                timestamp: 0,
                endpoint: 0x02,
                direction: TransferDirection::Out,
                length: 192,
            });
            producer.submit(ClockEvent {
                timestamp: 0,
                endpoint: USB_AUDIO_ENDPOINT,
                direction: TransferDirection::In,
                length: 192,
            });
        }
        producer.submit(out_event(192)); // exactly one real event fits
    }

    #[test]
    #[should_panic(expected = "missed a timing event")]
    fn test_unserviced_event_slot_is_fatal() {
        let (tx, _rx) = bounded::<ClockEvent>(1);
        let producer = ClockEventProducer { tx };
        producer.submit(out_event(192));
        producer.submit(out_event(192));
    }

    #[test]
    fn test_stopped_controller_discards_events() {
        let (tx, rx) = bounded::<ClockEvent>(1);
        drop(rx);
        let producer = ClockEventProducer { tx };
        producer.submit(out_event(192));
        producer.submit(out_event(192));
    }
}
