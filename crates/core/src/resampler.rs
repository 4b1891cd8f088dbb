//! Per-channel resampler units and the dual-channel coordinator.
//!
//! Stereo rate conversion runs the two channels in parallel: the secondary
//! channel is handed to a dedicated worker thread while the calling thread
//! converts the primary channel, then both results are collected before the
//! frame advances. The hand-off uses single-slot channels, so the worker is
//! always exactly one block behind its dispatcher and the two channels can
//! never drift apart by more than the block in flight.

use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::kernel::{AsrcKernel, AsrcProfile, KernelFactory};

/// One channel's rate converter: a kernel instance plus the ratio it
/// reported at bind time.
pub struct ResamplerUnit {
    kernel: Box<dyn AsrcKernel>,
    nominal_fs_ratio: u32,
}

impl ResamplerUnit {
    pub fn new(factory: &KernelFactory) -> Result<Self> {
        let kernel = factory()?;
        let nominal_fs_ratio = kernel.nominal_fs_ratio();
        log::debug!("resampler unit ready, nominal fs ratio {:#010x}", nominal_fs_ratio);
        Ok(Self { kernel, nominal_fs_ratio })
    }

    pub fn nominal_fs_ratio(&self) -> u32 {
        self.nominal_fs_ratio
    }

    pub fn process(&mut self, input: &[i32], output: &mut [i32], fs_ratio: u32) -> usize {
        self.kernel.process(input, output, fs_ratio)
    }
}

/// One block travelling to the secondary-channel worker and back. The same
/// buffers shuttle back and forth, so steady state allocates nothing.
struct WorkBlock {
    input: Vec<i32>,
    output: Vec<i32>,
    fs_ratio: u32,
    produced: usize,
}

/// Runs both channels of a stereo stream through per-channel kernels in
/// lockstep.
///
/// The two kernels are built from the same factory but are fully independent
/// instances; each owns its own filter state, so channel history never
/// crosses over. Identical ratios are stamped on both channels every block,
/// and a block where the channels report different output counts is
/// unrecoverable: the stream would be corrupt from that sample on, so the
/// coordinator halts instead of re-aligning.
///
/// Dropping the coordinator disconnects the worker and joins it.
pub struct DualResampleCoordinator {
    primary: ResamplerUnit,
    fs_ratio: u32,
    block_length: usize,
    shuttle: Option<WorkBlock>,
    work_tx: Option<Sender<WorkBlock>>,
    done_rx: Receiver<WorkBlock>,
    worker: Option<JoinHandle<()>>,
}

impl DualResampleCoordinator {
    /// Builds the primary unit on the calling thread and a secondary unit on
    /// its own worker thread, both from `factory`.
    pub fn spawn(profile: &AsrcProfile, factory: KernelFactory) -> Result<Self> {
        let primary = ResamplerUnit::new(&factory)?;
        let fs_ratio = primary.nominal_fs_ratio();

        let (work_tx, work_rx) = bounded::<WorkBlock>(1);
        let (done_tx, done_rx) = bounded::<WorkBlock>(1);
        let worker_factory = factory.clone();
        let worker = thread::Builder::new()
            .name("driftmic-asrc1".into())
            .spawn(move || secondary_channel_loop(worker_factory, work_rx, done_tx))
            .context("spawning secondary resampler thread")?;

        let shuttle = WorkBlock {
            input: vec![0; profile.block_length],
            output: vec![0; profile.max_block_output()],
            fs_ratio,
            produced: 0,
        };

        Ok(Self {
            primary,
            fs_ratio,
            block_length: profile.block_length,
            shuttle: Some(shuttle),
            work_tx: Some(work_tx),
            done_rx,
            worker: Some(worker),
        })
    }

    /// The ratio both channels are currently driven at, Q16.16.
    pub fn fs_ratio(&self) -> u32 {
        self.fs_ratio
    }

    pub fn nominal_fs_ratio(&self) -> u32 {
        self.primary.nominal_fs_ratio()
    }

    /// Trims the conversion ratio. Takes effect on the next block, on both
    /// channels at once.
    pub fn set_fs_ratio(&mut self, fs_ratio: u32) {
        self.fs_ratio = fs_ratio;
    }

    /// Converts one block of each channel and returns the per-channel output
    /// count. Output slices must hold at least
    /// [`AsrcProfile::max_block_output`] samples.
    pub fn process_block(
        &mut self,
        primary_in: &[i32],
        secondary_in: &[i32],
        primary_out: &mut [i32],
        secondary_out: &mut [i32],
    ) -> usize {
        debug_assert_eq!(primary_in.len(), self.block_length);
        debug_assert_eq!(secondary_in.len(), self.block_length);

        let mut block = match self.shuttle.take() {
            Some(block) => block,
            None => unreachable!("work block is parked between process_block calls"),
        };
        block.input.copy_from_slice(secondary_in);
        block.fs_ratio = self.fs_ratio;
        block.produced = 0;

        let dispatched = match &self.work_tx {
            Some(tx) => tx.send(block).is_ok(),
            None => false,
        };
        if !dispatched {
            log::error!("secondary resampler worker is gone");
            panic!("secondary resampler thread terminated");
        }

        let produced = self.primary.process(primary_in, primary_out, self.fs_ratio);

        let block = match self.done_rx.recv() {
            Ok(block) => block,
            Err(_) => {
                log::error!("secondary resampler worker is gone");
                panic!("secondary resampler thread terminated");
            }
        };
        if block.produced != produced {
            log::error!(
                "resampler channels desynchronized: primary produced {}, secondary {}",
                produced,
                block.produced
            );
            panic!("resampler channels desynchronized");
        }
        secondary_out[..produced].copy_from_slice(&block.output[..produced]);
        self.shuttle = Some(block);
        produced
    }
}

impl Drop for DualResampleCoordinator {
    fn drop(&mut self) {
        // Disconnect first so the worker's receive loop ends.
        self.work_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn secondary_channel_loop(
    factory: KernelFactory,
    work_rx: Receiver<WorkBlock>,
    done_tx: Sender<WorkBlock>,
) {
    let mut unit = match ResamplerUnit::new(&factory) {
        Ok(unit) => unit,
        Err(err) => {
            log::error!("secondary resampler init failed: {:#}", err);
            panic!("secondary resampler init failed");
        }
    };
    for mut block in work_rx.iter() {
        block.produced = unit.process(&block.input, &mut block.output, block.fs_ratio);
        if done_tx.send(block).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::constants::ASRC_BLOCK_LENGTH;
    use crate::kernel::{linear_kernel_factory, DitherMode, LinearAsrc};
    use crate::rate::SampleRate;

    fn profile() -> AsrcProfile {
        AsrcProfile {
            input: SampleRate::Hz96000,
            output: SampleRate::Hz48000,
            channels: 1,
            block_length: ASRC_BLOCK_LENGTH,
            dither: DitherMode::Off,
        }
    }

    fn ramp(seed: i32) -> Vec<i32> {
        (0..ASRC_BLOCK_LENGTH as i32).map(|i| seed + i * 3).collect()
    }

    #[test]
    fn test_channels_stay_in_lockstep() {
        let p = profile();
        let mut coord = DualResampleCoordinator::spawn(&p, linear_kernel_factory(p)).unwrap();
        let mut out0 = vec![0i32; p.max_block_output()];
        let mut out1 = vec![0i32; p.max_block_output()];

        // A standalone kernel fed the secondary stream must agree exactly
        // with what comes back from the worker.
        let mut solo = LinearAsrc::new(&p).unwrap();
        let mut solo_out = vec![0i32; p.max_block_output()];

        for block in 0..32 {
            let in0 = ramp(block);
            let in1 = ramp(1000 + block * 7);
            let n = coord.process_block(&in0, &in1, &mut out0, &mut out1);
            let n_solo = solo.process(&in1, &mut solo_out, coord.fs_ratio());
            assert_eq!(n, n_solo, "block {}: counts must match a standalone kernel", block);
            assert_eq!(
                &out1[..n],
                &solo_out[..n_solo],
                "block {}: secondary channel must be deterministic",
                block
            );
        }
    }

    #[test]
    fn test_identical_inputs_produce_identical_outputs() {
        let p = profile();
        let mut coord = DualResampleCoordinator::spawn(&p, linear_kernel_factory(p)).unwrap();
        let mut out0 = vec![0i32; p.max_block_output()];
        let mut out1 = vec![0i32; p.max_block_output()];
        for block in 0..16 {
            let input = ramp(block * 11);
            let n = coord.process_block(&input, &input, &mut out0, &mut out1);
            assert_eq!(&out0[..n], &out1[..n], "independent kernels fed the same input must agree");
        }
    }

    #[test]
    fn test_ratio_trim_applies_to_both_channels() {
        let p = profile();
        let mut coord = DualResampleCoordinator::spawn(&p, linear_kernel_factory(p)).unwrap();
        let nominal = coord.nominal_fs_ratio() as u64;
        coord.set_fs_ratio((nominal + nominal / 1000) as u32);

        let mut out0 = vec![0i32; p.max_block_output()];
        let mut out1 = vec![0i32; p.max_block_output()];
        let input = ramp(0);
        let mut total = 0;
        for _ in 0..100 {
            total += coord.process_block(&input, &input, &mut out0, &mut out1);
        }
        assert!(
            total < 100 * ASRC_BLOCK_LENGTH / 2,
            "trimming the ratio up must reduce output on both channels together"
        );
    }

    /// Produces a fixed sample count per block, configurable per instance.
    struct FixedCountKernel {
        count: usize,
    }

    impl AsrcKernel for FixedCountKernel {
        fn nominal_fs_ratio(&self) -> u32 {
            1 << 16
        }

        fn process(&mut self, _input: &[i32], output: &mut [i32], _fs_ratio: u32) -> usize {
            output[..self.count].fill(0);
            self.count
        }
    }

    #[test]
    #[should_panic(expected = "resampler channels desynchronized")]
    fn test_mismatched_output_counts_are_fatal() {
        let p = profile();
        // First build (primary) yields 120 samples per block, second build
        // (worker) yields 121. The first processed block must halt.
        let builds = Arc::new(AtomicUsize::new(0));
        let factory: KernelFactory = Arc::new(move || {
            let nth = builds.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FixedCountKernel { count: 120 + nth }) as Box<dyn AsrcKernel>)
        });
        let mut coord = DualResampleCoordinator::spawn(&p, factory).unwrap();
        let input = vec![0i32; ASRC_BLOCK_LENGTH];
        let mut out0 = vec![0i32; p.max_block_output()];
        let mut out1 = vec![0i32; p.max_block_output()];
        coord.process_block(&input, &input, &mut out0, &mut out1);
    }

    #[test]
    #[should_panic(expected = "secondary resampler thread terminated")]
    fn test_dead_worker_is_fatal() {
        let p = profile();
        // The worker's kernel build fails, so the worker goes down before
        // the first block; dispatch must halt rather than continue mono.
        let builds = Arc::new(AtomicUsize::new(0));
        let factory: KernelFactory = Arc::new(move || {
            if builds.fetch_add(1, Ordering::SeqCst) == 0 {
                let p = profile();
                Ok(Box::new(LinearAsrc::new(&p)?) as Box<dyn AsrcKernel>)
            } else {
                anyhow::bail!("no filter table for this rate pair")
            }
        });
        let mut coord = DualResampleCoordinator::spawn(&p, factory).unwrap();
        let input = vec![0i32; ASRC_BLOCK_LENGTH];
        let mut out0 = vec![0i32; p.max_block_output()];
        let mut out1 = vec![0i32; p.max_block_output()];
        // Either the dispatch or the collect side sees the disconnect,
        // depending on how far the worker got before its panic.
        coord.process_block(&input, &input, &mut out0, &mut out1);
    }
}
