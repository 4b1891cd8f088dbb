//! Sample-rate converter kernels.
//!
//! The pipeline drives kernels through [`AsrcKernel`] and never assumes a
//! particular algorithm. [`LinearAsrc`] is the built-in implementation: a
//! streaming linear interpolator with exact sample accounting. A polyphase
//! filter-bank kernel drops in behind the same trait; such kernels size
//! their inter-stage working area as
//! [`ASRC_STACK_LENGTH_MULT`](crate::constants::ASRC_STACK_LENGTH_MULT)
//! times the block length and bind it at construction.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::constants::ASRC_STACK_LENGTH_MULT;
use crate::rate::SampleRate;

/// Whether the kernel dithers when requantizing to the output width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DitherMode {
    Off,
    On,
}

/// Everything a kernel needs to bind its state for one rate pair.
#[derive(Debug, Clone, Copy)]
pub struct AsrcProfile {
    pub input: SampleRate,
    pub output: SampleRate,
    /// Channels handled by one kernel instance. The stock kernels are
    /// single-channel; multi-channel streams run one instance per channel.
    pub channels: usize,
    /// Samples per channel consumed by each `process` call.
    pub block_length: usize,
    pub dither: DitherMode,
}

impl AsrcProfile {
    /// Nominal input:output ratio in Q16.16 for this rate pair.
    pub fn nominal_fs_ratio(&self) -> u32 {
        (((self.input.hz() as u64) << 16) / self.output.hz() as u64) as u32
    }

    /// Upper bound on samples one `process` call can produce, used to size
    /// output staging. Never less than the kernel working-area contract of
    /// [`ASRC_STACK_LENGTH_MULT`] blocks, so staging cannot undercut what a
    /// kernel is allowed to fill.
    pub fn max_block_output(&self) -> usize {
        let nominal = (self.block_length as u64 * self.output.hz() as u64)
            .div_ceil(self.input.hz() as u64) as usize;
        (nominal + 1).max(self.block_length * ASRC_STACK_LENGTH_MULT)
    }
}

/// A streaming sample-rate converter bound to one rate pair.
///
/// `process` consumes exactly one input block and returns how many samples
/// it wrote to `output`. The count varies by a sample or two around the
/// nominal ratio from call to call; callers must account for every sample
/// reported rather than assuming a fixed count.
pub trait AsrcKernel: Send {
    /// The ratio reported at bind time, Q16.16 input:output.
    fn nominal_fs_ratio(&self) -> u32;

    /// Converts one block at the given ratio. `fs_ratio` is normally the
    /// nominal value; a rate servo may trim it a few hundred ppm either way.
    fn process(&mut self, input: &[i32], output: &mut [i32], fs_ratio: u32) -> usize;
}

/// Builds one kernel instance. Each resampler channel calls the factory
/// once, from its own thread, so kernel state is never shared.
pub type KernelFactory = Arc<dyn Fn() -> Result<Box<dyn AsrcKernel>> + Send + Sync>;

/// Returns a factory producing [`LinearAsrc`] kernels for `profile`.
pub fn linear_kernel_factory(profile: AsrcProfile) -> KernelFactory {
    Arc::new(move || {
        let kernel = LinearAsrc::new(&profile)?;
        Ok(Box::new(kernel) as Box<dyn AsrcKernel>)
    })
}

/// Linear-interpolation rate converter.
///
/// Tracks a Q16.16 phase through the input stream and emits one sample per
/// `fs_ratio` step, interpolating between adjacent input samples. One sample
/// of history carries the interpolation across block boundaries, so the
/// output is a continuous stream with no seams at block edges.
pub struct LinearAsrc {
    nominal_fs_ratio: u32,
    block_length: usize,
    /// Q16.16 position into the current block, always `< fs_ratio` on entry.
    phase: u64,
    /// Last sample of the previous block.
    history: i32,
}

impl LinearAsrc {
    pub fn new(profile: &AsrcProfile) -> Result<Self> {
        if profile.channels != 1 {
            bail!(
                "linear ASRC is single-channel, got {} channels per instance",
                profile.channels
            );
        }
        if profile.block_length == 0 {
            bail!("ASRC block length must be non-zero");
        }
        Ok(Self {
            nominal_fs_ratio: profile.nominal_fs_ratio(),
            block_length: profile.block_length,
            phase: 0,
            history: 0,
        })
    }
}

impl AsrcKernel for LinearAsrc {
    fn nominal_fs_ratio(&self) -> u32 {
        self.nominal_fs_ratio
    }

    fn process(&mut self, input: &[i32], output: &mut [i32], fs_ratio: u32) -> usize {
        debug_assert_eq!(input.len(), self.block_length, "input must be one block");
        let step = fs_ratio as u64;
        let limit = (input.len() as u64) << 16;
        let mut produced = 0;
        while self.phase < limit {
            let idx = (self.phase >> 16) as usize;
            let frac = (self.phase & 0xFFFF) as i64;
            let s0 = if idx == 0 { self.history } else { input[idx - 1] } as i64;
            let s1 = input[idx] as i64;
            output[produced] = (s0 + (((s1 - s0) * frac) >> 16)) as i32;
            produced += 1;
            self.phase += step;
        }
        self.phase -= limit;
        self.history = input[input.len() - 1];
        produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ASRC_BLOCK_LENGTH;

    fn profile(input: SampleRate, output: SampleRate) -> AsrcProfile {
        AsrcProfile {
            input,
            output,
            channels: 1,
            block_length: ASRC_BLOCK_LENGTH,
            dither: DitherMode::Off,
        }
    }

    #[test]
    fn test_nominal_ratio_is_q16() {
        let p = profile(SampleRate::Hz96000, SampleRate::Hz48000);
        assert_eq!(p.nominal_fs_ratio(), 2 << 16, "96k to 48k is exactly 2.0");

        let p = profile(SampleRate::Hz48000, SampleRate::Hz48000);
        assert_eq!(p.nominal_fs_ratio(), 1 << 16, "same-rate pair is exactly 1.0");
    }

    #[test]
    fn test_multi_channel_instance_is_rejected() {
        let mut p = profile(SampleRate::Hz96000, SampleRate::Hz48000);
        p.channels = 2;
        assert!(LinearAsrc::new(&p).is_err(), "kernel instances are per-channel");
    }

    #[test]
    fn test_sample_accounting_is_exact() {
        let p = profile(SampleRate::Hz96000, SampleRate::Hz48000);
        let mut asrc = LinearAsrc::new(&p).unwrap();
        let ratio = asrc.nominal_fs_ratio();
        let input: Vec<i32> = (0..ASRC_BLOCK_LENGTH as i32).collect();
        let mut output = vec![0i32; p.max_block_output()];

        let mut total = 0usize;
        let blocks = 64;
        for _ in 0..blocks {
            let n = asrc.process(&input, &mut output, ratio);
            let nominal = ASRC_BLOCK_LENGTH / 2;
            assert!(
                n.abs_diff(nominal) <= 1,
                "per-block output {} strays more than one sample from nominal {}",
                n,
                nominal
            );
            total += n;
        }
        let expected = blocks * ASRC_BLOCK_LENGTH / 2;
        assert!(
            total.abs_diff(expected) <= 1,
            "cumulative output {} must track input within one sample of {}",
            total,
            expected
        );
    }

    #[test]
    fn test_trimmed_ratio_shifts_output_count() {
        let p = profile(SampleRate::Hz96000, SampleRate::Hz48000);
        let mut asrc = LinearAsrc::new(&p).unwrap();
        // +1000 ppm input clock: each output sample steps a hair further
        // through the input, so fewer samples come out per block.
        let nominal = asrc.nominal_fs_ratio() as u64;
        let trimmed = (nominal + nominal / 1000) as u32;
        let input = vec![0i32; ASRC_BLOCK_LENGTH];
        let mut output = vec![0i32; p.max_block_output()];

        let mut total = 0usize;
        let blocks = 200;
        for _ in 0..blocks {
            total += asrc.process(&input, &mut output, trimmed);
        }
        let untrimmed = blocks * ASRC_BLOCK_LENGTH / 2;
        assert!(
            total < untrimmed,
            "a faster input clock must yield fewer output samples ({} >= {})",
            total,
            untrimmed
        );
        // 0.1% of 24000 samples is 24; allow rounding slack either side.
        let deficit = untrimmed - total;
        assert!(
            (20..=28).contains(&deficit),
            "deficit {} should be close to the 1000 ppm trim",
            deficit
        );
    }

    #[test]
    fn test_constant_signal_passes_through() {
        let p = profile(SampleRate::Hz88200, SampleRate::Hz48000);
        let mut asrc = LinearAsrc::new(&p).unwrap();
        let ratio = asrc.nominal_fs_ratio();
        let input = vec![0x1234_5678i32; ASRC_BLOCK_LENGTH];
        let mut output = vec![0i32; p.max_block_output()];

        // First block interpolates against zero history; skip it.
        asrc.process(&input, &mut output, ratio);
        let n = asrc.process(&input, &mut output, ratio);
        assert!(n > 0);
        for &s in &output[..n] {
            assert_eq!(s, 0x1234_5678, "a DC signal must interpolate to itself");
        }
    }

    #[test]
    fn test_upconversion_fits_staging_bound() {
        let p = profile(SampleRate::Hz44100, SampleRate::Hz192000);
        let mut asrc = LinearAsrc::new(&p).unwrap();
        let ratio = asrc.nominal_fs_ratio();
        let input = vec![0i32; ASRC_BLOCK_LENGTH];
        let mut output = vec![0i32; p.max_block_output()];
        for _ in 0..32 {
            let n = asrc.process(&input, &mut output, ratio);
            assert!(
                n <= p.max_block_output(),
                "block output {} exceeds the advertised bound {}",
                n,
                p.max_block_output()
            );
        }
    }
}
