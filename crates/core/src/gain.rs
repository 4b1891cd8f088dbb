//! Automatic gain control for the capture path.

use crate::constants::SAMPLE_FULL_SCALE as FULL_SCALE;
use crate::frame::FrameMetadata;

/// RMS below this is treated as silence and never adapted on.
const SILENCE_FLOOR: f64 = 1e-6;

/// Above this correlation the frame is considered loudspeaker echo rather
/// than near-end speech, provided the reference is actually carrying signal.
const ECHO_DOMINANCE_THRESHOLD: f32 = 0.5;
const REFERENCE_ENERGY_FLOOR: f32 = 1e-4;

const MIN_GAIN: f64 = 0.125;
const MAX_GAIN: f64 = 16.0;

/// A per-frame gain stage driven by the frame's analysis metadata.
pub trait GainKernel: Send {
    /// Processes one channel-frame. `output` and `input` are the same
    /// length; passing the same slice data through a scratch copy is the
    /// caller's business.
    fn process(&mut self, output: &mut [i32], input: &[i32], metadata: &FrameMetadata);

    /// The gain currently applied, linear, for telemetry.
    fn current_gain(&self) -> f32 {
        1.0
    }
}

/// Level-tracking AGC with asymmetric smoothing.
///
/// Tracks frame RMS against a target level and slews the applied gain toward
/// the correction, fast when cutting and slow when boosting so a sudden shout
/// ducks immediately but a quiet talker fades up without pumping. Adaptation
/// only runs on frames the metadata marks as near-end voice; echo-dominant
/// and silent frames keep the current gain so loudspeaker playback cannot
/// wind the gain up or down.
pub struct GainController {
    target_level: f32,
    gain: f32,
    attack_coeff: f32,
    release_coeff: f32,
}

impl GainController {
    /// `target_level` is the desired frame RMS as a fraction of full scale.
    pub fn new(target_level: f32) -> Self {
        Self {
            target_level,
            gain: 1.0,
            attack_coeff: 0.1,
            release_coeff: 0.005,
        }
    }

    /// The gain currently applied, linear.
    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl GainKernel for GainController {
    fn current_gain(&self) -> f32 {
        self.gain
    }

    fn process(&mut self, output: &mut [i32], input: &[i32], metadata: &FrameMetadata) {
        debug_assert_eq!(output.len(), input.len());

        let mut sum_sq = 0.0f64;
        for &s in input {
            let x = s as f64 / FULL_SCALE;
            sum_sq += x * x;
        }
        let rms = (sum_sq / input.len().max(1) as f64).sqrt();

        let echo_dominant = metadata.echo_correlation > ECHO_DOMINANCE_THRESHOLD
            && metadata.reference_energy > REFERENCE_ENERGY_FLOOR;
        if metadata.voice_activity && !echo_dominant && rms > SILENCE_FLOOR {
            let desired = (self.target_level as f64 / rms).clamp(MIN_GAIN, MAX_GAIN) as f32;
            let coeff = if desired < self.gain {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.gain += (desired - self.gain) * coeff;
        }

        let limit = 0.99 * FULL_SCALE;
        for (dst, &src) in output.iter_mut().zip(input.iter()) {
            let scaled = src as f64 * self.gain as f64;
            *dst = scaled.clamp(-limit, limit) as i32;
        }
    }
}
