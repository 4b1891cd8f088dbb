//! The closed set of supported sample rates and their converter codes.

use std::fmt;

/// Rate-converter configuration code.
///
/// Discriminants index the kernel's filter tables, ordered by ascending
/// rate. The numeric values are part of the kernel contract and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RateCode {
    Fs44 = 0,
    Fs48 = 1,
    Fs88 = 2,
    Fs96 = 3,
    Fs176 = 4,
    Fs192 = 5,
}

/// A sample rate the front-end supports.
///
/// Anything outside this set is a configuration error caught at setup, never
/// a runtime condition. Use [`SampleRate::try_from`] to validate an integer
/// rate from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleRate {
    Hz44100,
    Hz48000,
    Hz88200,
    Hz96000,
    Hz176400,
    Hz192000,
}

impl SampleRate {
    /// Every supported rate, ascending.
    pub const ALL: [SampleRate; 6] = [
        SampleRate::Hz44100,
        SampleRate::Hz48000,
        SampleRate::Hz88200,
        SampleRate::Hz96000,
        SampleRate::Hz176400,
        SampleRate::Hz192000,
    ];

    pub fn hz(self) -> u32 {
        match self {
            SampleRate::Hz44100 => 44_100,
            SampleRate::Hz48000 => 48_000,
            SampleRate::Hz88200 => 88_200,
            SampleRate::Hz96000 => 96_000,
            SampleRate::Hz176400 => 176_400,
            SampleRate::Hz192000 => 192_000,
        }
    }

    /// The converter code for this rate.
    pub fn code(self) -> RateCode {
        match self {
            SampleRate::Hz44100 => RateCode::Fs44,
            SampleRate::Hz48000 => RateCode::Fs48,
            SampleRate::Hz88200 => RateCode::Fs88,
            SampleRate::Hz96000 => RateCode::Fs96,
            SampleRate::Hz176400 => RateCode::Fs176,
            SampleRate::Hz192000 => RateCode::Fs192,
        }
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.hz())
    }
}

/// Error returned when an integer rate is not in the supported set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedRate(pub u32);

impl fmt::Display for UnsupportedRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported sample rate {} Hz", self.0)
    }
}

impl std::error::Error for UnsupportedRate {}

impl TryFrom<u32> for SampleRate {
    type Error = UnsupportedRate;

    fn try_from(hz: u32) -> Result<Self, UnsupportedRate> {
        SampleRate::ALL
            .into_iter()
            .find(|r| r.hz() == hz)
            .ok_or(UnsupportedRate(hz))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_table_order() {
        let codes: Vec<u8> = SampleRate::ALL.iter().map(|r| r.code() as u8).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 5], "codes must stay in table order");
    }

    #[test]
    fn test_supported_rates_round_trip() {
        for rate in SampleRate::ALL {
            let parsed = SampleRate::try_from(rate.hz());
            assert_eq!(parsed, Ok(rate), "rate {} should parse back", rate.hz());
        }
    }

    #[test]
    fn test_unsupported_rates_are_rejected() {
        for hz in [0u32, 8_000, 16_000, 22_050, 32_000, 47_999, 384_000] {
            let parsed = SampleRate::try_from(hz);
            assert_eq!(parsed, Err(UnsupportedRate(hz)), "{} Hz must be rejected", hz);
        }
    }
}
