//! Numeric conversions shared by the audio path.

use std::time::Duration;

/// Lossy conversion to `f32`.
///
/// Sample arithmetic mixes integer sample values, frame counts and gains.
/// This trait makes the intentional precision loss explicit at call sites
/// instead of scattering `as` casts.
pub trait ToF32 {
    fn to_f32_lossy(self) -> f32;
}

impl ToF32 for i16 {
    #[inline]
    fn to_f32_lossy(self) -> f32 {
        f32::from(self)
    }
}

impl ToF32 for u32 {
    #[inline]
    #[expect(clippy::cast_precision_loss)]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

impl ToF32 for u64 {
    #[inline]
    #[expect(clippy::cast_precision_loss)]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

/// Converts a duration into milliseconds, saturating at `u64::MAX`.
#[must_use]
pub fn as_millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Number of whole frames that play in `duration` at `sample_rate`.
#[must_use]
pub fn frames_in(duration: Duration, sample_rate: u32) -> u64 {
    let frames = duration.as_nanos() * u128::from(sample_rate) / 1_000_000_000;
    u64::try_from(frames).unwrap_or(u64::MAX)
}
