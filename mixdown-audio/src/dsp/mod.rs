//! Per-voice processing stages
//!
//! A voice's audio flows through these in a fixed order: channel remap,
//! resample, pitch correction (see [`crate::pitch`]), pan, then gain.
//! Every stage is pass-through when its parameters are at identity.

mod panner;
mod remap;
mod resampler;

pub use panner::Panner;
pub use remap::{ChannelRemap, MAX_SOURCE_CHANNELS};
pub use resampler::LinearResampler;

/// Scale interleaved samples in place. Unity gain leaves the block untouched.
#[inline]
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if gain == 1.0 {
        return;
    }
    for s in samples.iter_mut() {
        *s *= gain;
    }
}
