//! Mixing engine for mixdown - voices, transform chain, and mixer
//!
//! This crate provides the real-time mixing pipeline:
//! - Session: owns the voices, the output stream and the slide worker
//! - Voice: one playing sound with its own attributes and DSP state
//! - Chain: remap, resample, pitch correction, pan and gain per voice
//! - Mixer: the period routine that sums every playing voice
//! - Pitch: phase vocoder that keeps pitch steady while rate changes

mod attribute;
mod chain;
mod device;
mod dsp;
mod error;
mod mixer;
mod registry;
mod session;
mod slide;
mod source;
mod voice;
pub mod pitch;

pub use attribute::{AttributeKind, AttributeValue, MAX_RATE, MIN_RATE};
pub use chain::{RenderParams, TransformChain};
pub use dsp::{ChannelRemap, LinearResampler, Panner, MAX_SOURCE_CHANNELS};
pub use error::{AudioError, ErrorKind, Result, SourceError};
pub use mixer::Mixer;
pub use pitch::{FftSize, PitchCorrector};
pub use registry::{PostMixCallback, VoiceHandle};
pub use session::{DeviceInfo, OutputChannels, SampleFormat, Session, SessionConfig};
pub use slide::{SlideHandle, SlideOutcome};
pub use source::{PcmSource, Source, SourceRead};
pub use voice::{VoiceCallback, VoiceStatus};
