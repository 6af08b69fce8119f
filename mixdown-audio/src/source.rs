//! Audio sources - the cursor a voice pulls frames from

use crate::error::SourceError;
use std::sync::Arc;

/// Result of a single [`Source::read`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRead {
    /// Frames written to the output buffer
    pub frames: usize,
    /// True once the cursor sits at the end of the material
    pub at_end: bool,
}

/// Decoded audio that a voice can pull interleaved f32 frames from.
///
/// Implementations are driven from the mixer thread, so `read` must not
/// block or allocate once the source is constructed.
pub trait Source: Send {
    /// Number of interleaved channels
    fn channels(&self) -> usize;

    /// Native sample rate of the material
    fn sample_rate(&self) -> u32;

    /// Read up to `frames` frames into `output` (interleaved, `channels()` wide)
    fn read(&mut self, output: &mut [f32], frames: usize) -> Result<SourceRead, SourceError>;

    /// Move the cursor to an absolute frame index
    fn seek(&mut self, frame: u64) -> Result<(), SourceError>;

    /// Current cursor position in frames
    fn position(&self) -> u64;

    /// Total length in frames, if known
    fn frame_count(&self) -> Option<u64>;
}

impl<S: Source + ?Sized> Source for Box<S> {
    fn channels(&self) -> usize {
        (**self).channels()
    }

    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn read(&mut self, output: &mut [f32], frames: usize) -> Result<SourceRead, SourceError> {
        (**self).read(output, frames)
    }

    fn seek(&mut self, frame: u64) -> Result<(), SourceError> {
        (**self).seek(frame)
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn frame_count(&self) -> Option<u64> {
        (**self).frame_count()
    }
}

/// Raw interleaved PCM already resident in memory.
///
/// The sample data is shared, so many voices can play the same material
/// with independent cursors.
#[derive(Debug, Clone)]
pub struct PcmSource {
    samples: Arc<[f32]>,
    channels: usize,
    sample_rate: u32,
    frames: usize,
    cursor: usize,
}

impl PcmSource {
    /// Wrap interleaved samples. Trailing samples that do not make up a whole
    /// frame are ignored.
    pub fn new(samples: Arc<[f32]>, channels: usize, sample_rate: u32) -> Result<Self, SourceError> {
        if channels == 0 {
            return Err(SourceError::Unsupported("channel count is 0".into()));
        }
        if sample_rate == 0 {
            return Err(SourceError::Unsupported("sample rate is 0".into()));
        }
        if samples.is_empty() {
            return Err(SourceError::Unsupported("PCM buffer is empty".into()));
        }

        let frames = samples.len() / channels;
        Ok(Self {
            samples,
            channels,
            sample_rate,
            frames,
            cursor: 0,
        })
    }

    /// Shared sample data
    pub fn samples(&self) -> &Arc<[f32]> {
        &self.samples
    }
}

impl Source for PcmSource {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, output: &mut [f32], frames: usize) -> Result<SourceRead, SourceError> {
        let available = self.frames - self.cursor;
        let count = frames.min(available).min(output.len() / self.channels);

        let start = self.cursor * self.channels;
        let end = start + count * self.channels;
        output[..count * self.channels].copy_from_slice(&self.samples[start..end]);
        self.cursor += count;

        Ok(SourceRead {
            frames: count,
            at_end: self.cursor >= self.frames,
        })
    }

    fn seek(&mut self, frame: u64) -> Result<(), SourceError> {
        if frame > self.frames as u64 {
            return Err(SourceError::SeekOutOfRange {
                frame,
                len: self.frames as u64,
            });
        }
        self.cursor = frame as usize;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.cursor as u64
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.frames as u64)
    }
}
