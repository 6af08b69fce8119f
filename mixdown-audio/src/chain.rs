//! Per-voice transform chain: remap, resample, pitch-correct, pan, gain

use crate::dsp::{apply_gain, ChannelRemap, LinearResampler, Panner, MAX_SOURCE_CHANNELS};
use crate::error::{zeroed, AudioError, Result};
use crate::pitch::{FftSize, PitchCorrector};
use crate::source::Source;

/// Attribute snapshot a chain renders one block with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderParams {
    pub volume: f32,
    pub rate: f32,
    pub pan: f32,
    pub pitch_correction: bool,
    pub looping: bool,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            rate: 1.0,
            pan: 0.0,
            pitch_correction: false,
            looping: false,
        }
    }
}

/// Reads from a source and brings it to device channels and rate
struct Feed {
    remap: ChannelRemap,
    resampler: LinearResampler,
    /// Frames per source read
    capacity: usize,
    read_buf: Vec<f32>,
    remap_buf: Vec<f32>,
}

impl Feed {
    /// Fill `out` with up to `frames` resampled frames. Returns the frames
    /// produced and whether the source ran dry.
    fn pull(
        &mut self,
        source: &mut dyn Source,
        looping: bool,
        out: &mut [f32],
        frames: usize,
    ) -> Result<(usize, bool)> {
        let ch = self.remap.output_channels();
        let mut produced = 0;

        while produced < frames {
            let remaining = frames - produced;
            let need = self.resampler.required_input(remaining).min(self.capacity);
            let got = if need > 0 {
                read_source(source, looping, &mut self.read_buf, need)?
            } else {
                0
            };

            self.remap.process(&self.read_buf, &mut self.remap_buf, got);
            produced += self.resampler.process(
                &self.remap_buf,
                got,
                &mut out[produced * ch..],
                remaining,
            );

            if got < need {
                return Ok((produced, true));
            }
        }

        Ok((produced, false))
    }
}

/// Read `frames` frames, wrapping to the start when `looping` is set.
fn read_source(
    source: &mut dyn Source,
    looping: bool,
    buf: &mut [f32],
    frames: usize,
) -> Result<usize> {
    let ch = source.channels();
    let mut filled = 0;
    // Guards against spinning on a source that yields nothing after a rewind
    let mut rewound_empty = false;

    while filled < frames {
        let read = source.read(&mut buf[filled * ch..frames * ch], frames - filled)?;
        filled += read.frames;

        if read.frames > 0 {
            rewound_empty = false;
        }
        if read.frames == 0 || read.at_end {
            if filled >= frames || !looping || rewound_empty {
                break;
            }
            source.seek(0)?;
            rewound_empty = read.frames == 0;
        }
    }

    Ok(filled)
}

/// Append `block` to the history ring, keeping only the newest frames
fn record_history(
    history: &mut [f32],
    pos: &mut usize,
    len: &mut usize,
    block: &[f32],
    ch: usize,
) {
    let cap = history.len() / ch;
    if cap == 0 {
        return;
    }
    let frames = block.len() / ch;
    let skip = frames.saturating_sub(cap);
    for frame in block[skip * ch..].chunks_exact(ch) {
        history[*pos * ch..(*pos + 1) * ch].copy_from_slice(frame);
        *pos = (*pos + 1) % cap;
    }
    *len = (*len + frames - skip).min(cap);
}

/// Linear fade from `from` to `to` over `frames` frames
fn crossfade(from: &[f32], to: &[f32], out: &mut [f32], frames: usize, ch: usize) {
    for f in 0..frames {
        let t = (f + 1) as f32 / frames as f32;
        for c in 0..ch {
            let i = f * ch + c;
            out[i] = from[i] * (1.0 - t) + to[i] * t;
        }
    }
}

/// The corrector only sits in the path while the rate is off unity
#[inline]
fn corrects_pitch(params: &RenderParams) -> bool {
    params.pitch_correction && params.rate != 1.0
}

/// Processing state owned by one voice.
///
/// All buffers are sized up front for `max_frames` per render call, so
/// rendering never allocates.
pub struct TransformChain {
    device_channels: usize,
    source_rate: u32,
    device_rate: u32,
    max_frames: usize,
    feed: Feed,
    pitch: PitchCorrector,
    /// Corrector is in the signal path and primed
    pitch_engaged: bool,
    /// Buffered corrector frames still owed after the source ends
    tail_remaining: usize,
    panner: Panner,
    stage_buf: Vec<f32>,
    spill_buf: Vec<f32>,
    /// Ring of the last `latency` resampled frames, fed to the corrector
    /// when it engages mid-stream
    history: Vec<f32>,
    history_pos: usize,
    history_len: usize,
}

impl TransformChain {
    pub fn new(
        source_channels: usize,
        source_rate: u32,
        device_channels: usize,
        device_rate: u32,
        max_frames: usize,
        fft_size: FftSize,
    ) -> Result<Self> {
        if source_channels == 0 || source_channels > MAX_SOURCE_CHANNELS {
            return Err(AudioError::invalid_argument(format!(
                "source has {source_channels} channels, supported range is 1..={MAX_SOURCE_CHANNELS}"
            )));
        }
        if source_rate == 0 {
            return Err(AudioError::invalid_argument("source sample rate is 0"));
        }

        let pitch = PitchCorrector::new(device_channels, fft_size)?;
        let history = zeroed(device_channels * pitch.latency(), "chain history buffer")?;
        Ok(Self {
            device_channels,
            source_rate,
            device_rate,
            max_frames,
            feed: Feed {
                remap: ChannelRemap::new(source_channels, device_channels),
                resampler: LinearResampler::new(device_channels),
                capacity: max_frames,
                read_buf: zeroed(source_channels * max_frames, "chain read buffer")?,
                remap_buf: zeroed(device_channels * max_frames, "chain remap buffer")?,
            },
            tail_remaining: pitch.latency(),
            pitch,
            pitch_engaged: false,
            panner: Panner::new(),
            stage_buf: zeroed(device_channels * max_frames, "chain stage buffer")?,
            spill_buf: zeroed(device_channels * max_frames, "chain spill buffer")?,
            history,
            history_pos: 0,
            history_len: 0,
        })
    }

    pub fn device_channels(&self) -> usize {
        self.device_channels
    }

    /// Forget all interpolation and correction state
    pub fn reset(&mut self) {
        self.feed.resampler.reset();
        self.pitch.reset();
        self.pitch_engaged = false;
        self.tail_remaining = self.pitch.latency();
        self.history_pos = 0;
        self.history_len = 0;
    }

    /// Reset, then warm the resampler and pitch corrector with the material
    /// just before `target` so playback from `target` starts without a run of
    /// silence. The source is left positioned at `target`; if the warm-up
    /// read fails the chain is left cold instead.
    pub fn prime(
        &mut self,
        source: &mut dyn Source,
        params: &RenderParams,
        target: u64,
    ) -> Result<()> {
        self.reset();
        self.apply(params);

        let correcting = corrects_pitch(params);
        if !correcting && self.feed.resampler.ratio() == 1.0 {
            return Ok(());
        }
        self.pitch_engaged = correcting;

        let ratio = self.feed.resampler.ratio();
        let lead = (self.pitch.latency() as f64 * ratio).ceil() as u64;
        let start = target.saturating_sub(lead);
        if start == target {
            return Ok(());
        }

        // A failed warm-up leaves a cold chain and the source at the target
        let warmed = self.warm(source, start, target - start, correcting);
        let restored = source.seek(target);
        if let Err(e) = warmed {
            self.reset();
            return Err(e);
        }
        restored?;
        Ok(())
    }

    /// Run `frames` source frames from `start` through the stages
    fn warm(
        &mut self,
        source: &mut dyn Source,
        start: u64,
        frames: u64,
        correcting: bool,
    ) -> Result<()> {
        source.seek(start)?;

        // Largest read whose resampled output still fits the stage buffer
        let mut chunk = self.feed.capacity;
        while chunk > 1 && self.feed.resampler.max_output_for_input(chunk) > self.max_frames {
            chunk /= 2;
        }

        let mut remaining = frames as usize;
        while remaining > 0 {
            let want = remaining.min(chunk);
            let got = read_source(source, false, &mut self.feed.read_buf, want)?;
            if got == 0 {
                break;
            }
            self.feed
                .remap
                .process(&self.feed.read_buf, &mut self.feed.remap_buf, got);
            let made = self.feed.resampler.process(
                &self.feed.remap_buf,
                got,
                &mut self.stage_buf,
                self.max_frames,
            );
            record_history(
                &mut self.history,
                &mut self.history_pos,
                &mut self.history_len,
                &self.stage_buf[..made * self.device_channels],
                self.device_channels,
            );
            if correcting {
                self.pitch.process(&self.stage_buf, &mut self.spill_buf, made);
            }
            remaining -= got;
        }
        Ok(())
    }

    /// Render up to `frames` frames into `out` (device channels, interleaved).
    ///
    /// Returns the frames written; fewer than requested means the source is
    /// exhausted. `frames` must not exceed the chain's `max_frames`.
    pub fn render(
        &mut self,
        source: &mut dyn Source,
        params: &RenderParams,
        out: &mut [f32],
        frames: usize,
    ) -> Result<usize> {
        let ch = self.device_channels;
        let frames = frames.min(self.max_frames);

        let correcting = corrects_pitch(params);
        let releasing = self.pitch_engaged && !correcting;
        self.apply(params);
        if correcting && !self.pitch_engaged {
            self.engage();
        }
        self.pitch_engaged = correcting;

        let produced = if correcting {
            let (got, ended) = self
                .feed
                .pull(source, params.looping, &mut self.stage_buf, frames)?;
            record_history(
                &mut self.history,
                &mut self.history_pos,
                &mut self.history_len,
                &self.stage_buf[..got * ch],
                ch,
            );

            let mut n = got;
            if ended {
                // Flush what the corrector still holds
                let tail = (frames - got).min(self.tail_remaining);
                self.stage_buf[got * ch..(got + tail) * ch].fill(0.0);
                self.tail_remaining -= tail;
                n += tail;
            }
            self.pitch.process(&self.stage_buf, out, n);
            n
        } else if releasing {
            // Fade from what the corrector still holds to the direct signal
            let (got, _) = self
                .feed
                .pull(source, params.looping, &mut self.stage_buf, frames)?;
            record_history(
                &mut self.history,
                &mut self.history_pos,
                &mut self.history_len,
                &self.stage_buf[..got * ch],
                ch,
            );
            self.pitch.process(&self.stage_buf, &mut self.spill_buf, got);
            crossfade(&self.spill_buf, &self.stage_buf, out, got, ch);
            got
        } else {
            let (got, _) = self.feed.pull(source, params.looping, out, frames)?;
            record_history(
                &mut self.history,
                &mut self.history_pos,
                &mut self.history_len,
                &out[..got * ch],
                ch,
            );
            got
        };

        let block = &mut out[..produced * ch];
        self.panner.process(block, ch);
        apply_gain(block, params.volume);
        Ok(produced)
    }

    /// Put the corrector in the path mid-stream, filling it from the
    /// history ring so its first output is not a run of silence
    fn engage(&mut self) {
        self.pitch.reset();
        self.tail_remaining = self.pitch.latency();

        let ch = self.device_channels;
        let cap = self.history.len() / ch;
        if cap == 0 {
            return;
        }
        let oldest = (self.history_pos + cap - self.history_len) % cap;
        let mut fed = 0;
        while fed < self.history_len {
            let at = (oldest + fed) % cap;
            let n = (self.history_len - fed).min(cap - at).min(self.max_frames);
            self.pitch
                .process(&self.history[at * ch..(at + n) * ch], &mut self.spill_buf, n);
            fed += n;
        }
    }

    fn apply(&mut self, params: &RenderParams) {
        let ratio =
            params.rate as f64 * self.source_rate as f64 / self.device_rate as f64;
        self.feed.resampler.set_ratio(ratio);
        self.pitch.set_shift(1.0 / params.rate);
        self.panner.set_pan(params.pan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::source::{PcmSource, SourceRead};
    use std::f32::consts::PI;
    use std::sync::Arc;

    fn sine_source(frames: usize, channels: usize, rate: u32) -> PcmSource {
        let samples: Arc<[f32]> = (0..frames * channels)
            .map(|i| {
                let frame = (i / channels) as f32;
                (2.0 * PI * 440.0 * frame / rate as f32).sin() * 0.5
            })
            .collect();
        PcmSource::new(samples, channels, rate).unwrap()
    }

    fn chain(source_channels: usize, device_channels: usize) -> TransformChain {
        TransformChain::new(source_channels, 48000, device_channels, 48000, 512, FftSize::Small)
            .unwrap()
    }

    /// Render until the chain stops producing, returning everything written
    fn drain(chain: &mut TransformChain, source: &mut PcmSource, params: &RenderParams) -> Vec<f32> {
        let ch = chain.device_channels();
        let mut all = Vec::new();
        let mut block = vec![0.0; 512 * ch];
        loop {
            let n = chain.render(source, params, &mut block, 512).unwrap();
            all.extend_from_slice(&block[..n * ch]);
            if n < 512 {
                return all;
            }
        }
    }

    #[test]
    fn test_identity_chain_is_bit_exact() {
        let mut src = sine_source(2000, 2, 48000);
        let expected = src.samples().to_vec();
        let mut chain = chain(2, 2);

        let out = drain(&mut chain, &mut src, &RenderParams::default());
        assert_eq!(out, expected);
    }

    #[test]
    fn test_double_rate_halves_frames() {
        let mut src = sine_source(44100, 1, 48000);
        let mut chain = chain(1, 1);
        let params = RenderParams {
            rate: 2.0,
            ..RenderParams::default()
        };

        let out = drain(&mut chain, &mut src, &params);
        assert_eq!(out.len(), 22050);
    }

    #[test]
    fn test_sample_rate_conversion_ratio() {
        let samples: Arc<[f32]> = vec![0.25; 24000].into();
        let mut src = PcmSource::new(samples, 1, 24000).unwrap();
        let mut chain = TransformChain::new(1, 24000, 1, 48000, 512, FftSize::Small).unwrap();

        let out = drain(&mut chain, &mut src, &RenderParams::default());
        // 24000 frames at half the device rate: 2 outputs per input, minus the
        // final half step that would need a frame past the end
        assert_eq!(out.len(), 47999);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_looping_wraps_without_gap() {
        let ramp: Arc<[f32]> = (0..100).map(|i| i as f32 / 100.0).collect();
        let mut src = PcmSource::new(ramp, 1, 48000).unwrap();
        let mut chain = chain(1, 1);
        let params = RenderParams {
            looping: true,
            ..RenderParams::default()
        };

        let mut out = vec![0.0; 512];
        assert_eq!(chain.render(&mut src, &params, &mut out, 512).unwrap(), 512);
        for (i, &s) in out.iter().enumerate() {
            assert_eq!(s, (i % 100) as f32 / 100.0);
        }
    }

    #[test]
    fn test_pan_and_gain_applied() {
        let samples: Arc<[f32]> = vec![1.0; 64].into();
        let mut src = PcmSource::new(samples, 1, 48000).unwrap();
        let mut chain = chain(1, 2);
        let params = RenderParams {
            volume: 0.5,
            pan: -1.0,
            ..RenderParams::default()
        };

        let mut out = vec![0.0; 128];
        chain.render(&mut src, &params, &mut out, 64).unwrap();
        assert_eq!(&out[..4], &[0.5, 0.0, 0.5, 0.0]);
    }

    fn zero_crossings(samples: &[f32]) -> usize {
        samples
            .windows(2)
            .filter(|w| (w[0] < 0.0) != (w[1] < 0.0))
            .count()
    }

    #[test]
    fn test_pitch_correction_keeps_frequency() {
        let frames = 1024 * 8;
        let params = RenderParams {
            rate: 0.5,
            pitch_correction: true,
            ..RenderParams::default()
        };

        let mut src = sine_source(frames, 1, 48000);
        let mut corrected = chain(1, 1);
        let out = drain(&mut corrected, &mut src, &params);
        // Every resampled frame plus one latency of flushed tail
        assert_eq!(out.len(), 16383 + 1024);

        let window = &out[4096..12288];
        let hz = zero_crossings(window) as f32 * 48000.0 / (2.0 * window.len() as f32);
        assert!((hz - 440.0).abs() < 44.0, "corrected to {hz} Hz");

        let mut src = sine_source(frames, 1, 48000);
        let mut varispeed = chain(1, 1);
        let plain = RenderParams {
            pitch_correction: false,
            ..params
        };
        let out = drain(&mut varispeed, &mut src, &plain);
        assert_eq!(out.len(), 16383);
        let window = &out[4096..12288];
        let hz = zero_crossings(window) as f32 * 48000.0 / (2.0 * window.len() as f32);
        assert!((hz - 220.0).abs() < 22.0, "varispeed at {hz} Hz");
    }

    #[test]
    fn test_pitch_correction_bypassed_at_unity_rate() {
        let mut src = sine_source(2000, 1, 48000);
        let expected = src.samples().to_vec();
        let mut chain = chain(1, 1);
        let params = RenderParams {
            pitch_correction: true,
            ..RenderParams::default()
        };

        let out = drain(&mut chain, &mut src, &params);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_prime_warms_pipeline_and_keeps_target() {
        let params = RenderParams {
            rate: 1.5,
            pitch_correction: true,
            ..RenderParams::default()
        };
        let energy = |block: &[f32]| block.iter().map(|s| s * s).sum::<f32>();

        let mut src = sine_source(48000, 1, 48000);
        let mut cold = chain(1, 1);
        src.seek(10000).unwrap();
        cold.reset();
        let mut block = vec![0.0; 256];
        cold.render(&mut src, &params, &mut block, 256).unwrap();
        assert_eq!(energy(&block), 0.0);

        let mut src = sine_source(48000, 1, 48000);
        let mut warm = chain(1, 1);
        warm.prime(&mut src, &params, 10000).unwrap();
        assert_eq!(src.position(), 10000);
        warm.render(&mut src, &params, &mut block, 256).unwrap();
        assert!(energy(&block) > 0.01);
    }

    #[test]
    fn test_enabling_correction_mid_stream_keeps_sound() {
        let energy = |block: &[f32]| block.iter().map(|s| s * s).sum::<f32>();
        let varispeed = RenderParams {
            rate: 1.5,
            ..RenderParams::default()
        };
        let corrected = RenderParams {
            pitch_correction: true,
            ..varispeed
        };

        let mut src = sine_source(48000, 1, 48000);
        let mut chain = chain(1, 1);
        let mut block = vec![0.0; 256];
        for _ in 0..8 {
            chain.render(&mut src, &varispeed, &mut block, 256).unwrap();
        }

        for i in 0..6 {
            let n = chain.render(&mut src, &corrected, &mut block, 256).unwrap();
            assert_eq!(n, 256);
            assert!(energy(&block) > 0.01, "block {i} after engaging is silent");
        }

        // And back off again: the release block fades rather than cutting out
        for i in 0..3 {
            chain.render(&mut src, &varispeed, &mut block, 256).unwrap();
            assert!(energy(&block) > 0.01, "block {i} after releasing is silent");
        }
    }

    struct BrokenSource {
        inner: PcmSource,
        fail_reads: bool,
    }

    impl Source for BrokenSource {
        fn channels(&self) -> usize {
            self.inner.channels()
        }

        fn sample_rate(&self) -> u32 {
            self.inner.sample_rate()
        }

        fn read(
            &mut self,
            output: &mut [f32],
            frames: usize,
        ) -> std::result::Result<SourceRead, SourceError> {
            if self.fail_reads {
                return Err(SourceError::Decode("corrupt packet".into()));
            }
            self.inner.read(output, frames)
        }

        fn seek(&mut self, frame: u64) -> std::result::Result<(), SourceError> {
            self.inner.seek(frame)
        }

        fn position(&self) -> u64 {
            self.inner.position()
        }

        fn frame_count(&self) -> Option<u64> {
            self.inner.frame_count()
        }
    }

    #[test]
    fn test_failed_prime_leaves_source_at_target() {
        let params = RenderParams {
            rate: 1.5,
            pitch_correction: true,
            ..RenderParams::default()
        };
        let mut src = BrokenSource {
            inner: sine_source(48000, 1, 48000),
            fail_reads: true,
        };
        let mut chain = chain(1, 1);

        assert!(chain.prime(&mut src, &params, 20000).is_err());
        assert_eq!(src.position(), 20000);

        // Cold but consistent: rendering resumes from the target
        src.fail_reads = false;
        let mut block = vec![0.0; 256];
        assert_eq!(chain.render(&mut src, &params, &mut block, 256).unwrap(), 256);
        assert!(src.position() > 20000);
    }

    #[test]
    fn test_rejects_too_many_channels() {
        let err = TransformChain::new(9, 48000, 2, 48000, 512, FftSize::Small).err();
        assert!(matches!(err, Some(AudioError::InvalidArgument(_))));
    }
}
