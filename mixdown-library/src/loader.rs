//! Whole-file sample loading and decoding

use mixdown_audio::{PcmSource, Source, SourceError};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while loading or decoding audio
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No audio track found in file")]
    NoAudioTrack,
    #[error("Unsupported format: {0}")]
    Unsupported(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Resample error: {0}")]
    Resample(String),
}

impl From<LoadError> for SourceError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::Io(e) => SourceError::Io(e),
            LoadError::NoAudioTrack | LoadError::Unsupported(_) => {
                SourceError::Unsupported(err.to_string())
            }
            LoadError::Decode(_) | LoadError::Resample(_) => SourceError::Decode(err.to_string()),
        }
    }
}

/// A probed container with a decoder ready for its first audio track
pub(crate) struct Probed {
    pub format: Box<dyn FormatReader>,
    pub decoder: Box<dyn Decoder>,
    pub track_id: u32,
    pub channels: usize,
    pub sample_rate: u32,
    pub frame_count: Option<u64>,
}

impl Probed {
    pub(crate) fn open(path: &Path) -> Result<Self, LoadError> {
        let file = std::fs::File::open(path)?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        Self::probe(Box::new(file), hint)
    }

    pub(crate) fn from_memory(bytes: Vec<u8>) -> Result<Self, LoadError> {
        Self::probe(Box::new(Cursor::new(bytes)), Hint::new())
    }

    fn probe(media: Box<dyn MediaSource>, hint: Hint) -> Result<Self, LoadError> {
        let mss = MediaSourceStream::new(media, Default::default());

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| LoadError::Unsupported(e.to_string()))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(LoadError::NoAudioTrack)?;

        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params
            .sample_rate
            .filter(|&rate| rate > 0)
            .ok_or_else(|| LoadError::Unsupported("unknown sample rate".into()))?;
        let channels = params
            .channels
            .map(|c| c.count())
            .filter(|&count| count > 0)
            .ok_or_else(|| LoadError::Unsupported("unknown channel layout".into()))?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| LoadError::Unsupported(e.to_string()))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            channels,
            sample_rate,
            frame_count: params.n_frames,
        })
    }

    /// Decode every remaining packet into interleaved f32
    fn decode_all(mut self) -> Result<Vec<f32>, LoadError> {
        let mut samples = Vec::new();
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => return Err(LoadError::Decode(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    warn!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(LoadError::Decode(e.to_string())),
            };

            if sample_buf
                .as_ref()
                .map_or(true, |buf| buf.capacity() < decoded.capacity())
            {
                sample_buf = Some(SampleBuffer::<f32>::new(
                    decoded.capacity() as u64,
                    *decoded.spec(),
                ));
            }
            if let Some(buf) = sample_buf.as_mut() {
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
        }

        Ok(samples)
    }
}

/// Decoded audio resident in memory.
///
/// Any number of voices can play one sample; each [`source`](Self::source)
/// gets its own cursor over the shared PCM.
#[derive(Debug, Clone)]
pub struct LoadedSample {
    pcm: PcmSource,
}

impl LoadedSample {
    /// Wrap raw interleaved PCM
    pub fn from_pcm(samples: Vec<f32>, channels: usize, sample_rate: u32) -> Result<Self, LoadError> {
        if samples.len() < channels {
            return Err(LoadError::Unsupported("PCM buffer holds no whole frame".into()));
        }
        let pcm = PcmSource::new(samples.into(), channels, sample_rate)
            .map_err(|e| LoadError::Unsupported(e.to_string()))?;
        Ok(Self { pcm })
    }

    /// A fresh source positioned at the first frame
    pub fn source(&self) -> PcmSource {
        self.pcm.clone()
    }

    /// Interleaved samples
    pub fn samples(&self) -> &Arc<[f32]> {
        self.pcm.samples()
    }

    pub fn channels(&self) -> usize {
        self.pcm.channels()
    }

    pub fn sample_rate(&self) -> u32 {
        self.pcm.sample_rate()
    }

    pub fn frames(&self) -> usize {
        self.samples().len() / self.channels()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate() as f64
    }
}

/// Loads whole files into memory using Symphonia, optionally converting them
/// to a fixed sample rate
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleLoader {
    target_sample_rate: Option<u32>,
}

impl SampleLoader {
    /// Loader that keeps each file's native sample rate
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader that converts everything to `target_sample_rate`
    pub fn with_sample_rate(target_sample_rate: u32) -> Self {
        Self {
            target_sample_rate: Some(target_sample_rate),
        }
    }

    /// Load and decode an audio file
    pub fn load(&self, path: &Path) -> Result<LoadedSample, LoadError> {
        let sample = self.finish(Probed::open(path)?)?;
        debug!(
            "Loaded {} ({} frames, {} Hz, {} ch)",
            path.display(),
            sample.frames(),
            sample.sample_rate(),
            sample.channels()
        );
        Ok(sample)
    }

    /// Decode an encoded file held in memory
    pub fn load_memory(&self, bytes: Vec<u8>) -> Result<LoadedSample, LoadError> {
        self.finish(Probed::from_memory(bytes)?)
    }

    fn finish(&self, probed: Probed) -> Result<LoadedSample, LoadError> {
        let channels = probed.channels;
        let source_rate = probed.sample_rate;
        let samples = probed.decode_all()?;

        let (samples, rate) = match self.target_sample_rate {
            Some(target) if target != source_rate => {
                (resample(&samples, channels, source_rate, target)?, target)
            }
            _ => (samples, source_rate),
        };

        LoadedSample::from_pcm(samples, channels, rate)
    }
}

/// Convert interleaved audio between sample rates with rubato
fn resample(
    samples: &[f32],
    channels: usize,
    source_rate: u32,
    target_rate: u32,
) -> Result<Vec<f32>, LoadError> {
    use rubato::{FftFixedInOut, Resampler};

    let frames = samples.len() / channels;
    let expected = (frames as u64 * target_rate as u64 / source_rate as u64) as usize;

    let mut resampler =
        FftFixedInOut::<f32>::new(source_rate as usize, target_rate as usize, 1024, channels)
            .map_err(|e| LoadError::Resample(e.to_string()))?;

    let deinterleaved: Vec<Vec<f32>> = (0..channels)
        .map(|ch| samples.iter().skip(ch).step_by(channels).copied().collect())
        .collect();

    let chunk_size = resampler.input_frames_next();
    let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected); channels];

    let mut pos = 0;
    while pos < frames {
        let end = (pos + chunk_size).min(frames);
        let chunk: Vec<Vec<f32>> = deinterleaved
            .iter()
            .map(|ch| {
                let mut v = ch[pos..end].to_vec();
                // Final partial chunk is zero padded
                v.resize(chunk_size, 0.0);
                v
            })
            .collect();

        let resampled = resampler
            .process(&chunk, None)
            .map_err(|e| LoadError::Resample(e.to_string()))?;
        for (out, data) in output.iter_mut().zip(resampled) {
            out.extend(data);
        }
        pos = end;
    }

    let out_frames = output.first().map_or(0, |ch| ch.len().min(expected));
    let mut interleaved = Vec::with_capacity(out_frames * channels);
    for frame in 0..out_frames {
        for ch in &output {
            interleaved.push(ch[frame]);
        }
    }
    Ok(interleaved)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal 16-bit PCM WAV encoder for test fixtures
    pub(crate) fn wav_bytes(samples: &[f32], channels: u16, sample_rate: u32) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let block_align = channels * 2;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn ramp(frames: usize, channels: usize) -> Vec<f32> {
        (0..frames * channels)
            .map(|i| ((i % 200) as f32 / 200.0) - 0.5)
            .collect()
    }

    #[test]
    fn test_load_memory_wav() {
        let pcm = ramp(1000, 2);
        let sample = SampleLoader::new()
            .load_memory(wav_bytes(&pcm, 2, 22050))
            .unwrap();

        assert_eq!(sample.channels(), 2);
        assert_eq!(sample.sample_rate(), 22050);
        assert_eq!(sample.frames(), 1000);
        for (a, b) in sample.samples().iter().zip(&pcm) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_load_with_conversion() {
        let pcm = ramp(4410, 1);
        let sample = SampleLoader::with_sample_rate(48000)
            .load_memory(wav_bytes(&pcm, 1, 44100))
            .unwrap();

        assert_eq!(sample.sample_rate(), 48000);
        assert!(sample.frames() <= 4800);
        assert!(sample.frames() > 4700);
    }

    #[test]
    fn test_sources_are_independent() {
        let sample = LoadedSample::from_pcm(ramp(100, 1), 1, 44100).unwrap();
        let mut a = sample.source();
        let b = sample.source();

        let mut buf = vec![0.0; 50];
        a.read(&mut buf, 50).unwrap();
        assert_eq!(a.position(), 50);
        assert_eq!(b.position(), 0);
        assert!(Arc::ptr_eq(a.samples(), b.samples()));
    }

    #[test]
    fn test_from_pcm_validation() {
        assert!(LoadedSample::from_pcm(Vec::new(), 1, 44100).is_err());
        assert!(LoadedSample::from_pcm(vec![0.0; 4], 0, 44100).is_err());
        assert!(LoadedSample::from_pcm(vec![0.0; 4], 1, 0).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = SampleLoader::new().load_memory(vec![7u8; 64]).unwrap_err();
        assert!(matches!(err, LoadError::Unsupported(_)));

        let err: mixdown_audio::AudioError = SourceError::from(err).into();
        assert_eq!(err.kind(), mixdown_audio::ErrorKind::InvalidArgument);
    }
}
