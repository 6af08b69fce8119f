//! Voices - one independently controllable playing sound

use crate::attribute::{validate, AtomicF32, AttributeKind, AttributeValue};
use crate::chain::{RenderParams, TransformChain};
use crate::error::{AudioError, Result};
use crate::registry::VoiceHandle;
use crate::source::Source;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Called on the mixer thread with a voice's processed block
/// (interleaved device channels, after gain) and its frame count.
pub type VoiceCallback = Box<dyn FnMut(VoiceHandle, &mut [f32], usize) + Send>;

/// Playback status of a voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceStatus {
    #[default]
    Idle,
    Playing,
    Paused,
    /// Source ran out and looping was off
    AtEnd,
}

impl VoiceStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => VoiceStatus::Playing,
            2 => VoiceStatus::Paused,
            3 => VoiceStatus::AtEnd,
            _ => VoiceStatus::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            VoiceStatus::Idle => 0,
            VoiceStatus::Playing => 1,
            VoiceStatus::Paused => 2,
            VoiceStatus::AtEnd => 3,
        }
    }
}

/// State shared between control threads and the mixer without locking.
///
/// Every field is an atomic; the mixer may observe a value up to one period
/// late.
#[derive(Debug)]
pub struct VoiceControl {
    volume: AtomicF32,
    rate: AtomicF32,
    pan: AtomicF32,
    pitch_correction: AtomicBool,
    looping: AtomicBool,
    status: AtomicU8,
    removed: AtomicBool,
    failures: AtomicU32,
}

impl Default for VoiceControl {
    fn default() -> Self {
        let defaults = RenderParams::default();
        Self {
            volume: AtomicF32::new(defaults.volume),
            rate: AtomicF32::new(defaults.rate),
            pan: AtomicF32::new(defaults.pan),
            pitch_correction: AtomicBool::new(defaults.pitch_correction),
            looping: AtomicBool::new(defaults.looping),
            status: AtomicU8::new(VoiceStatus::Idle.as_u8()),
            removed: AtomicBool::new(false),
            failures: AtomicU32::new(0),
        }
    }
}

impl VoiceControl {
    pub fn status(&self) -> VoiceStatus {
        VoiceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: VoiceStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// Playing -> AtEnd. A pause or stop that landed first wins.
    pub(crate) fn finish(&self) {
        let _ = self.status.compare_exchange(
            VoiceStatus::Playing.as_u8(),
            VoiceStatus::AtEnd.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn attribute(&self, kind: AttributeKind) -> AttributeValue {
        match kind {
            AttributeKind::Volume => AttributeValue::Float(self.volume.load()),
            AttributeKind::Rate => AttributeValue::Float(self.rate.load()),
            AttributeKind::Pan => AttributeValue::Float(self.pan.load()),
            AttributeKind::PitchCorrection => {
                AttributeValue::Bool(self.pitch_correction.load(Ordering::Relaxed))
            }
            AttributeKind::Looping => AttributeValue::Bool(self.looping.load(Ordering::Relaxed)),
        }
    }

    /// Validate and store an attribute. Nothing changes on error.
    pub fn set_attribute(&self, kind: AttributeKind, value: AttributeValue) -> Result<()> {
        match (kind, validate(kind, value)?) {
            (AttributeKind::Volume, AttributeValue::Float(v)) => self.volume.store(v),
            (AttributeKind::Rate, AttributeValue::Float(v)) => self.rate.store(v),
            (AttributeKind::Pan, AttributeValue::Float(v)) => self.pan.store(v),
            (AttributeKind::PitchCorrection, AttributeValue::Bool(v)) => {
                self.pitch_correction.store(v, Ordering::Relaxed)
            }
            (AttributeKind::Looping, AttributeValue::Bool(v)) => {
                self.looping.store(v, Ordering::Relaxed)
            }
            (kind, value) => {
                return Err(AudioError::invalid_argument(format!(
                    "invalid type for {kind:?}: {value:?}"
                )))
            }
        }
        Ok(())
    }

    /// Snapshot of everything the chain needs for one block
    pub fn params(&self) -> RenderParams {
        RenderParams {
            volume: self.volume.load(),
            rate: self.rate.load(),
            pan: self.pan.load(),
            pitch_correction: self.pitch_correction.load(Ordering::Relaxed),
            looping: self.looping.load(Ordering::Relaxed),
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Consecutive periods in which this voice failed to render
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn clear_failures(&self) {
        if self.failures.load(Ordering::Relaxed) != 0 {
            self.failures.store(0, Ordering::Relaxed);
        }
    }
}

/// Everything only one thread may touch at a time: the source cursor, the
/// chain's DSP state and the per-voice callback.
struct VoiceEngine {
    source: Box<dyn Source>,
    chain: TransformChain,
    callback: Option<VoiceCallback>,
}

/// A playing sound instance.
///
/// Attributes live in [`VoiceControl`] and are read lock-free by the mixer.
/// The engine sits behind a mutex that the mixer only ever `try_lock`s, so a
/// control thread seeking or restarting a voice makes the mixer skip it for
/// a period instead of blocking.
pub struct Voice {
    handle: VoiceHandle,
    control: Arc<VoiceControl>,
    engine: Mutex<VoiceEngine>,
}

impl Voice {
    pub(crate) fn new(handle: VoiceHandle, source: Box<dyn Source>, chain: TransformChain) -> Self {
        Self {
            handle,
            control: Arc::new(VoiceControl::default()),
            engine: Mutex::new(VoiceEngine {
                source,
                chain,
                callback: None,
            }),
        }
    }

    pub fn handle(&self) -> VoiceHandle {
        self.handle
    }

    pub fn control(&self) -> &Arc<VoiceControl> {
        &self.control
    }

    pub fn status(&self) -> VoiceStatus {
        self.control.status()
    }

    pub fn is_playing(&self) -> bool {
        self.status() == VoiceStatus::Playing
    }

    /// Start playback. Without `restart`, a paused voice resumes where it
    /// stopped and a playing voice is left alone.
    ///
    /// A rewind publishes `Playing` while still holding the engine.
    pub fn play(&self, restart: bool) -> Result<()> {
        match (self.control.status(), restart) {
            (VoiceStatus::Paused, false) => self.control.set_status(VoiceStatus::Playing),
            (VoiceStatus::Playing, false) => {}
            _ => {
                let params = self.control.params();
                let mut engine = self.engine.lock();
                let VoiceEngine { source, chain, .. } = &mut *engine;
                source.seek(0)?;
                chain.prime(source.as_mut(), &params, 0)?;
                self.control.set_status(VoiceStatus::Playing);
            }
        }
        Ok(())
    }

    pub fn pause(&self) {
        self.control.set_status(VoiceStatus::Paused);
    }

    /// Stop and rewind to the first frame
    pub fn stop(&self) -> Result<()> {
        let mut engine = self.engine.lock();
        self.control.set_status(VoiceStatus::Idle);
        engine.source.seek(0)?;
        engine.chain.reset();
        Ok(())
    }

    /// Move the cursor to `frame`, re-priming the resampler and pitch
    /// corrector from the material just before it. On failure the cursor
    /// stays where it was.
    pub fn seek(&self, frame: u64) -> Result<()> {
        let params = self.control.params();
        let mut engine = self.engine.lock();
        let VoiceEngine { source, chain, .. } = &mut *engine;

        if let Some(len) = source.frame_count() {
            if frame > len {
                return Err(AudioError::invalid_argument(format!(
                    "seek to frame {frame} is past the end ({len} frames)"
                )));
            }
        }
        let previous = source.position();
        source.seek(frame)?;
        if let Err(e) = chain.prime(source.as_mut(), &params, frame) {
            if let Err(restore) = source.seek(previous) {
                warn!("Could not restore cursor to frame {} after failed seek: {}", previous, restore);
            }
            chain.reset();
            return Err(e);
        }
        Ok(())
    }

    /// Current source cursor in frames
    pub fn position(&self) -> u64 {
        self.engine.lock().source.position()
    }

    pub fn set_attribute(&self, kind: AttributeKind, value: AttributeValue) -> Result<()> {
        self.control.set_attribute(kind, value)
    }

    pub fn attribute(&self, kind: AttributeKind) -> AttributeValue {
        self.control.attribute(kind)
    }

    pub fn set_callback(&self, callback: Option<VoiceCallback>) {
        self.engine.lock().callback = callback;
    }

    /// Render one block on the mixer thread.
    ///
    /// Returns `None` when a control thread holds the engine, otherwise the
    /// frames produced.
    pub(crate) fn render(&self, block: &mut [f32], frames: usize) -> Option<Result<usize>> {
        let mut engine = self.engine.try_lock()?;
        let params = self.control.params();
        let VoiceEngine {
            source,
            chain,
            callback,
        } = &mut *engine;

        let result = chain.render(source.as_mut(), &params, block, frames);
        if let Ok(&n) = result.as_ref() {
            if let Some(callback) = callback.as_mut() {
                let ch = chain.device_channels();
                callback(self.handle, &mut block[..n * ch], n);
            }
            // Looping sources wrap inside the read, so a short block means
            // the material is exhausted
            if n < frames {
                self.control.finish();
            }
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::pitch::FftSize;
    use crate::source::{PcmSource, SourceRead};

    fn voice(frames: usize) -> Voice {
        let samples: Arc<[f32]> = (0..frames).map(|i| i as f32 / frames as f32).collect();
        let source = PcmSource::new(samples, 1, 48000).unwrap();
        let chain = TransformChain::new(1, 48000, 1, 48000, 256, FftSize::Small).unwrap();
        Voice::new(VoiceHandle::new(0, 0, 0), Box::new(source), chain)
    }

    #[test]
    fn test_play_pause_resume() {
        let v = voice(1000);
        v.play(false).unwrap();
        assert!(v.is_playing());

        let mut block = vec![0.0; 256];
        v.render(&mut block, 100).unwrap().unwrap();
        assert_eq!(v.position(), 100);

        v.pause();
        assert_eq!(v.status(), VoiceStatus::Paused);
        v.play(false).unwrap();
        assert_eq!(v.position(), 100);

        v.play(true).unwrap();
        assert_eq!(v.position(), 0);
    }

    #[test]
    fn test_play_while_playing_keeps_position() {
        let v = voice(1000);
        v.play(false).unwrap();
        let mut block = vec![0.0; 256];
        v.render(&mut block, 50).unwrap().unwrap();
        v.play(false).unwrap();
        assert_eq!(v.position(), 50);
    }

    #[test]
    fn test_stop_rewinds() {
        let v = voice(1000);
        v.play(false).unwrap();
        let mut block = vec![0.0; 256];
        v.render(&mut block, 200).unwrap().unwrap();
        v.stop().unwrap();
        assert_eq!(v.status(), VoiceStatus::Idle);
        assert_eq!(v.position(), 0);
    }

    #[test]
    fn test_seek_past_end_rejected() {
        let v = voice(1000);
        assert!(v.seek(1000).is_ok());
        let err = v.seek(1001).unwrap_err();
        assert!(matches!(err, AudioError::InvalidArgument(_)));
        assert_eq!(v.position(), 1000);
    }

    #[test]
    fn test_short_render_marks_end_and_restart_replays() {
        let v = voice(100);
        v.play(false).unwrap();

        let mut block = vec![0.0; 256];
        assert_eq!(v.render(&mut block, 256).unwrap().unwrap(), 100);
        assert_eq!(v.status(), VoiceStatus::AtEnd);

        v.play(true).unwrap();
        assert_eq!(v.status(), VoiceStatus::Playing);
        assert_eq!(v.render(&mut block, 64).unwrap().unwrap(), 64);
        assert_eq!(v.status(), VoiceStatus::Playing);
    }

    #[test]
    fn test_end_of_source_does_not_override_pause() {
        let v = voice(100);
        v.play(false).unwrap();
        v.pause();

        let mut block = vec![0.0; 256];
        v.render(&mut block, 256).unwrap().unwrap();
        assert_eq!(v.status(), VoiceStatus::Paused);
    }

    /// Reads fail while the shared flag is set
    struct FlakySource {
        inner: PcmSource,
        failing: Arc<AtomicBool>,
    }

    impl Source for FlakySource {
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
            if self.failing.load(Ordering::Relaxed) {
                return Err(SourceError::Decode("truncated stream".into()));
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
    fn test_failed_seek_keeps_previous_position() {
        let samples: Arc<[f32]> = vec![0.5; 48000].into();
        let failing = Arc::new(AtomicBool::new(false));
        let source = FlakySource {
            inner: PcmSource::new(samples, 1, 48000).unwrap(),
            failing: Arc::clone(&failing),
        };
        let chain = TransformChain::new(1, 48000, 1, 48000, 256, FftSize::Small).unwrap();
        let v = Voice::new(VoiceHandle::new(0, 0, 0), Box::new(source), chain);
        v.set_attribute(AttributeKind::Rate, AttributeValue::Float(1.5))
            .unwrap();
        v.set_attribute(AttributeKind::PitchCorrection, AttributeValue::Bool(true))
            .unwrap();

        v.play(false).unwrap();
        v.seek(20000).unwrap();
        assert_eq!(v.position(), 20000);

        failing.store(true, Ordering::Relaxed);
        assert!(v.seek(30000).is_err());
        assert_eq!(v.position(), 20000);

        failing.store(false, Ordering::Relaxed);
        let mut block = vec![0.0; 256];
        assert_eq!(v.render(&mut block, 256).unwrap().unwrap(), 256);
        assert!(v.position() > 20000);
    }

    #[test]
    fn test_attribute_tag_mismatch_leaves_value() {
        let v = voice(10);
        v.set_attribute(AttributeKind::Volume, AttributeValue::Float(0.4))
            .unwrap();
        assert!(v
            .set_attribute(AttributeKind::Volume, AttributeValue::Bool(false))
            .is_err());
        assert_eq!(
            v.attribute(AttributeKind::Volume),
            AttributeValue::Float(0.4)
        );
    }

    #[test]
    fn test_attribute_reads_back_what_was_set() {
        let v = voice(10);
        v.set_attribute(AttributeKind::Rate, AttributeValue::Float(3.75))
            .unwrap();
        assert_eq!(v.attribute(AttributeKind::Rate), AttributeValue::Float(3.75));

        let err = v
            .set_attribute(AttributeKind::Rate, AttributeValue::Float(10.0))
            .unwrap_err();
        assert!(matches!(err, AudioError::InvalidArgument(_)));
        assert_eq!(v.attribute(AttributeKind::Rate), AttributeValue::Float(3.75));
    }

    #[test]
    fn test_render_skipped_while_engine_locked() {
        let v = voice(10);
        let guard = v.engine.lock();
        let mut block = vec![0.0; 16];
        assert!(v.render(&mut block, 8).is_none());
        drop(guard);
        assert!(v.render(&mut block, 8).is_some());
    }

    #[test]
    fn test_callback_sees_processed_block() {
        let v = voice(100);
        v.set_attribute(AttributeKind::Volume, AttributeValue::Float(0.0))
            .unwrap();
        v.set_callback(Some(Box::new(|_, block, frames| {
            assert_eq!(block.len(), frames);
            assert!(block.iter().all(|&s| s == 0.0));
            block.fill(0.25);
        })));

        let mut block = vec![0.0; 32];
        assert_eq!(v.render(&mut block, 32).unwrap().unwrap(), 32);
        assert!(block.iter().all(|&s| s == 0.25));
    }
}
