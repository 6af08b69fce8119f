//! Device session - owns the voices, the slide worker and the output stream

use crate::attribute::{AttributeKind, AttributeValue};
use crate::chain::TransformChain;
use crate::device::OutputDevice;
use crate::error::{AudioError, Result};
use crate::mixer::Mixer;
use crate::pitch::FftSize;
use crate::registry::{DrainSignal, PostMixCallback, Registry, VoiceHandle};
use crate::slide::{SlideHandle, SlideOutcome, SlideScheduler};
use crate::source::Source;
use crate::voice::{Voice, VoiceCallback, VoiceStatus};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// Output channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputChannels {
    Mono,
    #[default]
    Stereo,
}

impl OutputChannels {
    pub fn count(self) -> usize {
        match self {
            OutputChannels::Mono => 1,
            OutputChannels::Stereo => 2,
        }
    }
}

/// Output sample format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    #[default]
    F32,
    /// Accepted by the API but rejected at open
    I16,
}

/// Session parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub sample_rate: u32,
    pub channels: OutputChannels,
    pub format: SampleFormat,
    /// Most frames mixed per chunk; longer periods are split
    pub max_period_frames: usize,
    pub max_voices: usize,
    /// FFT frame for pitch correction
    pub stretch_fft_size: FftSize,
    /// How long `shutdown` waits for the mixer to release every voice
    pub drain_timeout: Duration,
    /// Tick interval of the slide scheduler
    pub slide_step: Duration,
    /// Depth of the control-to-mixer command queue
    pub command_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: OutputChannels::Stereo,
            format: SampleFormat::F32,
            max_period_frames: 4096,
            max_voices: 256,
            stretch_fft_size: FftSize::Medium,
            drain_timeout: Duration::from_secs(5),
            slide_step: Duration::from_millis(5),
            command_capacity: 1024,
        }
    }
}

impl SessionConfig {
    pub const MIN_SAMPLE_RATE: u32 = 8000;
    pub const MAX_SAMPLE_RATE: u32 = 192_000;
    pub const MIN_PERIOD_FRAMES: usize = 256;
    pub const MAX_PERIOD_FRAMES: usize = 16384;

    pub fn validate(&self) -> Result<()> {
        if self.format == SampleFormat::I16 {
            return Err(AudioError::invalid_argument(
                "16-bit integer output is not yet supported",
            ));
        }
        if !(Self::MIN_SAMPLE_RATE..=Self::MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(AudioError::invalid_argument(format!(
                "sample rate {} outside {}..={}",
                self.sample_rate,
                Self::MIN_SAMPLE_RATE,
                Self::MAX_SAMPLE_RATE
            )));
        }
        if !(Self::MIN_PERIOD_FRAMES..=Self::MAX_PERIOD_FRAMES).contains(&self.max_period_frames) {
            return Err(AudioError::invalid_argument(format!(
                "max period of {} frames outside {}..={}",
                self.max_period_frames,
                Self::MIN_PERIOD_FRAMES,
                Self::MAX_PERIOD_FRAMES
            )));
        }
        if self.max_voices == 0 || self.command_capacity == 0 {
            return Err(AudioError::invalid_argument(
                "voice limit and command capacity must be non-zero",
            ));
        }
        if self.slide_step.is_zero() {
            return Err(AudioError::invalid_argument("slide step must be non-zero"));
        }
        Ok(())
    }
}

/// What the session negotiated with the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub channels: usize,
    pub sample_rate: u32,
}

struct SessionInner {
    id: u32,
    config: SessionConfig,
    info: DeviceInfo,
    registry: Registry,
    slides: SlideScheduler,
    device: Mutex<Option<OutputDevice>>,
    closed: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.registry.mark_all_removed();
            self.slides.stop();
            if let Some(mut device) = self.device.lock().take() {
                device.stop();
            }
        }
    }
}

/// A running mixing session.
///
/// Cheap to clone; every clone controls the same voices. Any failing call
/// records its message, readable through [`Session::last_error`].
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open the default output device and start mixing into it
    pub fn open(config: SessionConfig) -> Result<Session> {
        let (session, mixer) = Self::build(config)?;
        let info = session.info();

        let device = OutputDevice::start(mixer, info.channels, info.sample_rate)?;
        *session.inner.device.lock() = Some(device);

        info!(
            "Session {} opened ({} Hz, {} ch)",
            session.id(),
            info.sample_rate,
            info.channels
        );
        Ok(session)
    }

    /// Create a session without an output device. The caller drives the
    /// returned [`Mixer`] itself.
    pub fn headless(config: SessionConfig) -> Result<(Session, Mixer)> {
        let (session, mixer) = Self::build(config)?;
        debug!("Session {} opened headless", session.id());
        Ok((session, mixer))
    }

    fn build(config: SessionConfig) -> Result<(Session, Mixer)> {
        config.validate()?;

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let info = DeviceInfo {
            channels: config.channels.count(),
            sample_rate: config.sample_rate,
        };

        let (tx, rx) = bounded(config.command_capacity);
        let drain = Arc::new(DrainSignal::new());
        let mixer = Mixer::new(
            info.channels,
            config.max_period_frames,
            config.max_voices,
            rx,
            Arc::clone(&drain),
        )?;
        let slides = SlideScheduler::start(config.slide_step)?;

        let inner = SessionInner {
            id,
            registry: Registry::new(id, config.max_voices, tx, drain),
            config,
            info,
            slides,
            device: Mutex::new(None),
            closed: AtomicBool::new(false),
            last_error: Mutex::new(None),
        };
        Ok((
            Session {
                inner: Arc::new(inner),
            },
            mixer,
        ))
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn info(&self) -> DeviceInfo {
        self.inner.info
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Message of the most recent failed call
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Voices registered and not yet released by the mixer
    pub fn voice_count(&self) -> usize {
        self.inner.registry.live()
    }

    /// Register a new voice over `source`. It starts Idle.
    pub fn create_voice<S: Source + 'static>(&self, source: S) -> Result<VoiceHandle> {
        let result = self.ensure_open().and_then(|()| {
            let info = self.inner.info;
            let config = &self.inner.config;
            self.inner.registry.insert(|handle| {
                let chain = TransformChain::new(
                    source.channels(),
                    source.sample_rate(),
                    info.channels,
                    info.sample_rate,
                    config.max_period_frames,
                    config.stretch_fft_size,
                )?;
                Ok(Voice::new(handle, Box::new(source), chain))
            })
        });

        self.track(result).map(|voice| {
            debug!("Voice {} created", voice.handle().index());
            voice.handle()
        })
    }

    /// Release a voice. The mixer drops it at the end of its next period.
    pub fn free(&self, handle: VoiceHandle) -> Result<()> {
        let result = self
            .ensure_open()
            .and_then(|()| self.inner.registry.mark_removed(handle));
        self.track(result).map(|_| debug!("Voice {} freed", handle.index()))
    }

    pub fn play(&self, handle: VoiceHandle, restart: bool) -> Result<()> {
        self.with_voice(handle, |voice| voice.play(restart))
    }

    pub fn pause(&self, handle: VoiceHandle) -> Result<()> {
        self.with_voice(handle, |voice| {
            voice.pause();
            Ok(())
        })
    }

    pub fn stop(&self, handle: VoiceHandle) -> Result<()> {
        self.with_voice(handle, |voice| voice.stop())
    }

    pub fn seek(&self, handle: VoiceHandle, frame: u64) -> Result<()> {
        self.with_voice(handle, |voice| voice.seek(frame))
    }

    pub fn status(&self, handle: VoiceHandle) -> Result<VoiceStatus> {
        self.with_voice(handle, |voice| Ok(voice.status()))
    }

    pub fn is_playing(&self, handle: VoiceHandle) -> Result<bool> {
        self.with_voice(handle, |voice| Ok(voice.is_playing()))
    }

    /// Source cursor of a voice, in source frames
    pub fn position(&self, handle: VoiceHandle) -> Result<u64> {
        self.with_voice(handle, |voice| Ok(voice.position()))
    }

    pub fn set_attribute(
        &self,
        handle: VoiceHandle,
        kind: AttributeKind,
        value: AttributeValue,
    ) -> Result<()> {
        self.with_voice(handle, |voice| voice.set_attribute(kind, value))
    }

    pub fn get_attribute(&self, handle: VoiceHandle, kind: AttributeKind) -> Result<AttributeValue> {
        self.with_voice(handle, |voice| Ok(voice.attribute(kind)))
    }

    /// Slide a float attribute to `target` over `duration`, blocking until
    /// the slide finishes
    pub fn slide_attribute(
        &self,
        handle: VoiceHandle,
        kind: AttributeKind,
        target: f32,
        duration: Duration,
    ) -> Result<SlideOutcome> {
        self.slide_attribute_async(handle, kind, target, duration)
            .map(SlideHandle::wait)
    }

    /// Start a slide and return immediately
    pub fn slide_attribute_async(
        &self,
        handle: VoiceHandle,
        kind: AttributeKind,
        target: f32,
        duration: Duration,
    ) -> Result<SlideHandle> {
        self.with_voice(handle, |voice| {
            self.inner.slides.begin(
                handle,
                Arc::clone(voice.control()),
                kind,
                target,
                duration,
            )
        })
    }

    /// Install or clear the callback that sees this voice's processed block
    pub fn set_callback(&self, handle: VoiceHandle, callback: Option<VoiceCallback>) -> Result<()> {
        self.with_voice(handle, |voice| {
            voice.set_callback(callback);
            Ok(())
        })
    }

    /// Register a global callback. Every registered callback sees each mixed
    /// period before the final clamp, in registration order.
    pub fn set_global_callback(&self, callback: PostMixCallback) -> Result<()> {
        let result = self
            .ensure_open()
            .and_then(|()| self.inner.registry.add_post_mix(callback));
        self.track(result)
    }

    /// Consecutive periods in which the voice failed to render
    pub fn voice_failures(&self, handle: VoiceHandle) -> Result<u32> {
        self.with_voice(handle, |voice| Ok(voice.control().failures()))
    }

    /// Free every voice, stop slides, wait for the mixer to release the
    /// voices and close the output stream.
    pub fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return self.track(Err(AudioError::InvalidState(
                "session is already shut down".into(),
            )));
        }

        let flagged = self.inner.registry.mark_all_removed();
        self.inner.slides.stop();
        debug!("Session {} draining {} voice(s)", self.id(), flagged);

        let drained = self.inner.registry.drain_wait(self.inner.config.drain_timeout);
        if let Err(e) = &drained {
            warn!("Session {} drain failed: {}", self.id(), e);
        }

        if let Some(mut device) = self.inner.device.lock().take() {
            device.stop();
        }
        info!("Session {} shut down", self.id());
        self.track(drained)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(AudioError::InvalidState("session has been shut down".into()));
        }
        Ok(())
    }

    fn with_voice<T>(&self, handle: VoiceHandle, op: impl FnOnce(&Voice) -> Result<T>) -> Result<T> {
        let result = self
            .ensure_open()
            .and_then(|()| self.inner.registry.get(handle))
            .and_then(|voice| op(&voice));
        self.track(result)
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            *self.inner.last_error.lock() = Some(e.to_string());
        }
        result
    }
}
