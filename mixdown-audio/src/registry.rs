//! Voice registry - control-side slots and the mixer-side active list
//!
//! Control threads own a generation-checked slot arena guarded by a mutex.
//! New voices reach the mixer over a bounded channel, so the mixer never
//! touches that mutex. Freed voices are only flagged; the mixer erases them
//! in its sweep, which is the only place a voice is dropped.

use crate::error::{AudioError, Result};
use crate::mixer::POST_MIX_CAPACITY;
use crate::voice::Voice;
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Called on the mixer thread with the whole mixed period (interleaved) and
/// its frame count, before the final clamp.
pub type PostMixCallback = Box<dyn FnMut(&mut [f32], usize) + Send>;

/// Identifies a voice within one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceHandle {
    session: u32,
    index: u32,
    generation: u32,
}

impl VoiceHandle {
    pub(crate) fn new(session: u32, index: u32, generation: u32) -> Self {
        Self {
            session,
            index,
            generation,
        }
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Messages from control threads to the mixer
pub(crate) enum MixerCommand {
    Insert(Arc<Voice>),
    AddPostMix(PostMixCallback),
}

/// Count of voices the mixer has yet to retire, with a wakeup for waiters
pub(crate) struct DrainSignal {
    live: AtomicUsize,
    lock: Mutex<()>,
    drained: Condvar,
}

impl DrainSignal {
    pub(crate) fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
            lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn added(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    /// Mixer side: `count` voices were erased
    pub(crate) fn retired(&self, count: usize) {
        if count == 0 {
            return;
        }
        if self.live.fetch_sub(count, Ordering::AcqRel) == count {
            // Taken only on the transition to empty
            let _guard = self.lock.lock();
            self.drained.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while self.live() > 0 {
            if self.drained.wait_until(&mut guard, deadline).timed_out() {
                let live = self.live();
                if live == 0 {
                    break;
                }
                return Err(AudioError::Timeout(format!(
                    "{live} voice(s) still active after {timeout:?}"
                )));
            }
        }
        Ok(())
    }
}

struct Slot {
    generation: u32,
    voice: Option<Arc<Voice>>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Control-side view of a session's voices
pub(crate) struct Registry {
    session: u32,
    max_voices: usize,
    arena: Mutex<Arena>,
    commands: Sender<MixerCommand>,
    drain: Arc<DrainSignal>,
    post_mix: AtomicUsize,
}

impl Registry {
    pub(crate) fn new(
        session: u32,
        max_voices: usize,
        commands: Sender<MixerCommand>,
        drain: Arc<DrainSignal>,
    ) -> Self {
        Self {
            session,
            max_voices,
            arena: Mutex::new(Arena::default()),
            commands,
            drain,
            post_mix: AtomicUsize::new(0),
        }
    }

    /// Allocate a slot, build the voice for its handle and hand it to the mixer
    pub(crate) fn insert(
        &self,
        build: impl FnOnce(VoiceHandle) -> Result<Voice>,
    ) -> Result<Arc<Voice>> {
        let mut arena = self.arena.lock();

        if self.drain.live() >= self.max_voices {
            return Err(AudioError::invalid_operation(format!(
                "voice limit of {} reached",
                self.max_voices
            )));
        }

        let index = match arena.free.pop() {
            Some(index) => index,
            None => {
                arena.slots.push(Slot {
                    generation: 0,
                    voice: None,
                });
                (arena.slots.len() - 1) as u32
            }
        };
        let handle = VoiceHandle::new(self.session, index, arena.slots[index as usize].generation);

        let voice = match build(handle) {
            Ok(voice) => Arc::new(voice),
            Err(e) => {
                arena.free.push(index);
                return Err(e);
            }
        };

        self.drain.added();
        if let Err(e) = self.commands.try_send(MixerCommand::Insert(Arc::clone(&voice))) {
            self.drain.retired(1);
            arena.free.push(index);
            return Err(match e {
                TrySendError::Full(_) => AudioError::invalid_operation("mixer command queue is full"),
                TrySendError::Disconnected(_) => AudioError::invalid_operation("mixer is gone"),
            });
        }

        arena.slots[index as usize].voice = Some(Arc::clone(&voice));
        Ok(voice)
    }

    /// Resolve a handle to its live voice
    pub(crate) fn get(&self, handle: VoiceHandle) -> Result<Arc<Voice>> {
        let arena = self.arena.lock();
        self.resolve(&arena, handle).map(Arc::clone)
    }

    /// Flag a voice for removal and vacate its slot. The mixer drops it on
    /// its next sweep.
    pub(crate) fn mark_removed(&self, handle: VoiceHandle) -> Result<Arc<Voice>> {
        let mut arena = self.arena.lock();
        self.resolve(&arena, handle)?;

        let slot = &mut arena.slots[handle.index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let voice = slot.voice.take().ok_or_else(|| {
            AudioError::invalid_argument("voice slot is empty")
        })?;
        voice.control().mark_removed();
        arena.free.push(handle.index);
        Ok(voice)
    }

    /// Flag every live voice, returning how many were flagged
    pub(crate) fn mark_all_removed(&self) -> usize {
        let mut arena = self.arena.lock();
        let Arena { slots, free } = &mut *arena;
        let mut count = 0;
        for (index, slot) in slots.iter_mut().enumerate() {
            if let Some(voice) = slot.voice.take() {
                voice.control().mark_removed();
                slot.generation = slot.generation.wrapping_add(1);
                free.push(index as u32);
                count += 1;
            }
        }
        count
    }

    pub(crate) fn add_post_mix(&self, callback: PostMixCallback) -> Result<()> {
        let taken = self.post_mix.fetch_add(1, Ordering::AcqRel);
        if taken >= POST_MIX_CAPACITY {
            self.post_mix.fetch_sub(1, Ordering::AcqRel);
            return Err(AudioError::invalid_operation(format!(
                "at most {POST_MIX_CAPACITY} global callbacks"
            )));
        }
        self.commands
            .try_send(MixerCommand::AddPostMix(callback))
            .map_err(|_| {
                self.post_mix.fetch_sub(1, Ordering::AcqRel);
                AudioError::invalid_operation("mixer command queue is unavailable")
            })
    }

    /// Voices not yet erased by the mixer
    pub(crate) fn live(&self) -> usize {
        self.drain.live()
    }

    /// Block until the mixer has erased every voice
    pub(crate) fn drain_wait(&self, timeout: Duration) -> Result<()> {
        self.drain.wait(timeout)
    }

    fn resolve<'a>(&self, arena: &'a Arena, handle: VoiceHandle) -> Result<&'a Arc<Voice>> {
        if handle.session != self.session {
            return Err(AudioError::InvalidData(format!(
                "voice belongs to session {}, not {}",
                handle.session, self.session
            )));
        }
        arena
            .slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.voice.as_ref())
            .ok_or_else(|| AudioError::invalid_argument("stale or unknown voice handle"))
    }
}

/// Mixer-side list of voices being mixed
pub(crate) struct ActiveVoices {
    voices: Vec<Arc<Voice>>,
    drain: Arc<DrainSignal>,
}

impl ActiveVoices {
    pub(crate) fn with_capacity(capacity: usize, drain: Arc<DrainSignal>) -> Result<Self> {
        let mut voices = Vec::new();
        voices
            .try_reserve_exact(capacity)
            .map_err(|e| crate::error::reserve_failed("voice list", e))?;
        Ok(Self { voices, drain })
    }

    pub(crate) fn adopt(&mut self, voice: Arc<Voice>) {
        self.voices.push(voice);
    }

    pub(crate) fn iter(&self) -> std::slice::Iter<'_, Arc<Voice>> {
        self.voices.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.voices.len()
    }

    /// Erase every voice flagged as removed
    pub(crate) fn sweep(&mut self) {
        let before = self.voices.len();
        self.voices.retain(|voice| !voice.control().is_removed());
        self.drain.retired(before - self.voices.len());
    }
}
