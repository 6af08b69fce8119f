//! Mixer - the real-time period routine that sums every playing voice

use crate::error::{zeroed, Result};
use crate::registry::{ActiveVoices, DrainSignal, MixerCommand, PostMixCallback};
use crate::voice::VoiceStatus;
use crossbeam_channel::Receiver;
use std::sync::Arc;

/// Post-mix callbacks the mixer can take without reallocating
pub(crate) const POST_MIX_CAPACITY: usize = 16;

/// Mixes all active voices into an output buffer.
///
/// Owned by the output device's callback (or by the caller in headless
/// mode). `process` never blocks, logs or allocates: new voices arrive over
/// a channel, engines are only `try_lock`ed, and every buffer is sized when
/// the session opens.
pub struct Mixer {
    channels: usize,
    max_frames: usize,
    commands: Receiver<MixerCommand>,
    voices: ActiveVoices,
    post_mix: Vec<PostMixCallback>,
    /// One voice's rendered block
    block: Vec<f32>,
}

impl Mixer {
    pub(crate) fn new(
        channels: usize,
        max_frames: usize,
        max_voices: usize,
        commands: Receiver<MixerCommand>,
        drain: Arc<DrainSignal>,
    ) -> Result<Self> {
        let mut post_mix = Vec::new();
        post_mix
            .try_reserve_exact(POST_MIX_CAPACITY)
            .map_err(|e| crate::error::reserve_failed("post-mix callbacks", e))?;

        Ok(Self {
            channels,
            max_frames,
            commands,
            voices: ActiveVoices::with_capacity(max_voices, drain)?,
            post_mix,
            block: zeroed(channels * max_frames, "mixer block")?,
        })
    }

    /// Interleaved channel count of the output
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Voices currently held by the mixer, including ones awaiting the sweep
    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Fill `output` (interleaved) with one period of mixed audio
    pub fn process(&mut self, output: &mut [f32]) {
        output.fill(0.0);
        self.adopt_pending();

        let ch = self.channels;
        let total = output.len() / ch;
        let mut offset = 0;
        while offset < total {
            let frames = (total - offset).min(self.max_frames);
            self.mix_chunk(&mut output[offset * ch..(offset + frames) * ch], frames);
            offset += frames;
        }

        self.voices.sweep();

        for callback in &mut self.post_mix {
            callback(output, total);
        }

        for sample in output.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }

    fn adopt_pending(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                MixerCommand::Insert(voice) => self.voices.adopt(voice),
                MixerCommand::AddPostMix(callback) => self.post_mix.push(callback),
            }
        }
    }

    fn mix_chunk(&mut self, out: &mut [f32], frames: usize) {
        let ch = self.channels;

        for voice in self.voices.iter() {
            let control = voice.control();
            if control.is_removed() || control.status() != VoiceStatus::Playing {
                continue;
            }

            let block = &mut self.block[..frames * ch];
            match voice.render(block, frames) {
                // Engine busy on a control thread
                None => {}
                Some(Err(_)) => control.record_failure(),
                Some(Ok(produced)) => {
                    control.clear_failures();
                    for (o, s) in out.iter_mut().zip(&block[..produced * ch]) {
                        *o += *s;
                    }
                }
            }
        }
    }
}
