//! Pitch correction for rate-shifted voices
//!
//! Resampling a voice by `rate` also scales its pitch by `rate`. The
//! [`PitchCorrector`] undoes that with a phase vocoder: each analysis frame
//! is split into bins, every bin's true frequency is estimated from its phase
//! advance, and the magnitudes are moved to `bin * shift` before resynthesis.
//!
//! The corrector is sample-count neutral (one frame out per frame in) with a
//! fixed delay of one FFT frame. Callers compensate for the delay by priming
//! it on seek and flushing it when the source runs out.

mod stft;

pub use stft::{wrap_phase, FftSize, Stft};

use crate::error::{zeroed, Result};
use rustfft::num_complex::Complex;
use std::f32::consts::TAU;

/// Per-channel FIFOs and phase memory
struct ChannelState {
    input: Vec<f32>,
    output: Vec<f32>,
    accum: Vec<f32>,
    last_phase: Vec<f32>,
    sum_phase: Vec<f32>,
}

impl ChannelState {
    fn new(size: FftSize) -> Result<Self> {
        let n = size.as_usize();
        let bins = size.num_bins();
        Ok(Self {
            input: zeroed(n, "pitch input fifo")?,
            output: zeroed(size.hop_size(), "pitch output fifo")?,
            accum: zeroed(n, "pitch accumulator")?,
            last_phase: zeroed(bins, "pitch phase")?,
            sum_phase: zeroed(bins, "pitch phase")?,
        })
    }

    fn reset(&mut self) {
        self.input.fill(0.0);
        self.output.fill(0.0);
        self.accum.fill(0.0);
        self.last_phase.fill(0.0);
        self.sum_phase.fill(0.0);
    }
}

/// Phase-vocoder pitch shifter over interleaved frames
pub struct PitchCorrector {
    fft_size: FftSize,
    stft: Stft,
    channels: Vec<ChannelState>,
    /// Write index into the input FIFOs
    rover: usize,
    /// Frequency multiplier, 1.0 = unchanged
    shift: f32,
    ana_freq: Vec<f32>,
    ana_mag: Vec<f32>,
    syn_freq: Vec<f32>,
    syn_mag: Vec<f32>,
}

impl PitchCorrector {
    pub fn new(channels: usize, fft_size: FftSize) -> Result<Self> {
        let bins = fft_size.num_bins();
        let mut states = Vec::new();
        states
            .try_reserve_exact(channels)
            .map_err(|e| crate::error::reserve_failed("pitch channels", e))?;
        for _ in 0..channels {
            states.push(ChannelState::new(fft_size)?);
        }

        Ok(Self {
            fft_size,
            stft: Stft::new(fft_size)?,
            channels: states,
            rover: fft_size.as_usize() - fft_size.hop_size(),
            shift: 1.0,
            ana_freq: zeroed(bins, "pitch analysis")?,
            ana_mag: zeroed(bins, "pitch analysis")?,
            syn_freq: zeroed(bins, "pitch synthesis")?,
            syn_mag: zeroed(bins, "pitch synthesis")?,
        })
    }

    /// Set the frequency multiplier. Correcting a voice played at `rate`
    /// uses `1.0 / rate`.
    #[inline]
    pub fn set_shift(&mut self, shift: f32) {
        self.shift = shift;
    }

    #[inline]
    pub fn shift(&self) -> f32 {
        self.shift
    }

    /// Frames buffered before a frame can be analysed
    pub fn input_latency(&self) -> usize {
        self.fft_size.as_usize() - self.fft_size.hop_size()
    }

    /// Frames held back after analysis before they are emitted
    pub fn output_latency(&self) -> usize {
        self.fft_size.hop_size()
    }

    /// Total delay between a frame going in and its corrected version coming out
    pub fn latency(&self) -> usize {
        self.input_latency() + self.output_latency()
    }

    /// Process `frames` interleaved frames from `input` into `output`
    pub fn process(&mut self, input: &[f32], output: &mut [f32], frames: usize) {
        let ch = self.channels.len();
        let n = self.fft_size.as_usize();
        let fifo_latency = self.input_latency();

        for f in 0..frames {
            for (c, state) in self.channels.iter_mut().enumerate() {
                state.input[self.rover] = input[f * ch + c];
                output[f * ch + c] = state.output[self.rover - fifo_latency];
            }
            self.rover += 1;

            if self.rover >= n {
                self.rover = fifo_latency;
                for c in 0..ch {
                    self.process_frame(c);
                }
            }
        }
    }

    /// Clear all buffered audio and phase history
    pub fn reset(&mut self) {
        for state in &mut self.channels {
            state.reset();
        }
        self.rover = self.input_latency();
    }

    fn process_frame(&mut self, channel: usize) {
        let n = self.fft_size.as_usize();
        let hop = self.fft_size.hop_size();
        let bins = self.fft_size.num_bins();
        let oversample = (n / hop) as f32;
        let expected = TAU * hop as f32 / n as f32;
        let shift = self.shift;

        let Self {
            stft,
            channels,
            ana_freq,
            ana_mag,
            syn_freq,
            syn_mag,
            ..
        } = self;
        let state = &mut channels[channel];

        // Analysis: true frequency of each bin, in bins
        let spectrum = stft.analyze(&state.input);
        for k in 0..bins {
            let bin = spectrum[k];
            let phase = bin.arg();
            let delta = phase - state.last_phase[k];
            state.last_phase[k] = phase;

            let deviation = wrap_phase(delta - k as f32 * expected);
            ana_freq[k] = k as f32 + deviation * oversample / TAU;
            // One-sided spectrum: interior bins stand in for their mirror too
            ana_mag[k] = if k == 0 || k == bins - 1 {
                bin.norm()
            } else {
                2.0 * bin.norm()
            };
        }

        // Move energy to the shifted bins
        syn_mag.fill(0.0);
        syn_freq.fill(0.0);
        for k in 0..bins {
            let target = (k as f32 * shift) as usize;
            if target < bins {
                syn_mag[target] += ana_mag[k];
                syn_freq[target] = ana_freq[k] * shift;
            }
        }

        // Synthesis: accumulate phase from the shifted frequencies
        let spectrum = stft.spectrum_mut();
        for k in 0..bins {
            let deviation = (syn_freq[k] - k as f32) * TAU / oversample;
            let advance = deviation + k as f32 * expected;
            state.sum_phase[k] = (state.sum_phase[k] + advance).rem_euclid(TAU);
            spectrum[k] = Complex::from_polar(syn_mag[k], state.sum_phase[k]);
        }
        for bin in &mut spectrum[bins..] {
            *bin = Complex::new(0.0, 0.0);
        }
        stft.synthesize(&mut state.accum);

        state.output.copy_from_slice(&state.accum[..hop]);
        state.accum.copy_within(hop.., 0);
        state.accum[n - hop..].fill(0.0);
        state.input.copy_within(hop.., 0);
    }
}
