//! Windowed FFT analysis and overlap-add resynthesis

use crate::error::{zeroed, Result};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::{PI, TAU};
use std::sync::Arc;

/// FFT frame length for the pitch corrector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FftSize {
    /// 1024 samples - lower latency, less frequency resolution
    Small = 1024,
    /// 2048 samples - balanced
    #[default]
    Medium = 2048,
    /// 4096 samples - better low end, more latency
    Large = 4096,
}

impl FftSize {
    #[inline]
    pub fn as_usize(self) -> usize {
        self as usize
    }

    /// Analysis step (75% overlap)
    #[inline]
    pub fn hop_size(self) -> usize {
        self.as_usize() / 4
    }

    /// Positive-frequency bins, DC through Nyquist
    #[inline]
    pub fn num_bins(self) -> usize {
        self.as_usize() / 2 + 1
    }

    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            1024 => Some(FftSize::Small),
            2048 => Some(FftSize::Medium),
            4096 => Some(FftSize::Large),
            _ => None,
        }
    }
}

/// Forward/inverse transform pair sharing one window and work buffer
pub struct Stft {
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    /// Periodic Hann window
    window: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    /// Undoes the gain of window-squared overlap-add
    ola_gain: f32,
}

impl Stft {
    pub fn new(fft_size: FftSize) -> Result<Self> {
        let size = fft_size.as_usize();
        let hop = fft_size.hop_size();

        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);

        let mut window = zeroed::<f32>(size, "stft window")?;
        for (i, w) in window.iter_mut().enumerate() {
            *w = 0.5 * (1.0 - (2.0 * PI * i as f32 / size as f32).cos());
        }
        let energy: f32 = window.iter().map(|w| w * w).sum();

        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        Ok(Self {
            size,
            forward,
            inverse,
            ola_gain: hop as f32 / energy,
            window,
            spectrum: zeroed(size, "stft spectrum")?,
            scratch: zeroed(scratch_len, "stft scratch")?,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Window `frame` and transform it. The returned spectrum is the full
    /// `size` bins; only DC..=Nyquist carry information for real input.
    pub fn analyze(&mut self, frame: &[f32]) -> &mut [Complex<f32>] {
        for ((bin, &x), &w) in self.spectrum.iter_mut().zip(frame).zip(&self.window) {
            *bin = Complex::new(x * w, 0.0);
        }
        self.forward
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);
        &mut self.spectrum
    }

    /// Spectrum buffer for writing a synthesis frame
    pub fn spectrum_mut(&mut self) -> &mut [Complex<f32>] {
        &mut self.spectrum
    }

    /// Inverse-transform the spectrum buffer, window it again and add it
    /// into `accum` (at least `size` long).
    pub fn synthesize(&mut self, accum: &mut [f32]) {
        self.inverse
            .process_with_scratch(&mut self.spectrum, &mut self.scratch);

        let scale = self.ola_gain / self.size as f32;
        for ((acc, bin), &w) in accum.iter_mut().zip(&self.spectrum).zip(&self.window) {
            *acc += w * bin.re * scale;
        }
    }
}

/// Wrap a phase into -PI..=PI
#[inline]
pub fn wrap_phase(phase: f32) -> f32 {
    (phase + PI).rem_euclid(TAU) - PI
}
