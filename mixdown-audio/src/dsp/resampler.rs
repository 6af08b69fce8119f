//! Variable-rate linear interpolation resampler
//!
//! Positions are tracked in input frames. Two frames of history are kept so
//! interpolation continues seamlessly across block boundaries:
//!
//! ```text
//!   F[-1] = prev   F[0] = last   F[1..=n] = this block's input
//! ```
//!
//! An output frame at position `q` blends `F[floor(q)]` and `F[floor(q) + 1]`.
//! When `q` lands exactly on a frame the sample is copied verbatim, which makes
//! a ratio of 1.0 bit-exact.

/// Linear resampler over interleaved frames
#[derive(Debug, Clone)]
pub struct LinearResampler {
    channels: usize,
    /// Input frames consumed per output frame
    ratio: f64,
    /// Position of the next output frame, relative to `F[0]`
    pos: f64,
    prev: Vec<f32>,
    last: Vec<f32>,
}

impl LinearResampler {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            ratio: 1.0,
            pos: 1.0,
            prev: vec![0.0; channels],
            last: vec![0.0; channels],
        }
    }

    /// Set the step ratio. 2.0 plays twice as fast, 0.5 half as fast.
    #[inline]
    pub fn set_ratio(&mut self, ratio: f64) {
        self.ratio = ratio;
    }

    #[inline]
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// True while the resampler would hand frames through unchanged
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.ratio == 1.0 && self.pos.fract() == 0.0
    }

    /// Input frames needed to produce `output_frames` more frames
    pub fn required_input(&self, output_frames: usize) -> usize {
        if output_frames == 0 {
            return 0;
        }
        // Step exactly as `process` does so both agree on rounding
        let mut q = self.pos;
        for _ in 1..output_frames {
            q += self.ratio;
        }
        let (base, frac) = split(q);
        let needed = if frac == 0.0 { base } else { base + 1.0 };
        needed.max(0.0) as usize
    }

    /// Most output frames `input_frames` of input can produce
    pub fn max_output_for_input(&self, input_frames: usize) -> usize {
        let span = input_frames as f64 - self.pos;
        if span < 0.0 {
            return 0;
        }
        (span / self.ratio).floor() as usize + 1
    }

    /// Consume all `input_frames` frames and write up to `output_frames` frames.
    ///
    /// Returns the number of frames produced. Fewer than requested means the
    /// input ran out; the remaining position carries over to the next call.
    pub fn process(
        &mut self,
        input: &[f32],
        input_frames: usize,
        output: &mut [f32],
        output_frames: usize,
    ) -> usize {
        let ch = self.channels;
        let available = input_frames as f64;
        let mut produced = 0;

        while produced < output_frames {
            let (base, frac) = split(self.pos);
            let needed = if frac == 0.0 { base } else { base + 1.0 };
            if needed > available {
                break;
            }

            let i = base as isize;
            let out = &mut output[produced * ch..(produced + 1) * ch];
            let a = self.frame(input, i);
            if frac == 0.0 {
                out.copy_from_slice(a);
            } else {
                let b = self.frame(input, i + 1);
                let t = frac as f32;
                for c in 0..ch {
                    out[c] = a[c] * (1.0 - t) + b[c] * t;
                }
            }

            produced += 1;
            self.pos += self.ratio;
        }

        self.consume(input, input_frames);
        produced
    }

    /// Forget history and restart at the first input frame
    pub fn reset(&mut self) {
        self.pos = 1.0;
        self.prev.fill(0.0);
        self.last.fill(0.0);
    }

    #[inline]
    fn frame<'a>(&'a self, input: &'a [f32], index: isize) -> &'a [f32] {
        let ch = self.channels;
        match index {
            -1 => &self.prev,
            0 => &self.last,
            i => {
                let i = i as usize;
                &input[(i - 1) * ch..i * ch]
            }
        }
    }

    fn consume(&mut self, input: &[f32], frames: usize) {
        let ch = self.channels;
        match frames {
            0 => return,
            1 => {
                self.prev.copy_from_slice(&self.last);
                self.last.copy_from_slice(&input[..ch]);
            }
            n => {
                self.prev.copy_from_slice(&input[(n - 2) * ch..(n - 1) * ch]);
                self.last.copy_from_slice(&input[(n - 1) * ch..n * ch]);
            }
        }
        self.pos -= frames as f64;
    }
}

/// Split a position into whole frame and fraction, snapping values within
/// rounding noise of a frame boundary onto it.
#[inline]
fn split(q: f64) -> (f64, f64) {
    const SNAP: f64 = 1e-9;
    let base = q.floor();
    let frac = q - base;
    if frac < SNAP {
        (base, 0.0)
    } else if frac > 1.0 - SNAP {
        (base + 1.0, 0.0)
    } else {
        (base, frac)
    }
}
