//! Stereo balance

/// Balance-style panner.
///
/// Negative pan attenuates the right channel by `1 + pan`, positive pan
/// attenuates the left channel by `1 - pan`. The louder side is never
/// boosted, so centre (0.0) is an exact pass-through.
#[derive(Debug, Clone, Copy, Default)]
pub struct Panner {
    pan: f32,
}

impl Panner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set pan position, clamped to -1.0..=1.0
    #[inline]
    pub fn set_pan(&mut self, pan: f32) {
        self.pan = pan.clamp(-1.0, 1.0);
    }

    #[inline]
    pub fn pan(&self) -> f32 {
        self.pan
    }

    /// Pan interleaved frames in place. Anything other than stereo passes through.
    pub fn process(&self, samples: &mut [f32], channels: usize) {
        if channels != 2 || self.pan == 0.0 {
            return;
        }

        let (left, right) = if self.pan < 0.0 {
            (1.0, 1.0 + self.pan)
        } else {
            (1.0 - self.pan, 1.0)
        };

        for frame in samples.chunks_exact_mut(2) {
            frame[0] *= left;
            frame[1] *= right;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_left() {
        let mut p = Panner::new();
        p.set_pan(-1.0);
        let mut block = [0.5, 0.5, 0.25, 0.25];
        p.process(&mut block, 2);
        assert_eq!(block, [0.5, 0.0, 0.25, 0.0]);
    }

    #[test]
    fn test_partial_right() {
        let mut p = Panner::new();
        p.set_pan(0.5);
        let mut block = [1.0, 1.0];
        p.process(&mut block, 2);
        assert_eq!(block, [0.5, 1.0]);
    }

    #[test]
    fn test_mono_untouched() {
        let mut p = Panner::new();
        p.set_pan(1.0);
        let mut block = [0.3, 0.4];
        p.process(&mut block, 1);
        assert_eq!(block, [0.3, 0.4]);
    }

    #[test]
    fn test_clamped() {
        let mut p = Panner::new();
        p.set_pan(-7.0);
        assert_eq!(p.pan(), -1.0);
    }
}
