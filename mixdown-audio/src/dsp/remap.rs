//! Channel count conversion between a source and the output device

/// Most channels a source may carry
pub const MAX_SOURCE_CHANNELS: usize = 8;

/// Converts interleaved frames from `from` channels to `to` channels.
///
/// - mono to N duplicates the sample into every output channel
/// - N to mono averages the input channels
/// - otherwise channels are copied index for index, extra outputs are zeroed
#[derive(Debug, Clone, Copy)]
pub struct ChannelRemap {
    from: usize,
    to: usize,
}

impl ChannelRemap {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    /// True when input and output layouts match
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.from == self.to
    }

    pub fn input_channels(&self) -> usize {
        self.from
    }

    pub fn output_channels(&self) -> usize {
        self.to
    }

    /// Remap `frames` frames from `input` into `output`
    pub fn process(&self, input: &[f32], output: &mut [f32], frames: usize) {
        let (from, to) = (self.from, self.to);

        if from == to {
            output[..frames * to].copy_from_slice(&input[..frames * from]);
            return;
        }

        let inputs = input[..frames * from].chunks_exact(from);
        let outputs = output[..frames * to].chunks_exact_mut(to);

        if from == 1 {
            for (src, dst) in inputs.zip(outputs) {
                dst.fill(src[0]);
            }
        } else if to == 1 {
            let scale = 1.0 / from as f32;
            for (src, dst) in inputs.zip(outputs) {
                dst[0] = src.iter().sum::<f32>() * scale;
            }
        } else {
            let shared = from.min(to);
            for (src, dst) in inputs.zip(outputs) {
                dst[..shared].copy_from_slice(&src[..shared]);
                dst[shared..].fill(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_to_stereo_duplicates() {
        let remap = ChannelRemap::new(1, 2);
        let mut out = [0.0; 6];
        remap.process(&[0.1, 0.2, 0.3], &mut out, 3);
        assert_eq!(out, [0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let remap = ChannelRemap::new(2, 1);
        let mut out = [0.0; 2];
        remap.process(&[1.0, 0.0, 0.5, -0.5], &mut out, 2);
        assert_eq!(out, [0.5, 0.0]);
    }

    #[test]
    fn test_surround_to_stereo_keeps_front_pair() {
        let remap = ChannelRemap::new(4, 2);
        let mut out = [0.0; 2];
        remap.process(&[0.1, 0.2, 0.9, 0.9], &mut out, 1);
        assert_eq!(out, [0.1, 0.2]);
    }

    #[test]
    fn test_identity_copies() {
        let remap = ChannelRemap::new(2, 2);
        assert!(remap.is_identity());
        let mut out = [0.0; 4];
        remap.process(&[1.0, 2.0, 3.0, 4.0], &mut out, 2);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }
}
