//! Interleaved to planar sample-format conversion.
//!
//! The decoder emits interleaved `f32`; the device graph takes planar `f32` at
//! the same rate and channel count. Only the memory layout changes.
//!
//! [`Downmix`] folds surround layouts onto a device with fewer channels.

use std::f32::consts::FRAC_1_SQRT_2;

use crate::audio::frame::{DecodedAudioBlock, PlanarBuffer};
use crate::error::AudioError;

/// Converts decoded blocks of one fixed format into planar buffers.
#[derive(Debug, Clone)]
pub struct FormatConverter {
    channels: usize,
    sample_rate: u32,
}

impl FormatConverter {
    pub fn new(channels: usize, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Deinterleave the valid frames of `block`.
    pub fn convert(&self, block: &DecodedAudioBlock) -> Result<PlanarBuffer, AudioError> {
        if block.channels() != self.channels {
            return Err(AudioError::ConversionFailed(format!(
                "block has {} channels, converter expects {}",
                block.channels(),
                self.channels
            )));
        }
        if block.sample_rate() != self.sample_rate {
            return Err(AudioError::ConversionFailed(format!(
                "block is {}Hz, converter expects {}Hz",
                block.sample_rate(),
                self.sample_rate
            )));
        }
        if block.frame_count() == 0 {
            return Err(AudioError::ConversionFailed("block holds no frames".into()));
        }

        let frames = block.frame_count();
        let mut planar = PlanarBuffer::new(frames, self.channels, self.sample_rate);
        for (frame_idx, frame) in block.interleaved().chunks_exact(self.channels).enumerate() {
            for (channel_idx, &sample) in frame.iter().enumerate() {
                planar.channel_mut(channel_idx)[frame_idx] = sample;
            }
        }
        Ok(planar)
    }
}

/// 5.1 (FL FR FC LFE BL BR) to stereo. LFE is left out.
const STEREO_FROM_51: [[f32; 6]; 2] = [
    [1.0, 0.0, FRAC_1_SQRT_2, 0.0, FRAC_1_SQRT_2, 0.0],
    [0.0, 1.0, FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2],
];

/// 7.1 (FL FR FC LFE BL BR SL SR) to stereo. LFE is left out.
const STEREO_FROM_71: [[f32; 8]; 2] = [
    [1.0, 0.0, FRAC_1_SQRT_2, 0.0, FRAC_1_SQRT_2, 0.0, FRAC_1_SQRT_2, 0.0],
    [0.0, 1.0, FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2, 0.0, FRAC_1_SQRT_2],
];

/// Mixing matrix from session channels to fewer device channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Downmix {
    /// `matrix[out][in]`
    matrix: Vec<Vec<f32>>,
}

impl Downmix {
    /// Matrix for playing `source` channels on `target` device channels.
    ///
    /// Only 5.1 and 7.1 onto stereo have one. Other layouts return `None` and
    /// are routed by channel index.
    pub fn new(source: usize, target: usize) -> Option<Self> {
        let matrix = match (source, target) {
            (6, 2) => STEREO_FROM_51.iter().map(|row| row.to_vec()).collect(),
            (8, 2) => STEREO_FROM_71.iter().map(|row| row.to_vec()).collect(),
            _ => return None,
        };
        Some(Self { matrix })
    }

    pub fn input_channels(&self) -> usize {
        self.matrix.first().map_or(0, Vec::len)
    }

    pub fn output_channels(&self) -> usize {
        self.matrix.len()
    }

    pub fn apply(&self, buffer: &PlanarBuffer) -> PlanarBuffer {
        let mut mixed = PlanarBuffer::new(
            buffer.frames(),
            self.output_channels(),
            buffer.sample_rate(),
        );
        for (out_idx, weights) in self.matrix.iter().enumerate() {
            let out = mixed.channel_mut(out_idx);
            for (in_idx, &weight) in weights.iter().enumerate() {
                if weight == 0.0 || in_idx >= buffer.channels() {
                    continue;
                }
                for (dst, &src) in out.iter_mut().zip(buffer.channel(in_idx)) {
                    *dst += weight * src;
                }
            }
        }
        mixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_block_is_separated_per_channel() {
        let converter = FormatConverter::new(2, 48000);
        let samples: Vec<f32> = (0..240)
            .flat_map(|i| [i as f32, -(i as f32)])
            .collect();
        let block = DecodedAudioBlock::from_interleaved(samples, 2, 48000).unwrap();

        let planar = converter.convert(&block).unwrap();

        assert_eq!(planar.frames(), 240);
        assert_eq!(planar.channels(), 2);
        assert!(planar.channel(0).iter().enumerate().all(|(i, &s)| s == i as f32));
        assert!(planar.channel(1).iter().enumerate().all(|(i, &s)| s == -(i as f32)));
    }

    #[test]
    fn test_stale_trailing_samples_are_not_converted() {
        let converter = FormatConverter::new(2, 48000);
        let mut block = DecodedAudioBlock::with_capacity(240, 2, 48000);
        block.storage_mut().fill(0.75);
        block.storage_mut()[..4].copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);
        block.set_frame_count(2).unwrap();

        let planar = converter.convert(&block).unwrap();

        assert_eq!(planar.frames(), 2);
        assert_eq!(planar.channel(0), &[0.1, 0.3]);
        assert_eq!(planar.channel(1), &[0.2, 0.4]);
    }

    #[test]
    fn test_surround_layout() {
        let converter = FormatConverter::new(6, 48000);
        let samples: Vec<f32> = (0..10)
            .flat_map(|_| (0..6).map(|c| c as f32))
            .collect();
        let block = DecodedAudioBlock::from_interleaved(samples, 6, 48000).unwrap();

        let planar = converter.convert(&block).unwrap();
        for c in 0..6 {
            assert!(planar.channel(c).iter().all(|&s| s == c as f32));
        }
    }

    #[test]
    fn test_format_mismatch_fails() {
        let converter = FormatConverter::new(2, 48000);

        let mono = DecodedAudioBlock::from_interleaved(vec![0.0; 10], 1, 48000).unwrap();
        assert!(matches!(
            converter.convert(&mono),
            Err(AudioError::ConversionFailed(_))
        ));

        let wrong_rate = DecodedAudioBlock::from_interleaved(vec![0.0; 10], 2, 24000).unwrap();
        assert!(matches!(
            converter.convert(&wrong_rate),
            Err(AudioError::ConversionFailed(_))
        ));

        let empty = DecodedAudioBlock::with_capacity(240, 2, 48000);
        assert!(matches!(
            converter.convert(&empty),
            Err(AudioError::ConversionFailed(_))
        ));
    }

    fn marked(channels: usize, marked: usize) -> PlanarBuffer {
        let mut buffer = PlanarBuffer::new(4, channels, 48000);
        buffer.channel_mut(marked).fill(1.0);
        buffer
    }

    #[test]
    fn test_center_folds_into_both_sides() {
        let downmix = Downmix::new(6, 2).unwrap();
        assert_eq!(downmix.input_channels(), 6);

        let mixed = downmix.apply(&marked(6, 2));

        assert_eq!(mixed.channels(), 2);
        assert_eq!(mixed.frames(), 4);
        assert_eq!(mixed.sample_rate(), 48000);
        for ch in 0..2 {
            assert!(mixed.channel(ch).iter().all(|&s| (s - FRAC_1_SQRT_2).abs() < 1e-6));
        }
    }

    #[test]
    fn test_lfe_is_left_out_of_stereo() {
        let mixed = Downmix::new(6, 2).unwrap().apply(&marked(6, 3));
        assert!(mixed.channel(0).iter().chain(mixed.channel(1)).all(|&s| s == 0.0));
    }

    #[test]
    fn test_side_channels_stay_on_their_side() {
        let downmix = Downmix::new(8, 2).unwrap();

        let left = downmix.apply(&marked(8, 6));
        assert!(left.channel(0).iter().all(|&s| s > 0.7));
        assert!(left.channel(1).iter().all(|&s| s == 0.0));

        let right = downmix.apply(&marked(8, 5));
        assert!(right.channel(0).iter().all(|&s| s == 0.0));
        assert!(right.channel(1).iter().all(|&s| s > 0.7));

        let front = downmix.apply(&marked(8, 0));
        assert_eq!(front.channel(0), &[1.0; 4]);
        assert_eq!(front.channel(1), &[0.0; 4]);
    }

    #[test]
    fn test_other_layouts_have_no_matrix() {
        assert_eq!(Downmix::new(2, 2), None);
        assert_eq!(Downmix::new(6, 4), None);
        assert_eq!(Downmix::new(2, 6), None);
        assert_eq!(Downmix::new(8, 1), None);
    }
}
