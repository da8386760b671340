use anyhow::Result;

/// One decoded frame of interleaved `f32` samples.
///
/// The sample storage is sized for the session's `samples_per_frame`; only the
/// first `frame_count` frames are valid. Everything past that is stale and must
/// never reach the device.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudioBlock {
    samples: Vec<f32>,
    frame_count: usize,
    channels: usize,
    sample_rate: u32,
}

impl DecodedAudioBlock {
    /// Create a silent block able to hold `capacity` frames.
    pub fn with_capacity(capacity: usize, channels: usize, sample_rate: u32) -> Self {
        Self {
            samples: vec![0.0; capacity * channels],
            frame_count: 0,
            channels,
            sample_rate,
        }
    }

    /// Create a block from interleaved samples, all of which are valid.
    ///
    /// Returns an error if the data length is not a multiple of the channel count.
    pub fn from_interleaved(samples: Vec<f32>, channels: usize, sample_rate: u32) -> Result<Self> {
        if channels == 0 || samples.len() % channels != 0 {
            anyhow::bail!(
                "Data length {} must be a multiple of channels {}",
                samples.len(),
                channels
            );
        }
        let frame_count = samples.len() / channels;
        Ok(Self {
            samples,
            frame_count,
            channels,
            sample_rate,
        })
    }

    /// Mark how many frames hold decoded audio.
    ///
    /// Returns an error if `frames` exceeds the capacity.
    pub fn set_frame_count(&mut self, frames: usize) -> Result<()> {
        if frames > self.capacity() {
            anyhow::bail!(
                "Frame count {} exceeds capacity {}",
                frames,
                self.capacity()
            );
        }
        self.frame_count = frames;
        Ok(())
    }

    /// Number of valid frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Number of frames the storage can hold.
    pub fn capacity(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Valid interleaved samples.
    pub fn interleaved(&self) -> &[f32] {
        &self.samples[..self.frame_count * self.channels]
    }

    /// Whole sample storage, including frames past `frame_count`.
    pub fn storage_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    /// Returns an iterator over the valid samples of one channel.
    pub fn iter_channel(&self, channel_idx: usize) -> impl Iterator<Item = &f32> {
        assert!(
            channel_idx < self.channels,
            "Channel index {} out of bounds (max {})",
            channel_idx,
            self.channels - 1
        );
        self.interleaved().iter().skip(channel_idx).step_by(self.channels)
    }
}

/// Non-interleaved `f32` audio: each channel occupies its own contiguous region.
///
/// This is the layout the output device consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarBuffer {
    data: Vec<f32>,
    frames: usize,
    channels: usize,
    sample_rate: u32,
}

impl PlanarBuffer {
    pub fn new(frames: usize, channels: usize, sample_rate: u32) -> Self {
        Self {
            data: vec![0.0; frames * channels],
            frames,
            channels,
            sample_rate,
        }
    }

    /// Build a buffer from one sample vector per channel.
    ///
    /// Channels longer than the shortest one are truncated.
    pub fn from_channels(channels: &[Vec<f32>], sample_rate: u32) -> Self {
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        let mut data = Vec::with_capacity(frames * channels.len());
        for channel in channels {
            data.extend_from_slice(&channel[..frames]);
        }
        Self {
            data,
            frames,
            channels: channels.len(),
            sample_rate,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel(&self, channel_idx: usize) -> &[f32] {
        let start = channel_idx * self.frames;
        &self.data[start..start + self.frames]
    }

    pub fn channel_mut(&mut self, channel_idx: usize) -> &mut [f32] {
        let start = channel_idx * self.frames;
        &mut self.data[start..start + self.frames]
    }

    /// Sample at `frame` of `channel_idx`, or silence for a channel this buffer lacks.
    #[inline]
    pub fn sample_or_silence(&self, channel_idx: usize, frame: usize) -> f32 {
        if channel_idx < self.channels {
            self.data[channel_idx * self.frames + frame]
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_channel_iter() {
        let samples = vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0]; // L1, R1, L2, R2, L3, R3
        let block = DecodedAudioBlock::from_interleaved(samples, 2, 48000).unwrap();

        let left: Vec<_> = block.iter_channel(0).cloned().collect();
        let right: Vec<_> = block.iter_channel(1).cloned().collect();

        assert_eq!(left, vec![1.0, 2.0, 3.0]);
        assert_eq!(right, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_block_validation() {
        assert!(DecodedAudioBlock::from_interleaved(vec![0.0; 961], 2, 48000).is_err());
        assert!(DecodedAudioBlock::from_interleaved(vec![0.0; 4], 0, 48000).is_err());
    }

    #[test]
    fn test_frame_count_limits_valid_samples() {
        let mut block = DecodedAudioBlock::with_capacity(4, 2, 48000);
        block
            .storage_mut()
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 9.0, 9.0, 9.0, 9.0]);
        block.set_frame_count(2).unwrap();

        assert_eq!(block.capacity(), 4);
        assert_eq!(block.interleaved(), &[1.0, 2.0, 3.0, 4.0]);
        assert!(block.set_frame_count(5).is_err());
    }

    #[test]
    fn test_planar_channels_are_contiguous() {
        let mut buffer = PlanarBuffer::new(3, 2, 48000);
        buffer.channel_mut(0).copy_from_slice(&[1.0, 2.0, 3.0]);
        buffer.channel_mut(1).copy_from_slice(&[4.0, 5.0, 6.0]);

        assert_eq!(buffer.channel(0), &[1.0, 2.0, 3.0]);
        assert_eq!(buffer.channel(1), &[4.0, 5.0, 6.0]);
        assert_eq!(buffer.sample_or_silence(1, 2), 6.0);
        assert_eq!(buffer.sample_or_silence(2, 0), 0.0);
    }

    #[test]
    fn test_planar_from_channels_truncates_to_shortest() {
        let buffer = PlanarBuffer::from_channels(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0]], 48000);
        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.channel(0), &[1.0, 2.0]);
        assert_eq!(buffer.channel(1), &[4.0, 5.0]);
    }
}
