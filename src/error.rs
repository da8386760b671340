//! Error taxonomy for the audio path.
//!
//! Construction-time failures ([`AudioError::InvalidTopology`],
//! [`AudioError::DecoderCreationFailed`], [`AudioError::DeviceStartFailed`])
//! abort session start. Per-frame failures ([`AudioError::DecodeFailed`],
//! [`AudioError::ConversionFailed`]) are logged where they happen and the frame
//! is dropped.
//!
//! Rejected device preferences are reported through [`PreferenceError`], which
//! is never fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("invalid multistream topology: {0}")]
    InvalidTopology(String),

    #[error("invalid frame size: {samples_per_frame} samples at {sample_rate}Hz")]
    InvalidFrameSize {
        samples_per_frame: u32,
        sample_rate: u32,
    },

    #[error("failed to create multistream decoder: {message} (code {code})")]
    DecoderCreationFailed { code: i32, message: String },

    #[error("failed to decode frame: {0}")]
    DecodeFailed(String),

    #[error("failed to convert block: {0}")]
    ConversionFailed(String),

    #[error("failed to start output device: {0:#}")]
    DeviceStartFailed(anyhow::Error),

    #[error("an audio session is already active")]
    SessionActive,
}

impl AudioError {
    /// Whether the error only affects a single frame.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AudioError::DecodeFailed(_) | AudioError::ConversionFailed(_)
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PreferenceError {
    #[error("sample rate {0}Hz not supported by the output device")]
    SampleRateUnsupported(u32),

    #[error("IO buffer of {frames} frames outside the device range {min}..={max}")]
    BufferSizeOutOfRange { frames: u32, min: u32, max: u32 },

    #[error("output device does not report its IO buffer size range")]
    BufferSizeUnknown,

    #[error("output device unavailable: {0}")]
    DeviceUnavailable(String),
}
