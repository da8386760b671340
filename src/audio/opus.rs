//! Opus multistream decoding.
//!
//! The host sends one Opus multistream packet per audio frame. Coupled streams
//! decode as stereo pairs, the rest as mono, and the decoder's channel mapping
//! places them in speaker order. The `opus` crate only wraps the single-stream
//! API, so the multistream decoder is driven through `audiopus_sys`.
//!
//! Decoding is meant to run directly on the thread that receives frames.

use std::ffi::CStr;
use std::ptr::{self, NonNull};

use audiopus_sys::OpusMSDecoder;
use tracing::debug;

use super::config::SessionAudioConfig;
use super::frame::DecodedAudioBlock;
use crate::error::AudioError;

fn opus_error_message(code: i32) -> String {
    // SAFETY: opus_strerror returns a pointer to a static NUL-terminated string
    // for every input value.
    unsafe { CStr::from_ptr(audiopus_sys::opus_strerror(code)) }
        .to_string_lossy()
        .into_owned()
}

/// Stateful multistream decoder bound to one session configuration.
///
/// The decoder carries concealment state from frame to frame, so a failed
/// frame never resets it: the next frame in sequence must see the same state.
pub struct FrameDecoder {
    decoder: Option<NonNull<OpusMSDecoder>>,
    channels: usize,
    sample_rate: u32,
    samples_per_frame: usize,
}

// SAFETY: the decoder state is only reachable through `&mut self`, so moving the
// owner to another thread moves exclusive access with it.
unsafe impl Send for FrameDecoder {}

impl FrameDecoder {
    pub fn open(config: &SessionAudioConfig) -> Result<Self, AudioError> {
        let mut error: i32 = 0;

        // SAFETY: the mapping slice holds exactly `channel_count` entries, which
        // is what the decoder reads.
        let decoder = unsafe {
            audiopus_sys::opus_multistream_decoder_create(
                config.sample_rate() as i32,
                config.channel_count() as i32,
                config.stream_count() as i32,
                config.coupled_stream_count() as i32,
                config.channel_mapping().as_ptr(),
                &mut error,
            )
        };

        let decoder = match NonNull::new(decoder) {
            Some(decoder) if error == audiopus_sys::OPUS_OK as i32 => decoder,
            Some(decoder) => {
                // SAFETY: non-null pointer freshly returned by the create call.
                unsafe { audiopus_sys::opus_multistream_decoder_destroy(decoder.as_ptr()) };
                return Err(AudioError::DecoderCreationFailed {
                    code: error,
                    message: opus_error_message(error),
                });
            }
            None => {
                return Err(AudioError::DecoderCreationFailed {
                    code: error,
                    message: opus_error_message(error),
                });
            }
        };

        debug!(
            "Opus multistream decoder created: {}Hz, {} channels",
            config.sample_rate(),
            config.channel_count()
        );

        Ok(Self {
            decoder: Some(decoder),
            channels: config.channels(),
            sample_rate: config.sample_rate(),
            samples_per_frame: config.samples_per_frame() as usize,
        })
    }

    pub fn is_open(&self) -> bool {
        self.decoder.is_some()
    }

    /// Decode one encoded frame.
    ///
    /// The returned block holds as many frames as the decoder produced, never
    /// more than the session's `samples_per_frame`.
    pub fn decode(&mut self, frame: &[u8]) -> Result<DecodedAudioBlock, AudioError> {
        if frame.is_empty() {
            return Err(AudioError::DecodeFailed("empty frame".into()));
        }
        let len = i32::try_from(frame.len())
            .map_err(|_| AudioError::DecodeFailed(format!("frame of {} bytes", frame.len())))?;
        self.decode_raw(frame.as_ptr(), len)
    }

    /// Produce concealment audio for one lost frame.
    pub fn conceal(&mut self) -> Result<DecodedAudioBlock, AudioError> {
        self.decode_raw(ptr::null(), 0)
    }

    fn decode_raw(&mut self, data: *const u8, len: i32) -> Result<DecodedAudioBlock, AudioError> {
        let decoder = self
            .decoder
            .ok_or_else(|| AudioError::DecodeFailed("decoder is closed".into()))?;

        let mut block =
            DecodedAudioBlock::with_capacity(self.samples_per_frame, self.channels, self.sample_rate);

        // SAFETY: `data` is either null with `len == 0` (concealment) or points to
        // `len` readable bytes. The block storage holds `samples_per_frame *
        // channels` floats, matching the frame size passed in.
        let decoded = unsafe {
            audiopus_sys::opus_multistream_decode_float(
                decoder.as_ptr(),
                data,
                len,
                block.storage_mut().as_mut_ptr(),
                self.samples_per_frame as i32,
                0,
            )
        };

        if decoded < 0 {
            return Err(AudioError::DecodeFailed(format!(
                "{} (code {})",
                opus_error_message(decoded),
                decoded
            )));
        }
        if decoded == 0 {
            return Err(AudioError::DecodeFailed("decoder produced no samples".into()));
        }

        block
            .set_frame_count(decoded as usize)
            .map_err(|e| AudioError::DecodeFailed(e.to_string()))?;
        Ok(block)
    }

    /// Release the decoder. Calling it again is a no-op.
    pub fn close(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            // SAFETY: the pointer came from opus_multistream_decoder_create and
            // `take` guarantees it is destroyed once.
            unsafe { audiopus_sys::opus_multistream_decoder_destroy(decoder.as_ptr()) };
            debug!("Opus multistream decoder closed");
        }
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        self.close();
    }
}
