//! C ABI for the streaming-session library's audio renderer callbacks.
//!
//! The session library calls `init` once per stream, `decode_and_play` once per
//! encoded frame on its receive thread, and `cleanup` on teardown (possibly
//! more than once, and after a failed `init`). The one live session is kept in
//! a process-wide slot; the mutex only serializes these entry points.

use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::{Mutex, MutexGuard};

use libc::{c_char, c_int, c_void};
use tracing::{debug, error, warn};

use crate::audio::config::AudioDescriptor;
use crate::audio::playback::PlaybackSettings;
use crate::error::AudioError;
use crate::io::{CpalBackend, OutputBackend};
use crate::session::AudioSession;

/// Most channels the session library describes (7.1).
pub const MAX_CHANNEL_COUNT: usize = 8;

const AUDIO_CONFIGURATION_MARKER: c_int = 0xCA;

/// Multistream descriptor exactly as the session library lays it out.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OpusMultistreamConfiguration {
    pub sample_rate: c_int,
    pub channel_count: c_int,
    pub streams: c_int,
    pub coupled_streams: c_int,
    pub samples_per_frame: c_int,
    pub mapping: [u8; MAX_CHANNEL_COUNT],
}

impl OpusMultistreamConfiguration {
    /// Copy into an owned descriptor, rejecting values that do not fit.
    pub fn to_descriptor(&self) -> Result<AudioDescriptor, AudioError> {
        let narrow = |value: c_int, what: &str| {
            u8::try_from(value)
                .map_err(|_| AudioError::InvalidTopology(format!("{what} {value} out of range")))
        };

        let channel_count = narrow(self.channel_count, "channel count")?;
        if channel_count as usize > MAX_CHANNEL_COUNT {
            return Err(AudioError::InvalidTopology(format!(
                "{} channels exceed the {} mapping slots",
                channel_count, MAX_CHANNEL_COUNT
            )));
        }
        let sample_rate = u32::try_from(self.sample_rate).map_err(|_| {
            AudioError::InvalidTopology(format!("sample rate {} out of range", self.sample_rate))
        })?;
        let samples_per_frame =
            u32::try_from(self.samples_per_frame).map_err(|_| AudioError::InvalidFrameSize {
                samples_per_frame: 0,
                sample_rate,
            })?;

        Ok(AudioDescriptor {
            sample_rate,
            channel_count,
            stream_count: narrow(self.streams, "stream count")?,
            coupled_stream_count: narrow(self.coupled_streams, "coupled stream count")?,
            channel_mapping: self.mapping[..channel_count as usize].to_vec(),
            samples_per_frame,
        })
    }
}

/// The `audio_configuration` value passed to `init`.
///
/// Packs a marker byte, the channel count and the speaker channel mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfigurationTag {
    pub channel_count: u8,
    pub channel_mask: u16,
}

impl AudioConfigurationTag {
    pub fn from_raw(raw: c_int) -> Option<Self> {
        if raw & 0xFF != AUDIO_CONFIGURATION_MARKER {
            return None;
        }
        Some(Self {
            channel_count: ((raw >> 8) & 0xFF) as u8,
            channel_mask: ((raw >> 16) & 0xFFFF) as u16,
        })
    }
}

static SESSION: Mutex<Option<AudioSession>> = Mutex::new(None);

fn session_slot() -> MutexGuard<'static, Option<AudioSession>> {
    // A panic while holding the lock leaves the slot usable.
    SESSION.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn init_session<B: OutputBackend>(
    audio_configuration: c_int,
    descriptor: &OpusMultistreamConfiguration,
    flags: c_int,
    backend: B,
    settings: &PlaybackSettings,
) -> Result<(), AudioError> {
    let mut slot = session_slot();
    if slot.is_some() {
        return Err(AudioError::SessionActive);
    }

    let descriptor = descriptor.to_descriptor()?;
    match AudioConfigurationTag::from_raw(audio_configuration) {
        Some(tag) if tag.channel_count != descriptor.channel_count => warn!(
            "Audio configuration announces {} channels, descriptor has {}",
            tag.channel_count, descriptor.channel_count
        ),
        Some(tag) => debug!("Audio configuration: {:?}", tag),
        None => warn!("Unrecognized audio configuration {:#x}", audio_configuration),
    }
    debug!("Audio renderer flags: {:#x}", flags);

    let session = AudioSession::open(&descriptor, backend, settings)?;
    *slot = Some(session);
    Ok(())
}

/// Open the process-wide session on `backend`, mapping the outcome to the
/// C return convention.
fn init_with<B: OutputBackend>(
    audio_configuration: c_int,
    descriptor: &OpusMultistreamConfiguration,
    flags: c_int,
    backend: B,
    settings: &PlaybackSettings,
) -> c_int {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        init_session(audio_configuration, descriptor, flags, backend, settings)
    }));
    match result {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!("Failed to initialize audio: {}", e);
            if !matches!(e, AudioError::SessionActive) {
                gamestream_audio_cleanup();
            }
            -1
        }
        Err(_) => {
            error!("Audio init panicked");
            gamestream_audio_cleanup();
            -1
        }
    }
}

/// Start the audio session for a new stream.
///
/// Returns `0` on success and `-1` on failure.
///
/// # Safety
///
/// `descriptor` must be null or point to a valid configuration for the
/// duration of the call. It is copied and never referenced afterward.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gamestream_audio_init(
    audio_configuration: c_int,
    descriptor: *const OpusMultistreamConfiguration,
    _context: *mut c_void,
    flags: c_int,
) -> c_int {
    crate::init_logging();

    // SAFETY: the caller guarantees a valid pointer if it is non-null.
    let Some(descriptor) = (unsafe { descriptor.as_ref() }).copied() else {
        error!("Audio init called without a descriptor");
        return -1;
    };

    init_with(
        audio_configuration,
        &descriptor,
        flags,
        CpalBackend::default(),
        &PlaybackSettings::default(),
    )
}

/// Tear down the current session, if any.
#[unsafe(no_mangle)]
pub extern "C" fn gamestream_audio_cleanup() {
    let session = session_slot().take();
    if let Some(session) = session {
        if panic::catch_unwind(AssertUnwindSafe(|| session.close())).is_err() {
            error!("Audio cleanup panicked");
        }
    }
}

/// Decode one encoded frame and schedule it for playback.
///
/// Failures are logged; nothing is reported to the caller.
///
/// # Safety
///
/// `data` must point to `length` readable bytes for the duration of the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gamestream_audio_decode_and_play(data: *const c_char, length: c_int) {
    let frame: &[u8] = match usize::try_from(length) {
        Ok(0) => &[],
        Ok(len) if !data.is_null() => {
            // SAFETY: the caller guarantees `length` readable bytes at `data`.
            unsafe { slice::from_raw_parts(data.cast::<u8>(), len) }
        }
        _ => {
            warn!("Dropping frame with invalid buffer ({} bytes)", length);
            return;
        }
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut slot = session_slot();
        match slot.as_mut() {
            Some(session) => session.submit_frame(frame),
            None => debug!("No active audio session, dropping frame"),
        }
    }));
    if result.is_err() {
        error!("Audio decode panicked");
    }
}
