//! Client-side audio path of a game-streaming client.
//!
//! Encoded Opus multistream frames arrive one per call from the streaming
//! session library. Each frame is decoded on the calling thread, then handed
//! to a dedicated playback thread that converts it to the device's planar
//! layout and queues it on the output device.
//!
//! # Modules
//! - [`audio`] - configuration, decoding, format conversion and the playback engine
//! - [`io`] - output devices (cpal)
//! - [`session`] - one stream's audio lifetime
//! - [`ffi`] - C entry points for the session library
//! - [`error`] - error taxonomy

pub mod audio;
pub mod error;
pub mod ffi;
pub mod io;
pub mod session;

pub use audio::{
    AudioDescriptor, DecodedAudioBlock, DevicePreferences, FormatConverter, FrameDecoder,
    PlanarBuffer, PlaybackEngine, PlaybackSettings, PreferenceReport, SessionAudioConfig,
    configure,
};
pub use error::{AudioError, PreferenceError};
pub use io::{CpalBackend, OutputBackend, OutputDevice};
pub use session::{AudioSession, SessionState, StatsSnapshot};

/// Install a `tracing` subscriber that honors `RUST_LOG`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
