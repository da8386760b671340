//! Audio data types, decoding and playback.
//!
//! # Configuration
//! - [`config`] - validated session parameters and device preference requests
//!
//! # Data Types
//! - [`frame::DecodedAudioBlock`] - interleaved decoder output with a valid frame count
//! - [`frame::PlanarBuffer`] - per-channel layout consumed by the device
//!
//! # Codec
//! - [`opus`] - Opus multistream decoder with loss concealment
//!
//! # Playback
//! - [`convert`] - interleaved to planar conversion and surround downmix
//! - [`playback`] - serialized playback thread feeding the output device

pub mod config;
pub mod convert;
pub mod frame;
pub mod opus;
pub mod playback;

pub use config::{
    AudioDescriptor, DevicePreferences, PreferenceReport, SessionAudioConfig, configure,
};
pub use convert::{Downmix, FormatConverter};
pub use frame::{DecodedAudioBlock, PlanarBuffer};
pub use opus::FrameDecoder;
pub use playback::{PlaybackEngine, PlaybackSettings};
