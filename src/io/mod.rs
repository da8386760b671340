//! Hardware I/O.
//!
//! - [`OutputBackend`] / [`OutputDevice`] - the device seam used by the playback engine
//! - [`CpalBackend`] - speaker playback via cpal

pub mod audio;

#[cfg(test)]
pub(crate) mod testing;

pub use audio::{CpalBackend, OutputBackend, OutputDevice};
