//! Audio session orchestration.
//!
//! An [`AudioSession`] owns the three per-stream components, built in
//! dependency order and torn down in reverse:
//!
//! 1. [`SessionAudioConfig`] - validated from the host's descriptor
//! 2. [`FrameDecoder`] - used on the decode context (the caller of
//!    [`AudioSession::submit_frame`])
//! 3. [`PlaybackEngine`] - owns the output device on its own thread
//!
//! A session is move-only and cannot be reopened; a new stream gets a new
//! session.

mod stats;

pub use stats::{SessionStats, StatsSnapshot};

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::audio::config::{AudioDescriptor, PreferenceReport, SessionAudioConfig, configure};
use crate::audio::opus::FrameDecoder;
use crate::audio::playback::{PlaybackEngine, PlaybackSettings};
use crate::error::AudioError;
use crate::io::OutputBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Configuring,
    /// Device running, no frame submitted yet.
    Ready,
    Streaming,
    Stopped,
}

pub struct AudioSession {
    config: Arc<SessionAudioConfig>,
    decoder: FrameDecoder,
    playback: PlaybackEngine,
    stats: Arc<SessionStats>,
    preferences: PreferenceReport,
    state: SessionState,
}

impl AudioSession {
    /// Configure, open the decoder and start playback.
    ///
    /// On failure everything built so far is released before returning.
    pub fn open<B: OutputBackend>(
        descriptor: &AudioDescriptor,
        mut backend: B,
        settings: &PlaybackSettings,
    ) -> Result<Self, AudioError> {
        let mut state = SessionState::Uninitialized;
        transition(&mut state, SessionState::Configuring);

        let opened = configure(descriptor, &mut backend).and_then(|(config, preferences)| {
            let decoder = FrameDecoder::open(&config)?;
            let config = Arc::new(config);
            let stats = Arc::new(SessionStats::default());
            // A failed start drops the decoder on the way out.
            let playback = PlaybackEngine::start(config.clone(), backend, settings, stats.clone())?;
            Ok((config, decoder, playback, stats, preferences))
        });

        match opened {
            Ok((config, decoder, playback, stats, preferences)) => {
                transition(&mut state, SessionState::Ready);
                Ok(Self {
                    config,
                    decoder,
                    playback,
                    stats,
                    preferences,
                    state,
                })
            }
            Err(e) => {
                transition(&mut state, SessionState::Stopped);
                Err(e)
            }
        }
    }

    pub fn config(&self) -> &SessionAudioConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Device preferences granted while configuring.
    pub fn preferences(&self) -> &PreferenceReport {
        &self.preferences
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Decode one encoded frame and schedule it for playback.
    ///
    /// A frame that fails to decode is logged and dropped; the session keeps
    /// going with the next one.
    pub fn submit_frame(&mut self, frame: &[u8]) {
        if !self.accepts_frames() {
            return;
        }
        self.stats.record_received();

        match self.decoder.decode(frame) {
            Ok(block) => {
                self.stats.record_decoded();
                self.playback.schedule(block);
            }
            Err(e) => {
                warn!("Could not decode sample data: {}", e);
                self.stats.record_decode_failure();
            }
        }
    }

    /// Schedule concealment audio in place of a frame that never arrived.
    pub fn submit_lost_frame(&mut self) {
        if !self.accepts_frames() {
            return;
        }

        match self.decoder.conceal() {
            Ok(block) => {
                self.stats.record_concealed();
                self.playback.schedule(block);
            }
            Err(e) => {
                warn!("Could not conceal lost frame: {}", e);
                self.stats.record_decode_failure();
            }
        }
    }

    fn accepts_frames(&mut self) -> bool {
        match self.state {
            SessionState::Ready => {
                transition(&mut self.state, SessionState::Streaming);
                true
            }
            SessionState::Streaming => true,
            _ => false,
        }
    }

    /// Tear the session down: playback first, then the decoder.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.playback.stop();
        self.decoder.close();
        transition(&mut self.state, SessionState::Stopped);
        info!("Audio session closed: {:?}", self.stats.snapshot());
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn transition(state: &mut SessionState, next: SessionState) {
    debug!("Audio session {:?} -> {:?}", state, next);
    *state = next;
}
