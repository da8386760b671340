//! Session audio configuration.
//!
//! Turns the peer's multistream descriptor into a validated, immutable
//! [`SessionAudioConfig`] and asks the output device for a matching sample rate
//! and IO buffer duration. The device requests are best-effort: a rejection is
//! logged and playback proceeds with whatever the device grants.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AudioError, PreferenceError};

/// Mapping value that routes no decoded channel to an output channel.
pub const SILENT_CHANNEL: u8 = 255;

/// Longest frame Opus can carry.
const MAX_FRAME_DURATION_MS: u64 = 120;

/// Multistream audio descriptor as negotiated with the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDescriptor {
    pub sample_rate: u32,
    pub channel_count: u8,
    pub stream_count: u8,
    pub coupled_stream_count: u8,
    pub channel_mapping: Vec<u8>,
    pub samples_per_frame: u32,
}

impl AudioDescriptor {
    /// 48kHz stereo carried as a single coupled stream.
    pub fn stereo(samples_per_frame: u32) -> Self {
        Self {
            sample_rate: 48000,
            channel_count: 2,
            stream_count: 1,
            coupled_stream_count: 1,
            channel_mapping: vec![0, 1],
            samples_per_frame,
        }
    }

    /// 48kHz 5.1 surround in the host's speaker order.
    pub fn surround_51(samples_per_frame: u32) -> Self {
        Self {
            sample_rate: 48000,
            channel_count: 6,
            stream_count: 4,
            coupled_stream_count: 2,
            channel_mapping: vec![0, 4, 1, 5, 2, 3],
            samples_per_frame,
        }
    }
}

/// Validated audio parameters for one streaming session.
///
/// Shared read-only between the decode and playback contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAudioConfig {
    sample_rate: u32,
    channel_count: u8,
    stream_count: u8,
    coupled_stream_count: u8,
    channel_mapping: Vec<u8>,
    samples_per_frame: u32,
}

impl SessionAudioConfig {
    /// Validate a descriptor without touching any device.
    pub fn from_descriptor(descriptor: &AudioDescriptor) -> Result<Self, AudioError> {
        validate_topology(descriptor)?;
        validate_frame_size(descriptor)?;

        Ok(Self {
            sample_rate: descriptor.sample_rate,
            channel_count: descriptor.channel_count,
            stream_count: descriptor.stream_count,
            coupled_stream_count: descriptor.coupled_stream_count,
            channel_mapping: descriptor.channel_mapping.clone(),
            samples_per_frame: descriptor.samples_per_frame,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u8 {
        self.channel_count
    }

    pub fn channels(&self) -> usize {
        self.channel_count as usize
    }

    pub fn stream_count(&self) -> u8 {
        self.stream_count
    }

    pub fn coupled_stream_count(&self) -> u8 {
        self.coupled_stream_count
    }

    pub fn channel_mapping(&self) -> &[u8] {
        &self.channel_mapping
    }

    pub fn samples_per_frame(&self) -> u32 {
        self.samples_per_frame
    }

    /// Duration of one decoded frame, used as the preferred IO buffer duration.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples_per_frame as f64 / self.sample_rate as f64)
    }
}

fn validate_topology(descriptor: &AudioDescriptor) -> Result<(), AudioError> {
    let invalid = |reason: String| Err(AudioError::InvalidTopology(reason));

    if descriptor.sample_rate == 0 {
        return invalid("sample rate must be positive".into());
    }
    if descriptor.channel_count == 0 {
        return invalid("channel count must be positive".into());
    }
    if descriptor.stream_count == 0 {
        return invalid("stream count must be positive".into());
    }
    if descriptor.coupled_stream_count > descriptor.stream_count {
        return invalid(format!(
            "{} coupled streams exceed {} streams",
            descriptor.coupled_stream_count, descriptor.stream_count
        ));
    }

    let decoded_channels =
        descriptor.stream_count as usize + descriptor.coupled_stream_count as usize;
    if decoded_channels != descriptor.channel_count as usize {
        return invalid(format!(
            "{} streams ({} coupled) decode to {} channels, expected {}",
            descriptor.stream_count,
            descriptor.coupled_stream_count,
            decoded_channels,
            descriptor.channel_count
        ));
    }

    if descriptor.channel_mapping.len() != descriptor.channel_count as usize {
        return invalid(format!(
            "mapping has {} entries for {} channels",
            descriptor.channel_mapping.len(),
            descriptor.channel_count
        ));
    }

    if let Some(entry) = descriptor
        .channel_mapping
        .iter()
        .find(|&&m| m != SILENT_CHANNEL && m as usize >= decoded_channels)
    {
        return invalid(format!(
            "mapping entry {} out of range for {} decoded channels",
            entry, decoded_channels
        ));
    }

    Ok(())
}

fn validate_frame_size(descriptor: &AudioDescriptor) -> Result<(), AudioError> {
    let max_samples = descriptor.sample_rate as u64 * MAX_FRAME_DURATION_MS / 1000;
    let samples = descriptor.samples_per_frame as u64;
    if samples == 0 || samples > max_samples {
        return Err(AudioError::InvalidFrameSize {
            samples_per_frame: descriptor.samples_per_frame,
            sample_rate: descriptor.sample_rate,
        });
    }
    Ok(())
}

/// Output device characteristics that can be requested before playback.
///
/// Both requests are hints. Implementations report a rejection but callers
/// never treat it as fatal.
pub trait DevicePreferences {
    fn set_preferred_sample_rate(&mut self, sample_rate: u32) -> Result<(), PreferenceError>;

    fn set_preferred_io_buffer_duration(
        &mut self,
        duration: Duration,
    ) -> Result<(), PreferenceError>;
}

/// Which device preferences were accepted during [`configure`].
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceReport {
    pub sample_rate: Result<(), PreferenceError>,
    pub io_buffer_duration: Result<(), PreferenceError>,
}

impl PreferenceReport {
    pub fn all_granted(&self) -> bool {
        self.sample_rate.is_ok() && self.io_buffer_duration.is_ok()
    }
}

/// Validate the descriptor and request matching device IO characteristics.
///
/// Only topology and frame-size problems fail; rejected preferences are
/// logged and returned in the report.
pub fn configure(
    descriptor: &AudioDescriptor,
    preferences: &mut dyn DevicePreferences,
) -> Result<(SessionAudioConfig, PreferenceReport), AudioError> {
    let config = SessionAudioConfig::from_descriptor(descriptor)?;
    info!(
        "Audio config: {}Hz, {} channels, {} streams ({} coupled), {} samples/frame",
        config.sample_rate,
        config.channel_count,
        config.stream_count,
        config.coupled_stream_count,
        config.samples_per_frame
    );
    debug!("Channel mapping: {:?}", config.channel_mapping);

    let sample_rate = preferences.set_preferred_sample_rate(config.sample_rate);
    if let Err(e) = &sample_rate {
        warn!("Failed to set preferred sample rate: {}", e);
    }

    let io_buffer_duration = preferences.set_preferred_io_buffer_duration(config.frame_duration());
    if let Err(e) = &io_buffer_duration {
        warn!("Failed to set preferred IO buffer duration: {}", e);
    }

    Ok((
        config,
        PreferenceReport {
            sample_rate,
            io_buffer_duration,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectAll;

    impl DevicePreferences for RejectAll {
        fn set_preferred_sample_rate(&mut self, sample_rate: u32) -> Result<(), PreferenceError> {
            Err(PreferenceError::SampleRateUnsupported(sample_rate))
        }

        fn set_preferred_io_buffer_duration(
            &mut self,
            _duration: Duration,
        ) -> Result<(), PreferenceError> {
            Err(PreferenceError::DeviceUnavailable("test".into()))
        }
    }

    #[derive(Default)]
    struct Capture {
        sample_rate: Option<u32>,
        duration: Option<Duration>,
    }

    impl DevicePreferences for Capture {
        fn set_preferred_sample_rate(&mut self, sample_rate: u32) -> Result<(), PreferenceError> {
            self.sample_rate = Some(sample_rate);
            Ok(())
        }

        fn set_preferred_io_buffer_duration(
            &mut self,
            duration: Duration,
        ) -> Result<(), PreferenceError> {
            self.duration = Some(duration);
            Ok(())
        }
    }

    #[test]
    fn test_stereo_descriptor_is_valid() {
        let config = SessionAudioConfig::from_descriptor(&AudioDescriptor::stereo(240)).unwrap();
        assert_eq!(config.sample_rate(), 48000);
        assert_eq!(config.channels(), 2);
        assert_eq!(config.channel_mapping(), &[0, 1]);
        assert_eq!(config.frame_duration(), Duration::from_millis(5));
    }

    #[test]
    fn test_surround_descriptor_is_valid() {
        let config =
            SessionAudioConfig::from_descriptor(&AudioDescriptor::surround_51(480)).unwrap();
        assert_eq!(config.channels(), 6);
        assert_eq!(config.frame_duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_coupled_exceeding_streams_is_invalid_topology() {
        let mut descriptor = AudioDescriptor::stereo(240);
        descriptor.stream_count = 1;
        descriptor.coupled_stream_count = 2;
        descriptor.channel_count = 3;
        descriptor.channel_mapping = vec![0, 1, 2];

        let err = SessionAudioConfig::from_descriptor(&descriptor).unwrap_err();
        assert!(matches!(err, AudioError::InvalidTopology(_)), "{err}");
    }

    #[test]
    fn test_channel_accounting_mismatch_is_invalid_topology() {
        let mut descriptor = AudioDescriptor::stereo(240);
        descriptor.stream_count = 2;
        descriptor.coupled_stream_count = 1;

        let err = SessionAudioConfig::from_descriptor(&descriptor).unwrap_err();
        assert!(matches!(err, AudioError::InvalidTopology(_)), "{err}");
    }

    #[test]
    fn test_mapping_length_mismatch_is_invalid_topology() {
        let mut descriptor = AudioDescriptor::stereo(240);
        descriptor.channel_mapping = vec![0];

        let err = SessionAudioConfig::from_descriptor(&descriptor).unwrap_err();
        assert!(matches!(err, AudioError::InvalidTopology(_)), "{err}");
    }

    #[test]
    fn test_mapping_entry_out_of_range_is_invalid_topology() {
        let mut descriptor = AudioDescriptor::stereo(240);
        descriptor.channel_mapping = vec![0, 2];
        assert!(matches!(
            SessionAudioConfig::from_descriptor(&descriptor),
            Err(AudioError::InvalidTopology(_))
        ));

        descriptor.channel_mapping = vec![0, SILENT_CHANNEL];
        assert!(SessionAudioConfig::from_descriptor(&descriptor).is_ok());
    }

    #[test]
    fn test_frame_size_bounds() {
        let mut descriptor = AudioDescriptor::stereo(0);
        assert!(matches!(
            SessionAudioConfig::from_descriptor(&descriptor),
            Err(AudioError::InvalidFrameSize { .. })
        ));

        descriptor.samples_per_frame = 5760;
        assert!(SessionAudioConfig::from_descriptor(&descriptor).is_ok());

        descriptor.samples_per_frame = 5761;
        assert!(matches!(
            SessionAudioConfig::from_descriptor(&descriptor),
            Err(AudioError::InvalidFrameSize { .. })
        ));
    }

    #[test]
    fn test_rejected_preferences_are_not_fatal() {
        let (config, report) = configure(&AudioDescriptor::stereo(240), &mut RejectAll).unwrap();
        assert_eq!(config.samples_per_frame(), 240);
        assert!(!report.all_granted());
        assert_eq!(
            report.sample_rate,
            Err(PreferenceError::SampleRateUnsupported(48000))
        );
    }

    #[test]
    fn test_configure_requests_rate_and_frame_duration() {
        let mut capture = Capture::default();
        let (_, report) = configure(&AudioDescriptor::stereo(480), &mut capture).unwrap();

        assert!(report.all_granted());
        assert_eq!(capture.sample_rate, Some(48000));
        assert_eq!(capture.duration, Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_invalid_descriptor_requests_nothing_from_device() {
        let mut capture = Capture::default();
        let mut descriptor = AudioDescriptor::stereo(240);
        descriptor.coupled_stream_count = 2;

        assert!(configure(&descriptor, &mut capture).is_err());
        assert_eq!(capture.sample_rate, None);
        assert_eq!(capture.duration, None);
    }

    #[test]
    fn test_descriptor_from_json() {
        let json = r#"{
            "sample_rate": 48000,
            "channel_count": 2,
            "stream_count": 1,
            "coupled_stream_count": 1,
            "channel_mapping": [0, 1],
            "samples_per_frame": 240
        }"#;
        let descriptor: AudioDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor, AudioDescriptor::stereo(240));
    }
}
