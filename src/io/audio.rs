//! Audio output device using cpal.
//!
//! Provides:
//! - [`OutputBackend`] / [`OutputDevice`] - the seam between the playback engine
//!   and a concrete output device
//! - [`CpalBackend`] - the default output device (or one picked by id)
//!
//! The device graph is a lock-free queue of [`PlanarBuffer`]s (the source node)
//! drained by the cpal real-time callback, which writes them in the device's
//! native sample format.
//!
//! Before queueing, surround sessions are downmixed when the device has fewer
//! channels, and buffers are resampled when the device runs at another rate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, Device, DeviceId, SampleFormat, SizedSample, StreamConfig, SupportedBufferSize,
};
use dasp_sample::FromSample;
use rtrb::{Consumer, Producer, RingBuffer};
use rubato::{FftFixedIn, Resampler};
use tracing::{debug, error, info, warn};

use crate::audio::config::{DevicePreferences, SessionAudioConfig};
use crate::audio::convert::Downmix;
use crate::audio::frame::PlanarBuffer;
use crate::error::PreferenceError;

/// An opened output device graph.
///
/// Created, driven and released on the playback context only.
pub trait OutputDevice {
    /// Start the device and begin consuming submitted buffers.
    fn start(&mut self) -> Result<()>;

    /// Queue a buffer for playback after everything queued before it.
    fn submit(&mut self, buffer: PlanarBuffer) -> Result<()>;

    /// Number of buffers waiting in the device queue.
    fn queued(&self) -> usize;

    /// Discard queued buffers.
    fn reset(&mut self);

    /// Stop the device. Safe to call more than once.
    fn stop(&mut self);
}

/// Opens output devices for a session.
///
/// The backend is handed to the playback context, which opens the device there
/// so the device handle never leaves that thread.
pub trait OutputBackend: DevicePreferences + Send + 'static {
    fn open(
        &mut self,
        config: &SessionAudioConfig,
        queue_capacity: usize,
    ) -> Result<Box<dyn OutputDevice>>;
}

fn find_device_by_id<I: Iterator<Item = Device>>(
    devices: I,
    device_id: &DeviceId,
) -> Option<Device> {
    devices
        .filter_map(|d| d.id().ok().map(|id| (d, id)))
        .find(|(_, id)| id == device_id)
        .map(|(d, _)| d)
}

fn get_output_device(device_id: Option<&DeviceId>) -> Result<Device> {
    let host = cpal::default_host();
    match device_id {
        Some(id) => {
            let devices = host
                .output_devices()
                .context("Failed to enumerate output devices")?;
            find_device_by_id(devices, id).context("Output device not found")
        }
        None => host
            .default_output_device()
            .context("No default output device available"),
    }
}

/// The preferred buffer size if the chosen configuration can honor it.
fn fit_buffer_size(preferred: Option<u32>, supported: &SupportedBufferSize) -> BufferSize {
    match (preferred, supported) {
        (Some(frames), SupportedBufferSize::Range { min, max })
            if (*min..=*max).contains(&frames) =>
        {
            BufferSize::Fixed(frames)
        }
        (Some(frames), _) => {
            warn!(
                "Output config cannot use a {} frame buffer ({:?}), using its default",
                frames, supported
            );
            BufferSize::Default
        }
        (None, _) => BufferSize::Default,
    }
}

fn is_supported_format(format: SampleFormat) -> bool {
    matches!(
        format,
        SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16 | SampleFormat::I32
    )
}

/// Output through cpal.
///
/// Preferences are checked against what the device reports and remembered
/// for [`OutputBackend::open`]; rejected ones fall back to the device default.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    device_id: Option<DeviceId>,
    preferred_sample_rate: Option<u32>,
    preferred_buffer_frames: Option<u32>,
}

impl CpalBackend {
    pub fn new(device_id: Option<DeviceId>) -> Self {
        Self {
            device_id,
            preferred_sample_rate: None,
            preferred_buffer_frames: None,
        }
    }

    fn device(&self) -> Result<Device, PreferenceError> {
        get_output_device(self.device_id.as_ref())
            .map_err(|e| PreferenceError::DeviceUnavailable(format!("{e:#}")))
    }

    /// Pick channels, rate and sample format for the stream.
    ///
    /// Prefers an exact channel match at the preferred rate and falls back to
    /// the device default configuration.
    fn select_stream_config(
        &self,
        device: &Device,
        config: &SessionAudioConfig,
    ) -> Result<(StreamConfig, SampleFormat)> {
        let default_config = device
            .default_output_config()
            .context("Failed to get default output config")?;
        debug!("Default output config: {default_config:#?}");

        let sample_rate = self
            .preferred_sample_rate
            .unwrap_or(default_config.sample_rate());

        let exact = device
            .supported_output_configs()
            .context("Failed to query supported output configs")?
            .filter(|range| {
                range.channels() as usize == config.channels()
                    && range.min_sample_rate() <= sample_rate
                    && sample_rate <= range.max_sample_rate()
                    && is_supported_format(range.sample_format())
            })
            .max_by_key(|range| range.sample_format() == SampleFormat::F32);

        if let Some(range) = exact {
            return Ok((
                StreamConfig {
                    channels: range.channels(),
                    sample_rate,
                    buffer_size: fit_buffer_size(
                        self.preferred_buffer_frames,
                        range.buffer_size(),
                    ),
                },
                range.sample_format(),
            ));
        }

        warn!(
            "Output device has no {}-channel config at {}Hz, using its default",
            config.channels(),
            sample_rate
        );
        let buffer_size = if default_config.sample_rate() == sample_rate {
            fit_buffer_size(self.preferred_buffer_frames, default_config.buffer_size())
        } else {
            BufferSize::Default
        };
        Ok((
            StreamConfig {
                channels: default_config.channels(),
                sample_rate: default_config.sample_rate(),
                buffer_size,
            },
            default_config.sample_format(),
        ))
    }
}

impl DevicePreferences for CpalBackend {
    fn set_preferred_sample_rate(&mut self, sample_rate: u32) -> Result<(), PreferenceError> {
        let device = self.device()?;
        let supported = device
            .supported_output_configs()
            .map_err(|e| PreferenceError::DeviceUnavailable(e.to_string()))?
            .any(|range| {
                range.min_sample_rate() <= sample_rate && sample_rate <= range.max_sample_rate()
            });

        if !supported {
            self.preferred_sample_rate = None;
            return Err(PreferenceError::SampleRateUnsupported(sample_rate));
        }
        self.preferred_sample_rate = Some(sample_rate);
        Ok(())
    }

    fn set_preferred_io_buffer_duration(
        &mut self,
        duration: Duration,
    ) -> Result<(), PreferenceError> {
        let device = self.device()?;
        let default_config = device
            .default_output_config()
            .map_err(|e| PreferenceError::DeviceUnavailable(e.to_string()))?;

        let sample_rate = self
            .preferred_sample_rate
            .unwrap_or(default_config.sample_rate());
        let frames = (duration.as_secs_f64() * sample_rate as f64).round() as u32;

        match default_config.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max } => {
                if frames < *min || frames > *max {
                    self.preferred_buffer_frames = None;
                    return Err(PreferenceError::BufferSizeOutOfRange {
                        frames,
                        min: *min,
                        max: *max,
                    });
                }
                self.preferred_buffer_frames = Some(frames);
                Ok(())
            }
            cpal::SupportedBufferSize::Unknown => {
                self.preferred_buffer_frames = None;
                Err(PreferenceError::BufferSizeUnknown)
            }
        }
    }
}

impl OutputBackend for CpalBackend {
    fn open(
        &mut self,
        config: &SessionAudioConfig,
        queue_capacity: usize,
    ) -> Result<Box<dyn OutputDevice>> {
        let device = get_output_device(self.device_id.as_ref())?;
        let (stream_config, sample_format) = self.select_stream_config(&device, config)?;
        info!(
            "Output stream: {} channels at {}Hz, {:?}, buffer {:?}",
            stream_config.channels,
            stream_config.sample_rate,
            sample_format,
            stream_config.buffer_size
        );

        let downmix = Downmix::new(config.channels(), stream_config.channels as usize);
        if downmix.is_some() {
            info!(
                "Downmixing {} channels to {}",
                config.channels(),
                stream_config.channels
            );
        }
        let mixed_channels = downmix
            .as_ref()
            .map_or(config.channels(), Downmix::output_channels);

        let resampler = if stream_config.sample_rate != config.sample_rate() {
            let resampler = FftFixedIn::<f32>::new(
                config.sample_rate() as usize,
                stream_config.sample_rate as usize,
                config.samples_per_frame() as usize,
                1,
                mixed_channels,
            )
            .context("Failed to create resampler")?;
            info!(
                "Created resampler {}Hz -> {}Hz",
                config.sample_rate(),
                stream_config.sample_rate
            );
            Some(resampler)
        } else {
            None
        };

        let (producer, consumer) = RingBuffer::<PlanarBuffer>::new(queue_capacity);
        let flush = Arc::new(AtomicBool::new(false));

        let stream = match sample_format {
            SampleFormat::F32 => {
                build_output_stream::<f32>(&device, &stream_config, consumer, flush.clone())?
            }
            SampleFormat::I16 => {
                build_output_stream::<i16>(&device, &stream_config, consumer, flush.clone())?
            }
            SampleFormat::U16 => {
                build_output_stream::<u16>(&device, &stream_config, consumer, flush.clone())?
            }
            SampleFormat::I32 => {
                build_output_stream::<i32>(&device, &stream_config, consumer, flush.clone())?
            }
            format => anyhow::bail!("Unsupported sample format: {:?}", format),
        };

        Ok(Box::new(CpalOutput {
            stream: Some(stream),
            producer,
            capacity: queue_capacity,
            flush,
            downmix,
            resampler,
            pending: vec![Vec::new(); mixed_channels],
            device_rate: stream_config.sample_rate,
        }))
    }
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: Consumer<PlanarBuffer>,
    flush: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let out_channels = config.channels as usize;
    let mut current: Option<PlanarBuffer> = None;
    let mut position = 0;

    debug!("Building output stream");
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if flush.swap(false, Ordering::AcqRel) {
                    current = None;
                    while consumer.pop().is_ok() {}
                }

                for frame in data.chunks_mut(out_channels) {
                    let exhausted = current.as_ref().is_none_or(|b| position >= b.frames());
                    if exhausted {
                        current = consumer.pop().ok();
                        position = 0;
                    }

                    match &current {
                        Some(buffer) => {
                            for (channel_idx, slot) in frame.iter_mut().enumerate() {
                                let sample = buffer.sample_or_silence(channel_idx, position);
                                *slot = T::from_sample_(sample);
                            }
                            position += 1;
                        }
                        None => {
                            for slot in frame.iter_mut() {
                                *slot = T::from_sample_(0.0f32);
                            }
                        }
                    }
                }
            },
            |err| error!("An error occurred on the output audio stream: {}", err),
            None,
        )
        .context("Failed to build output stream")?;

    Ok(stream)
}

struct CpalOutput {
    stream: Option<cpal::Stream>,
    producer: Producer<PlanarBuffer>,
    capacity: usize,
    flush: Arc<AtomicBool>,
    downmix: Option<Downmix>,
    resampler: Option<FftFixedIn<f32>>,
    /// Frames per channel waiting for a full resampler chunk.
    pending: Vec<Vec<f32>>,
    device_rate: u32,
}

impl CpalOutput {
    /// Resample to the device rate.
    ///
    /// Input is buffered until the resampler has a full chunk, so short blocks
    /// are never padded. Returns `None` while nothing is ready.
    fn resample(&mut self, buffer: PlanarBuffer) -> Result<Option<PlanarBuffer>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Some(buffer));
        };

        self.pending.resize_with(buffer.channels(), Vec::new);
        for (ch, pending) in self.pending.iter_mut().enumerate() {
            pending.extend_from_slice(buffer.channel(ch));
        }

        let mut output = vec![Vec::new(); self.pending.len()];
        while self
            .pending
            .first()
            .is_some_and(|p| p.len() >= resampler.input_frames_next())
        {
            let needed = resampler.input_frames_next();
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|p| p.drain(..needed).collect())
                .collect();
            let resampled = resampler
                .process(&chunk, None)
                .context("Failed to resample buffer")?;
            for (out, data) in output.iter_mut().zip(resampled) {
                out.extend(data);
            }
        }

        if output.first().is_none_or(Vec::is_empty) {
            return Ok(None);
        }
        Ok(Some(PlanarBuffer::from_channels(&output, self.device_rate)))
    }
}

impl OutputDevice for CpalOutput {
    fn start(&mut self) -> Result<()> {
        let stream = self.stream.as_ref().context("Output stream already stopped")?;
        stream.play().context("Failed to play stream")?;
        info!("Audio playback started");
        Ok(())
    }

    fn submit(&mut self, buffer: PlanarBuffer) -> Result<()> {
        let buffer = match &self.downmix {
            Some(downmix) => downmix.apply(&buffer),
            None => buffer,
        };
        let Some(buffer) = self.resample(buffer)? else {
            return Ok(());
        };
        self.producer
            .push(buffer)
            .map_err(|_| anyhow::anyhow!("Device queue full ({} buffers)", self.capacity))
    }

    fn queued(&self) -> usize {
        self.capacity - self.producer.slots()
    }

    fn reset(&mut self) {
        self.flush.store(true, Ordering::Release);
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        for pending in &mut self.pending {
            pending.clear();
        }
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("Failed to pause output stream: {}", e);
            }
            info!("Audio playback stopped");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
