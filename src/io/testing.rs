//! Recording output backend for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use super::audio::{OutputBackend, OutputDevice};
use crate::audio::config::{DevicePreferences, SessionAudioConfig};
use crate::audio::frame::PlanarBuffer;
use crate::error::PreferenceError;

/// Records everything submitted to the devices it opens.
#[derive(Clone, Default)]
pub(crate) struct RecordingBackend {
    pub submitted: Arc<Mutex<Vec<PlanarBuffer>>>,
    pub events: Arc<Mutex<Vec<&'static str>>>,
    pub open_devices: Arc<AtomicUsize>,
    pub fail_open: bool,
    pub fail_start: bool,
    pub reject_preferences: bool,
    pub submit_delay: Option<Duration>,
    pub open_delay: Option<Duration>,
}

impl RecordingBackend {
    pub fn submitted_len(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    /// First sample of channel 0 of every submitted buffer.
    pub fn markers(&self) -> Vec<f32> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.channel(0)[0])
            .collect()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

impl DevicePreferences for RecordingBackend {
    fn set_preferred_sample_rate(&mut self, sample_rate: u32) -> Result<(), PreferenceError> {
        if self.reject_preferences {
            return Err(PreferenceError::SampleRateUnsupported(sample_rate));
        }
        Ok(())
    }

    fn set_preferred_io_buffer_duration(
        &mut self,
        _duration: Duration,
    ) -> Result<(), PreferenceError> {
        if self.reject_preferences {
            return Err(PreferenceError::BufferSizeUnknown);
        }
        Ok(())
    }
}

impl OutputBackend for RecordingBackend {
    fn open(
        &mut self,
        _config: &SessionAudioConfig,
        _queue_capacity: usize,
    ) -> Result<Box<dyn OutputDevice>> {
        if let Some(delay) = self.open_delay {
            thread::sleep(delay);
        }
        if self.fail_open {
            anyhow::bail!("No default output device available");
        }
        self.events.lock().unwrap().push("open");
        self.open_devices.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingDevice {
            backend: self.clone(),
            stopped: false,
        }))
    }
}

struct RecordingDevice {
    backend: RecordingBackend,
    stopped: bool,
}

impl OutputDevice for RecordingDevice {
    fn start(&mut self) -> Result<()> {
        if self.backend.fail_start {
            anyhow::bail!("device refused to start");
        }
        self.backend.events.lock().unwrap().push("start");
        Ok(())
    }

    fn submit(&mut self, buffer: PlanarBuffer) -> Result<()> {
        if let Some(delay) = self.backend.submit_delay {
            thread::sleep(delay);
        }
        self.backend.submitted.lock().unwrap().push(buffer);
        Ok(())
    }

    fn queued(&self) -> usize {
        self.backend.submitted_len()
    }

    fn reset(&mut self) {
        self.backend.events.lock().unwrap().push("reset");
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.backend.events.lock().unwrap().push("stop");
            self.backend.open_devices.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for RecordingDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub(crate) fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
