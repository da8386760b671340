//! Playback engine.
//!
//! Decoded blocks are handed from the decode context to one dedicated playback
//! thread through a bounded FIFO channel. That thread owns the device graph: it
//! opens and starts the device, converts each block from interleaved to planar
//! layout and submits it to the device queue, strictly in the order the blocks
//! were scheduled.
//!
//! Scheduling never blocks. When the channel is full the newest block is
//! dropped: a short gap is preferable to stalling the network path or playing
//! stale audio late.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::config::SessionAudioConfig;
use super::convert::FormatConverter;
use super::frame::DecodedAudioBlock;
use crate::error::AudioError;
use crate::io::{OutputBackend, OutputDevice};
use crate::session::SessionStats;

/// Tuning for the playback engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Decoded blocks waiting for the playback thread.
    pub queue_capacity: usize,
    /// Planar buffers waiting in the device queue.
    pub device_queue_capacity: usize,
    /// How long `start` waits for the device to come up.
    pub start_timeout_ms: u64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            device_queue_capacity: 128,
            start_timeout_ms: 2000,
        }
    }
}

impl PlaybackSettings {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

/// Playback threads left behind by a start that timed out.
///
/// They release their device once the device call they are blocked in returns.
/// The next start joins them first, so two devices are never open at once.
static ABANDONED_WORKERS: Mutex<Vec<JoinHandle<()>>> = Mutex::new(Vec::new());

fn join_abandoned_workers() {
    // Held while joining so a concurrent start waits for the same workers.
    let mut abandoned = ABANDONED_WORKERS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    for worker in abandoned.drain(..) {
        debug!("Waiting for abandoned playback thread");
        if worker.join().is_err() {
            error!("Abandoned playback thread panicked");
        }
    }
}

/// Handle to a running playback thread.
pub struct PlaybackEngine {
    sender: Option<Sender<DecodedAudioBlock>>,
    worker: Option<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
}

impl PlaybackEngine {
    /// Spawn the playback thread and bring the output device up on it.
    ///
    /// Returns once the device has started, or with
    /// [`AudioError::DeviceStartFailed`] if it could not be prepared or started.
    pub fn start<B: OutputBackend>(
        config: Arc<SessionAudioConfig>,
        backend: B,
        settings: &PlaybackSettings,
        stats: Arc<SessionStats>,
    ) -> Result<Self, AudioError> {
        join_abandoned_workers();

        let (sender, receiver) = channel::bounded(settings.queue_capacity.max(1));
        let (ready_tx, ready_rx) = channel::bounded(1);
        let stopping = Arc::new(AtomicBool::new(false));

        let worker = PlaybackWorker {
            converter: FormatConverter::new(config.channels(), config.sample_rate()),
            config,
            receiver,
            stopping: stopping.clone(),
            stats: stats.clone(),
        };
        let device_queue_capacity = settings.device_queue_capacity.max(1);

        let handle = thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || worker.run(backend, device_queue_capacity, ready_tx))
            .context("Failed to spawn playback thread")
            .map_err(AudioError::DeviceStartFailed)?;

        let failure = match ready_rx.recv_timeout(settings.start_timeout()) {
            Ok(Ok(())) => {
                return Ok(Self {
                    sender: Some(sender),
                    worker: Some(handle),
                    stopping,
                    stats,
                });
            }
            Ok(Err(e)) => e,
            Err(RecvTimeoutError::Timeout) => {
                // The thread releases the device on its own once it sees the
                // closed channel.
                stopping.store(true, Ordering::Release);
                drop(sender);
                ABANDONED_WORKERS
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(handle);
                return Err(AudioError::DeviceStartFailed(anyhow::anyhow!(
                    "Output device did not start within {:?}",
                    settings.start_timeout()
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                anyhow::anyhow!("Playback thread exited during device start")
            }
        };

        if handle.join().is_err() {
            error!("Playback thread panicked during device start");
        }
        Err(AudioError::DeviceStartFailed(failure))
    }

    /// Queue a block for playback and return immediately.
    pub fn schedule(&self, block: DecodedAudioBlock) {
        let Some(sender) = &self.sender else {
            debug!("Playback stopped, dropping block");
            self.stats.record_dropped();
            return;
        };

        match sender.try_send(block) {
            Ok(()) => self.stats.record_scheduled(),
            Err(TrySendError::Full(_)) => {
                warn!("Playback queue full, dropping block");
                self.stats.record_dropped();
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Playback thread gone, dropping block");
                self.stats.record_dropped();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Stop playback and release the device. Calling it again is a no-op.
    ///
    /// Blocks still queued are discarded.
    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        self.sender.take();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Playback thread panicked");
            }
            info!("Playback engine stopped");
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PlaybackWorker {
    config: Arc<SessionAudioConfig>,
    converter: FormatConverter,
    receiver: Receiver<DecodedAudioBlock>,
    stopping: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
}

impl PlaybackWorker {
    fn run<B: OutputBackend>(
        self,
        mut backend: B,
        device_queue_capacity: usize,
        ready: Sender<Result<()>>,
    ) {
        let mut device = match open_device(&mut backend, &self.config, device_queue_capacity) {
            Ok(device) => {
                let _ = ready.send(Ok(()));
                device
            }
            Err(e) => {
                error!("Failed to start output device: {:#}", e);
                let _ = ready.send(Err(e));
                return;
            }
        };
        drop(ready);

        while let Ok(block) = self.receiver.recv() {
            if self.stopping.load(Ordering::Acquire) {
                self.stats.record_dropped();
                continue;
            }
            self.play(device.as_mut(), block);
        }

        device.reset();
        device.stop();
        debug!("Playback thread finished");
    }

    fn play(&self, device: &mut dyn OutputDevice, block: DecodedAudioBlock) {
        let planar = match self.converter.convert(&block) {
            Ok(planar) => planar,
            Err(e) => {
                warn!("Dropping block: {}", e);
                self.stats.record_conversion_failure();
                return;
            }
        };

        match device.submit(planar) {
            Ok(()) => self.stats.record_submitted(),
            Err(e) => {
                warn!(
                    "Dropping buffer with {} queued on the device: {:#}",
                    device.queued(),
                    e
                );
                self.stats.record_submit_failure();
            }
        }
    }
}

fn open_device<B: OutputBackend>(
    backend: &mut B,
    config: &SessionAudioConfig,
    queue_capacity: usize,
) -> Result<Box<dyn OutputDevice>> {
    let mut device = backend
        .open(config, queue_capacity)
        .context("Failed to prepare output device")?;
    if let Err(e) = device.start() {
        device.stop();
        return Err(e.context("Failed to start output device"));
    }
    Ok(device)
}
