use std::f32::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use gamestream_audio::{AudioDescriptor, AudioSession, CpalBackend, PlaybackSettings};
use opus::{Application, Channels, Encoder};
use tracing::{error, info};

const SAMPLES_PER_FRAME: usize = 240;
const TONE_HZ: f32 = 440.0;
const DURATION: Duration = Duration::from_secs(3);

fn main() {
    gamestream_audio::init_logging();

    if let Err(e) = run() {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let settings = match std::env::args().nth(1) {
        Some(path) => PlaybackSettings::from_json_file(path)?,
        None => PlaybackSettings::default(),
    };
    info!("Playback settings: {:?}", settings);

    let descriptor = AudioDescriptor::stereo(SAMPLES_PER_FRAME as u32);
    let mut session = AudioSession::open(&descriptor, CpalBackend::default(), &settings)?;

    let mut encoder = Encoder::new(descriptor.sample_rate, Channels::Stereo, Application::LowDelay)
        .context("Failed to create Opus encoder")?;
    let mut packet = vec![0u8; 4000];

    let frame_duration = session.config().frame_duration();
    let frames = (DURATION.as_secs_f64() / frame_duration.as_secs_f64()) as usize;
    let sample_rate = descriptor.sample_rate as f32;
    let started = Instant::now();

    info!("Playing {}Hz tone for {:?}", TONE_HZ, DURATION);
    for n in 0..frames {
        let pcm: Vec<f32> = (0..SAMPLES_PER_FRAME)
            .flat_map(|i| {
                let t = (n * SAMPLES_PER_FRAME + i) as f32 / sample_rate;
                let s = (t * TONE_HZ * TAU).sin() * 0.2;
                [s, s]
            })
            .collect();
        let len = encoder
            .encode_float(&pcm, &mut packet)
            .context("Opus encoding failed")?;
        session.submit_frame(&packet[..len]);

        // Pace frames like a network stream would deliver them.
        let due = started + frame_duration * (n as u32 + 1);
        if let Some(wait) = due.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    info!("Stats: {:?}", session.stats());
    session.close();
    Ok(())
}
