//! Headless controller for renderpipe.
//!
//! Provides one API for feeding WAV files through the engine, playing
//! beeps and rendering offline that the CLI and integration tests share.

mod config;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rp_engine::{Engine, EngineError, SoundEffect, Stream};
use rp_format::{load_wav, write_wav, DeviceInfo, FormatError};
use rp_sink::{NullControl, NullDriver, SinkRegistry};
use tracing::{debug, info, warn};

pub use config::{load_settings, parse_settings};
pub use rp_engine::EngineSettings;

/// Back-off when a stream's ring is full.
const FEED_RETRY: Duration = Duration::from_millis(5);

/// Error type for controller operations.
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Owns an engine and at most one file being played.
pub struct Controller {
    engine: Arc<Engine>,
    playback: Option<PlaybackHandle>,
}

struct PlaybackHandle {
    stop_signal: Arc<AtomicBool>,
    frames_fed: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    stream: Arc<Stream>,
    thread: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_engine(Engine::new(settings))
    }

    pub fn with_engine(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
            playback: None,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn devices(&self) -> Vec<(&'static str, DeviceInfo)> {
        self.engine.enumerate_devices(true)
    }

    // --- Real-time playback ---

    /// Start playing a WAV file. Stops any previous playback first.
    pub fn play_wav(&mut self, data: &[u8]) -> Result<(), MasterError> {
        self.stop();

        let wav = load_wav(data)?;
        info!("playing {} ({} frames)", wav.format, wav.frames());
        let stream = self.engine.make_stream(wav.format.clone())?;
        self.engine.start()?;

        let stop_signal = Arc::new(AtomicBool::new(false));
        let frames_fed = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let engine = self.engine.clone();
        let feed_stream = stream.clone();
        let stop = stop_signal.clone();
        let fed = frames_fed.clone();
        let done = finished.clone();

        let thread = std::thread::Builder::new()
            .name("rp-feeder".into())
            .spawn(move || {
                feeder_thread(&engine, &feed_stream, &wav.data, &stop, &fed);
                done.store(true, Ordering::Relaxed);
            })
            .map_err(|e| EngineError::Thread(e.to_string()))?;

        self.playback = Some(PlaybackHandle {
            stop_signal,
            frames_fed,
            finished,
            stream,
            thread: Some(thread),
        });
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut pb) = self.playback.take() {
            pb.stop_signal.store(true, Ordering::Relaxed);
            if let Some(handle) = pb.thread.take() {
                if handle.join().is_err() {
                    warn!("feeder thread panicked");
                }
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playback
            .as_ref()
            .is_some_and(|p| !p.finished.load(Ordering::Relaxed))
    }

    pub fn is_finished(&self) -> bool {
        self.playback
            .as_ref()
            .is_some_and(|p| p.finished.load(Ordering::Relaxed))
    }

    /// Seconds of the current file that have become audible.
    pub fn position(&self) -> Option<f64> {
        let pb = self.playback.as_ref()?;
        if pb.finished.load(Ordering::Relaxed) {
            return None;
        }
        let rate = pb.stream.format().sample_rate as f64;
        let fed = pb.frames_fed.load(Ordering::Relaxed) as f64 / rate;
        Some((fed - pb.stream.delay()).max(0.0))
    }

    pub fn pause(&self) -> bool {
        self.playback.as_ref().is_some_and(|p| p.stream.pause())
    }

    pub fn resume(&self) -> bool {
        self.playback.as_ref().is_some_and(|p| p.stream.resume())
    }

    pub fn set_volume(&self, volume: f32) {
        self.engine.set_volume(volume);
    }

    /// Play a short sine beep as a sound effect.
    pub fn beep(&self, frequency: f32, duration_ms: u32) -> Result<SoundEffect, MasterError> {
        let rate = self.engine.format().map_or(48000, |f| f.sample_rate);
        let sound = SoundEffect::tone(frequency, duration_ms, rate, 0.5)?;
        self.engine.start()?;
        self.engine.play_sound(&sound)?;
        Ok(sound)
    }

    // --- Offline rendering ---

    /// Push a WAV file through a fresh engine on an offline null sink and
    /// return what the sink received, as a WAV file in the output format.
    pub fn render_to_wav(settings: &EngineSettings, data: &[u8]) -> Result<Vec<u8>, MasterError> {
        let wav = load_wav(data)?;
        let control = NullControl::new();
        control.set_capture(true);
        let mut registry = SinkRegistry::new();
        registry.register(Arc::new(NullDriver::with_control(control.clone())));
        let engine = Engine::with_registry(settings.clone(), registry);

        let stream = engine.make_stream(wav.format.clone())?;
        let mut offset = 0;
        while offset < wav.data.len() {
            let n = stream.add_data(&wav.data[offset..]);
            offset += n;
            engine.render_period()?;
        }
        while stream.cache_time() > 0.0 {
            engine.render_period()?;
        }
        let format = engine
            .format()
            .ok_or(EngineError::Sink(rp_sink::SinkError::NotInitialized))?;
        engine.free_stream(&stream);

        let pcm = control.take_captured();
        debug!("rendered {} bytes as {}", pcm.len(), format);
        let mut out = Vec::with_capacity(pcm.len() + 44);
        write_wav(&mut out, &format, &pcm)?;
        Ok(out)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn feeder_thread(engine: &Engine, stream: &Arc<Stream>, data: &[u8], stop: &AtomicBool, fed: &AtomicU64) {
    let frame_size = stream.format().frame_size.max(1) as u64;
    let mut offset = 0;
    while offset < data.len() && !stop.load(Ordering::Relaxed) {
        let n = stream.add_data(&data[offset..]);
        if n == 0 {
            std::thread::sleep(FEED_RETRY);
            continue;
        }
        offset += n;
        fed.fetch_add(n as u64 / frame_size, Ordering::Relaxed);
    }
    if !stop.load(Ordering::Relaxed) {
        stream.drain(true);
    }
    engine.free_stream(stream);
    debug!("feeder done after {} bytes", offset);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_format::{AudioFormat, ChannelLayout, DataFormat};

    fn s16_wav(frames: usize, channels: usize, rate: u32, value: i16) -> Vec<u8> {
        let format = AudioFormat::new(
            DataFormat::S16LE,
            rate,
            ChannelLayout::default_for_count(channels),
        );
        let pcm: Vec<u8> = std::iter::repeat(value.to_le_bytes())
            .take(frames * channels)
            .flatten()
            .collect();
        let mut out = Vec::new();
        write_wav(&mut out, &format, &pcm).unwrap();
        out
    }

    fn offline_controller() -> (Controller, NullControl) {
        let control = NullControl::new();
        let mut registry = SinkRegistry::new();
        registry.register(Arc::new(NullDriver::with_control(control.clone())));
        let engine = Engine::with_registry(EngineSettings::default(), registry);
        (Controller::with_engine(engine), control)
    }

    #[test]
    fn render_to_wav_converts_to_float() {
        let input = s16_wav(4800, 2, 48000, 16384);
        let out = Controller::render_to_wav(&EngineSettings::default(), &input).unwrap();
        let wav = load_wav(&out).unwrap();
        assert_eq!(wav.format.data_format, DataFormat::Float);
        assert_eq!(wav.format.sample_rate, 48000);
        // Whole periods: 4800 frames is exactly five 20 ms periods.
        assert_eq!(wav.frames(), 4800);
        let first = f32::from_ne_bytes([wav.data[0], wav.data[1], wav.data[2], wav.data[3]]);
        assert!((first - 0.5).abs() < 1e-4);
    }

    #[test]
    fn render_to_wav_downmixes_surround() {
        let input = s16_wav(960, 6, 48000, 8192);
        let out = Controller::render_to_wav(&EngineSettings::default(), &input).unwrap();
        let wav = load_wav(&out).unwrap();
        assert_eq!(wav.format.channel_count(), 2);
    }

    #[test]
    fn play_wav_runs_to_completion() {
        let (mut ctrl, control) = offline_controller();
        ctrl.play_wav(&s16_wav(9600, 2, 48000, 1000)).unwrap();
        assert!(ctrl.is_playing() || ctrl.is_finished());
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while ctrl.is_playing() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ctrl.is_finished());
        assert!(control.frames_written() >= 9600);
        assert_eq!(ctrl.engine().stream_count(), 0);
    }

    #[test]
    fn stop_interrupts_feeding() {
        let (mut ctrl, _control) = offline_controller();
        ctrl.engine().suspend();
        assert!(ctrl.play_wav(&s16_wav(100, 2, 48000, 0)).is_err());
        ctrl.engine().resume().unwrap();
        ctrl.play_wav(&s16_wav(480_000, 2, 48000, 0)).unwrap();
        ctrl.stop();
        assert!(!ctrl.is_playing());
    }

    #[test]
    fn beep_plays_a_sound_effect() {
        let (ctrl, _control) = offline_controller();
        let sound = ctrl.beep(880.0, 50).unwrap();
        assert_eq!(sound.frames(), 2400);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ctrl.engine().is_sound_playing(&sound) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!ctrl.engine().is_sound_playing(&sound));
    }

    #[test]
    fn bad_wav_is_a_format_error() {
        let (mut ctrl, _control) = offline_controller();
        assert!(matches!(ctrl.play_wav(b"not a wav"), Err(MasterError::Format(_))));
    }
}
