//! The render engine: owns the sink, the streams and the playing sounds.
//!
//! Control operations (creating and freeing streams, reopening the sink)
//! run on the caller's thread. [`Engine::render_period`] performs one
//! pull/mix/push cycle and is driven either by the engine's own render
//! thread ([`Engine::start`]) or directly by tests and offline renderers.
//!
//! Lock order is `output -> streams -> voices`. The output lock is held for
//! a whole render period, so a reopen can never overlap an in-flight pull.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rp_format::{AudioFormat, ChannelLayout, DeviceInfo};
use rp_sink::{BusId, MixerGraph, Sink, SinkRegistry};
use tracing::{debug, error, info, warn};

use crate::convert::from_float;
use crate::error::{EngineError, EngineResult};
use crate::settings::{EngineSettings, SampleRateMode};
use crate::sound::{SoundEffect, Voice};
use crate::stream::{SinkTiming, Stream, StreamConfig, StreamState};

/// Render thread back-off while nothing is open.
const IDLE_POLL: Duration = Duration::from_millis(5);

const DEFAULT_RATE: u32 = 48000;

/// Does moving from `current` to `desired` require closing the sink?
///
/// Passthrough toggling, a different codec or link rate, and any change
/// of PCM rate, channel count or sample format all do.
pub fn needs_reopen(current: Option<&AudioFormat>, desired: &AudioFormat) -> bool {
    let Some(current) = current else {
        return true;
    };
    if current.is_raw() != desired.is_raw() {
        return true;
    }
    if desired.is_raw() {
        return current.stream_type != desired.stream_type || current.sample_rate != desired.sample_rate;
    }
    current.sample_rate != desired.sample_rate
        || current.channel_count() != desired.channel_count()
        || current.data_format != desired.data_format
}

struct StreamEntry {
    stream: Arc<Stream>,
    bus: Option<BusId>,
}

struct Output {
    sink: Option<Box<dyn Sink>>,
    /// Format the sink negotiated
    format: Option<AudioFormat>,
    /// Format last asked for
    requested: Option<AudioFormat>,
    device: String,
    dirty: bool,
    graph: MixerGraph,
    mix_buf: Vec<f32>,
    out_buf: Vec<u8>,
    raw_stream: Option<Arc<Stream>>,
    idle_since: Option<Instant>,
}

struct Shared {
    settings: RwLock<EngineSettings>,
    registry: SinkRegistry,
    output: Mutex<Output>,
    streams: Mutex<Vec<StreamEntry>>,
    voices: Mutex<Vec<Voice>>,
    timing: Arc<SinkTiming>,
    next_id: AtomicU64,
    volume: AtomicU32,
    muted: AtomicBool,
    suspended: AtomicBool,
}

struct RenderThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owned audio engine. Dropping it stops rendering and closes the sink.
pub struct Engine {
    shared: Arc<Shared>,
    thread: Mutex<Option<RenderThread>>,
}

#[cfg(feature = "alloc_check")]
fn render_graph(graph: &mut MixerGraph, out: &mut [f32]) -> bool {
    assert_no_alloc::assert_no_alloc(|| graph.render(out))
}

#[cfg(not(feature = "alloc_check"))]
fn render_graph(graph: &mut MixerGraph, out: &mut [f32]) -> bool {
    graph.render(out)
}

/// Release the sink. `requested` survives so the next open asks for the same format.
fn close_locked(out: &mut Output) {
    if let Some(mut sink) = out.sink.take() {
        sink.deinitialize();
        info!("closed output {}", out.device);
    }
    out.format = None;
    out.raw_stream = None;
}

impl Shared {
    fn settings(&self) -> EngineSettings {
        self.settings.read().clone()
    }

    /// Format to request for the live streams plus `new`.
    fn desired_format(&self, out: &Output, settings: &EngineSettings, new: Option<&AudioFormat>) -> AudioFormat {
        if let Some(f) = new.filter(|f| f.is_raw()) {
            return f.clone();
        }

        let mut layout = ChannelLayout::new();
        let mut others = false;
        let mut first_rate = None;
        {
            let streams = self.streams.lock();
            let live = streams
                .iter()
                .map(|e| &e.stream)
                .filter(|s| !s.is_raw() && s.state() != StreamState::Destroyed);
            for s in live {
                others = true;
                first_rate.get_or_insert(s.format().sample_rate);
                for ch in s.format().channel_layout.iter() {
                    if !layout.contains(ch) && layout.push(ch).is_err() {
                        break;
                    }
                }
            }
        }
        if let Some(f) = new {
            for ch in f.channel_layout.iter() {
                if !layout.contains(ch) && layout.push(ch).is_err() {
                    break;
                }
            }
        }

        let cap = settings.channels.max(1);
        let mut layout = if layout.is_empty() {
            ChannelLayout::default_for_count(cap.min(2))
        } else {
            layout.best_match()
        };
        if layout.count() > cap {
            layout = ChannelLayout::default_for_count(cap);
        }

        let current = out.requested.as_ref().filter(|f| !f.is_raw()).map(|f| f.sample_rate);
        let rate = match settings.sample_rate_mode {
            SampleRateMode::Fixed(rate) => rate,
            SampleRateMode::Variable => match (new, current) {
                (Some(_), Some(rate)) if others => rate,
                (Some(f), _) => f.sample_rate,
                (None, Some(rate)) => rate,
                (None, None) => first_rate.unwrap_or(DEFAULT_RATE),
            },
        };

        let mut format = AudioFormat::float(rate, layout);
        format.frames = rate * settings.period_ms / 1000;
        format
    }

    /// Close the sink, open one for `desired` and rebind every stream and
    /// playing sound to the new format.
    fn reopen_locked(&self, out: &mut Output, desired: AudioFormat) -> EngineResult<()> {
        close_locked(out);
        out.requested = Some(desired.clone());

        let (device, normalize) = {
            let s = self.settings.read();
            (s.device.clone(), s.normalize_downmix)
        };
        let opened = match self.registry.open(&desired, &device) {
            Ok(opened) => opened,
            Err(e) => {
                error!("failed to open output for {}: {}", desired, e);
                return Err(e.into());
            }
        };
        let hw = opened.format;
        out.sink = Some(opened.sink);
        out.device = opened.device;
        out.dirty = false;
        out.idle_since = None;

        let frames = hw.frames.max(1) as usize;
        if !hw.is_raw() {
            out.graph.set_channels(hw.channel_count());
            out.graph.set_max_frames(frames);
        }
        out.mix_buf.clear();
        out.mix_buf.resize(frames * hw.channel_count(), 0.0);
        out.out_buf.clear();
        out.out_buf.resize(frames * hw.frame_size as usize, 0);

        {
            let mut streams = self.streams.lock();
            for entry in streams.iter_mut() {
                let stream = &entry.stream;
                if stream.state() == StreamState::Destroyed {
                    continue;
                }
                if let Err(e) = stream.initialize(&hw) {
                    debug!("stream {} idle on {}: {}", stream.id(), hw, e);
                    continue;
                }
                if stream.is_raw() {
                    out.raw_stream = Some(stream.clone());
                } else if entry.bus.is_none() {
                    entry.bus = out.graph.attach(stream.clone());
                }
            }
        }

        {
            let mut voices = self.voices.lock();
            if hw.is_raw() {
                voices.clear();
            } else {
                for voice in voices.iter_mut() {
                    let prepared = voice.sound().prepare(&hw, normalize);
                    voice.rebind(prepared);
                }
            }
        }

        out.format = Some(hw);
        Ok(())
    }

    fn ensure_open_locked(&self, out: &mut Output) -> EngineResult<()> {
        if out.sink.is_some() && !out.dirty {
            return Ok(());
        }
        let desired = match out.requested.clone() {
            Some(f) => f,
            None => {
                let settings = self.settings();
                self.desired_format(out, &settings, None)
            }
        };
        self.reopen_locked(out, desired)
    }

    fn has_activity(&self) -> bool {
        self.streams.lock().iter().any(|e| e.stream.is_active()) || !self.voices.lock().is_empty()
    }

    /// Soft suspend: release the device after a quiet spell.
    fn garbage_collect(&self, out: &mut Output, active: bool) {
        if active {
            out.idle_since = None;
            return;
        }
        if out.sink.is_none() {
            return;
        }
        let delay = Duration::from_millis(self.settings.read().suspend_delay_ms);
        let now = Instant::now();
        match out.idle_since {
            None => out.idle_since = Some(now),
            Some(since) if now.duration_since(since) >= delay => {
                info!("output idle for {:?}, releasing {}", delay, out.device);
                close_locked(out);
                out.idle_since = None;
            }
            Some(_) => {}
        }
    }

    fn render_period(&self) -> EngineResult<usize> {
        if self.suspended.load(Ordering::Acquire) {
            return Ok(0);
        }
        let mut guard = self.output.lock();
        let out = &mut *guard;

        let dirty = out.dirty || out.sink.as_ref().is_some_and(|s| s.is_dirty());
        if dirty && out.sink.is_some() {
            warn!("output {} invalidated, reopening", out.device);
            out.dirty = true;
            self.ensure_open_locked(out)?;
        }

        let active = self.has_activity();
        if out.sink.is_none() {
            if !active {
                return Ok(0);
            }
            debug!("activity on a released output, reopening");
            self.ensure_open_locked(out)?;
        }

        let Some(hw) = out.format.as_ref() else {
            return Ok(0);
        };
        let frames = hw.frames.max(1) as usize;
        let channels = hw.channel_count();
        let bytes = frames * hw.frame_size as usize;
        let data_format = hw.data_format;
        let raw = hw.is_raw();

        let mut fatal = false;
        let mut pushed = 0;
        {
            let Output {
                sink,
                graph,
                mix_buf,
                out_buf,
                raw_stream,
                ..
            } = &mut *out;
            let Some(sink) = sink.as_mut() else {
                return Ok(0);
            };

            if raw {
                match raw_stream {
                    Some(stream) => {
                        stream.get_raw(&mut out_buf[..bytes]);
                    }
                    None => out_buf[..bytes].fill(0),
                }
            } else {
                let mix = &mut mix_buf[..frames * channels];
                render_graph(graph, mix);
                self.voices.lock().retain_mut(|v| v.mix_into(mix, channels));
                let gain = if self.muted.load(Ordering::Relaxed) {
                    0.0
                } else {
                    f32::from_bits(self.volume.load(Ordering::Relaxed))
                };
                if gain != 1.0 {
                    for s in mix.iter_mut() {
                        *s *= gain;
                    }
                }
                from_float(data_format, mix, &mut out_buf[..bytes]);
            }

            while pushed < frames {
                match sink.add_packets(&out_buf[..bytes], frames - pushed, pushed) {
                    Ok(0) => break,
                    Ok(n) => pushed += n,
                    Err(e) => {
                        if e.is_fatal() {
                            fatal = true;
                        } else {
                            warn!("add_packets: {}", e);
                        }
                        break;
                    }
                }
            }
            self.timing.set(sink.delay(), sink.cache_total());
        }
        if fatal {
            out.dirty = true;
        }

        self.garbage_collect(out, active);
        Ok(pushed)
    }
}

impl Engine {
    /// Engine over the default drivers (cpal when built in, then null).
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_registry(settings, SinkRegistry::with_defaults())
    }

    pub fn with_registry(settings: EngineSettings, registry: SinkRegistry) -> Self {
        let output = Output {
            sink: None,
            format: None,
            requested: None,
            device: String::new(),
            dirty: false,
            graph: MixerGraph::new(2),
            mix_buf: Vec::new(),
            out_buf: Vec::new(),
            raw_stream: None,
            idle_since: None,
        };
        Self {
            shared: Arc::new(Shared {
                settings: RwLock::new(settings),
                registry,
                output: Mutex::new(output),
                streams: Mutex::new(Vec::new()),
                voices: Mutex::new(Vec::new()),
                timing: Arc::new(SinkTiming::default()),
                next_id: AtomicU64::new(1),
                volume: AtomicU32::new(1.0f32.to_bits()),
                muted: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> EngineSettings {
        self.shared.settings()
    }

    /// Replace the settings; an open output is reopened to apply them.
    pub fn update_settings(&self, settings: EngineSettings) -> EngineResult<()> {
        *self.shared.settings.write() = settings.clone();
        let mut out = self.shared.output.lock();
        if out.sink.is_none() {
            out.requested = None;
            return Ok(());
        }
        let raw = out.format.as_ref().is_some_and(AudioFormat::is_raw);
        let desired = match out.requested.clone() {
            Some(f) if raw => f,
            _ => self.shared.desired_format(&out, &settings, None),
        };
        self.shared.reopen_locked(&mut out, desired)
    }

    // --- Streams ---

    /// Create a stream producing `format`.
    ///
    /// Reopens the sink when the current output cannot carry the stream
    /// (passthrough toggle, rate, channel count or sample format).
    pub fn make_stream(&self, format: AudioFormat) -> EngineResult<Arc<Stream>> {
        format.validate()?;
        let settings = self.shared.settings();
        if let Some(st) = format.stream_type.filter(|_| format.is_raw()) {
            if !settings.passthrough.allows(st) {
                return Err(EngineError::PassthroughDisabled(st));
            }
        }
        if self.shared.suspended.load(Ordering::Acquire) {
            return Err(EngineError::Suspended);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(Stream::new(
            id,
            format,
            StreamConfig::from(&settings),
            self.shared.timing.clone(),
        )?);

        let mut out = self.shared.output.lock();
        let desired = self.shared.desired_format(&out, &settings, Some(stream.format()));
        if out.sink.is_none() || out.dirty || needs_reopen(out.requested.as_ref(), &desired) {
            info!("stream {} ({}) needs output {}", id, stream.format(), desired);
            self.shared.reopen_locked(&mut out, desired)?;
        }
        let hw = out
            .format
            .clone()
            .ok_or(EngineError::Sink(rp_sink::SinkError::NotInitialized))?;
        stream.initialize(&hw)?;

        let bus = if stream.is_raw() {
            out.raw_stream = Some(stream.clone());
            None
        } else {
            Some(out.graph.attach(stream.clone()).ok_or(EngineError::BusPoolExhausted)?)
        };
        out.idle_since = None;
        self.shared.streams.lock().push(StreamEntry {
            stream: stream.clone(),
            bus,
        });
        debug!("stream {} created on {}", id, hw);
        Ok(stream)
    }

    /// Destroy `stream` and reap every destroyed stream.
    ///
    /// Leaving passthrough reopens the sink for PCM.
    pub fn free_stream(&self, stream: &Arc<Stream>) {
        // Invalid from here on; a pull in flight finishes or sees silence.
        stream.destroy();

        let mut out = self.shared.output.lock();
        {
            let out = &mut *out;
            let mut streams = self.shared.streams.lock();
            streams.retain(|e| {
                if e.stream.state() != StreamState::Destroyed {
                    return true;
                }
                if let Some(bus) = e.bus {
                    out.graph.detach(bus);
                }
                if out.raw_stream.as_ref().is_some_and(|r| Arc::ptr_eq(r, &e.stream)) {
                    out.raw_stream = None;
                }
                false
            });
        }

        let in_raw = out.requested.as_ref().is_some_and(AudioFormat::is_raw);
        let raw_alive = self
            .shared
            .streams
            .lock()
            .iter()
            .any(|e| e.stream.is_raw());
        if !in_raw || raw_alive {
            return;
        }
        if out.sink.is_none() || self.shared.suspended.load(Ordering::Acquire) {
            // Released: the next open picks a PCM format.
            out.requested = None;
        } else {
            let settings = self.shared.settings();
            let desired = self.shared.desired_format(&out, &settings, None);
            info!("leaving passthrough, reopening for {}", desired);
            if let Err(e) = self.shared.reopen_locked(&mut out, desired) {
                error!("could not restore PCM output: {}", e);
            }
        }
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }

    // --- Sounds ---

    /// Decode a WAV sound effect and prepare it for the current output.
    pub fn make_sound(&self, wav: &[u8]) -> EngineResult<SoundEffect> {
        let sound = SoundEffect::from_wav(wav)?;
        if let Some(hw) = self.format().filter(|f| !f.is_raw()) {
            sound.prepare(&hw, self.shared.settings.read().normalize_downmix);
        }
        Ok(sound)
    }

    /// Start `sound`, or restart it from the top if it is already playing.
    pub fn play_sound(&self, sound: &SoundEffect) -> EngineResult<()> {
        if self.shared.suspended.load(Ordering::Acquire) {
            return Err(EngineError::Suspended);
        }
        let mut out = self.shared.output.lock();
        self.shared.ensure_open_locked(&mut out)?;
        let Some(hw) = out.format.as_ref().filter(|f| !f.is_raw()) else {
            warn!("cannot play sounds during passthrough");
            return Ok(());
        };
        let normalize = self.shared.settings.read().normalize_downmix;
        let mut voices = self.shared.voices.lock();
        match voices.iter_mut().find(|v| v.sound().ptr_eq(sound)) {
            Some(voice) => voice.restart(),
            None => voices.push(Voice::new(sound.clone(), sound.prepare(hw, normalize))),
        }
        out.idle_since = None;
        Ok(())
    }

    pub fn stop_sound(&self, sound: &SoundEffect) {
        self.shared.voices.lock().retain(|v| !v.sound().ptr_eq(sound));
    }

    pub fn is_sound_playing(&self, sound: &SoundEffect) -> bool {
        self.shared.voices.lock().iter().any(|v| v.sound().ptr_eq(sound))
    }

    /// Stop `sound` and drop the engine's references to it.
    pub fn free_sound(&self, sound: SoundEffect) {
        self.stop_sound(&sound);
    }

    // --- Output ---

    /// Run one pull/mix/push cycle. Returns the frames the sink took.
    pub fn render_period(&self) -> EngineResult<usize> {
        self.shared.render_period()
    }

    /// Release the device and stop all sounds until [`Engine::resume`].
    pub fn suspend(&self) {
        let mut out = self.shared.output.lock();
        self.shared.suspended.store(true, Ordering::Release);
        close_locked(&mut out);
        self.shared.voices.lock().clear();
        info!("engine suspended");
    }

    pub fn resume(&self) -> EngineResult<()> {
        let mut out = self.shared.output.lock();
        self.shared.suspended.store(false, Ordering::Release);
        info!("engine resumed");
        match out.requested.clone() {
            Some(desired) => self.shared.reopen_locked(&mut out, desired),
            None => Ok(()),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    /// Hot-plug notification: refresh device lists and reopen the output.
    pub fn devices_changed(&self) -> EngineResult<()> {
        let devices = self.shared.registry.enumerate(true);
        debug!("{} devices after change", devices.len());
        let mut out = self.shared.output.lock();
        if out.sink.is_none() {
            return Ok(());
        }
        out.dirty = true;
        self.shared.ensure_open_locked(&mut out)
    }

    pub fn enumerate_devices(&self, force: bool) -> Vec<(&'static str, DeviceInfo)> {
        self.shared.registry.enumerate(force)
    }

    /// Play out every stream, then the sink.
    pub fn drain(&self) {
        let streams: Vec<Arc<Stream>> = self
            .shared
            .streams
            .lock()
            .iter()
            .map(|e| e.stream.clone())
            .collect();
        for stream in &streams {
            stream.drain(true);
        }
        if let Some(sink) = self.shared.output.lock().sink.as_mut() {
            sink.drain();
        }
    }

    /// Sink delay in seconds, as of the last period.
    pub fn delay(&self) -> f64 {
        self.shared.timing.delay()
    }

    /// The negotiated output format, if a sink has been opened.
    pub fn format(&self) -> Option<AudioFormat> {
        self.shared.output.lock().format.clone()
    }

    /// `"<driver>:<device>"` of the open output.
    pub fn device(&self) -> Option<String> {
        let out = self.shared.output.lock();
        out.sink.as_ref().map(|_| out.device.clone())
    }

    pub fn is_open(&self) -> bool {
        self.shared.output.lock().sink.is_some()
    }

    pub fn is_passthrough(&self) -> bool {
        self.shared
            .output
            .lock()
            .format
            .as_ref()
            .is_some_and(AudioFormat::is_raw)
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared
            .volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.shared.volume.load(Ordering::Relaxed))
    }

    pub fn set_mute(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    // --- Render thread ---

    /// Spawn the render thread. A no-op when it is already running.
    pub fn start(&self) -> EngineResult<()> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let shared = self.shared.clone();
        let stop_flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("rp-render".into())
            .spawn(move || render_thread(shared, stop_flag))
            .map_err(|e| EngineError::Thread(e.to_string()))?;
        *slot = Some(RenderThread { stop, handle });
        Ok(())
    }

    /// Stop the render thread, destroy every stream and close the sink.
    pub fn shutdown(&self) {
        if let Some(thread) = self.thread.lock().take() {
            thread.stop.store(true, Ordering::Relaxed);
            if thread.handle.join().is_err() {
                error!("render thread panicked");
            }
        }
        let mut out = self.shared.output.lock();
        {
            let out = &mut *out;
            let mut streams = self.shared.streams.lock();
            for entry in streams.drain(..) {
                entry.stream.destroy();
                if let Some(bus) = entry.bus {
                    out.graph.detach(bus);
                }
            }
            out.raw_stream = None;
        }
        self.shared.voices.lock().clear();
        close_locked(&mut out);
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn render_thread(shared: Arc<Shared>, stop: Arc<AtomicBool>) {
    debug!("render thread started");
    while !stop.load(Ordering::Relaxed) {
        match shared.render_period() {
            Ok(0) => std::thread::sleep(IDLE_POLL),
            Ok(_) => {}
            Err(e) => {
                warn!("render period failed: {}", e);
                std::thread::sleep(IDLE_POLL * 20);
            }
        }
    }
    debug!("render thread stopped");
}
