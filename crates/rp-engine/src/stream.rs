//! Streams: the hand-off between a decoder thread and the render thread.
//!
//! The producer side ([`Stream::add_data`]) converts incoming PCM to float,
//! remaps/upmixes it to the hardware layout, resamples it to the hardware
//! rate and writes it into the stream's ring. The render side
//! ([`Stream::get_frames`]) drains the ring, applies volume and fades and
//! never blocks: when the stream is being torn down or reconfigured it
//! returns silence instead.
//!
//! Passthrough streams skip the whole chain; their bytes go through the
//! ring untouched and are read with [`Stream::get_raw`].

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rp_format::{AudioFormat, ChannelLayout, DataFormat};
use rp_sink::GraphSource;
use tracing::{debug, trace};

use crate::convert::{Converter, LinearResampler, ResamplerState};
use crate::error::{EngineError, EngineResult};
use crate::remap::{Remapper, Upmixer};
use crate::ring::{ring_buffer, RingConsumer, RingProducer};
use crate::settings::EngineSettings;

/// Most samples handed to an audio callback per render call.
pub const VIS_MAX_SAMPLES: usize = 512;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Uninitialized = 0,
    Valid = 1,
    Paused = 2,
    Draining = 3,
    Destroyed = 4,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamState::Valid,
            2 => StreamState::Paused,
            3 => StreamState::Draining,
            4 => StreamState::Destroyed,
            _ => StreamState::Uninitialized,
        }
    }
}

/// Visualisation tap: receives a stereo copy of what a stream renders.
pub trait AudioCallback: Send + Sync {
    fn initialize(&self, _channels: usize, _sample_rate: u32) {}
    fn on_audio_data(&self, samples: &[f32]);
}

/// Sink timing published by the engine after each period.
#[derive(Debug, Default)]
pub struct SinkTiming {
    delay: AtomicU64,
    cache_total: AtomicU64,
}

impl SinkTiming {
    pub fn set(&self, delay: f64, cache_total: f64) {
        self.delay.store(delay.to_bits(), Ordering::Relaxed);
        self.cache_total.store(cache_total.to_bits(), Ordering::Relaxed);
    }

    pub fn delay(&self) -> f64 {
        f64::from_bits(self.delay.load(Ordering::Relaxed))
    }

    pub fn cache_total(&self) -> f64 {
        f64::from_bits(self.cache_total.load(Ordering::Relaxed))
    }
}

/// Per-stream knobs taken from [`EngineSettings`].
#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfig {
    pub buffer_ms: u32,
    pub add_data_timeout: Duration,
    pub normalize: bool,
}

impl From<&EngineSettings> for StreamConfig {
    fn from(s: &EngineSettings) -> Self {
        Self {
            buffer_ms: s.stream_buffer_ms.max(1),
            add_data_timeout: Duration::from_millis(s.add_data_timeout_ms),
            normalize: s.normalize_downmix,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

/// Which stages of the conversion chain a stream runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChainInfo {
    pub convert: bool,
    pub remap: bool,
    pub upmix: bool,
    pub resample: bool,
    pub passthrough: bool,
}

/// Result of one render-side read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderStatus {
    /// Frames taken from the ring
    pub frames: usize,
    /// Nothing was read; the output buffer holds silence
    pub silent: bool,
}

impl RenderStatus {
    const SILENCE: RenderStatus = RenderStatus {
        frames: 0,
        silent: true,
    };
}

#[derive(Clone, Copy)]
enum Stage {
    Float,
    Remap,
    Upmix,
    Resample,
}

/// Producer-side state.
struct Chain {
    hw: AudioFormat,
    converter: Option<Converter>,
    remapper: Option<Remapper>,
    upmixer: Option<Upmixer>,
    resampler: Option<LinearResampler>,
    passthrough: bool,
    /// Bytes per frame stored in the ring
    ring_frame_bytes: usize,
    producer: RingProducer,
    /// Bumped on every rebuild; staged scratch data is only valid for one epoch
    epoch: u64,
    float_buf: Vec<f32>,
    remap_buf: Vec<f32>,
    upmix_buf: Vec<f32>,
    resample_buf: Vec<f32>,
}

/// One `add_data` chunk, converted and waiting for ring space.
struct Staged {
    epoch: u64,
    frames: usize,
    /// `None` for passthrough: the input bytes go in as they are
    stage: Option<Stage>,
    samples: usize,
    needed: usize,
    saved: Option<ResamplerState>,
}

struct Fade {
    target: f32,
    step: f32,
    running: bool,
}

/// Render-side state.
struct RenderSide {
    consumer: RingConsumer,
    frame_bytes: usize,
    channels: usize,
    sample_rate: u32,
    passthrough: bool,
    volume: f32,
    replay_gain: f32,
    fade: Fade,
    vis_remap: Option<Remapper>,
    vis_buf: Vec<f32>,
    callback: Option<Arc<dyn AudioCallback>>,
}

/// Chain stages and ring geometry for one input/hardware pairing.
struct Plan {
    converter: Option<Converter>,
    remapper: Option<Remapper>,
    upmixer: Option<Upmixer>,
    resampler: Option<LinearResampler>,
    passthrough: bool,
    channels: usize,
    ring_frame_bytes: usize,
}

fn plan(input: &AudioFormat, hw: &AudioFormat, normalize: bool) -> EngineResult<Plan> {
    if input.is_raw() {
        if !hw.is_raw() || hw.stream_type != input.stream_type {
            return Err(EngineError::InvalidFormat(format!(
                "passthrough stream {} on non-passthrough output {}",
                input, hw
            )));
        }
        return Ok(Plan {
            converter: None,
            remapper: None,
            upmixer: None,
            resampler: None,
            passthrough: true,
            channels: input.channel_count(),
            ring_frame_bytes: input.frame_size as usize,
        });
    }
    if hw.is_raw() {
        return Err(EngineError::InvalidFormat(format!(
            "PCM stream {} on passthrough output {}",
            input, hw
        )));
    }

    let converter = match input.data_format {
        DataFormat::Float => None,
        other => Some(Converter::new(other).ok_or_else(|| {
            EngineError::InvalidFormat(format!("no converter for {}", other))
        })?),
    };

    let (remapper, upmixer) = if input.channel_layout == hw.channel_layout {
        (None, None)
    } else if input.channel_layout.is_prefix_of(&hw.channel_layout) {
        (None, Upmixer::new(input.channel_count(), hw.channel_count()))
    } else {
        (
            Some(Remapper::new(&input.channel_layout, &hw.channel_layout, normalize)),
            None,
        )
    };

    let resampler = (input.sample_rate != hw.sample_rate)
        .then(|| LinearResampler::new(hw.channel_count(), input.sample_rate, hw.sample_rate));

    Ok(Plan {
        converter,
        remapper,
        upmixer,
        resampler,
        passthrough: false,
        channels: hw.channel_count(),
        ring_frame_bytes: hw.channel_count() * std::mem::size_of::<f32>(),
    })
}

impl Chain {
    fn info(&self) -> ChainInfo {
        ChainInfo {
            convert: self.converter.is_some(),
            remap: self.remapper.is_some(),
            upmix: self.upmixer.is_some(),
            resample: self.resampler.is_some(),
            passthrough: self.passthrough,
        }
    }

    /// Run `frames` frames of `input` through the chain.
    ///
    /// Returns the final stage and the number of samples it holds.
    fn process(&mut self, input: &[u8], in_channels: usize, frames: usize) -> (Stage, usize) {
        let Chain {
            converter,
            remapper,
            upmixer,
            resampler,
            float_buf,
            remap_buf,
            upmix_buf,
            resample_buf,
            ..
        } = self;

        let n = frames * in_channels;
        if float_buf.len() < n {
            float_buf.resize(n, 0.0);
        }
        match converter {
            Some(c) => {
                c.convert(input, &mut float_buf[..n]);
            }
            None => bytemuck::cast_slice_mut::<f32, u8>(&mut float_buf[..n]).copy_from_slice(&input[..n * 4]),
        }
        let mut stage = Stage::Float;
        let mut samples = n;

        if let Some(r) = remapper.as_ref() {
            let out = frames * r.output().count();
            if remap_buf.len() < out {
                remap_buf.resize(out, 0.0);
            }
            r.process(&float_buf[..n], &mut remap_buf[..out], frames);
            stage = Stage::Remap;
            samples = out;
        }

        if let Some(u) = upmixer.as_ref() {
            let out = frames * u.channels_out();
            if upmix_buf.len() < out {
                upmix_buf.resize(out, 0.0);
            }
            let src = match stage {
                Stage::Remap => &remap_buf[..samples],
                _ => &float_buf[..samples],
            };
            u.process(src, &mut upmix_buf[..out], frames);
            stage = Stage::Upmix;
            samples = out;
        }

        if let Some(rs) = resampler.as_mut() {
            let src = match stage {
                Stage::Remap => &remap_buf[..samples],
                Stage::Upmix => &upmix_buf[..samples],
                _ => &float_buf[..samples],
            };
            resample_buf.clear();
            rs.process(src, resample_buf);
            stage = Stage::Resample;
            samples = resample_buf.len();
        }

        (stage, samples)
    }

    /// Write the output of [`Chain::process`] into the ring.
    fn write_staged(&mut self, stage: Stage, samples: usize) {
        let Chain {
            producer,
            float_buf,
            remap_buf,
            upmix_buf,
            resample_buf,
            ..
        } = self;
        let buf = match stage {
            Stage::Float => &float_buf[..samples],
            Stage::Remap => &remap_buf[..samples],
            Stage::Upmix => &upmix_buf[..samples],
            Stage::Resample => &resample_buf[..samples],
        };
        producer.write(bytemuck::cast_slice(buf));
    }
}

impl Fade {
    fn idle() -> Self {
        Self {
            target: 1.0,
            step: 0.0,
            running: false,
        }
    }
}

impl RenderSide {
    fn apply_gain(&mut self, samples: &mut [f32]) {
        let ch = self.channels.max(1);
        for frame in samples.chunks_exact_mut(ch) {
            if self.fade.running {
                self.volume += self.fade.step;
                let done = (self.fade.step > 0.0 && self.volume >= self.fade.target)
                    || (self.fade.step < 0.0 && self.volume <= self.fade.target);
                if done {
                    self.volume = self.fade.target;
                    self.fade.running = false;
                }
            }
            let gain = self.volume.clamp(0.0, 1.0) * self.replay_gain;
            if gain == 1.0 {
                for s in frame.iter_mut() {
                    *s = s.clamp(-1.0, 1.0);
                }
            } else {
                for s in frame.iter_mut() {
                    *s = (*s * gain).clamp(-1.0, 1.0);
                }
            }
        }
    }

    fn feed_callback(&mut self, rendered: &[f32]) {
        let RenderSide {
            callback,
            vis_buf,
            vis_remap,
            channels,
            ..
        } = self;
        let Some(cb) = callback.as_ref() else {
            return;
        };
        let ch = (*channels).max(1);
        let frames = (rendered.len() / ch).min(VIS_MAX_SAMPLES / 2);
        if frames == 0 {
            return;
        }
        match vis_remap {
            Some(r) => r.process(&rendered[..frames * ch], &mut vis_buf[..frames * 2], frames),
            None => vis_buf[..frames * 2].copy_from_slice(&rendered[..frames * 2]),
        }
        cb.on_audio_data(&vis_buf[..frames * 2]);
    }
}

/// One logical audio source.
pub struct Stream {
    id: u64,
    format: AudioFormat,
    config: StreamConfig,
    state: AtomicU8,
    chain: Mutex<Option<Chain>>,
    render: Mutex<Option<RenderSide>>,
    /// Serializes producers so the chain lock can be dropped while waiting
    feed: Mutex<()>,
    timing: Arc<SinkTiming>,
}

impl Stream {
    /// A stream in `Uninitialized` state; call [`Stream::initialize`] next.
    pub fn new(id: u64, format: AudioFormat, config: StreamConfig, timing: Arc<SinkTiming>) -> EngineResult<Self> {
        format.validate()?;
        Ok(Self {
            id,
            format,
            config,
            state: AtomicU8::new(StreamState::Uninitialized as u8),
            chain: Mutex::new(None),
            render: Mutex::new(None),
            feed: Mutex::new(()),
            timing,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Format the producer writes in.
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn is_raw(&self) -> bool {
        self.format.is_raw()
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: StreamState, to: StreamState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Build (or rebuild) the chain for the hardware format `hw`.
    ///
    /// Buffered audio survives when the ring geometry is unchanged.
    pub fn initialize(&self, hw: &AudioFormat) -> EngineResult<()> {
        if self.state() == StreamState::Destroyed {
            return Ok(());
        }
        let plan = plan(&self.format, hw, self.config.normalize)?;
        let mut chain_slot = self.chain.lock();
        let mut render_slot = self.render.lock();

        let keep_ring = match (chain_slot.as_ref(), render_slot.as_ref()) {
            (Some(chain), Some(render)) => {
                chain.ring_frame_bytes == plan.ring_frame_bytes
                    && render.channels == plan.channels
                    && chain.hw.sample_rate == hw.sample_rate
                    && chain.hw.channel_layout == hw.channel_layout
            }
            _ => false,
        };

        let epoch = chain_slot.as_ref().map_or(0, |c| c.epoch + 1);
        let old_chain = chain_slot.take();
        let old_render = render_slot.take();
        let (producer, consumer, volume, replay_gain, callback) = match (old_chain, old_render) {
            (Some(chain), Some(render)) if keep_ring => {
                (chain.producer, render.consumer, render.volume, render.replay_gain, render.callback)
            }
            (_, old_render) => {
                let frames = (hw.sample_rate as u64 * self.config.buffer_ms as u64 / 1000).max(1) as usize;
                let (p, c) = ring_buffer(frames * plan.ring_frame_bytes);
                let (volume, replay_gain, callback) = old_render
                    .map(|r| (r.volume, r.replay_gain, r.callback))
                    .unwrap_or((1.0, 1.0, None));
                (p, c, volume, replay_gain, callback)
            }
        };

        let vis_remap = (!plan.passthrough && hw.channel_layout != ChannelLayout::stereo())
            .then(|| Remapper::new(&hw.channel_layout, &ChannelLayout::stereo(), true));
        if let Some(cb) = &callback {
            cb.initialize(2, hw.sample_rate);
        }

        let info = ChainInfo {
            convert: plan.converter.is_some(),
            remap: plan.remapper.is_some(),
            upmix: plan.upmixer.is_some(),
            resample: plan.resampler.is_some(),
            passthrough: plan.passthrough,
        };
        *render_slot = Some(RenderSide {
            consumer,
            frame_bytes: plan.ring_frame_bytes,
            channels: plan.channels,
            sample_rate: hw.sample_rate,
            passthrough: plan.passthrough,
            volume,
            replay_gain,
            fade: Fade::idle(),
            vis_remap,
            vis_buf: vec![0.0; VIS_MAX_SAMPLES],
            callback,
        });
        *chain_slot = Some(Chain {
            hw: hw.clone(),
            converter: plan.converter,
            remapper: plan.remapper,
            upmixer: plan.upmixer,
            resampler: plan.resampler,
            passthrough: plan.passthrough,
            ring_frame_bytes: plan.ring_frame_bytes,
            producer,
            epoch,
            float_buf: Vec::new(),
            remap_buf: Vec::new(),
            upmix_buf: Vec::new(),
            resample_buf: Vec::new(),
        });
        drop(render_slot);
        drop(chain_slot);

        self.transition(StreamState::Uninitialized, StreamState::Valid);
        debug!(
            "stream {} initialized: {} -> {} ({:?}, ring kept: {})",
            self.id, self.format, hw, info, keep_ring
        );
        Ok(())
    }

    /// Stages the producer currently runs.
    pub fn chain_info(&self) -> ChainInfo {
        self.chain.lock().as_ref().map(Chain::info).unwrap_or_default()
    }

    /// Most input frames one `add_data` call will take.
    fn max_input_frames(&self, chain: &Chain) -> usize {
        let ring_frames = chain.producer.capacity() / chain.ring_frame_bytes.max(1);
        let in_frames = match &chain.resampler {
            Some(r) => (ring_frames as f64 / r.ratio()) as usize,
            None => ring_frames,
        };
        (in_frames / 2).max(1)
    }

    /// Convert as much of `data` as one call takes into the chain's scratch buffers.
    fn stage(&self, chain: &mut Chain, data: &[u8]) -> Option<Staged> {
        let in_fs = self.format.frame_size as usize;
        let frames = (data.len() / in_fs).min(self.max_input_frames(chain));
        if frames == 0 {
            return None;
        }
        let input = &data[..frames * in_fs];
        if chain.passthrough {
            return Some(Staged {
                epoch: chain.epoch,
                frames,
                stage: None,
                samples: 0,
                needed: input.len(),
                saved: None,
            });
        }
        let saved = chain.resampler.as_ref().map(LinearResampler::save);
        let (stage, samples) = chain.process(input, self.format.channel_count(), frames);
        Some(Staged {
            epoch: chain.epoch,
            frames,
            stage: Some(stage),
            samples,
            needed: samples * std::mem::size_of::<f32>(),
            saved,
        })
    }

    /// Queue `data` (whole frames in [`Stream::format`]).
    ///
    /// Returns the number of bytes consumed; 0 means "try again later"
    /// (ring full after the backpressure wait, paused without room, or the
    /// stream is not accepting data). The chain is unlocked while waiting,
    /// so a reinitialization is never held up by a full ring.
    pub fn add_data(&self, data: &[u8]) -> usize {
        let state = self.state();
        if data.is_empty() || !matches!(state, StreamState::Valid | StreamState::Paused) {
            return 0;
        }
        let _feed = self.feed.lock();
        let in_fs = self.format.frame_size as usize;
        let timeout = self.config.add_data_timeout;
        let start = Instant::now();
        let mut staged: Option<Staged> = None;

        loop {
            let mut chain_slot = self.chain.lock();
            let Some(chain) = chain_slot.as_mut() else {
                return 0;
            };
            // Rebuilt while we slept: the old scratch data is gone.
            if staged.as_ref().map_or(true, |s| s.epoch != chain.epoch) {
                staged = self.stage(chain, data);
            }
            let Some(current) = staged.as_ref() else {
                return 0;
            };

            let room = chain.producer.write_size();
            if current.needed <= room {
                match current.stage {
                    None => chain.producer.write(&data[..current.frames * in_fs]),
                    Some(stage) => chain.write_staged(stage, current.samples),
                }
                return current.frames * in_fs;
            }

            let elapsed = start.elapsed();
            if self.state() != StreamState::Valid || elapsed >= timeout {
                let needed = current.needed;
                if let (Some(saved), Some(r)) = (staged.and_then(|s| s.saved), chain.resampler.as_mut()) {
                    r.restore(saved);
                }
                trace!("stream {}: ring full, {} bytes deferred", self.id, needed);
                return 0;
            }
            let bytes_per_second = (chain.ring_frame_bytes * chain.hw.sample_rate as usize).max(1) as u64;
            let missing = (current.needed - room) as u64;
            let wait = Duration::from_millis((missing * 1000 / bytes_per_second).max(1));
            drop(chain_slot);
            std::thread::sleep(wait.min(timeout - elapsed));
        }
    }

    /// Render `out.len() / channels` frames of float audio in the
    /// hardware layout. Never blocks.
    pub fn get_frames(&self, out: &mut [f32]) -> RenderStatus {
        let Some(mut guard) = self.render.try_lock() else {
            out.fill(0.0);
            return RenderStatus::SILENCE;
        };
        let state = self.state();
        let render = match guard.as_mut() {
            Some(r) if !r.passthrough && matches!(state, StreamState::Valid | StreamState::Draining) => r,
            _ => {
                out.fill(0.0);
                return RenderStatus::SILENCE;
            }
        };

        let ch = render.channels.max(1);
        let wanted = out.len() / ch;
        let available = render.consumer.read_size() / render.frame_bytes;
        let frames = wanted.min(available);
        let samples = frames * ch;
        render
            .consumer
            .read(bytemuck::cast_slice_mut::<f32, u8>(&mut out[..samples]));
        out[samples..].fill(0.0);

        if state == StreamState::Draining && render.consumer.read_size() < render.frame_bytes {
            self.transition(StreamState::Draining, StreamState::Valid);
        }

        render.feed_callback(&out[..samples]);
        render.apply_gain(&mut out[..samples]);

        RenderStatus {
            frames,
            silent: frames == 0,
        }
    }

    /// Read passthrough bytes (whole link frames). Never blocks.
    pub fn get_raw(&self, out: &mut [u8]) -> RenderStatus {
        let Some(mut guard) = self.render.try_lock() else {
            out.fill(0);
            return RenderStatus::SILENCE;
        };
        let state = self.state();
        let render = match guard.as_mut() {
            Some(r) if r.passthrough && matches!(state, StreamState::Valid | StreamState::Draining) => r,
            _ => {
                out.fill(0);
                return RenderStatus::SILENCE;
            }
        };
        let fb = render.frame_bytes.max(1);
        let frames = (out.len() / fb).min(render.consumer.read_size() / fb);
        render.consumer.read(&mut out[..frames * fb]);
        out[frames * fb..].fill(0);
        if state == StreamState::Draining && render.consumer.read_size() < fb {
            self.transition(StreamState::Draining, StreamState::Valid);
        }
        RenderStatus {
            frames,
            silent: frames == 0,
        }
    }

    fn with_render<R>(&self, f: impl FnOnce(&mut RenderSide) -> R) -> Option<R> {
        self.render.lock().as_mut().map(f)
    }

    pub fn set_volume(&self, volume: f32) {
        self.with_render(|r| {
            r.volume = volume.clamp(0.0, 1.0);
            r.fade.running = false;
        });
    }

    pub fn volume(&self) -> f32 {
        self.with_render(|r| r.volume).unwrap_or(1.0)
    }

    pub fn set_replay_gain(&self, gain: f32) {
        self.with_render(|r| r.replay_gain = gain.max(0.0));
    }

    pub fn replay_gain(&self) -> f32 {
        self.with_render(|r| r.replay_gain).unwrap_or(1.0)
    }

    /// Ramp volume linearly from `from` to `target` over `time_ms`.
    pub fn fade_volume(&self, from: f32, target: f32, time_ms: u32) {
        self.with_render(|r| {
            let from = from.clamp(0.0, 1.0);
            let target = target.clamp(0.0, 1.0);
            let frames = (time_ms as u64 * r.sample_rate as u64 / 1000).max(1);
            if time_ms == 0 || from == target {
                r.volume = target;
                r.fade.running = false;
                return;
            }
            r.volume = from;
            r.fade = Fade {
                target,
                step: (target - from) / frames as f32,
                running: true,
            };
        });
    }

    pub fn is_fading(&self) -> bool {
        self.with_render(|r| r.fade.running).unwrap_or(false)
    }

    /// Buffered bytes in the ring (hardware-side frames).
    fn buffered(&self) -> (usize, usize, u32) {
        self.with_render(|r| (r.consumer.read_size(), r.consumer.capacity(), r.sample_rate))
            .unwrap_or((0, 0, 0))
    }

    fn bytes_to_seconds(&self, bytes: usize, rate: u32) -> f64 {
        let frame_bytes = self
            .with_render(|r| r.frame_bytes)
            .unwrap_or(self.format.frame_size as usize)
            .max(1);
        if rate == 0 {
            0.0
        } else {
            (bytes / frame_bytes) as f64 / rate as f64
        }
    }

    /// Seconds buffered in this stream.
    pub fn cache_time(&self) -> f64 {
        let (used, _, rate) = self.buffered();
        self.bytes_to_seconds(used, rate)
    }

    /// Seconds this stream plus the sink can hold.
    pub fn cache_total(&self) -> f64 {
        let (_, cap, rate) = self.buffered();
        self.bytes_to_seconds(cap, rate) + self.timing.cache_total()
    }

    /// Seconds until data added now becomes audible.
    pub fn delay(&self) -> f64 {
        self.cache_time() + self.timing.delay()
    }

    /// Input bytes `add_data` would take right now without waiting.
    pub fn space(&self) -> usize {
        let chain_slot = self.chain.lock();
        let Some(chain) = chain_slot.as_ref() else {
            return 0;
        };
        let ring_frames = chain.producer.write_size() / chain.ring_frame_bytes.max(1);
        let in_frames = match &chain.resampler {
            // The resampler may emit one frame ahead of the ratio.
            Some(r) => ((ring_frames.saturating_sub(1)) as f64 / r.ratio()) as usize,
            None => ring_frames,
        };
        in_frames.min(self.max_input_frames(chain)) * self.format.frame_size as usize
    }

    /// Stop accepting data and let the ring play out.
    ///
    /// With `wait`, blocks until the ring is empty (bounded by the cache
    /// size plus a second).
    pub fn drain(&self, wait: bool) {
        if !self.transition(StreamState::Valid, StreamState::Draining) {
            return;
        }
        if !wait {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs_f64(self.cache_total() + 1.0);
        while self.state() == StreamState::Draining && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// No drain in progress and nothing left in the ring.
    pub fn is_drained(&self) -> bool {
        self.state() != StreamState::Draining && self.buffered().0 == 0
    }

    /// Drop everything buffered and cancel any fade or drain.
    pub fn flush(&self) {
        let mut chain_slot = self.chain.lock();
        if let Some(r) = chain_slot.as_mut().and_then(|c| c.resampler.as_mut()) {
            r.reset();
        }
        let mut render_slot = self.render.lock();
        if let Some(render) = render_slot.as_mut() {
            render.consumer.clear();
            render.fade.running = false;
        }
        drop(render_slot);
        drop(chain_slot);
        self.transition(StreamState::Draining, StreamState::Valid);
    }

    pub fn pause(&self) -> bool {
        self.transition(StreamState::Valid, StreamState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition(StreamState::Paused, StreamState::Valid)
    }

    pub fn is_paused(&self) -> bool {
        self.state() == StreamState::Paused
    }

    /// Is this stream producing audio right now?
    pub fn is_active(&self) -> bool {
        matches!(self.state(), StreamState::Valid | StreamState::Draining) && self.buffered().0 > 0
    }

    pub fn register_audio_callback(&self, callback: Arc<dyn AudioCallback>) {
        self.with_render(|r| {
            callback.initialize(2, r.sample_rate);
            r.callback = Some(callback);
        });
    }

    pub fn unregister_audio_callback(&self) {
        self.with_render(|r| r.callback = None);
    }

    /// Mark invalid and release the ring. The render side sees silence
    /// from the moment the state changes.
    pub(crate) fn destroy(&self) {
        self.set_state(StreamState::Destroyed);
        let mut render_slot = self.render.lock();
        if let Some(render) = render_slot.as_mut() {
            render.consumer.clear();
            render.callback = None;
        }
        drop(render_slot);
        debug!("stream {} destroyed", self.id);
    }
}

impl GraphSource for Stream {
    fn pull(&self, out: &mut [f32]) -> bool {
        !self.get_frames(out).silent
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rp_format::{StandardLayout, StreamType};
    use std::sync::atomic::AtomicUsize;

    fn stream(format: AudioFormat, hw: &AudioFormat) -> Stream {
        let s = Stream::new(1, format, StreamConfig::default(), Arc::new(SinkTiming::default())).unwrap();
        s.initialize(hw).unwrap();
        s
    }

    fn floats_to_bytes(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
    }

    fn stereo_float(rate: u32) -> AudioFormat {
        AudioFormat::float(rate, ChannelLayout::stereo())
    }

    #[test]
    fn matching_formats_pass_through_untouched() {
        let hw = stereo_float(48000);
        let s = stream(stereo_float(48000), &hw);
        assert_eq!(s.state(), StreamState::Valid);
        assert_eq!(s.chain_info(), ChainInfo::default());

        let input = [0.1f32, -0.2, 0.3, -0.4, 0.5, -0.6];
        let bytes = floats_to_bytes(&input);
        assert_eq!(s.add_data(&bytes), bytes.len());
        let mut out = [0.0f32; 6];
        let status = s.get_frames(&mut out);
        assert_eq!(status.frames, 3);
        assert_eq!(out, input);
    }

    #[test]
    fn converter_and_downmix_for_multichannel_s16() {
        let hw = stereo_float(48000);
        let format = AudioFormat::new(DataFormat::S16LE, 48000, StandardLayout::L5_1.layout());
        let s = stream(format, &hw);
        let info = s.chain_info();
        assert!(info.convert && info.remap);
        assert!(!info.upmix && !info.resample);

        let frame: Vec<u8> = [16384i16; 6].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(s.add_data(&frame), 12);
        let mut out = [0.0f32; 2];
        assert_eq!(s.get_frames(&mut out).frames, 1);
        assert!((out[0] - 0.5).abs() < 1e-5 && (out[1] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn prefix_layout_is_upmixed() {
        let hw = AudioFormat::float(48000, StandardLayout::L5_1.layout());
        let s = stream(stereo_float(48000), &hw);
        let info = s.chain_info();
        assert!(info.upmix && !info.remap);
        s.add_data(&floats_to_bytes(&[0.25, 0.75]));
        let mut out = [9.0f32; 6];
        s.get_frames(&mut out);
        assert_eq!(out, [0.25, 0.75, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn rate_mismatch_resamples() {
        let hw = stereo_float(48000);
        let s = stream(stereo_float(24000), &hw);
        assert!(s.chain_info().resample);
        let input: Vec<f32> = (0..200).flat_map(|i| [i as f32 / 400.0; 2]).collect();
        assert_eq!(s.add_data(&floats_to_bytes(&input)), input.len() * 4);
        let mut out = vec![0.0f32; 2 * 500];
        let frames = s.get_frames(&mut out).frames;
        assert!((397..=400).contains(&frames), "{} frames", frames);
    }

    #[test]
    fn passthrough_bytes_are_untouched() {
        let hw = AudioFormat::raw(StreamType::Ac3, 48000);
        let s = stream(AudioFormat::raw(StreamType::Ac3, 48000), &hw);
        assert!(s.chain_info().passthrough);
        let data: Vec<u8> = (0..64u8).collect();
        assert_eq!(s.add_data(&data), 64);
        let mut out = [0u8; 64];
        assert_eq!(s.get_raw(&mut out).frames, 16);
        assert_eq!(out.to_vec(), data);
        // PCM reads of a passthrough stream are silent.
        assert!(s.get_frames(&mut [0.0; 4]).silent);
    }

    #[test]
    fn raw_stream_needs_raw_output() {
        let s = Stream::new(
            1,
            AudioFormat::raw(StreamType::Ac3, 48000),
            StreamConfig::default(),
            Arc::new(SinkTiming::default()),
        )
        .unwrap();
        assert!(s.initialize(&stereo_float(48000)).is_err());
        assert_eq!(s.state(), StreamState::Uninitialized);
        assert_eq!(s.add_data(&[0; 4]), 0);
    }

    #[test]
    fn backpressure_returns_zero_when_full() {
        let config = StreamConfig {
            buffer_ms: 10,
            add_data_timeout: Duration::from_millis(5),
            normalize: true,
        };
        let s = Stream::new(1, stereo_float(1000), config, Arc::new(SinkTiming::default())).unwrap();
        s.initialize(&stereo_float(1000)).unwrap();
        // Ring holds 10 frames; one call takes at most half of it.
        let chunk = floats_to_bytes(&[0.1; 10]);
        assert_eq!(s.add_data(&chunk), 40);
        assert_eq!(s.add_data(&chunk), 40);
        assert_eq!(s.space(), 0);
        let started = Instant::now();
        assert_eq!(s.add_data(&chunk), 0);
        assert!(started.elapsed() >= Duration::from_millis(5));

        // Data already accepted is still intact.
        let mut out = [0.0f32; 20];
        assert_eq!(s.get_frames(&mut out).frames, 10);
        assert!(out.iter().all(|&x| (x - 0.1).abs() < 1e-7));
    }

    #[test]
    fn paused_stream_fails_fast_and_renders_silence() {
        let config = StreamConfig {
            buffer_ms: 4,
            add_data_timeout: Duration::from_secs(10),
            normalize: true,
        };
        let s = Stream::new(1, stereo_float(1000), config, Arc::new(SinkTiming::default())).unwrap();
        s.initialize(&stereo_float(1000)).unwrap();
        let chunk = floats_to_bytes(&[0.2; 4]);
        assert!(s.pause());
        assert_eq!(s.add_data(&chunk), 16);
        assert_eq!(s.add_data(&chunk), 16);
        let started = Instant::now();
        assert_eq!(s.add_data(&chunk), 0);
        assert!(started.elapsed() < Duration::from_secs(1));

        let mut out = [1.0f32; 4];
        assert!(s.get_frames(&mut out).silent);
        assert_eq!(out, [0.0; 4]);
        assert!(s.resume());
        assert_eq!(s.get_frames(&mut out).frames, 2);
    }

    #[test]
    fn initialize_does_not_wait_for_a_blocked_producer() {
        let config = StreamConfig {
            buffer_ms: 10,
            add_data_timeout: Duration::from_millis(500),
            normalize: true,
        };
        let hw = stereo_float(1000);
        let s = Arc::new(Stream::new(1, stereo_float(1000), config, Arc::new(SinkTiming::default())).unwrap());
        s.initialize(&hw).unwrap();
        // Ten-frame ring, five frames per call.
        let chunk = floats_to_bytes(&[0.2; 10]);
        assert_eq!(s.add_data(&chunk), 40);
        assert_eq!(s.add_data(&chunk), 40);
        assert_eq!(s.space(), 0);

        let producer = {
            let s = s.clone();
            let chunk = chunk.clone();
            std::thread::spawn(move || s.add_data(&chunk))
        };
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        s.initialize(&hw).unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));

        // Make room; the parked producer lands its chunk on the rebuilt chain.
        let mut out = [0.0f32; 10];
        assert_eq!(s.get_frames(&mut out).frames, 5);
        assert_eq!(producer.join().unwrap(), 40);
        let mut out = [0.0f32; 20];
        assert_eq!(s.get_frames(&mut out).frames, 10);
        assert!(out.iter().all(|&x| (x - 0.2).abs() < 1e-6));
    }

    #[test]
    fn fade_to_same_volume_is_a_no_op() {
        let s = stream(stereo_float(48000), &stereo_float(48000));
        s.set_volume(0.5);
        s.fade_volume(0.5, 0.5, 1000);
        assert!(!s.is_fading());
        s.add_data(&floats_to_bytes(&[1.0; 8]));
        let mut out = [0.0f32; 8];
        s.get_frames(&mut out);
        assert!(out.iter().all(|&x| x == 0.5));
    }

    #[test]
    fn fade_ramps_monotonically_and_stops_at_target() {
        let s = stream(stereo_float(1000), &stereo_float(1000));
        s.fade_volume(0.0, 1.0, 10);
        assert!(s.is_fading());
        s.add_data(&floats_to_bytes(&[1.0; 40]));
        let mut out = [0.0f32; 40];
        s.get_frames(&mut out);
        let left: Vec<f32> = out.iter().step_by(2).copied().collect();
        assert!(left.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(left[19], 1.0);
        assert!(left[0] < 0.2);
        assert!(!s.is_fading());
    }

    #[test]
    fn drain_returns_to_valid_when_empty() {
        let s = stream(stereo_float(48000), &stereo_float(48000));
        s.add_data(&floats_to_bytes(&[0.1; 4]));
        s.drain(false);
        assert_eq!(s.state(), StreamState::Draining);
        assert_eq!(s.add_data(&floats_to_bytes(&[0.1; 2])), 0);
        assert!(!s.is_drained());
        let mut out = [0.0f32; 8];
        s.get_frames(&mut out);
        assert_eq!(s.state(), StreamState::Valid);
        assert!(s.is_drained());
    }

    #[test]
    fn flush_discards_buffered_audio() {
        let s = stream(stereo_float(48000), &stereo_float(48000));
        s.add_data(&floats_to_bytes(&[0.1; 64]));
        assert!(s.cache_time() > 0.0);
        s.flush();
        assert_eq!(s.cache_time(), 0.0);
        assert!(s.get_frames(&mut [0.0; 4]).silent);
    }

    #[test]
    fn destroyed_stream_renders_silence() {
        let s = stream(stereo_float(48000), &stereo_float(48000));
        s.add_data(&floats_to_bytes(&[0.9; 16]));
        s.destroy();
        let mut out = [1.0f32; 16];
        let status = s.get_frames(&mut out);
        assert!(status.silent);
        assert!(out.iter().all(|&x| x == 0.0));
        assert_eq!(s.add_data(&floats_to_bytes(&[0.9; 2])), 0);
    }

    #[test]
    fn reinitialize_keeps_ring_when_geometry_unchanged() {
        let hw = stereo_float(48000);
        let s = stream(AudioFormat::new(DataFormat::S16LE, 48000, ChannelLayout::stereo()), &hw);
        s.add_data(&[0u8; 400]);
        let before = s.cache_time();
        let mut hw2 = hw.clone();
        hw2.frames = 512;
        s.initialize(&hw2).unwrap();
        assert_eq!(s.cache_time(), before);

        s.initialize(&AudioFormat::float(44100, ChannelLayout::stereo())).unwrap();
        assert_eq!(s.cache_time(), 0.0);
        assert!(s.chain_info().resample);
    }

    #[test]
    fn delay_includes_sink_delay() {
        let timing = Arc::new(SinkTiming::default());
        let s = Stream::new(1, stereo_float(1000), StreamConfig::default(), timing.clone()).unwrap();
        s.initialize(&stereo_float(1000)).unwrap();
        s.add_data(&floats_to_bytes(&[0.0; 200]));
        timing.set(0.05, 0.2);
        assert!((s.delay() - 0.15).abs() < 1e-9);
        assert!((s.cache_total() - 1.2).abs() < 1e-9);
    }

    struct Counter {
        calls: AtomicUsize,
        max_len: AtomicUsize,
    }

    impl AudioCallback for Counter {
        fn on_audio_data(&self, samples: &[f32]) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.max_len.fetch_max(samples.len(), Ordering::Relaxed);
        }
    }

    #[test]
    fn audio_callback_sees_at_most_512_stereo_samples() {
        let hw = AudioFormat::float(48000, StandardLayout::L5_1.layout());
        let s = stream(AudioFormat::float(48000, StandardLayout::L5_1.layout()), &hw);
        let cb = Arc::new(Counter {
            calls: AtomicUsize::new(0),
            max_len: AtomicUsize::new(0),
        });
        s.register_audio_callback(cb.clone());
        s.add_data(&floats_to_bytes(&vec![0.1; 6 * 1000]));
        let mut out = vec![0.0f32; 6 * 1000];
        s.get_frames(&mut out);
        assert_eq!(cb.calls.load(Ordering::Relaxed), 1);
        assert_eq!(cb.max_len.load(Ordering::Relaxed), VIS_MAX_SAMPLES);

        s.unregister_audio_callback();
        s.add_data(&floats_to_bytes(&vec![0.1; 6]));
        s.get_frames(&mut out[..6]);
        assert_eq!(cb.calls.load(Ordering::Relaxed), 1);
    }
}
