//! CPAL-based sink.
//!
//! cpal drives output from its own callback thread, so `add_packets`
//! pushes whole frames into an SPSC byte ring that the callback drains.
//! The native stream handle is not `Send` on every host; it lives on a
//! small owner thread for the lifetime of the sink.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, StreamConfig, StreamError, SupportedBufferSize};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use rp_format::{AudioFormat, ChannelLayout, DataFormat, DeviceInfo, DeviceType, StreamType};
use tracing::{debug, error, info, warn};

use crate::error::{SinkError, SinkResult};
use crate::negotiate::{
    negotiate_period, resolve_channel_map, search_exclusive, BufferRequest, Candidate, FormatProbe, Probe,
    PeriodStep, RangeHwParams, SEARCH_RATES,
};
use crate::traits::{Sink, SinkDriver};

/// Requested period when the format leaves it unset.
const DEFAULT_PERIOD_MS: u32 = 20;
/// Periods held by the ring between `add_packets` and the callback.
const RING_PERIODS: u32 = 4;

fn sample_format_for(format: DataFormat) -> Option<SampleFormat> {
    match format {
        DataFormat::U8 => Some(SampleFormat::U8),
        DataFormat::S8 => Some(SampleFormat::I8),
        DataFormat::S16NE | DataFormat::Raw => Some(SampleFormat::I16),
        DataFormat::S32NE => Some(SampleFormat::I32),
        DataFormat::Float => Some(SampleFormat::F32),
        DataFormat::Double => Some(SampleFormat::F64),
        _ => None,
    }
}

fn data_format_for(format: SampleFormat) -> Option<DataFormat> {
    match format {
        SampleFormat::U8 => Some(DataFormat::U8),
        SampleFormat::I8 => Some(DataFormat::S8),
        SampleFormat::I16 => Some(DataFormat::S16NE),
        SampleFormat::I32 => Some(DataFormat::S32NE),
        SampleFormat::F32 => Some(DataFormat::Float),
        SampleFormat::F64 => Some(DataFormat::Double),
        _ => None,
    }
}

/// Guess the physical link from the device name.
fn device_type_for(name: &str) -> DeviceType {
    let lower = name.to_ascii_lowercase();
    if lower.contains("hdmi") {
        DeviceType::Hdmi
    } else if lower.contains("displayport") {
        DeviceType::DisplayPort
    } else if lower.contains("iec958") || lower.contains("spdif") || lower.contains("s/pdif") {
        DeviceType::Iec958
    } else {
        DeviceType::Pcm
    }
}

fn layout_for(channels: usize) -> ChannelLayout {
    if cfg!(target_os = "linux") {
        resolve_channel_map(None, channels)
    } else {
        ChannelLayout::default_for_count(channels)
    }
}

/// One supported config range, flattened.
#[derive(Clone, Copy, Debug)]
struct ConfigRange {
    channels: u16,
    min_rate: u32,
    max_rate: u32,
    sample_format: SampleFormat,
    buffer: Option<(u32, u32)>,
}

fn config_ranges(device: &Device) -> SinkResult<Vec<ConfigRange>> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| SinkError::DeviceInit(e.to_string()))?;
    Ok(configs
        .map(|c| ConfigRange {
            channels: c.channels(),
            min_rate: c.min_sample_rate().0,
            max_rate: c.max_sample_rate().0,
            sample_format: c.sample_format(),
            buffer: match c.buffer_size() {
                SupportedBufferSize::Range { min, max } => Some((*min, *max)),
                SupportedBufferSize::Unknown => None,
            },
        })
        .collect())
}

struct CpalProbe<'a> {
    ranges: &'a [ConfigRange],
}

impl FormatProbe for CpalProbe<'_> {
    fn probe(&self, candidate: &Candidate) -> Probe {
        let Some(wanted) = sample_format_for(candidate.data_format) else {
            return Probe::Unsupported;
        };
        let hit = self.ranges.iter().any(|r| {
            r.channels as usize == candidate.layout.count()
                && r.sample_format == wanted
                && (r.min_rate..=r.max_rate).contains(&candidate.sample_rate)
        });
        if hit {
            Probe::Supported
        } else {
            Probe::Unsupported
        }
    }
}

fn find_device(host: &cpal::Host, name: &str) -> SinkResult<Device> {
    if name.is_empty() || name == "default" {
        return host.default_output_device().ok_or(SinkError::NoDevice);
    }
    let devices = host
        .output_devices()
        .map_err(|e| SinkError::DeviceInit(e.to_string()))?;
    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(SinkError::DeviceNotFound(name.to_string()))
}

/// Counters shared with the callback thread.
#[derive(Debug, Default)]
struct Shared {
    dirty: AtomicBool,
    underruns: AtomicU64,
    frames_played: AtomicU64,
}

struct Running {
    producer: HeapProd<u8>,
    format: AudioFormat,
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
    last_underrun_log: Instant,
    logged_underruns: u64,
}

/// Sink backed by the host's default cpal audio API.
pub struct CpalSink {
    shared: Arc<Shared>,
    running: Option<Running>,
}

impl CpalSink {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            running: None,
        }
    }

    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    fn log_underruns(running: &mut Running, shared: &Shared) {
        let total = shared.underruns.load(Ordering::Relaxed);
        if total > running.logged_underruns && running.last_underrun_log.elapsed() >= Duration::from_secs(1) {
            warn!("cpal sink underrun ({} since last report)", total - running.logged_underruns);
            running.logged_underruns = total;
            running.last_underrun_log = Instant::now();
        }
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for CpalSink {
    fn driver(&self) -> &'static str {
        CpalDriver::NAME
    }

    fn initialize(&mut self, format: &mut AudioFormat, device: &mut String) -> SinkResult<()> {
        if self.running.is_some() {
            return Err(SinkError::AlreadyInitialized);
        }
        let host = cpal::default_host();
        let native = find_device(&host, device)?;
        let ranges = config_ranges(&native)?;

        let candidate = search_exclusive(format, &CpalProbe { ranges: &ranges })?;
        candidate.apply_to(format);
        if !format.is_raw() {
            format.channel_layout = layout_for(format.channel_count());
        }
        format.update_frame_size();

        let sample_format = sample_format_for(format.data_format)
            .ok_or_else(|| SinkError::unsupported(format))?;
        let buffer_range = ranges
            .iter()
            .find(|r| {
                r.channels as usize == format.channel_count()
                    && r.sample_format == sample_format
                    && (r.min_rate..=r.max_rate).contains(&format.sample_rate)
            })
            .and_then(|r| r.buffer);

        let wanted_period = if format.frames > 0 {
            format.frames
        } else {
            format.sample_rate * DEFAULT_PERIOD_MS / 1000
        };
        let mut hw = RangeHwParams {
            period_range: buffer_range,
            buffer_range: None,
            default: BufferRequest::with_periods(wanted_period, RING_PERIODS),
        };
        let (step, accepted) =
            negotiate_period(&mut hw, BufferRequest::with_periods(wanted_period, RING_PERIODS))?;
        format.frames = accepted.period_frames;

        let config = StreamConfig {
            channels: format.channel_count() as u16,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: match step {
                PeriodStep::HardwareDefault => BufferSize::Default,
                _ => BufferSize::Fixed(accepted.period_frames),
            },
        };

        let ring_frames = (accepted.period_frames * RING_PERIODS).max(format.sample_rate / 10);
        let ring = HeapRb::<u8>::new(format.frames_to_bytes(ring_frames as usize));
        let (producer, consumer) = ring.split();

        let device_name = native.name().unwrap_or_else(|_| device.clone());
        drop(native);

        self.shared = Arc::new(Shared::default());
        let (ready_tx, ready_rx) = bounded::<SinkResult<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let shared = self.shared.clone();
        let thread_device = device.clone();
        let frame_size = format.frame_size as usize;
        let silence = if format.data_format == DataFormat::U8 { 0x80 } else { 0 };

        let thread = std::thread::Builder::new()
            .name("rp-cpal-output".into())
            .spawn(move || {
                let host = cpal::default_host();
                let native = match find_device(&host, &thread_device) {
                    Ok(d) => d,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let stream = match build_stream(&native, &config, sample_format, consumer, shared, frame_size, silence) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(SinkError::Playback(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| SinkError::StreamCreate(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                error!("cpal sink failed to start {}: {}", device_name, e);
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(SinkError::StreamCreate("output thread exited".into()));
            }
        }

        info!("cpal sink opened {} as {} ({:?})", device_name, format, step);
        *device = device_name;
        self.running = Some(Running {
            producer,
            format: format.clone(),
            stop: stop_tx,
            thread: Some(thread),
            last_underrun_log: Instant::now(),
            logged_underruns: 0,
        });
        Ok(())
    }

    fn deinitialize(&mut self) {
        if let Some(mut running) = self.running.take() {
            let _ = running.stop.send(());
            if let Some(handle) = running.thread.take() {
                let _ = handle.join();
            }
            debug!("cpal sink closed");
        }
    }

    fn add_packets(&mut self, data: &[u8], frames: usize, offset: usize) -> SinkResult<usize> {
        let shared = self.shared.clone();
        let running = self.running.as_mut().ok_or(SinkError::NotInitialized)?;
        let frame_size = running.format.frame_size as usize;
        let rate = running.format.sample_rate.max(1);
        let start = offset * frame_size;
        let end = (start + frames * frame_size).min(data.len());
        let mut pending = &data[start.min(end)..end];
        let total_frames = pending.len() / frame_size.max(1);
        pending = &pending[..total_frames * frame_size];

        let period = Duration::from_secs_f64(running.format.frames.max(1) as f64 / rate as f64);
        let capacity_secs = running.producer.capacity().get() as f64 / (frame_size * rate as usize) as f64;
        let deadline = Instant::now() + Duration::from_secs_f64(capacity_secs) + period * 2;

        let mut accepted = 0;
        while !pending.is_empty() {
            if shared.dirty.load(Ordering::Relaxed) {
                return Err(SinkError::Invalidated);
            }
            let room = (running.producer.vacant_len() / frame_size) * frame_size;
            let n = room.min(pending.len());
            if n > 0 {
                let pushed = running.producer.push_slice(&pending[..n]);
                accepted += pushed / frame_size;
                pending = &pending[pushed..];
                continue;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(period / 4);
        }
        Self::log_underruns(running, &shared);

        if accepted == 0 && total_frames > 0 {
            return Err(SinkError::Timeout);
        }
        Ok(accepted)
    }

    fn delay(&self) -> f64 {
        match &self.running {
            Some(r) => {
                let bps = r.format.bytes_per_second().max(1) as f64;
                r.producer.occupied_len() as f64 / bps + r.format.frames_to_seconds(r.format.frames as usize)
            }
            None => 0.0,
        }
    }

    fn cache_total(&self) -> f64 {
        match &self.running {
            Some(r) => {
                let bps = r.format.bytes_per_second().max(1) as f64;
                r.producer.capacity().get() as f64 / bps + r.format.frames_to_seconds(r.format.frames as usize)
            }
            None => 0.0,
        }
    }

    fn drain(&mut self) {
        let Some(running) = &self.running else {
            return;
        };
        let deadline = Instant::now() + Duration::from_secs_f64(self.cache_total() + 0.5);
        while running.producer.occupied_len() > 0 && Instant::now() < deadline {
            if self.shared.dirty.load(Ordering::Relaxed) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let period = running.format.frames_to_seconds(running.format.frames as usize);
        std::thread::sleep(Duration::from_secs_f64(period));
    }

    fn is_dirty(&self) -> bool {
        self.shared.dirty.load(Ordering::Relaxed)
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    mut consumer: HeapCons<u8>,
    shared: Arc<Shared>,
    frame_size: usize,
    silence: u8,
) -> SinkResult<cpal::Stream> {
    let cb_shared = shared.clone();
    device
        .build_output_stream_raw(
            config,
            sample_format,
            move |data: &mut cpal::Data, _: &cpal::OutputCallbackInfo| {
                let out = data.bytes_mut();
                let available = (consumer.occupied_len() / frame_size) * frame_size;
                let n = available.min((out.len() / frame_size) * frame_size);
                let popped = consumer.pop_slice(&mut out[..n]);
                if popped < out.len() {
                    out[popped..].fill(silence);
                    if popped > 0 || cb_shared.frames_played.load(Ordering::Relaxed) > 0 {
                        cb_shared.underruns.fetch_add(1, Ordering::Relaxed);
                    }
                }
                cb_shared
                    .frames_played
                    .fetch_add((popped / frame_size) as u64, Ordering::Relaxed);
            },
            move |err| match err {
                StreamError::DeviceNotAvailable => {
                    warn!("cpal device no longer available");
                    shared.dirty.store(true, Ordering::Relaxed);
                }
                other => warn!("cpal stream error: {}", other),
            },
            None,
        )
        .map_err(|e| SinkError::StreamCreate(e.to_string()))
}

/// Driver for [`CpalSink`] on the default cpal host.
pub struct CpalDriver {
    cache: Mutex<Option<Vec<DeviceInfo>>>,
}

impl CpalDriver {
    pub const NAME: &'static str = "CPAL";

    pub fn new() -> Self {
        Self {
            cache: Mutex::new(None),
        }
    }
}

impl Default for CpalDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn device_info(device: &Device) -> Option<DeviceInfo> {
    let name = device.name().ok()?;
    let ranges = match config_ranges(device) {
        Ok(r) => r,
        Err(e) => {
            debug!("skipping {}: {}", name, e);
            return None;
        }
    };
    let max_channels = ranges.iter().map(|r| r.channels as usize).max()?;

    let mut sample_rates: Vec<u32> = SEARCH_RATES
        .iter()
        .copied()
        .filter(|rate| ranges.iter().any(|r| (r.min_rate..=r.max_rate).contains(rate)))
        .collect();
    sample_rates.sort_unstable();

    let mut data_formats: Vec<DataFormat> = Vec::new();
    for r in &ranges {
        if let Some(f) = data_format_for(r.sample_format) {
            if !data_formats.contains(&f) {
                data_formats.push(f);
            }
        }
    }

    let device_type = device_type_for(&name);
    let stream_types = match device_type {
        DeviceType::Pcm => Vec::new(),
        DeviceType::Iec958 => vec![
            StreamType::Ac3,
            StreamType::DtsCore,
            StreamType::Dts512,
            StreamType::Dts1024,
            StreamType::Dts2048,
        ],
        DeviceType::Hdmi | DeviceType::DisplayPort => StreamType::ALL.to_vec(),
    };

    Some(DeviceInfo {
        device_name: name.clone(),
        display_name: name,
        display_name_extra: String::new(),
        device_type,
        channels: layout_for(max_channels),
        sample_rates,
        data_formats,
        wants_iec_passthrough: device_type.is_digital(),
        stream_types,
    })
}

impl SinkDriver for CpalDriver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn create(&self) -> Box<dyn Sink> {
        Box::new(CpalSink::new())
    }

    fn enumerate_devices(&self, force: bool) -> Vec<DeviceInfo> {
        let mut cache = self.cache.lock();
        if !force {
            if let Some(list) = cache.as_ref() {
                return list.clone();
            }
        }
        let host = cpal::default_host();
        let list: Vec<DeviceInfo> = match host.output_devices() {
            Ok(devices) => devices.filter_map(|d| device_info(&d)).collect(),
            Err(e) => {
                warn!("cpal device enumeration failed: {}", e);
                Vec::new()
            }
        };
        debug!("cpal enumerated {} output devices", list.len());
        *cache = Some(list.clone());
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(channels: u16, min: u32, max: u32, fmt: SampleFormat) -> ConfigRange {
        ConfigRange {
            channels,
            min_rate: min,
            max_rate: max,
            sample_format: fmt,
            buffer: Some((64, 4096)),
        }
    }

    #[test]
    fn sample_format_mapping_round_trips() {
        for fmt in [
            DataFormat::U8,
            DataFormat::S8,
            DataFormat::S16NE,
            DataFormat::S32NE,
            DataFormat::Float,
            DataFormat::Double,
        ] {
            let sf = sample_format_for(fmt).unwrap();
            assert_eq!(data_format_for(sf), Some(fmt));
        }
        assert_eq!(sample_format_for(DataFormat::Raw), Some(SampleFormat::I16));
        assert_eq!(sample_format_for(DataFormat::S24NE3), None);
    }

    #[test]
    fn probe_matches_channels_format_and_rate_range() {
        let ranges = [range(2, 44100, 96000, SampleFormat::F32)];
        let probe = CpalProbe { ranges: &ranges };
        let ok = Candidate {
            layout: ChannelLayout::stereo(),
            data_format: DataFormat::Float,
            sample_rate: 48000,
        };
        assert_eq!(probe.probe(&ok), Probe::Supported);
        let bad_rate = Candidate {
            sample_rate: 192000,
            ..ok.clone()
        };
        assert_eq!(probe.probe(&bad_rate), Probe::Unsupported);
        let bad_fmt = Candidate {
            data_format: DataFormat::S24NE3,
            ..ok
        };
        assert_eq!(probe.probe(&bad_fmt), Probe::Unsupported);
    }

    #[test]
    fn search_over_cpal_ranges_downgrades_format() {
        let ranges = [range(2, 8000, 48000, SampleFormat::I16)];
        let probe = CpalProbe { ranges: &ranges };
        let req = AudioFormat::float(48000, ChannelLayout::stereo());
        let c = search_exclusive(&req, &probe).unwrap();
        assert_eq!(c.data_format, DataFormat::S16NE);
        assert_eq!(c.sample_rate, 48000);
    }

    #[test]
    fn device_type_from_name() {
        assert_eq!(device_type_for("hdmi:CARD=PCH,DEV=0"), DeviceType::Hdmi);
        assert_eq!(device_type_for("iec958:CARD=Intel"), DeviceType::Iec958);
        assert_eq!(device_type_for("Speakers (Realtek)"), DeviceType::Pcm);
    }
}
