//! Null output: accepts everything, plays nothing.
//!
//! In realtime mode the sink keeps a virtual hardware clock and sleeps
//! like a device with a fixed buffer would, so the engine's pacing
//! behaves the same as with real hardware. Offline mode never sleeps.
//! A [`NullControl`] handle lets tests inspect what was written and
//! script device behavior (dirty flag, supported rates, open failures).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rp_format::{AudioFormat, ChannelLayout, DataFormat, DeviceInfo, DeviceType, StreamType};
use tracing::{debug, info};

use crate::error::{SinkError, SinkResult};
use crate::traits::{Sink, SinkDriver};

/// Virtual hardware buffer in seconds.
const NULL_BUFFER_SECONDS: f64 = 0.1;
/// Period used when the request leaves it unset.
const DEFAULT_PERIOD_MS: u32 = 20;

#[derive(Debug, Default)]
struct ControlState {
    capture: bool,
    captured: Vec<u8>,
    frames_written: u64,
    dirty: bool,
    open_count: usize,
    open_sinks: usize,
    last_format: Option<AudioFormat>,
    last_device: Option<String>,
    supported_rates: Option<Vec<u32>>,
    fail_open: bool,
}

/// Shared inspection/scripting handle for null sinks created by one driver.
#[derive(Clone, Debug, Default)]
pub struct NullControl {
    state: Arc<Mutex<ControlState>>,
}

impl NullControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a copy of every byte accepted by `add_packets`.
    pub fn set_capture(&self, capture: bool) {
        self.state.lock().capture = capture;
    }

    /// Take the captured bytes, leaving the capture buffer empty.
    pub fn take_captured(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().captured)
    }

    pub fn frames_written(&self) -> u64 {
        self.state.lock().frames_written
    }

    /// Pretend the device was unplugged or reconfigured.
    pub fn set_dirty(&self, dirty: bool) {
        self.state.lock().dirty = dirty;
    }

    /// Restrict the rates the device accepts; others negotiate to the closest.
    pub fn set_supported_rates(&self, rates: Option<Vec<u32>>) {
        self.state.lock().supported_rates = rates;
    }

    /// Make every following `initialize` fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Number of successful `initialize` calls so far.
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// Sinks currently initialized.
    pub fn open_sinks(&self) -> usize {
        self.state.lock().open_sinks
    }

    pub fn last_format(&self) -> Option<AudioFormat> {
        self.state.lock().last_format.clone()
    }

    pub fn last_device(&self) -> Option<String> {
        self.state.lock().last_device.clone()
    }
}

/// Sink with no hardware behind it.
pub struct NullSink {
    control: NullControl,
    realtime: bool,
    format: Option<AudioFormat>,
    /// Clock origin and frames accepted since then
    clock: Option<(Instant, u64)>,
}

impl NullSink {
    pub fn new(control: NullControl, realtime: bool) -> Self {
        Self {
            control,
            realtime,
            format: None,
            clock: None,
        }
    }

    /// Frames accepted but not yet "played" by the virtual clock.
    fn buffered_frames(&self) -> f64 {
        let (Some(format), Some((start, written))) = (&self.format, self.clock) else {
            return 0.0;
        };
        if !self.realtime {
            return 0.0;
        }
        let played = start.elapsed().as_secs_f64() * format.sample_rate as f64;
        (written as f64 - played).max(0.0)
    }
}

impl Sink for NullSink {
    fn driver(&self) -> &'static str {
        NullDriver::NAME
    }

    fn initialize(&mut self, format: &mut AudioFormat, device: &mut String) -> SinkResult<()> {
        if self.format.is_some() {
            return Err(SinkError::AlreadyInitialized);
        }
        let mut state = self.control.state.lock();
        if state.fail_open {
            return Err(SinkError::DeviceInit("null device scripted to fail".into()));
        }

        if format.channel_layout.is_empty() {
            format.channel_layout = ChannelLayout::stereo();
        }
        if !format.data_format.is_valid() {
            format.data_format = DataFormat::Float;
        }
        if format.sample_rate == 0 {
            format.sample_rate = 48000;
        }
        if let Some(rates) = &state.supported_rates {
            if !rates.contains(&format.sample_rate) {
                let info = DeviceInfo {
                    sample_rates: rates.clone(),
                    ..DeviceInfo::default()
                };
                if let Some(rate) = info.closest_rate(format.sample_rate) {
                    debug!("null sink: {} Hz unsupported, using {} Hz", format.sample_rate, rate);
                    format.sample_rate = rate;
                }
            }
        }
        if format.frames == 0 {
            format.frames = format.sample_rate * DEFAULT_PERIOD_MS / 1000;
        }
        format.update_frame_size();
        if device.is_empty() {
            *device = "default".into();
        }

        state.open_count += 1;
        state.open_sinks += 1;
        state.dirty = false;
        state.last_format = Some(format.clone());
        state.last_device = Some(device.clone());
        drop(state);

        info!("null sink opened: {}", format);
        self.format = Some(format.clone());
        self.clock = None;
        Ok(())
    }

    fn deinitialize(&mut self) {
        if self.format.take().is_some() {
            let mut state = self.control.state.lock();
            state.open_sinks = state.open_sinks.saturating_sub(1);
            debug!("null sink closed");
        }
        self.clock = None;
    }

    fn add_packets(&mut self, data: &[u8], frames: usize, offset: usize) -> SinkResult<usize> {
        let Some(format) = &self.format else {
            return Err(SinkError::NotInitialized);
        };
        if self.control.state.lock().dirty {
            return Err(SinkError::Invalidated);
        }
        let frame_size = format.frame_size as usize;
        let start = offset * frame_size;
        let end = (start + frames * frame_size).min(data.len());
        let frames = (end.saturating_sub(start)) / frame_size.max(1);
        let rate = format.sample_rate as f64;

        if self.realtime {
            let capacity = NULL_BUFFER_SECONDS * rate;
            let excess = self.buffered_frames() + frames as f64 - capacity;
            if excess > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(excess / rate));
            }
        }

        {
            let mut state = self.control.state.lock();
            state.frames_written += frames as u64;
            if state.capture {
                state.captured.extend_from_slice(&data[start..start + frames * frame_size]);
            }
        }
        match &mut self.clock {
            Some((_, written)) => *written += frames as u64,
            None => self.clock = Some((Instant::now(), frames as u64)),
        }
        Ok(frames)
    }

    fn delay(&self) -> f64 {
        match &self.format {
            Some(format) if format.sample_rate > 0 => self.buffered_frames() / format.sample_rate as f64,
            _ => 0.0,
        }
    }

    fn cache_total(&self) -> f64 {
        if self.format.is_some() {
            NULL_BUFFER_SECONDS
        } else {
            0.0
        }
    }

    fn drain(&mut self) {
        let delay = self.delay();
        if delay > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(delay));
        }
        self.clock = None;
    }

    fn is_dirty(&self) -> bool {
        self.format.is_some() && self.control.state.lock().dirty
    }
}

impl Drop for NullSink {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

/// Driver for [`NullSink`].
#[derive(Clone, Debug)]
pub struct NullDriver {
    control: NullControl,
    realtime: bool,
}

impl NullDriver {
    pub const NAME: &'static str = "NULL";

    /// Null driver that paces like hardware.
    pub fn realtime() -> Self {
        Self {
            control: NullControl::new(),
            realtime: true,
        }
    }

    /// Null driver that never sleeps (offline rendering, tests).
    pub fn offline() -> Self {
        Self {
            control: NullControl::new(),
            realtime: false,
        }
    }

    /// Offline null driver sharing `control` with the caller.
    pub fn with_control(control: NullControl) -> Self {
        Self {
            control,
            realtime: false,
        }
    }

    pub fn control(&self) -> &NullControl {
        &self.control
    }
}

impl SinkDriver for NullDriver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn create(&self) -> Box<dyn Sink> {
        Box::new(NullSink::new(self.control.clone(), self.realtime))
    }

    fn enumerate_devices(&self, _force: bool) -> Vec<DeviceInfo> {
        let rates = self
            .control
            .state
            .lock()
            .supported_rates
            .clone()
            .unwrap_or_else(|| vec![44100, 48000, 88200, 96000, 192000]);
        vec![DeviceInfo {
            device_name: "default".into(),
            display_name: "Null output".into(),
            display_name_extra: String::new(),
            device_type: DeviceType::Pcm,
            channels: rp_format::StandardLayout::L7_1.layout(),
            sample_rates: rates,
            data_formats: rp_format::DataFormat::PCM.to_vec(),
            stream_types: StreamType::ALL.to_vec(),
            wants_iec_passthrough: false,
        }]
    }
}
