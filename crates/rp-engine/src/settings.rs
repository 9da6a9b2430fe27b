//! Engine configuration.

use rp_format::StreamType;
use serde::{Deserialize, Serialize};

/// How the engine picks the hardware sample rate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleRateMode {
    /// Follow the most recently created stream.
    #[default]
    Variable,
    /// Always request this rate; streams are resampled to it.
    Fixed(u32),
}

/// Which compressed formats may be sent to the device undecoded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthroughSettings {
    pub enabled: bool,
    pub ac3: bool,
    pub eac3: bool,
    pub dts: bool,
    pub dtshd: bool,
    pub truehd: bool,
    pub transcode_ac3: bool,
}

impl PassthroughSettings {
    /// Whether `stream_type` may be passed through.
    pub fn allows(&self, stream_type: StreamType) -> bool {
        if !self.enabled {
            return false;
        }
        match stream_type {
            StreamType::Ac3 => self.ac3 || self.transcode_ac3,
            StreamType::Eac3 => self.eac3,
            StreamType::DtsCore | StreamType::Dts512 | StreamType::Dts1024 | StreamType::Dts2048 => self.dts,
            StreamType::DtsHd | StreamType::DtsHdMa => self.dtshd,
            StreamType::TrueHd => self.truehd,
        }
    }
}

/// Everything the engine reads from the outside world.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// `"<driver>:<device>|<display>"` or a bare device name
    pub device: String,
    /// Maximum speaker count to open
    pub channels: usize,
    pub sample_rate_mode: SampleRateMode,
    pub passthrough: PassthroughSettings,
    /// Idle time before the device is released
    pub suspend_delay_ms: u64,
    /// Per-stream ring size
    pub stream_buffer_ms: u32,
    /// Longest `add_data` waits for ring space
    pub add_data_timeout_ms: u64,
    /// Requested hardware period
    pub period_ms: u32,
    /// Scale downmix rows so they cannot clip
    pub normalize_downmix: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            device: "default".into(),
            channels: 2,
            sample_rate_mode: SampleRateMode::Variable,
            passthrough: PassthroughSettings::default(),
            suspend_delay_ms: 10_000,
            stream_buffer_ms: 1000,
            add_data_timeout_ms: 100,
            period_ms: 20,
            normalize_downmix: true,
        }
    }
}
