//! Device capability descriptors and device-string parsing.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::{ChannelLayout, DataFormat, FormatError, StreamType};

/// Physical link type of an output device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Analog or generic PCM output
    #[default]
    Pcm,
    /// S/PDIF (optical or coaxial)
    Iec958,
    Hdmi,
    DisplayPort,
}

impl DeviceType {
    /// Whether the link can carry IEC 61937 bitstreams at all.
    pub const fn is_digital(self) -> bool {
        !matches!(self, DeviceType::Pcm)
    }

    pub const fn name(self) -> &'static str {
        match self {
            DeviceType::Pcm => "PCM",
            DeviceType::Iec958 => "IEC958",
            DeviceType::Hdmi => "HDMI",
            DeviceType::DisplayPort => "DisplayPort",
        }
    }
}

/// Capabilities of one selectable output, built once per enumeration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Name handed to the native API
    pub device_name: String,
    pub display_name: String,
    pub display_name_extra: String,
    pub device_type: DeviceType,
    pub channels: ChannelLayout,
    pub sample_rates: Vec<u32>,
    pub data_formats: Vec<DataFormat>,
    pub stream_types: Vec<StreamType>,
    /// The device expects the engine to perform IEC 61937 encapsulation.
    pub wants_iec_passthrough: bool,
}

impl DeviceInfo {
    pub fn supports_rate(&self, rate: u32) -> bool {
        self.sample_rates.contains(&rate)
    }

    pub fn supports_format(&self, format: DataFormat) -> bool {
        self.data_formats.contains(&format)
    }

    pub fn supports_stream(&self, stream_type: StreamType) -> bool {
        self.stream_types.contains(&stream_type)
    }

    /// The supported rate closest to `rate` (ties go to the higher rate).
    pub fn closest_rate(&self, rate: u32) -> Option<u32> {
        self.sample_rates
            .iter()
            .copied()
            .min_by_key(|&r| ((r as i64 - rate as i64).abs(), core::cmp::Reverse(r)))
    }

    /// `"<driver>:<device>|<display>"` string selecting this device.
    pub fn device_string(&self, driver: &str) -> String {
        let mut s = String::new();
        s.push_str(driver);
        s.push(':');
        s.push_str(&self.device_name);
        s.push('|');
        s.push_str(&self.display_name);
        s
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device: {}", self.device_name)?;
        writeln!(f, "  display name: {}", self.display_name)?;
        if !self.display_name_extra.is_empty() {
            writeln!(f, "  extra:        {}", self.display_name_extra)?;
        }
        writeln!(f, "  type:         {}", self.device_type.name())?;
        writeln!(f, "  channels:     {}", self.channels)?;
        write!(f, "  rates:       ")?;
        for rate in &self.sample_rates {
            write!(f, " {}", rate)?;
        }
        writeln!(f)?;
        write!(f, "  formats:     ")?;
        for format in &self.data_formats {
            write!(f, " {}", format)?;
        }
        writeln!(f)?;
        if !self.stream_types.is_empty() {
            write!(f, "  passthrough: ")?;
            for st in &self.stream_types {
                write!(f, " {}", st)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// A parsed `"<driver>:<device>|<display>"` string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceString<'a> {
    /// Leading alphanumeric token before the first `:`, if any
    pub driver: Option<&'a str>,
    /// Device name passed to the native API
    pub device: &'a str,
    /// Friendly name after `|`, if any
    pub display: Option<&'a str>,
}

impl<'a> DeviceString<'a> {
    pub fn parse(s: &'a str) -> Result<Self, FormatError> {
        let (head, display) = match s.split_once('|') {
            Some((head, display)) => (head, Some(display)),
            None => (s, None),
        };
        let (driver, device) = match head.split_once(':') {
            Some((prefix, rest))
                if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                (Some(prefix), rest)
            }
            _ => (None, head),
        };
        if device.is_empty() && driver.is_none() {
            return Err(FormatError::MalformedDevice(s.into()));
        }
        Ok(Self {
            driver,
            device,
            display,
        })
    }

    /// Device name with the prefix removed only when it names `driver`.
    ///
    /// Device names such as `hdmi:CARD=PCH` contain a colon themselves, so
    /// the prefix is only stripped when it matches the backend asking.
    pub fn device_for(&self, driver: &str, original: &'a str) -> &'a str {
        match self.driver {
            Some(d) if d.eq_ignore_ascii_case(driver) => self.device,
            _ => original.split('|').next().unwrap_or(original),
        }
    }
}

/// Split a device string into `(driver, device, display)`.
pub fn split_device_string(s: &str) -> Result<(Option<&str>, &str, Option<&str>), FormatError> {
    let parsed = DeviceString::parse(s)?;
    Ok((parsed.driver, parsed.device, parsed.display))
}
