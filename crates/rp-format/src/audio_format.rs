//! The negotiated audio format.

use core::fmt;

use crate::{ChannelLayout, DataFormat, FormatError, StreamType};

/// Sample rate, sample encoding, channel layout and period of a PCM or
/// passthrough link.
///
/// `frame_size` always equals `data_format.bytes_per_sample() *
/// channel_layout.count()`; call [`AudioFormat::update_frame_size`] after
/// mutating either field by hand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub data_format: DataFormat,
    /// PCM: sample rate. RAW: link rate.
    pub sample_rate: u32,
    /// RAW only: rate the compressed stream was encoded at.
    pub encoded_rate: u32,
    pub channel_layout: ChannelLayout,
    /// Bytes per frame
    pub frame_size: u32,
    /// Hardware period size in frames
    pub frames: u32,
    /// RAW only: which codec the link carries.
    pub stream_type: Option<StreamType>,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            data_format: DataFormat::Invalid,
            sample_rate: 0,
            encoded_rate: 0,
            channel_layout: ChannelLayout::new(),
            frame_size: 0,
            frames: 0,
            stream_type: None,
        }
    }
}

impl AudioFormat {
    /// A PCM format with a derived frame size and no period set.
    pub fn new(data_format: DataFormat, sample_rate: u32, channel_layout: ChannelLayout) -> Self {
        let mut format = Self {
            data_format,
            sample_rate,
            channel_layout,
            ..Self::default()
        };
        format.update_frame_size();
        format
    }

    /// Interleaved 32-bit float at `sample_rate` with `channel_layout`.
    pub fn float(sample_rate: u32, channel_layout: ChannelLayout) -> Self {
        Self::new(DataFormat::Float, sample_rate, channel_layout)
    }

    /// The IEC 61937 link format for a compressed stream.
    pub fn raw(stream_type: StreamType, encoded_rate: u32) -> Self {
        let mut format = Self::new(
            DataFormat::Raw,
            stream_type.link_rate(encoded_rate),
            ChannelLayout::raw(stream_type.link_channels()),
        );
        format.encoded_rate = encoded_rate;
        format.stream_type = Some(stream_type);
        format
    }

    /// Recompute `frame_size` from the data format and layout.
    pub fn update_frame_size(&mut self) {
        self.frame_size = (self.data_format.bytes_per_sample() * self.channel_layout.count()) as u32;
    }

    pub fn channel_count(&self) -> usize {
        self.channel_layout.count()
    }

    pub fn is_raw(&self) -> bool {
        self.data_format.is_raw()
    }

    pub fn bytes_per_second(&self) -> usize {
        self.frame_size as usize * self.sample_rate as usize
    }

    pub fn frames_to_bytes(&self, frames: usize) -> usize {
        frames * self.frame_size as usize
    }

    pub fn bytes_to_frames(&self, bytes: usize) -> usize {
        if self.frame_size == 0 {
            0
        } else {
            bytes / self.frame_size as usize
        }
    }

    /// Duration of `frames` frames in seconds.
    pub fn frames_to_seconds(&self, frames: usize) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            frames as f64 / self.sample_rate as f64
        }
    }

    /// Check the structural invariants of a fully specified format.
    pub fn validate(&self) -> Result<(), FormatError> {
        if !self.data_format.is_valid() {
            return Err(FormatError::InvalidFormat("data format is invalid"));
        }
        if self.sample_rate == 0 {
            return Err(FormatError::InvalidFormat("sample rate is zero"));
        }
        if self.channel_layout.is_empty() {
            return Err(FormatError::InvalidFormat("channel layout is empty"));
        }
        if self.is_raw() && self.stream_type.is_none() {
            return Err(FormatError::InvalidFormat("raw format without stream type"));
        }
        let expected = self.data_format.bytes_per_sample() * self.channel_layout.count();
        if self.frame_size as usize != expected {
            return Err(FormatError::InvalidFormat("frame size does not match layout"));
        }
        Ok(())
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}Hz [{}] frame={}B period={}",
            self.data_format, self.sample_rate, self.channel_layout, self.frame_size, self.frames
        )?;
        if let Some(st) = self.stream_type {
            write!(f, " stream={}@{}Hz", st, self.encoded_rate)?;
        }
        Ok(())
    }
}
