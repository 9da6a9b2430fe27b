//! Core format types for renderpipe.
//!
//! This crate defines the vocabulary shared by the sink layer and the
//! engine: sample data formats, ordered channel layouts, the negotiated
//! `AudioFormat`, compressed passthrough stream types and the device
//! capability descriptors produced by enumeration, plus a small WAV
//! reader/writer used for sound effects and file playback.
//!
//! Designed to be `no_std` compatible with the `alloc` crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod audio_format;
mod channel;
mod data_format;
mod device;
mod stream_type;
mod wav;

pub use audio_format::AudioFormat;
pub use channel::{Channel, ChannelLayout, StandardLayout, MAX_CHANNELS};
pub use data_format::DataFormat;
pub use device::{split_device_string, DeviceInfo, DeviceString, DeviceType};
pub use stream_type::StreamType;
#[cfg(feature = "std")]
pub use wav::write_wav;
pub use wav::{load_wav, WavData};

/// Error type for format and device-string handling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// Too many channels for a layout
    #[error("channel layout overflow (max {MAX_CHANNELS} channels)")]
    LayoutOverflow,
    /// Unknown channel or format name
    #[error("unknown name: {0}")]
    UnknownName(alloc::string::String),
    /// Device string could not be parsed
    #[error("malformed device string: {0}")]
    MalformedDevice(alloc::string::String),
    /// Format fields are inconsistent
    #[error("invalid audio format: {0}")]
    InvalidFormat(&'static str),
    /// File ended before a complete header
    #[error("unexpected end of data")]
    UnexpectedEof,
    /// Container header is malformed
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
    /// WAV format tag / bit depth pair has no sample format
    #[error("unsupported encoding (format tag {0}, {1} bits)")]
    UnsupportedEncoding(u16, u16),
}
