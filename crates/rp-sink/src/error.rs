//! Sink error types.

use rp_format::AudioFormat;

/// Error type for sink operations.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// No output device available
    #[error("no audio device available")]
    NoDevice,
    /// Named device does not exist
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    /// No mutually supported format exists
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Failed to initialize audio device
    #[error("device init error: {0}")]
    DeviceInit(String),
    /// Failed to create the native output stream
    #[error("stream create error: {0}")]
    StreamCreate(String),
    /// Native playback control failed
    #[error("playback error: {0}")]
    Playback(String),
    /// Operation requires an initialized sink
    #[error("sink is not initialized")]
    NotInitialized,
    /// Sink already owns a device
    #[error("sink is already initialized")]
    AlreadyInitialized,
    /// Hardware did not free buffer space in time
    #[error("timed out waiting for hardware buffer space")]
    Timeout,
    /// Device vanished or changed format underneath the sink
    #[error("device invalidated, reopen required")]
    Invalidated,
    /// No driver registered under that name
    #[error("unknown sink driver: {0}")]
    UnknownDriver(String),
}

impl SinkError {
    pub fn unsupported(format: &AudioFormat) -> Self {
        Self::UnsupportedFormat(format.to_string())
    }

    /// True when the sink must be closed and reopened.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::Invalidated | SinkError::NotInitialized)
    }
}

pub type SinkResult<T> = Result<T, SinkError>;
