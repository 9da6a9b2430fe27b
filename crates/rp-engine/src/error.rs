//! Engine error type.

use rp_format::FormatError;
use rp_sink::SinkError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Format(#[from] FormatError),
    /// Stream or sound format cannot be rendered
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    /// Output is suspended; resume before creating streams
    #[error("engine is suspended")]
    Suspended,
    /// Passthrough of this stream type is disabled in settings
    #[error("passthrough disabled for {0}")]
    PassthroughDisabled(rp_format::StreamType),
    /// Every mixer bus is taken
    #[error("no free mixer bus")]
    BusPoolExhausted,
    /// Render thread could not be started
    #[error("render thread: {0}")]
    Thread(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
