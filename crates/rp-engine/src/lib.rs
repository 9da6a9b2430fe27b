//! Streams, format conversion and the render engine for renderpipe.
//!
//! Decoded audio enters through a [`Stream`]: it is converted to float,
//! remapped to the hardware layout, resampled to the hardware rate and
//! buffered in a lock-free ring. The [`Engine`] owns the sink, mixes every
//! stream and [`SoundEffect`] into one period and pushes it to the device.

mod convert;
mod engine;
mod error;
mod remap;
mod ring;
mod settings;
mod sound;
mod stream;

pub use convert::{from_float, resample_linear, to_float, Converter, LinearResampler, ResamplerState};
pub use engine::{needs_reopen, Engine};
pub use error::{EngineError, EngineResult};
pub use remap::{Remapper, Upmixer};
pub use ring::{ring_buffer, RingConsumer, RingProducer};
pub use settings::{EngineSettings, PassthroughSettings, SampleRateMode};
pub use sound::{PreparedSound, SoundEffect, Voice};
pub use stream::{
    AudioCallback, ChainInfo, RenderStatus, SinkTiming, Stream, StreamConfig, StreamState, VIS_MAX_SAMPLES,
};
