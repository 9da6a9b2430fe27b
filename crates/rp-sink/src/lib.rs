//! Audio output HAL for renderpipe.
//!
//! A [`Sink`] owns one native output device and accepts interleaved frames
//! in the format it negotiated. [`SinkDriver`]s create sinks and enumerate
//! devices; the [`SinkRegistry`] maps device strings to drivers and falls
//! back to the null sink when nothing else opens.
//!
//! The [`MixerGraph`] is the shared mix bus used by the engine: every input
//! owns a bus slot from a fixed [`BusPool`] and is summed through a gain
//! matrix without allocating on the render path.

mod error;
mod graph;
pub mod negotiate;
mod null;
mod registry;
mod traits;

#[cfg(feature = "cpal")]
mod cpal_backend;

pub use error::{SinkError, SinkResult};
pub use graph::{BusId, BusPool, GraphSource, MixerGraph, MAX_BUSES};
pub use null::{NullControl, NullDriver, NullSink};
pub use registry::{OpenedSink, SinkRegistry};
pub use traits::{Sink, SinkDriver};

#[cfg(feature = "cpal")]
pub use cpal_backend::{CpalDriver, CpalSink};
