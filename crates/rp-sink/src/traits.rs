//! Sink and driver traits.

use rp_format::{AudioFormat, DeviceInfo};

use crate::error::SinkResult;

/// One open (or openable) hardware output.
///
/// A sink owns its native device exclusively between `initialize` and
/// `deinitialize`. The engine pushes interleaved frames in the negotiated
/// format with [`Sink::add_packets`]; backends whose native API is
/// callback-driven bridge the two with an internal ring.
pub trait Sink: Send {
    /// Driver name this sink belongs to (e.g. `"NULL"`, `"CPAL"`).
    fn driver(&self) -> &'static str;

    /// Negotiate and open the device.
    ///
    /// `format` holds the desired format on entry and the format actually
    /// opened on success: sample rate, data format, layout, frame size and
    /// period may all differ from the request. `device` is rewritten with
    /// the device really opened when the backend had to fall back.
    fn initialize(&mut self, format: &mut AudioFormat, device: &mut String) -> SinkResult<()>;

    /// Stop output and release the native device.
    fn deinitialize(&mut self);

    /// Push `frames` frames starting at frame `offset` of `data`.
    ///
    /// Blocks until the hardware takes the data or a backend-defined
    /// timeout expires. Returns the number of frames accepted.
    fn add_packets(&mut self, data: &[u8], frames: usize, offset: usize) -> SinkResult<usize>;

    /// Seconds until the most recently accepted frame becomes audible.
    fn delay(&self) -> f64;

    /// Seconds of audio the sink can hold at most.
    fn cache_total(&self) -> f64;

    /// Block until everything accepted so far has been played.
    fn drain(&mut self);

    /// The device was invalidated (unplugged, reconfigured externally).
    fn is_dirty(&self) -> bool {
        false
    }
}

/// A backend family: creates sinks and discovers devices.
pub trait SinkDriver: Send + Sync {
    /// Prefix used in device strings (`"<name>:<device>"`).
    fn name(&self) -> &'static str;

    /// A fresh, uninitialized sink.
    fn create(&self) -> Box<dyn Sink>;

    /// Discover selectable outputs. Side-effect free; `force` bypasses any cache.
    fn enumerate_devices(&self, force: bool) -> Vec<DeviceInfo>;
}
