//! Driver registry and device-string dispatch.

use std::sync::Arc;

use rp_format::{AudioFormat, DeviceInfo, DeviceString};
use tracing::{info, warn};

use crate::error::{SinkError, SinkResult};
use crate::null::NullDriver;
use crate::traits::{Sink, SinkDriver};

/// A sink that finished `initialize`, plus where it actually landed.
pub struct OpenedSink {
    pub sink: Box<dyn Sink>,
    /// Negotiated hardware format
    pub format: AudioFormat,
    /// `"<driver>:<device>"` really opened
    pub device: String,
}

impl std::fmt::Debug for OpenedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSink")
            .field("driver", &self.sink.driver())
            .field("format", &self.format)
            .field("device", &self.device)
            .finish()
    }
}

/// Ordered set of sink drivers.
///
/// Opening walks the drivers named by the device string first, then every
/// other registered driver in registration order; the null driver is
/// always the last resort so the engine keeps a clock even without
/// hardware.
#[derive(Clone, Default)]
pub struct SinkRegistry {
    drivers: Vec<Arc<dyn SinkDriver>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver compiled in, null last.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        #[cfg(feature = "cpal")]
        registry.register(Arc::new(crate::cpal_backend::CpalDriver::new()));
        registry.register(Arc::new(NullDriver::realtime()));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn SinkDriver>) {
        self.drivers.push(driver);
    }

    pub fn driver(&self, name: &str) -> Option<&Arc<dyn SinkDriver>> {
        self.drivers.iter().find(|d| d.name().eq_ignore_ascii_case(name))
    }

    pub fn driver_names(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    /// Open `device` with the format in `format`.
    ///
    /// A device string with an unregistered driver prefix is treated as a
    /// bare device name. Each candidate driver gets one attempt.
    pub fn open(&self, format: &AudioFormat, device: &str) -> SinkResult<OpenedSink> {
        let parsed = DeviceString::parse(device).map_err(|e| SinkError::DeviceNotFound(e.to_string()))?;
        let named = parsed.driver.and_then(|d| self.driver(d)).cloned();

        let mut order: Vec<Arc<dyn SinkDriver>> = Vec::with_capacity(self.drivers.len() + 1);
        if let Some(driver) = &named {
            order.push(driver.clone());
        }
        order.extend(
            self.drivers
                .iter()
                .filter(|d| named.as_ref().map_or(true, |n| n.name() != d.name()))
                .cloned(),
        );
        if !order.iter().any(|d| d.name() == NullDriver::NAME) {
            order.push(Arc::new(NullDriver::realtime()));
        }

        let mut last_err = SinkError::NoDevice;
        for (attempt, driver) in order.iter().enumerate() {
            // Only the named (or first) driver gets the requested device name.
            let device_name = if attempt == 0 {
                parsed.device_for(driver.name(), device).to_string()
            } else {
                "default".to_string()
            };
            let mut sink = driver.create();
            let mut fmt = format.clone();
            let mut actual = device_name.clone();
            match sink.initialize(&mut fmt, &mut actual) {
                Ok(()) => {
                    if attempt > 0 {
                        warn!(
                            "device {} unavailable, fell back to {}:{}",
                            device,
                            driver.name(),
                            actual
                        );
                    }
                    info!("opened {}:{} as {}", driver.name(), actual, fmt);
                    return Ok(OpenedSink {
                        sink,
                        format: fmt,
                        device: format!("{}:{}", driver.name(), actual),
                    });
                }
                Err(e) => {
                    warn!("{} failed to open {}: {}", driver.name(), device_name, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Every device of every driver, as `(driver, info)` pairs.
    pub fn enumerate(&self, force: bool) -> Vec<(&'static str, DeviceInfo)> {
        self.drivers
            .iter()
            .flat_map(|d| {
                let name = d.name();
                d.enumerate_devices(force).into_iter().map(move |info| (name, info))
            })
            .collect()
    }
}

impl std::fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.drivers.iter().map(|d| d.name())).finish()
    }
}
