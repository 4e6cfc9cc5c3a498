//! Physical output devices.
//!
//! The engine only sees [`OutputBackend`] and [`OutputStream`]; the platform
//! specifics live in the submodules.

use crate::error::EngineError;

#[cfg(target_os = "macos")]
pub mod coreaudio;
#[cfg(feature = "cpal")]
pub mod cpal;

/// A physical output as reported by the host.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputDevice {
    /// Host specific identifier.
    pub id: u32,
    /// Human readable name.
    pub name: String,
    /// Nominal sample rate in Hz.
    pub sample_rate: f64,
    /// Interleaved channels the device renders.
    pub channels: usize,
}

/// Render callback installed on the device. Fills an interleaved block in place.
pub type RenderFn = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Source of output devices.
pub trait OutputBackend: Send + Sync {
    /// The current default output. `DeviceUnavailable` when there is none.
    fn default_output(&self) -> Result<OutputDevice, EngineError>;

    /// Install `render` on `device` without starting IO.
    fn open(&self, device: &OutputDevice, render: RenderFn)
    -> Result<Box<dyn OutputStream>, EngineError>;
}

/// An installed render callback. Dropping the stream removes the callback.
pub trait OutputStream: Send {
    /// Begin device IO.
    fn start(&mut self) -> Result<(), EngineError>;
    /// Halt device IO. Idempotent.
    fn stop(&mut self);
}

/// Platform default backend, if this build has one.
#[cfg(target_os = "macos")]
pub fn platform_backend() -> coreaudio::CoreAudioBackend {
    coreaudio::CoreAudioBackend::new()
}

/// Platform default backend, if this build has one.
#[cfg(all(not(target_os = "macos"), feature = "cpal"))]
pub fn platform_backend() -> self::cpal::CpalBackend {
    self::cpal::CpalBackend::new()
}
