//! Entry points for the device registration layer.
//!
//! The host plug-in reports IO lifecycle and capture buffers through a closed
//! set of hooks. [`DriverBridge`] dispatches them onto the passthrough engine
//! and reference counts IO clients so the device only runs while someone is
//! doing IO. A thin C ABI at the bottom of the file wraps it for the plug-in.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::engine::PassthroughEngine;
use crate::error::EngineError;
use crate::output::OutputBackend;

/// A hook invoked by the device registration layer.
#[derive(Debug)]
pub enum IoHook<'a> {
    /// A client began IO on the virtual device.
    StartIo {
        /// Host assigned client identifier.
        client_id: u32,
    },
    /// A client ended IO on the virtual device.
    StopIo {
        /// Host assigned client identifier.
        client_id: u32,
    },
    /// Mixed capture buffer, interleaved. Real-time.
    ProcessBuffer {
        /// Interleaved samples.
        samples: &'a [f32],
    },
    /// Capture buffer of one application, scaled by its gain first. Real-time.
    ProcessClientBuffer {
        /// Application that produced the buffer.
        app_id: &'a str,
        /// Interleaved samples, scaled in place.
        samples: &'a mut [f32],
    },
    /// The system default output device changed.
    DefaultOutputChanged,
}

/// Routes [`IoHook`]s onto an engine.
pub struct DriverBridge<B: OutputBackend> {
    engine: Arc<PassthroughEngine<B>>,
    clients: Mutex<HashSet<u32>>,
}

impl<B: OutputBackend> DriverBridge<B> {
    /// Wrap `engine`. The engine is started by the first `StartIo`.
    pub fn new(engine: Arc<PassthroughEngine<B>>) -> Self {
        Self {
            engine,
            clients: Mutex::new(HashSet::new()),
        }
    }

    /// The engine being driven.
    pub fn engine(&self) -> &Arc<PassthroughEngine<B>> {
        &self.engine
    }

    /// Number of clients currently doing IO.
    pub fn active_clients(&self) -> usize {
        self.clients.lock().len()
    }

    /// Handle one hook. Returns the frames accepted for buffer hooks, 0 otherwise.
    ///
    /// Buffer hooks never take the client lock.
    pub fn dispatch(&self, hook: IoHook<'_>) -> Result<usize, EngineError> {
        match hook {
            IoHook::ProcessBuffer { samples } => Ok(self.engine.process_buffer(samples)),
            IoHook::ProcessClientBuffer { app_id, samples } => {
                Ok(self.engine.process_app_buffer(app_id, samples))
            }
            IoHook::StartIo { client_id } => {
                let mut clients = self.clients.lock();
                let added = clients.insert(client_id);
                if added {
                    debug!(client_id, active = clients.len(), "io client started");
                }
                // Also retries when a device change left existing clients silent.
                if let Err(err) = self.engine.start() {
                    if added {
                        clients.remove(&client_id);
                    }
                    return Err(err);
                }
                Ok(0)
            }
            IoHook::StopIo { client_id } => {
                let mut clients = self.clients.lock();
                if clients.remove(&client_id) {
                    debug!(client_id, active = clients.len(), "io client stopped");
                    if clients.is_empty() {
                        self.engine.stop();
                    }
                }
                Ok(0)
            }
            IoHook::DefaultOutputChanged => {
                self.engine.handle_device_change()?;
                Ok(0)
            }
        }
    }
}

#[cfg(any(target_os = "macos", feature = "cpal"))]
pub use ffi::*;

#[cfg(any(target_os = "macos", feature = "cpal"))]
mod ffi {
    use std::ffi::{CStr, c_char};
    use std::slice;
    use std::sync::Arc;

    use tracing::{error, info, warn};

    use super::{DriverBridge, IoHook};
    use crate::bridge::CacheBridge;
    use crate::config::{BridgeConfig, EngineConfig, ServiceConfig};
    use crate::engine::{GainLookup, PassthroughEngine};
    use crate::error::EngineError;
    use crate::output;

    #[cfg(target_os = "macos")]
    type PlatformBackend = output::coreaudio::CoreAudioBackend;
    #[cfg(all(not(target_os = "macos"), feature = "cpal"))]
    type PlatformBackend = output::cpal::CpalBackend;

    /// Success.
    pub const APPFADERS_OK: i32 = 0;
    /// A required pointer argument was null.
    pub const APPFADERS_ERR_NULL: i32 = -1;
    /// No default output device.
    pub const APPFADERS_ERR_DEVICE_UNAVAILABLE: i32 = -2;
    /// The output device refused the render callback.
    pub const APPFADERS_ERR_CALLBACK_INSTALL: i32 = -3;
    /// The output device would not start.
    pub const APPFADERS_ERR_START: i32 = -4;

    /// Opaque handle owned by the plug-in.
    pub struct DriverHandle {
        bridge: DriverBridge<PlatformBackend>,
        // Kept alive for the engine's gain lookups.
        _cache: Arc<CacheBridge>,
    }

    fn translate_status(result: Result<usize, EngineError>) -> i32 {
        match result {
            Ok(_) => APPFADERS_OK,
            Err(EngineError::DeviceUnavailable) => APPFADERS_ERR_DEVICE_UNAVAILABLE,
            Err(EngineError::CallbackInstallFailed(_)) => APPFADERS_ERR_CALLBACK_INSTALL,
            Err(EngineError::StartFailed(_)) => APPFADERS_ERR_START,
        }
    }

    /// Create the engine and cache bridge. Returns null on failure.
    #[unsafe(no_mangle)]
    pub extern "C" fn appfaders_driver_create(capacity_frames: u32, channels: u32) -> *mut DriverHandle {
        crate::init_tracing();
        let mut config = EngineConfig::default();
        if capacity_frames > 0 {
            config.capacity_frames = capacity_frames as usize;
        }
        if channels > 0 {
            config.channels = channels as usize;
        }

        let cache = match CacheBridge::new(BridgeConfig::for_service(&ServiceConfig::from_env())) {
            Ok(cache) => Arc::new(cache),
            Err(err) => {
                error!(%err, "cannot start gain cache bridge");
                return std::ptr::null_mut();
            }
        };
        // Deferred: the first refresh happens on the bridge's worker.
        cache.connect();

        let engine = match PassthroughEngine::new(output::platform_backend(), &config) {
            Ok(engine) => engine.with_gain_lookup(Arc::clone(&cache) as Arc<dyn GainLookup>),
            Err(err) => {
                error!(%err, "cannot allocate passthrough ring");
                return std::ptr::null_mut();
            }
        };
        info!(
            capacity_frames = config.capacity_frames,
            channels = config.channels,
            "driver handle created"
        );
        Box::into_raw(Box::new(DriverHandle {
            bridge: DriverBridge::new(Arc::new(engine)),
            _cache: cache,
        }))
    }

    /// Stop IO and free the handle.
    ///
    /// # Safety
    /// `handle` must come from [`appfaders_driver_create`] and not be used afterwards.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn appfaders_driver_destroy(handle: *mut DriverHandle) {
        if !handle.is_null() {
            let handle = unsafe { Box::from_raw(handle) };
            handle.bridge.engine().stop();
        }
    }

    /// A host client started IO.
    ///
    /// # Safety
    /// `handle` must be a live handle from [`appfaders_driver_create`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn appfaders_driver_start_io(handle: *mut DriverHandle, client_id: u32) -> i32 {
        let Some(handle) = (unsafe { handle.as_ref() }) else {
            return APPFADERS_ERR_NULL;
        };
        let result = handle.bridge.dispatch(IoHook::StartIo { client_id });
        if let Err(err) = &result {
            warn!(client_id, %err, "start io failed");
        }
        translate_status(result)
    }

    /// A host client stopped IO.
    ///
    /// # Safety
    /// `handle` must be a live handle from [`appfaders_driver_create`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn appfaders_driver_stop_io(handle: *mut DriverHandle, client_id: u32) -> i32 {
        let Some(handle) = (unsafe { handle.as_ref() }) else {
            return APPFADERS_ERR_NULL;
        };
        translate_status(handle.bridge.dispatch(IoHook::StopIo { client_id }))
    }

    /// Push `frames` interleaved frames of capture audio. Real-time safe.
    /// Returns the frames accepted.
    ///
    /// # Safety
    /// `handle` must be live and `data` must point to `frames * channels` samples.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn appfaders_driver_process_buffer(
        handle: *mut DriverHandle,
        data: *const f32,
        frames: u32,
    ) -> u32 {
        let Some(handle) = (unsafe { handle.as_ref() }) else {
            return 0;
        };
        if data.is_null() || frames == 0 {
            return 0;
        }
        let channels = handle.bridge.engine().ring().channels();
        let samples = unsafe { slice::from_raw_parts(data, frames as usize * channels) };
        handle
            .bridge
            .dispatch(IoHook::ProcessBuffer { samples })
            .map_or(0, |written| written as u32)
    }

    /// Like [`appfaders_driver_process_buffer`] for one application's audio,
    /// which is scaled in place by its cached gain first.
    ///
    /// # Safety
    /// As for [`appfaders_driver_process_buffer`]; `app_id` must be a valid
    /// NUL terminated string and `data` writable.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn appfaders_driver_process_client_buffer(
        handle: *mut DriverHandle,
        app_id: *const c_char,
        data: *mut f32,
        frames: u32,
    ) -> u32 {
        let Some(handle) = (unsafe { handle.as_ref() }) else {
            return 0;
        };
        if app_id.is_null() || data.is_null() || frames == 0 {
            return 0;
        }
        let Ok(app_id) = unsafe { CStr::from_ptr(app_id) }.to_str() else {
            return 0;
        };
        let channels = handle.bridge.engine().ring().channels();
        let samples = unsafe { slice::from_raw_parts_mut(data, frames as usize * channels) };
        handle
            .bridge
            .dispatch(IoHook::ProcessClientBuffer { app_id, samples })
            .map_or(0, |written| written as u32)
    }

    /// The system default output changed; restart against the new one.
    ///
    /// # Safety
    /// `handle` must be a live handle from [`appfaders_driver_create`].
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn appfaders_driver_default_output_changed(handle: *mut DriverHandle) -> i32 {
        let Some(handle) = (unsafe { handle.as_ref() }) else {
            return APPFADERS_ERR_NULL;
        };
        translate_status(handle.bridge.dispatch(IoHook::DefaultOutputChanged))
    }
}

impl<B: OutputBackend> Drop for DriverBridge<B> {
    fn drop(&mut self) {
        let clients = self.clients.get_mut();
        if !clients.is_empty() {
            info!(remaining = clients.len(), "driver bridge dropped with active io clients");
            clients.clear();
            self.engine.stop();
        }
    }
}
