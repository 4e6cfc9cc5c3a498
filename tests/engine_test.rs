use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use appfaders::driver::{DriverBridge, IoHook};
use appfaders::output::{OutputBackend, OutputDevice, OutputStream, RenderFn};
use appfaders::{EngineConfig, EngineError, GainLookup, PassthroughEngine};
use parking_lot::Mutex;

#[derive(Default)]
struct FakeHardware {
    default_device: Mutex<Option<OutputDevice>>,
    refuse_callback: AtomicBool,
    refuse_start: AtomicBool,
    render: Mutex<Option<RenderFn>>,
    rendering_on: Mutex<Option<u32>>,
    opens: AtomicUsize,
}

#[derive(Clone, Default)]
struct FakeBackend {
    hw: Arc<FakeHardware>,
}

impl FakeBackend {
    fn with_device(id: u32, channels: usize) -> Self {
        let backend = Self::default();
        backend.plug(id, channels);
        backend
    }

    fn plug(&self, id: u32, channels: usize) {
        *self.hw.default_device.lock() = Some(OutputDevice {
            id,
            name: format!("fake {id}"),
            sample_rate: 48_000.0,
            channels,
        });
    }

    fn unplug(&self) {
        self.hw.default_device.lock().take();
    }

    fn rendering_on(&self) -> Option<u32> {
        *self.hw.rendering_on.lock()
    }

    /// Run one device IO cycle. Returns false when no IO is running.
    fn cycle(&self, out: &mut [f32]) -> bool {
        if self.rendering_on().is_none() {
            return false;
        }
        match self.hw.render.lock().as_mut() {
            Some(render) => {
                render(out);
                true
            }
            None => false,
        }
    }
}

struct FakeStream {
    hw: Arc<FakeHardware>,
    device: u32,
}

impl OutputBackend for FakeBackend {
    fn default_output(&self) -> Result<OutputDevice, EngineError> {
        self.hw
            .default_device
            .lock()
            .clone()
            .ok_or(EngineError::DeviceUnavailable)
    }

    fn open(
        &self,
        device: &OutputDevice,
        render: RenderFn,
    ) -> Result<Box<dyn OutputStream>, EngineError> {
        if self.hw.refuse_callback.load(Ordering::SeqCst) {
            return Err(EngineError::CallbackInstallFailed("refused".into()));
        }
        self.hw.opens.fetch_add(1, Ordering::SeqCst);
        *self.hw.render.lock() = Some(render);
        Ok(Box::new(FakeStream {
            hw: Arc::clone(&self.hw),
            device: device.id,
        }))
    }
}

impl OutputStream for FakeStream {
    fn start(&mut self) -> Result<(), EngineError> {
        if self.hw.refuse_start.load(Ordering::SeqCst) {
            return Err(EngineError::StartFailed("device busy".into()));
        }
        *self.hw.rendering_on.lock() = Some(self.device);
        Ok(())
    }

    fn stop(&mut self) {
        self.hw.rendering_on.lock().take();
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.hw.render.lock().take();
    }
}

fn engine(backend: &FakeBackend) -> PassthroughEngine<FakeBackend> {
    PassthroughEngine::new(backend.clone(), &EngineConfig::default()).unwrap()
}

#[test]
fn start_and_stop_are_idempotent() {
    let backend = FakeBackend::with_device(7, 2);
    let engine = engine(&backend);

    engine.start().unwrap();
    engine.start().unwrap();
    assert_eq!(backend.hw.opens.load(Ordering::SeqCst), 1);
    assert_eq!(backend.rendering_on(), Some(7));
    assert_eq!(engine.status().device.map(|d| d.id), Some(7));

    engine.stop();
    engine.stop();
    assert_eq!(backend.rendering_on(), None);
    assert!(backend.hw.render.lock().is_none());
    assert!(!engine.is_running());
}

#[test]
fn start_without_default_output_is_device_unavailable() {
    let backend = FakeBackend::default();
    let engine = engine(&backend);
    assert!(matches!(engine.start(), Err(EngineError::DeviceUnavailable)));
    assert!(!engine.status().running);
}

#[test]
fn refused_callback_is_reported() {
    let backend = FakeBackend::with_device(1, 2);
    backend.hw.refuse_callback.store(true, Ordering::SeqCst);
    let engine = engine(&backend);
    assert!(matches!(
        engine.start(),
        Err(EngineError::CallbackInstallFailed(_))
    ));

    backend.hw.refuse_callback.store(false, Ordering::SeqCst);
    engine.start().unwrap();
    assert!(engine.is_running());
}

#[test]
fn failed_start_removes_the_callback() {
    let backend = FakeBackend::with_device(1, 2);
    backend.hw.refuse_start.store(true, Ordering::SeqCst);
    let engine = engine(&backend);
    assert!(matches!(engine.start(), Err(EngineError::StartFailed(_))));
    assert!(backend.hw.render.lock().is_none());
    assert!(!engine.is_running());
}

#[test]
fn start_resets_stale_audio() {
    let backend = FakeBackend::with_device(1, 2);
    let engine = engine(&backend);
    engine.start().unwrap();
    engine.process_buffer(&[0.5; 64]);
    engine.stop();

    engine.start().unwrap();
    assert_eq!(engine.ring().available_read(), 0);
    let mut out = [1.0f32; 16];
    assert!(backend.cycle(&mut out));
    assert!(out.iter().all(|s| *s == 0.0));
    assert_eq!(engine.status().underflow_frames, 8);
}

#[test]
fn device_change_moves_output_to_new_default() {
    let backend = FakeBackend::with_device(1, 2);
    let engine = engine(&backend);

    engine.handle_device_change().unwrap();
    assert_eq!(backend.rendering_on(), None, "stopped engine stays stopped");

    engine.start().unwrap();
    backend.plug(2, 4);
    engine.handle_device_change().unwrap();
    assert_eq!(backend.rendering_on(), Some(2));
    assert_eq!(engine.status().device.map(|d| d.channels), Some(4));

    engine.process_buffer(&[0.25, -0.25]);
    let mut out = [9.0f32; 4];
    assert!(backend.cycle(&mut out));
    assert_eq!(out, [0.25, -0.25, 0.0, 0.0]);

    backend.unplug();
    assert!(matches!(
        engine.handle_device_change(),
        Err(EngineError::DeviceUnavailable)
    ));
    assert!(!engine.is_running());
    assert!(!backend.cycle(&mut out));
}

#[test]
fn device_change_retries_after_losing_the_output() {
    let backend = FakeBackend::with_device(1, 2);
    let engine = engine(&backend);
    engine.start().unwrap();

    backend.unplug();
    assert!(matches!(
        engine.handle_device_change(),
        Err(EngineError::DeviceUnavailable)
    ));
    assert!(!engine.is_running());

    backend.plug(2, 2);
    engine.handle_device_change().unwrap();
    assert!(engine.is_running());
    assert_eq!(backend.rendering_on(), Some(2));

    engine.stop();
    backend.plug(3, 2);
    engine.handle_device_change().unwrap();
    assert!(!engine.is_running(), "explicit stop is not undone by a device change");
}

struct Muted;

impl GainLookup for Muted {
    fn gain_for(&self, _: &str) -> f32 {
        0.0
    }
}

#[test]
fn driver_bridge_counts_io_clients() {
    let backend = FakeBackend::with_device(3, 2);
    let engine = Arc::new(engine(&backend).with_gain_lookup(Arc::new(Muted)));
    let driver = DriverBridge::new(Arc::clone(&engine));

    driver.dispatch(IoHook::StartIo { client_id: 10 }).unwrap();
    driver.dispatch(IoHook::StartIo { client_id: 11 }).unwrap();
    driver.dispatch(IoHook::StartIo { client_id: 11 }).unwrap();
    assert_eq!(driver.active_clients(), 2);
    assert_eq!(backend.hw.opens.load(Ordering::SeqCst), 1);

    let written = driver
        .dispatch(IoHook::ProcessBuffer {
            samples: &[0.1, 0.2, 0.3, 0.4],
        })
        .unwrap();
    assert_eq!(written, 2);

    let mut app_block = [0.9f32; 4];
    driver
        .dispatch(IoHook::ProcessClientBuffer {
            app_id: "com.example",
            samples: &mut app_block,
        })
        .unwrap();
    assert_eq!(app_block, [0.0; 4]);

    driver.dispatch(IoHook::StopIo { client_id: 10 }).unwrap();
    assert!(engine.is_running());
    driver.dispatch(IoHook::StopIo { client_id: 11 }).unwrap();
    assert!(!engine.is_running());
    assert_eq!(driver.active_clients(), 0);
}

#[test]
fn driver_bridge_forgets_client_when_start_fails() {
    let backend = FakeBackend::default();
    let driver = DriverBridge::new(Arc::new(engine(&backend)));
    assert!(matches!(
        driver.dispatch(IoHook::StartIo { client_id: 1 }),
        Err(EngineError::DeviceUnavailable)
    ));
    assert_eq!(driver.active_clients(), 0);

    backend.plug(4, 2);
    driver.dispatch(IoHook::StartIo { client_id: 1 }).unwrap();
    assert_eq!(backend.rendering_on(), Some(4));
}

#[test]
fn driver_bridge_restarts_silent_engine_on_next_start_io() {
    let backend = FakeBackend::with_device(1, 2);
    let engine = Arc::new(engine(&backend));
    let driver = DriverBridge::new(Arc::clone(&engine));
    driver.dispatch(IoHook::StartIo { client_id: 1 }).unwrap();

    backend.unplug();
    assert!(driver.dispatch(IoHook::DefaultOutputChanged).is_err());
    assert!(!engine.is_running());

    backend.plug(5, 2);
    driver.dispatch(IoHook::StartIo { client_id: 2 }).unwrap();
    assert_eq!(driver.active_clients(), 2);
    assert!(engine.is_running());
    assert_eq!(backend.rendering_on(), Some(5));
}
