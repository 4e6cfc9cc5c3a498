//! Passthrough engine: capture path to ring buffer to physical output.
//!
//! The capture side calls [`PassthroughEngine::process_buffer`] from whatever
//! real-time thread delivers audio. The output device pulls from the ring on
//! its own IO thread through the render callback installed by `start()`.
//! Neither path allocates, locks or logs.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::output::{OutputBackend, OutputDevice, OutputStream, RenderFn};
use crate::ring::{RingBuffer, monotonic_timestamp_ns};
use crate::store::DEFAULT_GAIN;

/// Frames converted per pass when the device and ring channel counts differ.
const SCRATCH_FRAMES: usize = 1_024;

/// Real-time safe gain lookup consumed by the engine.
pub trait GainLookup: Send + Sync {
    /// Gain for `app_id`; must not block or allocate.
    fn gain_for(&self, app_id: &str) -> f32;
}

/// Scale `samples` in place. Unity leaves the block untouched.
#[inline]
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if gain == DEFAULT_GAIN {
        return;
    }
    if gain <= 0.0 {
        samples.fill(0.0);
        return;
    }
    for sample in samples.iter_mut() {
        *sample *= gain;
    }
}

/// Point-in-time engine diagnostics.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineStatus {
    /// Whether device IO is running.
    pub running: bool,
    /// Device currently rendered to.
    pub device: Option<OutputDevice>,
    /// Ring occupancy in `[0.0, 1.0]`.
    pub buffer_fill: f32,
    /// Frames dropped because the ring was full.
    pub overflow_frames: u64,
    /// Frames of silence substituted because the ring was empty.
    pub underflow_frames: u64,
}

#[derive(Default)]
struct Control {
    stream: Option<Box<dyn OutputStream>>,
    device: Option<OutputDevice>,
    /// Set by a successful `start`, cleared only by `stop`. Survives a failed
    /// device change so the next notification retries.
    wanted: bool,
}

/// Relays captured frames to the default physical output.
pub struct PassthroughEngine<B: OutputBackend> {
    backend: B,
    ring: Arc<RingBuffer>,
    gains: Option<Arc<dyn GainLookup>>,
    running: AtomicBool,
    in_flight: AtomicUsize,
    control: Mutex<Control>,
}

impl<B: OutputBackend> PassthroughEngine<B> {
    /// Allocate the ring described by `config`. Nothing touches the device yet.
    pub fn new(backend: B, config: &EngineConfig) -> io::Result<Self> {
        let ring = if config.shared_memory {
            RingBuffer::new_shared(config.capacity_frames, config.channels)?
        } else {
            RingBuffer::new_local(config.capacity_frames, config.channels)
        };
        Ok(Self {
            backend,
            ring: Arc::new(ring),
            gains: None,
            running: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            control: Mutex::new(Control::default()),
        })
    }

    /// Use `lookup` for [`process_app_buffer`](Self::process_app_buffer).
    pub fn with_gain_lookup(mut self, lookup: Arc<dyn GainLookup>) -> Self {
        self.gains = Some(lookup);
        self
    }

    /// The ring between capture and output.
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Whether device IO is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start rendering to the current default output. No-op when running.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut control = self.control.lock();
        self.start_locked(&mut control)?;
        control.wanted = true;
        Ok(())
    }

    /// Stop rendering and release the device callback. No-op when stopped.
    pub fn stop(&self) {
        let mut control = self.control.lock();
        control.wanted = false;
        self.stop_locked(&mut control);
    }

    /// Restart against the new default output if started, including after
    /// an earlier device change left the engine without an output.
    pub fn handle_device_change(&self) -> Result<(), EngineError> {
        let mut control = self.control.lock();
        if !control.wanted {
            return Ok(());
        }
        info!("default output changed, restarting passthrough");
        self.stop_locked(&mut control);
        self.start_locked(&mut control).inspect_err(|err| {
            warn!(%err, "passthrough could not follow the device change, output is silent");
        })
    }

    /// Real-time capture entry point. Returns the frames accepted by the ring.
    #[inline]
    pub fn process_buffer(&self, samples: &[f32]) -> usize {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let written = if self.running.load(Ordering::SeqCst) {
            self.ring.push(samples, Some(monotonic_timestamp_ns()))
        } else {
            0
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        written
    }

    /// Like [`process_buffer`](Self::process_buffer) but scales the block by
    /// the cached gain for `app_id` first.
    #[inline]
    pub fn process_app_buffer(&self, app_id: &str, samples: &mut [f32]) -> usize {
        let gain = self
            .gains
            .as_ref()
            .map_or(DEFAULT_GAIN, |lookup| lookup.gain_for(app_id));
        apply_gain(samples, gain);
        self.process_buffer(samples)
    }

    /// Snapshot of the engine's state and ring counters.
    pub fn status(&self) -> EngineStatus {
        let control = self.control.lock();
        let capacity = self.ring.capacity_frames().max(1);
        EngineStatus {
            running: control.stream.is_some(),
            device: control.device.clone(),
            buffer_fill: self.ring.available_read() as f32 / capacity as f32,
            overflow_frames: self.ring.overflow_frames(),
            underflow_frames: self.ring.underflow_frames(),
        }
    }

    fn start_locked(&self, control: &mut Control) -> Result<(), EngineError> {
        if control.stream.is_some() {
            return Ok(());
        }
        let device = self.backend.default_output()?;

        // The producer may still be inside a push that began before the last stop.
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }
        self.ring.reset();

        let render = render_fn(Arc::clone(&self.ring), device.channels);
        let mut stream = self.backend.open(&device, render)?;
        stream.start()?;
        self.running.store(true, Ordering::SeqCst);

        info!(
            device = %device.name,
            sample_rate = device.sample_rate,
            channels = device.channels,
            capacity_frames = self.ring.capacity_frames(),
            "passthrough started"
        );
        control.stream = Some(stream);
        control.device = Some(device);
        Ok(())
    }

    fn stop_locked(&self, control: &mut Control) {
        let Some(mut stream) = control.stream.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        stream.stop();
        drop(stream);
        let device = control.device.take();
        info!(
            device = device.as_ref().map(|d| d.name.as_str()).unwrap_or("unknown"),
            overflow_frames = self.ring.overflow_frames(),
            underflow_frames = self.ring.underflow_frames(),
            "passthrough stopped"
        );
    }
}

impl<B: OutputBackend> Drop for PassthroughEngine<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build the device callback. Scratch space is allocated here, never per block.
fn render_fn(ring: Arc<RingBuffer>, device_channels: usize) -> RenderFn {
    let ring_channels = ring.channels();
    if device_channels == ring_channels {
        return Box::new(move |out: &mut [f32]| {
            ring.pop(out);
        });
    }

    let mut scratch = vec![0.0f32; SCRATCH_FRAMES * ring_channels];
    let shared = device_channels.min(ring_channels);
    Box::new(move |out: &mut [f32]| {
        if device_channels == 0 {
            return;
        }
        for block in out.chunks_mut(SCRATCH_FRAMES * device_channels) {
            let frames = block.len() / device_channels;
            let staged = &mut scratch[..frames * ring_channels];
            ring.pop(staged);
            for (dst, src) in block
                .chunks_exact_mut(device_channels)
                .zip(staged.chunks_exact(ring_channels))
            {
                dst[..shared].copy_from_slice(&src[..shared]);
                dst[shared..].fill(0.0);
            }
            // A trailing partial frame has no source frame.
            block[frames * device_channels..].fill(0.0);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_gain_is_bit_exact() {
        let mut block = [0.1f32, -0.7, 0.33, 1.0];
        let before = block;
        apply_gain(&mut block, 1.0);
        assert_eq!(block, before);
    }

    #[test]
    fn channel_mapping_zeroes_trailing_partial_frame() {
        let ring = Arc::new(RingBuffer::new_local(16, 2));
        ring.push(&[0.1, 0.2, 0.3, 0.4], None);
        let mut render = render_fn(Arc::clone(&ring), 3);
        let mut out = [9.0f32; 7];
        render(&mut out);
        assert_eq!(out, [0.1, 0.2, 0.0, 0.3, 0.4, 0.0, 0.0]);
    }

    #[test]
    fn zero_gain_silences() {
        let mut block = [0.5f32; 8];
        apply_gain(&mut block, 0.0);
        assert!(block.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn fractional_gain_scales() {
        let mut block = [0.5f32, -0.5];
        apply_gain(&mut block, 0.5);
        assert_eq!(block, [0.25, -0.25]);
    }

    #[test]
    fn render_maps_stereo_ring_onto_quad_device() {
        let ring = Arc::new(RingBuffer::new_local(64, 2));
        ring.push(&[0.1, 0.2, 0.3, 0.4], None);
        let mut render = render_fn(Arc::clone(&ring), 4);
        let mut out = [9.0f32; 12];
        render(&mut out);
        assert_eq!(
            out,
            [0.1, 0.2, 0.0, 0.0, 0.3, 0.4, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn render_folds_ring_onto_mono_device() {
        let ring = Arc::new(RingBuffer::new_local(64, 2));
        ring.push(&[0.1, 0.2, 0.3, 0.4], None);
        let mut render = render_fn(Arc::clone(&ring), 1);
        let mut out = [9.0f32; 3];
        render(&mut out);
        assert_eq!(out, [0.1, 0.3, 0.0]);
    }
}
